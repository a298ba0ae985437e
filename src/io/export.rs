//! Export per-observation results to CSV.
//!
//! The export is meant to be easy to consume in spreadsheets or downstream
//! scripts: one row per solved observation, with caller-selected passthrough
//! columns from the observation table followed by derived blocks in a fixed
//! order (tracer residuals, end-member fractions, group totals, effective
//! conversion ratios, usage penalties).

use std::io;
use std::path::Path;

use crate::domain::ExportOptions;
use crate::error::OmpaError;
use crate::fit::OmpaSoln;
use crate::problem::OmpaProblem;

/// Write per-observation results to a CSV file.
pub fn write_results_csv(
    path: &Path,
    problem: &OmpaProblem,
    soln: &OmpaSoln,
    options: &ExportOptions,
) -> Result<(), OmpaError> {
    let mut writer = csv::Writer::from_path(path).map_err(|e| {
        OmpaError::new(
            2,
            format!("Failed to create export CSV '{}': {e}", path.display()),
        )
    })?;
    write_results(&mut writer, problem, soln, options)
}

/// Write per-observation results through any CSV writer.
///
/// Column order: requested observation columns, `<tracer>_resid`,
/// `<end member>_frac`, `<group>_total`, `<tracer>_to_<group>_ratio`,
/// `<end member>_penalty`. Blocks the options disable are omitted entirely.
pub fn write_results<W: io::Write>(
    writer: &mut csv::Writer<W>,
    problem: &OmpaProblem,
    soln: &OmpaSoln,
    options: &ExportOptions,
) -> Result<(), OmpaError> {
    let observations = problem.observations();
    for name in &options.original_columns {
        if !observations.has_column(name) {
            return Err(OmpaError::new(
                2,
                format!("Export column '{name}' is not in the observation table."),
            ));
        }
    }

    let mut header: Vec<String> = options.original_columns.clone();
    if options.include_residuals {
        for tracer in problem.tracer_names() {
            header.push(format!("{tracer}_resid"));
        }
    }
    if options.include_fractions {
        for name in problem.end_member_names() {
            header.push(format!("{name}_frac"));
        }
    }
    if options.include_group_totals {
        for group in &problem.config().converted_groups {
            header.push(format!("{}_total", group.name));
        }
    }
    if options.include_effective_ratios {
        for ratios in &soln.effective_ratios {
            for tracer in &ratios.tracers {
                header.push(format!("{tracer}_to_{}_ratio", ratios.group));
            }
        }
    }
    if options.include_usage_penalties {
        for name in problem.end_member_names() {
            header.push(format!("{name}_penalty"));
        }
    }
    writer
        .write_record(&header)
        .map_err(|e| OmpaError::new(2, format!("Failed to write export CSV header: {e}")))?;

    let n = problem.num_observations();
    for i in 0..n {
        let mut record: Vec<String> = Vec::with_capacity(header.len());
        for name in &options.original_columns {
            let col = observations
                .column(name)
                .expect("column checked before the header was written");
            record.push(format!("{}", col[i]));
        }
        if options.include_residuals {
            for j in 0..problem.tracer_names().len() {
                record.push(format!("{}", soln.param_residuals[(i, j)]));
            }
        }
        if options.include_fractions {
            for e in 0..problem.num_end_members() {
                record.push(format!("{}", soln.fractions[(i, e)]));
            }
        }
        if options.include_group_totals {
            for g in 0..problem.num_groups() {
                record.push(format!("{}", soln.group_totals[(i, g)]));
            }
        }
        if options.include_effective_ratios {
            for ratios in &soln.effective_ratios {
                for t in 0..ratios.tracers.len() {
                    record.push(format!("{}", ratios.values[(i, t)]));
                }
            }
        }
        if options.include_usage_penalties {
            for e in 0..problem.num_end_members() {
                record.push(format!("{}", problem.usage_penalty()[(i, e)]));
            }
        }
        writer
            .write_record(&record)
            .map_err(|e| OmpaError::new(2, format!("Failed to write export CSV row: {e}")))?;
    }

    writer
        .flush()
        .map_err(|e| OmpaError::new(2, format!("Failed to flush export CSV: {e}")))?;
    Ok(())
}
