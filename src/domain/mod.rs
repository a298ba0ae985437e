//! Domain types used throughout the pipeline.
//!
//! This module defines:
//!
//! - input tables (`ObservationTable`, `EndMemberTable`)
//! - problem configuration (`OmpaConfig`, `ConvertedGroup`, `Smoothness`)
//! - sign and penalty variants (`GroupSigns`, `UsagePenaltySource`)
//! - export configuration (`ExportOptions`)

pub mod types;

pub use types::*;
