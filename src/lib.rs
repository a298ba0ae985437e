//! `ompa-rs` library crate: Optimal Multi-Parameter Analysis of water-mass
//! mixing.
//!
//! Given tracer observations and a set of candidate source water masses
//! ("end members"), this crate estimates, per observation:
//!
//! - non-negative mixing fractions that sum to one
//! - signed "converted variable" amounts (e.g. remineralized oxygen) that
//!   explain systematic deviations from conservative mixing
//!
//! The heavy lifting is a constrained weighted least-squares problem solved
//! as a convex QP, with a combinatorial sign search over converted-variable
//! groups, an optional spatial-smoothness regularizer, a nullspace-based
//! ambiguity quantifier, and an iterative end-member refinement loop.
//!
//! Table loading, plotting, and CLI handling are deliberately left to
//! callers; this crate takes in-memory tables and hands back typed results.

pub mod ambiguity;
pub mod domain;
pub mod error;
pub mod fit;
pub mod geo;
pub mod io;
pub mod math;
pub mod problem;
pub mod solver;
