//! Input/output helpers.
//!
//! - result export to CSV (`export`)

pub mod export;

pub use export::*;
