//! Analysis modules.
//!
//! Merging of adapter outcomes, the aggregate risk score, and the
//! ordering/summary helpers used by reports.

pub mod aggregator;
pub mod merge;
pub mod scoring;

pub use merge::{MergeEngine, MergeStats, MergedEntities};
pub use scoring::score;
