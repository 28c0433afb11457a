//! Aggregate risk score.
//!
//! | finding severity | weight |   | risk level | weight |
//! |------------------|--------|---|------------|--------|
//! | critical         | 0.30   |   | critical   | 0.25   |
//! | high             | 0.20   |   | high       | 0.15   |
//! | medium           | 0.10   |   | medium     | 0.08   |
//! | low              | 0.05   |   | low        | 0.03   |
//!
//! A finding contributes `weight × confidence`, a risk `weight × probability`.
//! The score is the capped sum of all contributions.

use crate::models::{Finding, Risk, Severity};

pub fn finding_weight(severity: Severity) -> f64 {
    match severity {
        Severity::Critical => 0.30,
        Severity::High => 0.20,
        Severity::Medium => 0.10,
        Severity::Low => 0.05,
    }
}

pub fn risk_weight(level: Severity) -> f64 {
    match level {
        Severity::Critical => 0.25,
        Severity::High => 0.15,
        Severity::Medium => 0.08,
        Severity::Low => 0.03,
    }
}

fn factor(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Score merged entities into `[0, 1]`.
///
/// Contributions are summed in ascending order so that the result is
/// bit-for-bit identical for any ordering of the inputs.
pub fn score(findings: &[Finding], risks: &[Risk]) -> f64 {
    let mut contributions: Vec<f64> = findings
        .iter()
        .map(|f| finding_weight(f.severity) * factor(f.confidence))
        .chain(
            risks
                .iter()
                .map(|r| risk_weight(r.level) * factor(r.probability)),
        )
        .collect();

    contributions.sort_by(f64::total_cmp);
    contributions.iter().sum::<f64>().min(1.0)
}
