//! Finding aggregation and summary text.
//!
//! This module provides utilities for ordering and grouping merged
//! findings, and for the human-readable summary stored on an analysis.

use crate::analysis::merge::MergeStats;
use crate::models::{Finding, Risk, Severity};
use std::collections::BTreeMap;

/// Sort findings by severity (critical first), then by line.
pub fn sort_findings(findings: &mut [Finding]) {
    findings.sort_by(|a, b| {
        b.severity
            .cmp(&a.severity)
            .then_with(|| a.line().unwrap_or(u32::MAX).cmp(&b.line().unwrap_or(u32::MAX)))
    });
}

/// Sort risks by level (critical first), then by risk score.
pub fn sort_risks(risks: &mut [Risk]) {
    risks.sort_by(|a, b| {
        b.level
            .cmp(&a.level)
            .then_with(|| b.risk_score.total_cmp(&a.risk_score))
    });
}

/// Group findings by severity, each group ordered by line.
pub fn group_by_severity(findings: &[Finding]) -> BTreeMap<Severity, Vec<&Finding>> {
    let mut grouped: BTreeMap<Severity, Vec<&Finding>> = BTreeMap::new();

    for finding in findings {
        grouped.entry(finding.severity).or_default().push(finding);
    }

    for group in grouped.values_mut() {
        group.sort_by_key(|f| f.line().unwrap_or(u32::MAX));
    }

    grouped
}

/// Count findings per reporting adapter.
pub fn count_by_source(findings: &[Finding]) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for finding in findings {
        *counts.entry(finding.source.to_string()).or_default() += 1;
    }
    counts
}

/// Get the top N findings by severity.
pub fn top_findings(findings: &[Finding], n: usize) -> Vec<Finding> {
    let mut sorted = findings.to_vec();
    sort_findings(&mut sorted);
    sorted.truncate(n);
    sorted
}

/// Build the analysis summary sentence list.
pub fn summary_text(findings: &[Finding], risks: &[Risk], stats: &MergeStats) -> String {
    let count = |severity: Severity| findings.iter().filter(|f| f.severity == severity).count();
    let risk_count = |level: Severity| risks.iter().filter(|r| r.level == level).count();

    let mut parts = Vec::new();
    let mut push = |n: usize, label: &str| {
        if n > 0 {
            parts.push(format!("{} {}", n, label));
        }
    };

    push(count(Severity::Critical), "critical security issues");
    push(count(Severity::High), "high-severity issues");
    push(count(Severity::Medium), "medium-severity issues");
    push(count(Severity::Low), "low-severity issues");
    push(risk_count(Severity::Critical), "critical risks");
    push(risk_count(Severity::High), "high-level risks");

    if parts.is_empty() {
        parts.push("No significant security issues or risks identified".to_string());
    }

    if !stats.failed.is_empty() {
        parts.push(format!(
            "{} of {} analyzers failed",
            stats.failed.len(),
            stats.total_adapters
        ));
    }

    format!("{}.", parts.join(". "))
}
