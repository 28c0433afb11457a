//! Normalization and deduplication of adapter outcomes.
//!
//! Merging only ever sees the fully settled set of outcomes for a run.
//! Outcomes are walked in fixed adapter order so that the first reporter
//! of a duplicate always wins, whatever order the adapters finished in.

use crate::adapter::{RawFinding, RawRisk, TaggedOutcome};
use crate::models::{
    AdapterId, Finding, FindingCategory, Location, Risk, RiskCategory, Severity,
};
use std::collections::{BTreeMap, HashSet};
use tracing::debug;
use uuid::Uuid;

const UNKNOWN_ISSUE: &str = "Unknown Issue";
const UNKNOWN_RISK: &str = "Unknown Risk";
const DEFAULT_CONFIDENCE: f64 = 0.5;

/// What one adapter contributed to the merged result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Contribution {
    pub raw_findings: usize,
    pub kept_findings: usize,
    pub raw_risks: usize,
    pub kept_risks: usize,
}

/// Bookkeeping produced alongside the merged entities.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub per_adapter: BTreeMap<AdapterId, Contribution>,
    pub duplicates_dropped: usize,
    /// Adapters whose outcome was a plain failure.
    pub failed: Vec<AdapterId>,
    /// Adapters that failed part-way but still contributed.
    pub partial: Vec<AdapterId>,
    pub total_adapters: usize,
}

/// Deduplicated findings and risks of one run.
#[derive(Debug, Clone, Default)]
pub struct MergedEntities {
    pub findings: Vec<Finding>,
    pub risks: Vec<Risk>,
    pub stats: MergeStats,
}

type FindingKey = (String, Option<u32>, Severity);
type RiskKey = (String, RiskCategory, Severity);

/// Merges tagged adapter outcomes into canonical entities.
#[derive(Debug, Default, Clone, Copy)]
pub struct MergeEngine;

impl MergeEngine {
    pub fn merge(&self, mut outcomes: Vec<TaggedOutcome>) -> MergedEntities {
        // Stable: two outcomes from the same adapter keep their order.
        outcomes.sort_by_key(|tagged| tagged.adapter);

        let mut merged = MergedEntities::default();
        merged.stats.total_adapters = outcomes.len();

        let mut seen_findings: HashSet<FindingKey> = HashSet::new();
        let mut seen_risks: HashSet<RiskKey> = HashSet::new();

        for TaggedOutcome { adapter, outcome } in outcomes {
            if outcome.is_failure() {
                merged.stats.failed.push(adapter);
            } else if outcome.error().is_some() {
                merged.stats.partial.push(adapter);
            }

            let contribution = merged.stats.per_adapter.entry(adapter).or_default();
            let Some(report) = outcome.report() else {
                continue;
            };

            for raw in &report.findings {
                contribution.raw_findings += 1;
                let finding = normalize_finding(raw, adapter);
                let key = (finding.title.to_lowercase(), finding.line(), finding.severity);
                if seen_findings.insert(key) {
                    contribution.kept_findings += 1;
                    merged.findings.push(finding);
                } else {
                    merged.stats.duplicates_dropped += 1;
                }
            }

            for raw in &report.risks {
                contribution.raw_risks += 1;
                let risk = normalize_risk(raw, adapter);
                let key = (risk.title.to_lowercase(), risk.category, risk.level);
                if seen_risks.insert(key) {
                    contribution.kept_risks += 1;
                    merged.risks.push(risk);
                } else {
                    merged.stats.duplicates_dropped += 1;
                }
            }
        }

        debug!(
            "Merged {} findings and {} risks ({} duplicates dropped)",
            merged.findings.len(),
            merged.risks.len(),
            merged.stats.duplicates_dropped
        );
        merged
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn unit_interval(value: Option<f64>, default: f64) -> f64 {
    match value {
        Some(v) if v.is_finite() => v.clamp(0.0, 1.0),
        _ => default,
    }
}

fn parse_severity(value: &Option<String>) -> Severity {
    value
        .as_deref()
        .and_then(|s| s.parse().ok())
        .unwrap_or(Severity::Low)
}

/// Map a raw finding onto the canonical entity.
pub fn normalize_finding(raw: &RawFinding, source: AdapterId) -> Finding {
    Finding {
        id: Uuid::new_v4(),
        title: non_empty(&raw.title).unwrap_or_else(|| UNKNOWN_ISSUE.to_string()),
        description: non_empty(&raw.description).unwrap_or_default(),
        recommendation: non_empty(&raw.recommendation).unwrap_or_default(),
        severity: parse_severity(&raw.severity),
        category: raw
            .category
            .as_deref()
            .map(FindingCategory::from)
            .unwrap_or(FindingCategory::Other),
        location: Location {
            line: raw.line_number,
            function: non_empty(&raw.function_name),
            file: non_empty(&raw.file_name),
        },
        source,
        confidence: unit_interval(raw.confidence, DEFAULT_CONFIDENCE),
    }
}

/// Impact assumed for a risk level when the reviewer gave none.
fn default_impact(level: Severity) -> f64 {
    match level {
        Severity::Low => 0.25,
        Severity::Medium => 0.5,
        Severity::High => 0.75,
        Severity::Critical => 1.0,
    }
}

/// Map a raw risk onto the canonical entity.
pub fn normalize_risk(raw: &RawRisk, source: AdapterId) -> Risk {
    let level = parse_severity(&raw.risk_level);
    let probability = unit_interval(raw.probability, DEFAULT_CONFIDENCE);
    let impact_score = raw
        .impact_score
        .filter(|v| v.is_finite())
        .map(|v| v.clamp(0.0, 1.0));

    Risk {
        id: Uuid::new_v4(),
        title: non_empty(&raw.title).unwrap_or_else(|| UNKNOWN_RISK.to_string()),
        description: non_empty(&raw.description).unwrap_or_default(),
        impact: non_empty(&raw.impact).unwrap_or_default(),
        mitigation: non_empty(&raw.mitigation).unwrap_or_default(),
        level,
        category: raw
            .category
            .as_deref()
            .and_then(|c| c.parse().ok())
            .unwrap_or(RiskCategory::Technical),
        probability,
        impact_score,
        risk_score: probability * impact_score.unwrap_or_else(|| default_impact(level)),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{AdapterOutcome, AdapterReport};
    use crate::error::AdapterError;
    use std::time::Duration;

    fn raw_finding(title: &str, line: u32, severity: &str, confidence: f64) -> RawFinding {
        RawFinding {
            title: Some(title.to_string()),
            severity: Some(severity.to_string()),
            line_number: Some(line),
            confidence: Some(confidence),
            ..RawFinding::default()
        }
    }

    fn success(adapter: AdapterId, findings: Vec<RawFinding>, risks: Vec<RawRisk>) -> TaggedOutcome {
        TaggedOutcome {
            adapter,
            outcome: AdapterOutcome::Success(AdapterReport {
                findings,
                risks,
                ..AdapterReport::default()
            }),
        }
    }

    fn failure(adapter: AdapterId) -> TaggedOutcome {
        TaggedOutcome {
            adapter,
            outcome: AdapterOutcome::Failure(AdapterError::Timeout(Duration::from_secs(300))),
        }
    }

    #[test]
    fn test_first_adapter_wins_regardless_of_settle_order() {
        // Settled in reverse order; merge must still prefer slither.
        let outcomes = vec![
            success(
                AdapterId::Semgrep,
                vec![raw_finding("Reentrancy", 21, "critical", 0.5)],
                vec![],
            ),
            failure(AdapterId::Mythril),
            success(
                AdapterId::Slither,
                vec![raw_finding("reentrancy", 21, "Critical", 0.9)],
                vec![],
            ),
        ];

        let merged = MergeEngine.merge(outcomes);
        assert_eq!(merged.findings.len(), 1);
        assert_eq!(merged.findings[0].source, AdapterId::Slither);
        assert_eq!(merged.findings[0].confidence, 0.9);
        assert_eq!(merged.stats.duplicates_dropped, 1);
        assert_eq!(merged.stats.failed, vec![AdapterId::Mythril]);
        assert_eq!(merged.stats.total_adapters, 3);

        let semgrep = &merged.stats.per_adapter[&AdapterId::Semgrep];
        assert_eq!(semgrep.raw_findings, 1);
        assert_eq!(semgrep.kept_findings, 0);
    }

    #[test]
    fn test_key_components_distinguish_findings() {
        let outcomes = vec![success(
            AdapterId::Slither,
            vec![
                raw_finding("Reentrancy", 21, "high", 0.9),
                raw_finding("Reentrancy", 22, "high", 0.9),
                raw_finding("Reentrancy", 21, "medium", 0.9),
                raw_finding("REENTRANCY", 21, "high", 0.4),
            ],
            vec![],
        )];

        let merged = MergeEngine.merge(outcomes);
        assert_eq!(merged.findings.len(), 3);
        assert_eq!(merged.stats.duplicates_dropped, 1);
    }

    #[test]
    fn test_risk_dedup_key() {
        let risk = |title: &str, level: &str, category: &str| RawRisk {
            title: Some(title.to_string()),
            risk_level: Some(level.to_string()),
            category: Some(category.to_string()),
            probability: Some(0.6),
            ..RawRisk::default()
        };

        let outcomes = vec![
            success(
                AdapterId::Anthropic,
                vec![],
                vec![risk("Oracle manipulation", "high", "technical")],
            ),
            success(
                AdapterId::OpenAi,
                vec![],
                vec![
                    risk("oracle manipulation", "high", "technical"),
                    risk("Oracle manipulation", "high", "financial"),
                ],
            ),
        ];

        let merged = MergeEngine.merge(outcomes);
        assert_eq!(merged.risks.len(), 2);
        assert_eq!(merged.risks[0].source, AdapterId::OpenAi);
        assert_eq!(merged.risks[1].category, RiskCategory::Financial);
        assert_eq!(merged.stats.per_adapter[&AdapterId::Anthropic].kept_risks, 0);
    }

    #[test]
    fn test_partial_failure_contributes() {
        let outcomes = vec![TaggedOutcome {
            adapter: AdapterId::OpenAi,
            outcome: AdapterOutcome::PartialFailure {
                report: AdapterReport {
                    findings: vec![raw_finding("Unchecked call", 9, "medium", 0.6)],
                    ..AdapterReport::default()
                },
                reason: AdapterError::MalformedOutput("risk payload".to_string()),
            },
        }];

        let merged = MergeEngine.merge(outcomes);
        assert_eq!(merged.findings.len(), 1);
        assert!(merged.stats.failed.is_empty());
        assert_eq!(merged.stats.partial, vec![AdapterId::OpenAi]);
    }

    #[test]
    fn test_normalize_finding_defaults() {
        let finding = normalize_finding(
            &RawFinding {
                title: Some("   ".to_string()),
                severity: Some("informational".to_string()),
                category: Some("logic".to_string()),
                confidence: Some(1.7),
                ..RawFinding::default()
            },
            AdapterId::OpenAi,
        );

        assert_eq!(finding.title, "Unknown Issue");
        assert_eq!(finding.severity, Severity::Low);
        assert_eq!(finding.category, FindingCategory::Other);
        assert_eq!(finding.confidence, 1.0);
        assert!(finding.location.is_empty());

        let finding = normalize_finding(&RawFinding::default(), AdapterId::Slither);
        assert_eq!(finding.confidence, 0.5);
    }

    #[test]
    fn test_normalize_risk_scores() {
        let risk = normalize_risk(
            &RawRisk {
                risk_level: Some("high".to_string()),
                probability: Some(0.5),
                ..RawRisk::default()
            },
            AdapterId::Anthropic,
        );
        assert_eq!(risk.title, "Unknown Risk");
        assert_eq!(risk.category, RiskCategory::Technical);
        assert_eq!(risk.impact_score, None);
        assert!((risk.risk_score - 0.375).abs() < 1e-12);

        let risk = normalize_risk(
            &RawRisk {
                probability: Some(-0.2),
                impact_score: Some(0.9),
                ..RawRisk::default()
            },
            AdapterId::Anthropic,
        );
        assert_eq!(risk.probability, 0.0);
        assert_eq!(risk.risk_score, 0.0);
    }
}
