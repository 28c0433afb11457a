//! Analyzer adapters.
//!
//! Every external analyzer, whether a process-based scanner or a model
//! reviewer, is wrapped behind the [`Analyzer`] capability. An adapter
//! call always settles into an [`AdapterOutcome`]; errors are data here.

pub mod model;
pub mod parsers;
pub mod process;
pub mod retry;

use crate::config::Config;
use crate::error::AdapterError;
use crate::models::{AdapterId, Contract};
use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

pub use model::{HttpModelClient, ModelBackend, ModelReviewer};
pub use process::{ProcessScanner, ScannerTool};

/// Kind of analysis a caller can request.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisKind {
    /// Vulnerability findings
    Security,
    /// Probabilistic risk assessments
    Risk,
    /// Gas optimization findings
    Gas,
}

impl AnalysisKind {
    pub const ALL: [AnalysisKind; 3] = [AnalysisKind::Security, AnalysisKind::Risk, AnalysisKind::Gas];

    /// Falls back to every kind when nothing was requested.
    pub fn or_all(kinds: &[AnalysisKind]) -> Vec<AnalysisKind> {
        if kinds.is_empty() {
            return Self::ALL.to_vec();
        }
        let mut kinds = kinds.to_vec();
        kinds.sort();
        kinds.dedup();
        kinds
    }
}

impl fmt::Display for AnalysisKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnalysisKind::Security => write!(f, "security"),
            AnalysisKind::Risk => write!(f, "risk"),
            AnalysisKind::Gas => write!(f, "gas"),
        }
    }
}

/// A finding as reported by an adapter, before normalization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawFinding {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub recommendation: Option<String>,
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default, deserialize_with = "lenient_line")]
    pub line_number: Option<u32>,
    #[serde(default)]
    pub function_name: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
}

/// A risk as reported by an adapter, before normalization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawRisk {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub impact: Option<String>,
    #[serde(default)]
    pub mitigation: Option<String>,
    #[serde(default, alias = "level")]
    pub risk_level: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub probability: Option<f64>,
    #[serde(default)]
    pub impact_score: Option<f64>,
}

/// Accepts `42`, `"42"` or `null` for line numbers; models are not strict.
fn lenient_line<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::Number(n)) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Some(serde_json::Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

/// Everything an adapter managed to produce.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AdapterReport {
    pub findings: Vec<RawFinding>,
    pub risks: Vec<RawRisk>,
    pub metadata: BTreeMap<String, String>,
}

impl AdapterReport {
    pub fn is_empty(&self) -> bool {
        self.findings.is_empty() && self.risks.is_empty()
    }

    /// Appends another report's entities, keeping order.
    pub fn extend(&mut self, other: AdapterReport) {
        self.findings.extend(other.findings);
        self.risks.extend(other.risks);
        self.metadata.extend(other.metadata);
    }
}

/// Result of one adapter call.
#[derive(Debug, Clone, PartialEq)]
pub enum AdapterOutcome {
    Success(AdapterReport),
    PartialFailure {
        report: AdapterReport,
        reason: AdapterError,
    },
    Failure(AdapterError),
}

impl AdapterOutcome {
    /// Whatever parsed, regardless of how the call ended.
    pub fn report(&self) -> Option<&AdapterReport> {
        match self {
            AdapterOutcome::Success(report) => Some(report),
            AdapterOutcome::PartialFailure { report, .. } => Some(report),
            AdapterOutcome::Failure(_) => None,
        }
    }

    pub fn error(&self) -> Option<&AdapterError> {
        match self {
            AdapterOutcome::Success(_) => None,
            AdapterOutcome::PartialFailure { reason, .. } => Some(reason),
            AdapterOutcome::Failure(err) => Some(err),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, AdapterOutcome::Failure(_))
    }

    /// Short label for logs and progress messages.
    pub fn label(&self) -> &'static str {
        match self {
            AdapterOutcome::Success(_) => "succeeded",
            AdapterOutcome::PartialFailure { .. } => "partially failed",
            AdapterOutcome::Failure(_) => "failed",
        }
    }

    /// Builds an outcome from a report and an optional failure reason.
    pub fn from_parts(report: AdapterReport, reason: Option<AdapterError>) -> Self {
        match reason {
            None => AdapterOutcome::Success(report),
            Some(reason) if report.is_empty() => AdapterOutcome::Failure(reason),
            Some(reason) => AdapterOutcome::PartialFailure { report, reason },
        }
    }
}

/// An outcome tagged with the adapter that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct TaggedOutcome {
    pub adapter: AdapterId,
    pub outcome: AdapterOutcome,
}

/// Uniform capability over one external analyzer.
#[async_trait]
pub trait Analyzer: Send + Sync {
    /// Adapter identity; also fixes its position in merge order.
    fn id(&self) -> AdapterId;

    /// Whether this adapter contributes to the given kind.
    fn supports(&self, kind: AnalysisKind) -> bool;

    /// Run the analyzer. Never panics or returns an error across this
    /// boundary; every condition is represented in the outcome.
    async fn analyze(&self, contract: &Contract, kinds: &[AnalysisKind]) -> AdapterOutcome;
}

/// Which adapter families a run may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdapterFamilies {
    pub scanners: bool,
    pub reviewers: bool,
}

impl Default for AdapterFamilies {
    fn default() -> Self {
        Self {
            scanners: true,
            reviewers: true,
        }
    }
}

/// Construct the enabled adapters in fixed merge order.
pub fn build_adapters(config: &Config, families: AdapterFamilies) -> Vec<Arc<dyn Analyzer>> {
    let mut adapters: Vec<Arc<dyn Analyzer>> = Vec::new();

    for id in AdapterId::ALL {
        let adapter: Option<Arc<dyn Analyzer>> =
            match (ScannerTool::for_adapter(id), ModelBackend::for_adapter(id)) {
                (Some(tool), _) => {
                    let settings = config.scanners.for_tool(tool);
                    (families.scanners && settings.enabled).then(|| {
                        Arc::new(ProcessScanner::from_config(tool, settings)) as Arc<dyn Analyzer>
                    })
                }
                (None, Some(backend)) => {
                    let settings = config.models.for_backend(backend);
                    (families.reviewers && settings.enabled).then(|| {
                        Arc::new(ModelReviewer::from_config(backend, settings)) as Arc<dyn Analyzer>
                    })
                }
                (None, None) => None,
            };

        match adapter {
            Some(adapter) => adapters.push(adapter),
            None => debug!("Adapter {} disabled", id),
        }
    }

    info!("Configured {} analyzer adapters", adapters.len());
    adapters
}

/// Adapters applicable to any of the requested kinds, in merge order.
pub fn select_applicable(
    adapters: &[Arc<dyn Analyzer>],
    kinds: &[AnalysisKind],
) -> Vec<Arc<dyn Analyzer>> {
    let mut selected: Vec<Arc<dyn Analyzer>> = adapters
        .iter()
        .filter(|adapter| kinds.iter().any(|kind| adapter.supports(*kind)))
        .cloned()
        .collect();
    selected.sort_by_key(|adapter| adapter.id());
    selected
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(AdapterId, Vec<AnalysisKind>);

    #[async_trait]
    impl Analyzer for Fixed {
        fn id(&self) -> AdapterId {
            self.0
        }

        fn supports(&self, kind: AnalysisKind) -> bool {
            self.1.contains(&kind)
        }

        async fn analyze(&self, _contract: &Contract, _kinds: &[AnalysisKind]) -> AdapterOutcome {
            AdapterOutcome::Success(AdapterReport::default())
        }
    }

    #[test]
    fn test_or_all_defaults_and_dedups() {
        assert_eq!(AnalysisKind::or_all(&[]), AnalysisKind::ALL.to_vec());
        assert_eq!(
            AnalysisKind::or_all(&[AnalysisKind::Gas, AnalysisKind::Security, AnalysisKind::Gas]),
            vec![AnalysisKind::Security, AnalysisKind::Gas]
        );
    }

    #[test]
    fn test_outcome_from_parts() {
        let report = AdapterReport {
            findings: vec![RawFinding::default()],
            ..AdapterReport::default()
        };
        let reason = AdapterError::MalformedOutput("x".to_string());

        assert!(matches!(
            AdapterOutcome::from_parts(report.clone(), None),
            AdapterOutcome::Success(_)
        ));
        assert!(matches!(
            AdapterOutcome::from_parts(report, Some(reason.clone())),
            AdapterOutcome::PartialFailure { .. }
        ));
        assert!(AdapterOutcome::from_parts(AdapterReport::default(), Some(reason)).is_failure());
    }

    #[test]
    fn test_raw_finding_lenient_line() {
        let finding: RawFinding =
            serde_json::from_str(r#"{"title": "x", "line_number": "42"}"#).unwrap();
        assert_eq!(finding.line_number, Some(42));

        let finding: RawFinding = serde_json::from_str(r#"{"line_number": null}"#).unwrap();
        assert_eq!(finding.line_number, None);

        let risk: RawRisk = serde_json::from_str(r#"{"level": "high"}"#).unwrap();
        assert_eq!(risk.risk_level.as_deref(), Some("high"));
    }

    #[test]
    fn test_select_applicable_keeps_merge_order() {
        let adapters: Vec<Arc<dyn Analyzer>> = vec![
            Arc::new(Fixed(AdapterId::OpenAi, vec![AnalysisKind::Security, AnalysisKind::Risk])),
            Arc::new(Fixed(AdapterId::Semgrep, vec![AnalysisKind::Security])),
            Arc::new(Fixed(AdapterId::Slither, vec![AnalysisKind::Security, AnalysisKind::Gas])),
        ];

        let ids: Vec<_> = select_applicable(&adapters, &[AnalysisKind::Security])
            .iter()
            .map(|a| a.id())
            .collect();
        assert_eq!(ids, vec![AdapterId::Slither, AdapterId::Semgrep, AdapterId::OpenAi]);

        let ids: Vec<_> = select_applicable(&adapters, &[AnalysisKind::Risk])
            .iter()
            .map(|a| a.id())
            .collect();
        assert_eq!(ids, vec![AdapterId::OpenAi]);
    }

    #[test]
    fn test_build_adapters_respects_families() {
        let config = Config::default();
        let all = build_adapters(&config, AdapterFamilies::default());
        assert_eq!(all.len(), 5);
        assert_eq!(all[0].id(), AdapterId::Slither);
        assert_eq!(all[4].id(), AdapterId::Anthropic);

        let scanners_only = build_adapters(
            &config,
            AdapterFamilies {
                scanners: true,
                reviewers: false,
            },
        );
        assert!(scanners_only.iter().all(|a| a.id().is_scanner()));
        assert_eq!(scanners_only.len(), 3);
    }
}
