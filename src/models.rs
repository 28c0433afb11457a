//! Data models for contract analyses.
//!
//! This module contains the canonical entities shared by every component:
//! the analysis record and its lifecycle, findings, risks, and the
//! contract submitted for review.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Severity of a finding, also used as the level of a risk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Low severity - informational, style, minor gas issues
    Low,
    /// Medium severity - weaknesses exploitable under specific conditions
    Medium,
    /// High severity - exploitable vulnerabilities
    High,
    /// Critical severity - direct loss of funds or control
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Low => write!(f, "Low"),
            Severity::Medium => write!(f, "Medium"),
            Severity::High => write!(f, "High"),
            Severity::Critical => write!(f, "Critical"),
        }
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity: {}", other)),
        }
    }
}

impl Severity {
    /// All severities, most severe first.
    pub const DESCENDING: [Severity; 4] = [
        Severity::Critical,
        Severity::High,
        Severity::Medium,
        Severity::Low,
    ];

    /// Returns an emoji representation of the severity.
    pub fn emoji(&self) -> &'static str {
        match self {
            Severity::Low => "🟢",
            Severity::Medium => "🟡",
            Severity::High => "🟠",
            Severity::Critical => "🔴",
        }
    }

    /// Lowercase wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

/// Category of a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FindingCategory {
    AccessControl,
    Arithmetic,
    Reentrancy,
    Gas,
    Other,
}

impl fmt::Display for FindingCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FindingCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FindingCategory::AccessControl => "access-control",
            FindingCategory::Arithmetic => "arithmetic",
            FindingCategory::Reentrancy => "reentrancy",
            FindingCategory::Gas => "gas",
            FindingCategory::Other => "other",
        }
    }
}

impl From<&str> for FindingCategory {
    fn from(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "access-control" | "access_control" | "access control" => FindingCategory::AccessControl,
            "arithmetic" => FindingCategory::Arithmetic,
            "reentrancy" => FindingCategory::Reentrancy,
            "gas" => FindingCategory::Gas,
            _ => FindingCategory::Other,
        }
    }
}

/// Category of a risk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskCategory {
    Financial,
    Operational,
    Technical,
    Regulatory,
}

impl fmt::Display for RiskCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskCategory::Financial => write!(f, "financial"),
            RiskCategory::Operational => write!(f, "operational"),
            RiskCategory::Technical => write!(f, "technical"),
            RiskCategory::Regulatory => write!(f, "regulatory"),
        }
    }
}

impl FromStr for RiskCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "financial" => Ok(RiskCategory::Financial),
            "operational" => Ok(RiskCategory::Operational),
            "technical" => Ok(RiskCategory::Technical),
            "regulatory" => Ok(RiskCategory::Regulatory),
            other => Err(format!("unknown risk category: {}", other)),
        }
    }
}

/// Where in the contract a finding was located.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

impl Location {
    /// True when no location detail is known.
    pub fn is_empty(&self) -> bool {
        self.line.is_none() && self.function.is_none() && self.file.is_none()
    }
}

/// Identity of the adapter that produced an entity.
///
/// Variants are declared in the fixed merge order: earlier variants win
/// deduplication ties against later ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterId {
    Slither,
    Mythril,
    Semgrep,
    OpenAi,
    Anthropic,
}

impl AdapterId {
    pub const ALL: [AdapterId; 5] = [
        AdapterId::Slither,
        AdapterId::Mythril,
        AdapterId::Semgrep,
        AdapterId::OpenAi,
        AdapterId::Anthropic,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AdapterId::Slither => "slither",
            AdapterId::Mythril => "mythril",
            AdapterId::Semgrep => "semgrep",
            AdapterId::OpenAi => "openai",
            AdapterId::Anthropic => "anthropic",
        }
    }

    /// True for the process-based scanner family.
    pub fn is_scanner(&self) -> bool {
        matches!(
            self,
            AdapterId::Slither | AdapterId::Mythril | AdapterId::Semgrep
        )
    }
}

impl fmt::Display for AdapterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A security observation, owned by exactly one analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub recommendation: String,
    pub severity: Severity,
    pub category: FindingCategory,
    #[serde(default, skip_serializing_if = "Location::is_empty")]
    pub location: Location,
    /// Adapter that reported the finding.
    pub source: AdapterId,
    /// Confidence in [0, 1].
    pub confidence: f64,
}

impl Finding {
    /// Line number used for display and merge keys.
    pub fn line(&self) -> Option<u32> {
        self.location.line
    }
}

/// A probabilistic assessment of impact, owned by exactly one analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Risk {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub impact: String,
    pub mitigation: String,
    pub level: Severity,
    pub category: RiskCategory,
    /// Probability in [0, 1].
    pub probability: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub impact_score: Option<f64>,
    /// probability × impact_score, in [0, 1].
    pub risk_score: f64,
    pub source: AdapterId,
}

/// Lifecycle state of an analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisStatus {
    Pending,
    Analyzing,
    Completed,
    Failed,
}

impl fmt::Display for AnalysisStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnalysisStatus::Pending => write!(f, "pending"),
            AnalysisStatus::Analyzing => write!(f, "analyzing"),
            AnalysisStatus::Completed => write!(f, "completed"),
            AnalysisStatus::Failed => write!(f, "failed"),
        }
    }
}

impl AnalysisStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AnalysisStatus::Completed | AnalysisStatus::Failed)
    }

    /// Allowed edges: pending → analyzing → {completed | failed}.
    pub fn can_transition_to(&self, next: AnalysisStatus) -> bool {
        matches!(
            (self, next),
            (AnalysisStatus::Pending, AnalysisStatus::Analyzing)
                | (AnalysisStatus::Analyzing, AnalysisStatus::Completed)
                | (AnalysisStatus::Analyzing, AnalysisStatus::Failed)
        )
    }
}

/// One orchestrated run over a contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    pub id: Uuid,
    pub contract_id: String,
    pub status: AnalysisStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Whole seconds between start and completion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<i64>,
    /// Aggregate score, present only when completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl Analysis {
    /// Creates a new pending analysis for a contract.
    pub fn pending(contract_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            contract_id: contract_id.into(),
            status: AnalysisStatus::Pending,
            started_at: None,
            completed_at: None,
            duration_seconds: None,
            risk_score: None,
            summary: None,
        }
    }

    /// Moves to `analyzing` and stamps the start time.
    pub fn begin(&mut self, now: DateTime<Utc>) -> Result<(), String> {
        self.transition(AnalysisStatus::Analyzing)?;
        self.started_at = Some(now);
        Ok(())
    }

    /// Moves to `completed` with the final score and summary.
    pub fn complete(
        &mut self,
        now: DateTime<Utc>,
        risk_score: f64,
        summary: String,
    ) -> Result<(), String> {
        self.transition(AnalysisStatus::Completed)?;
        self.stamp_completion(now);
        self.risk_score = Some(risk_score);
        self.summary = Some(summary);
        Ok(())
    }

    /// Moves to `failed` with a user-facing summary.
    pub fn fail(&mut self, now: DateTime<Utc>, summary: String) -> Result<(), String> {
        self.transition(AnalysisStatus::Failed)?;
        self.stamp_completion(now);
        self.risk_score = None;
        self.summary = Some(summary);
        Ok(())
    }

    fn transition(&mut self, next: AnalysisStatus) -> Result<(), String> {
        if !self.status.can_transition_to(next) {
            return Err(format!(
                "invalid status transition {} -> {}",
                self.status, next
            ));
        }
        self.status = next;
        Ok(())
    }

    fn stamp_completion(&mut self, now: DateTime<Utc>) {
        self.completed_at = Some(now);
        self.duration_seconds = self
            .started_at
            .map(|started| (now - started).num_seconds().max(0));
    }
}

/// A contract submitted for review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contract {
    /// Identifier used as the analysis key.
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<u64>,
    /// Solidity source code.
    pub source_code: String,
}

impl Contract {
    pub fn new(id: impl Into<String>, source_code: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            address: None,
            chain_id: None,
            source_code: source_code.into(),
        }
    }

    /// Display name used in prompts and reports.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("Unknown")
    }
}

/// Counts of findings and risks by severity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FindingSummary {
    pub total_findings: usize,
    pub critical: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
    pub total_risks: usize,
    pub critical_risks: usize,
    pub high_risks: usize,
    /// Findings grouped by category.
    pub by_category: std::collections::BTreeMap<String, usize>,
}

impl FindingSummary {
    /// Creates a summary from merged findings and risks.
    pub fn from_entities(findings: &[Finding], risks: &[Risk]) -> Self {
        let mut summary = Self {
            total_findings: findings.len(),
            total_risks: risks.len(),
            ..Self::default()
        };

        for finding in findings {
            match finding.severity {
                Severity::Critical => summary.critical += 1,
                Severity::High => summary.high += 1,
                Severity::Medium => summary.medium += 1,
                Severity::Low => summary.low += 1,
            }

            *summary
                .by_category
                .entry(finding.category.to_string())
                .or_insert(0) += 1;
        }

        for risk in risks {
            match risk.level {
                Severity::Critical => summary.critical_risks += 1,
                Severity::High => summary.high_risks += 1,
                _ => {}
            }
        }

        summary
    }
}

/// Full result bundle of a completed analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResults {
    pub analysis: Analysis,
    pub findings: Vec<Finding>,
    pub risks: Vec<Risk>,
    pub summary: FindingSummary,
}
