//! Markdown report generation.
//!
//! This module generates Markdown and JSON audit reports from the
//! results of a completed analysis.

use crate::analysis::aggregator::{count_by_source, group_by_severity, sort_risks, top_findings};
use crate::models::{AnalysisResults, Finding, FindingSummary, Risk, Severity};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io::Write;
use std::path::Path;

/// Findings listed in the summary's highlight table.
const TOP_FINDINGS: usize = 5;

/// Information about the run that produced the results.
#[derive(Debug, Clone, Serialize)]
pub struct ReportMetadata {
    pub contract_id: String,
    pub contract_name: String,
    pub analysis_date: DateTime<Utc>,
    /// Adapters that took part in the run.
    pub analyzers: Vec<String>,
    pub duration_seconds: f64,
}

/// A complete audit report.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub metadata: ReportMetadata,
    #[serde(flatten)]
    pub results: AnalysisResults,
    /// Whether the risks table is rendered.
    #[serde(skip)]
    pub include_risks: bool,
}

/// Generate a complete Markdown report.
pub fn generate_markdown_report(report: &Report) -> String {
    let results = &report.results;
    let mut output = String::new();

    output.push_str("# AuditMesh Report\n\n");
    output.push_str(&generate_metadata_section(&report.metadata, results));
    output.push_str(&generate_summary_section(&results.summary, &results.findings));
    output.push_str(&generate_findings_section(&results.findings));
    if report.include_risks {
        output.push_str(&generate_risks_section(&results.risks));
    }
    output.push_str(&generate_footer());

    output
}

/// Generate the metadata section.
fn generate_metadata_section(metadata: &ReportMetadata, results: &AnalysisResults) -> String {
    let mut section = String::new();

    section.push_str("## Metadata\n\n");
    section.push_str(&format!(
        "- **Contract:** {} (`{}`)\n",
        metadata.contract_name, metadata.contract_id
    ));
    section.push_str(&format!(
        "- **Analysis Date:** {}\n",
        metadata.analysis_date.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    if !metadata.analyzers.is_empty() {
        section.push_str(&format!(
            "- **Analyzers:** {}\n",
            metadata.analyzers.join(", ")
        ));
    }
    section.push_str(&format!(
        "- **Risk Score:** {:.2}\n",
        results.analysis.risk_score.unwrap_or(0.0)
    ));
    section.push_str(&format!(
        "- **Analysis Duration:** {:.1}s\n",
        metadata.duration_seconds
    ));
    if let Some(ref summary) = results.analysis.summary {
        section.push_str(&format!("\n> {}\n", summary));
    }
    section.push('\n');

    section
}

/// Generate the summary section.
fn generate_summary_section(summary: &FindingSummary, findings: &[Finding]) -> String {
    let mut section = String::new();

    section.push_str("## Summary\n\n");

    section.push_str("### Finding Severity Breakdown\n\n");
    section.push_str(&format!(
        "| {} Critical | {} High | {} Medium | {} Low | **Total** |\n",
        Severity::Critical.emoji(),
        Severity::High.emoji(),
        Severity::Medium.emoji(),
        Severity::Low.emoji(),
    ));
    section.push_str("|:---:|:---:|:---:|:---:|:---:|\n");
    section.push_str(&format!(
        "| {} | {} | {} | {} | **{}** |\n\n",
        summary.critical, summary.high, summary.medium, summary.low, summary.total_findings
    ));

    if !summary.by_category.is_empty() {
        section.push_str("### Findings by Category\n\n");
        section.push_str("| Category | Count |\n");
        section.push_str("|:---|:---:|\n");

        let mut categories: Vec<_> = summary.by_category.iter().collect();
        categories.sort_by_key(|(_, count)| std::cmp::Reverse(*count));

        for (category, count) in categories {
            section.push_str(&format!("| {} | {} |\n", category, count));
        }
        section.push('\n');
    }

    let top = top_findings(findings, TOP_FINDINGS);
    if !top.is_empty() {
        section.push_str("### Top Findings\n\n");
        section.push_str("| # | Severity | Finding | Line | Analyzer |\n");
        section.push_str("|:---:|:---|:---|:---:|:---|\n");
        for (rank, finding) in top.iter().enumerate() {
            section.push_str(&format!(
                "| {} | {} {} | {} | {} | {} |\n",
                rank + 1,
                finding.severity.emoji(),
                finding.severity,
                finding.title.replace('|', "\\|"),
                finding
                    .line()
                    .map(|line| line.to_string())
                    .unwrap_or_else(|| "-".to_string()),
                finding.source
            ));
        }
        section.push('\n');
    }

    let sources = count_by_source(findings);
    if !sources.is_empty() {
        section.push_str("### Findings by Analyzer\n\n");
        section.push_str("| Analyzer | Findings |\n");
        section.push_str("|:---|:---:|\n");
        for (source, count) in sources {
            section.push_str(&format!("| {} | {} |\n", source, count));
        }
        section.push('\n');
    }

    section
}

/// Generate the findings section, grouped by severity.
fn generate_findings_section(findings: &[Finding]) -> String {
    let mut section = String::new();

    section.push_str("## Findings\n\n");

    if findings.is_empty() {
        section.push_str("No findings were reported for this contract.\n\n");
        return section;
    }

    let grouped = group_by_severity(findings);
    for severity in Severity::DESCENDING {
        let Some(group) = grouped.get(&severity) else {
            continue;
        };
        section.push_str(&format!("### {} {} ({})\n\n", severity.emoji(), severity, group.len()));
        for finding in group {
            section.push_str(&generate_finding_block(finding));
        }
    }

    section
}

/// Generate a single finding block.
fn generate_finding_block(finding: &Finding) -> String {
    let mut block = String::new();

    block.push_str(&format!("#### {} - {}\n\n", finding.category, finding.title));

    let mut location = Vec::new();
    if let Some(line) = finding.location.line {
        location.push(format!("line {}", line));
    }
    if let Some(ref function) = finding.location.function {
        location.push(format!("`{}`", function));
    }
    if let Some(ref file) = finding.location.file {
        location.push(format!("in `{}`", file));
    }
    if !location.is_empty() {
        block.push_str(&format!("**Location:** {}\n\n", location.join(" ")));
    }

    block.push_str(&format!(
        "*Reported by {} (confidence {:.0}%)*\n\n",
        finding.source,
        finding.confidence * 100.0
    ));

    if !finding.description.is_empty() {
        block.push_str(&format!("**Description:** {}\n\n", finding.description));
    }

    if !finding.recommendation.is_empty() {
        block.push_str(&format!("> 💡 **Recommendation:** {}\n\n", finding.recommendation));
    }

    block.push_str("---\n\n");

    block
}

/// Generate the risks table.
fn generate_risks_section(risks: &[Risk]) -> String {
    if risks.is_empty() {
        return String::new();
    }

    let mut risks = risks.to_vec();
    sort_risks(&mut risks);

    let mut section = String::new();
    section.push_str("## Risks\n\n");
    section.push_str("| Level | Category | Risk | Probability | Score | Mitigation |\n");
    section.push_str("|:---|:---|:---|:---:|:---:|:---|\n");

    for risk in &risks {
        section.push_str(&format!(
            "| {} {} | {} | {} | {:.0}% | {:.2} | {} |\n",
            risk.level.emoji(),
            risk.level,
            risk.category,
            risk.title,
            risk.probability * 100.0,
            risk.risk_score,
            risk.mitigation.replace('|', "\\|")
        ));
    }
    section.push('\n');

    section
}

/// Generate the report footer.
fn generate_footer() -> String {
    let mut footer = String::new();

    footer.push_str("---\n\n");
    footer.push_str(&format!(
        "*Report generated by AuditMesh v{}*\n",
        env!("CARGO_PKG_VERSION")
    ));

    footer
}

/// Generate a JSON report.
pub fn generate_json_report(report: &Report) -> Result<String> {
    serde_json::to_string_pretty(report).map_err(Into::into)
}

/// Write rendered report content to a file.
pub fn write_report(content: &str, path: &Path) -> Result<()> {
    let mut file = std::fs::File::create(path)?;
    file.write_all(content.as_bytes())?;

    Ok(())
}
