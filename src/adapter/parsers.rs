//! Scanner output parsers.
//!
//! Each parser validates the tool's JSON against a typed schema and maps
//! tool-specific severities, confidences and categories onto raw findings.
//! Unreadable output has exactly one effect: `Failure(MalformedOutput)`.

use super::{AdapterOutcome, AdapterReport, RawFinding};
use crate::error::AdapterError;
use serde::Deserialize;

fn default_success() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Slither
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SlitherOutput {
    #[serde(default = "default_success")]
    success: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    results: SlitherResults,
}

#[derive(Debug, Default, Deserialize)]
struct SlitherResults {
    #[serde(default)]
    detectors: Vec<SlitherDetector>,
}

#[derive(Debug, Deserialize)]
struct SlitherDetector {
    #[serde(default)]
    check: String,
    #[serde(default)]
    impact: String,
    #[serde(default)]
    confidence: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    elements: Vec<SlitherElement>,
}

#[derive(Debug, Deserialize)]
struct SlitherElement {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    source_mapping: Option<SourceMapping>,
}

#[derive(Debug, Deserialize)]
struct SourceMapping {
    #[serde(default)]
    lines: Vec<u32>,
    #[serde(default)]
    filename_relative: Option<String>,
}

/// Parse `slither --json -` output. Optimization detectors are kept only
/// when gas findings were requested.
pub fn parse_slither(stdout: &str, include_gas: bool) -> AdapterOutcome {
    if stdout.trim().is_empty() {
        return AdapterOutcome::Success(AdapterReport::default());
    }

    let parsed: SlitherOutput = match serde_json::from_str(stdout) {
        Ok(parsed) => parsed,
        Err(e) => return malformed("slither", e),
    };

    let mut report = AdapterReport::default();
    for detector in parsed.results.detectors {
        let is_optimization = detector.impact.eq_ignore_ascii_case("optimization");
        if is_optimization && !include_gas {
            continue;
        }

        let first = detector.elements.first();
        let mapping = first.and_then(|e| e.source_mapping.as_ref());

        let category = if is_optimization {
            "gas"
        } else {
            categorize_by_keyword(&detector.check)
        };

        report.findings.push(RawFinding {
            title: Some(detector.check.clone()),
            description: Some(detector.description.trim().to_string()),
            recommendation: Some(format!(
                "Address the {} issue identified by Slither analysis.",
                detector.check
            )),
            severity: Some(map_slither_impact(&detector.impact).to_string()),
            category: Some(category.to_string()),
            line_number: mapping.and_then(|m| m.lines.first().copied()),
            function_name: first.and_then(|e| e.name.clone()),
            file_name: mapping.and_then(|m| m.filename_relative.clone()),
            confidence: Some(map_slither_confidence(&detector.confidence)),
        });
    }

    report
        .metadata
        .insert("detectors".to_string(), report.findings.len().to_string());

    let reason = (!parsed.success).then(|| {
        AdapterError::MalformedOutput(
            parsed
                .error
                .unwrap_or_else(|| "slither reported an unsuccessful run".to_string()),
        )
    });
    AdapterOutcome::from_parts(report, reason)
}

fn map_slither_impact(impact: &str) -> &'static str {
    match impact {
        "High" => "high",
        "Medium" => "medium",
        _ => "low",
    }
}

fn map_slither_confidence(confidence: &str) -> f64 {
    match confidence {
        "High" => 0.9,
        "Medium" => 0.7,
        _ => 0.5,
    }
}

/// Keyword categorization shared by Slither checks and Semgrep rule ids.
fn categorize_by_keyword(check: &str) -> &'static str {
    let check = check.to_lowercase();
    if check.contains("reentrancy") {
        "reentrancy"
    } else if check.contains("access") || check.contains("modifier") {
        "access-control"
    } else if check.contains("arithmetic") || check.contains("overflow") || check.contains("underflow")
    {
        "arithmetic"
    } else if check.contains("gas") {
        "gas"
    } else {
        "other"
    }
}

// ---------------------------------------------------------------------------
// Mythril
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct MythrilOutput {
    #[serde(default = "default_success")]
    success: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    issues: Vec<MythrilIssue>,
}

#[derive(Debug, Deserialize)]
struct MythrilIssue {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: String,
    #[serde(default)]
    severity: String,
    #[serde(default, rename = "swc-id")]
    swc_id: String,
    #[serde(default)]
    lineno: Option<u32>,
    #[serde(default)]
    function: Option<String>,
    #[serde(default)]
    filename: Option<String>,
}

/// Parse `myth analyze -o json` output.
pub fn parse_mythril(stdout: &str) -> AdapterOutcome {
    if stdout.trim().is_empty() {
        return AdapterOutcome::Success(AdapterReport::default());
    }

    let parsed: MythrilOutput = match serde_json::from_str(stdout) {
        Ok(parsed) => parsed,
        Err(e) => return malformed("mythril", e),
    };

    let mut report = AdapterReport::default();
    for issue in parsed.issues {
        let swc = normalize_swc(&issue.swc_id);
        report.findings.push(RawFinding {
            title: issue.title,
            description: Some(issue.description),
            recommendation: Some(mythril_recommendation(&swc).to_string()),
            severity: Some(issue.severity.to_lowercase()),
            category: Some(categorize_swc(&swc).to_string()),
            line_number: issue.lineno,
            function_name: issue.function,
            file_name: issue.filename,
            // Mythril reports no confidence of its own.
            confidence: Some(0.8),
        });
    }

    let reason = (!parsed.success).then(|| {
        AdapterError::MalformedOutput(
            parsed
                .error
                .unwrap_or_else(|| "mythril reported an unsuccessful run".to_string()),
        )
    });
    AdapterOutcome::from_parts(report, reason)
}

/// "SWC-107" and "107" both become "107".
fn normalize_swc(id: &str) -> String {
    id.trim()
        .trim_start_matches("SWC-")
        .trim_start_matches("swc-")
        .to_string()
}

fn categorize_swc(swc: &str) -> &'static str {
    match swc {
        "107" => "reentrancy",
        "101" => "arithmetic",
        "104" | "105" | "115" => "access-control",
        _ => "other",
    }
}

fn mythril_recommendation(swc: &str) -> &'static str {
    match swc {
        "107" => "Implement a reentrancy guard or use the checks-effects-interactions pattern",
        "101" => "Use Solidity 0.8+ checked arithmetic or a safe math library",
        "104" => "Check the return value of every low-level call",
        "105" => "Restrict withdrawals to authorized callers",
        "115" => "Use msg.sender instead of tx.origin for authorization",
        _ => "Review and address the identified security issue.",
    }
}

// ---------------------------------------------------------------------------
// Semgrep
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SemgrepOutput {
    #[serde(default)]
    results: Vec<SemgrepResult>,
    #[serde(default)]
    errors: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct SemgrepResult {
    #[serde(default)]
    check_id: String,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    start: Option<SemgrepPosition>,
    #[serde(default)]
    extra: SemgrepExtra,
}

#[derive(Debug, Deserialize)]
struct SemgrepPosition {
    #[serde(default)]
    line: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct SemgrepExtra {
    #[serde(default)]
    message: String,
    #[serde(default)]
    severity: String,
}

/// Parse `semgrep --json` output.
pub fn parse_semgrep(stdout: &str) -> AdapterOutcome {
    if stdout.trim().is_empty() {
        return AdapterOutcome::Success(AdapterReport::default());
    }

    let parsed: SemgrepOutput = match serde_json::from_str(stdout) {
        Ok(parsed) => parsed,
        Err(e) => return malformed("semgrep", e),
    };

    let mut report = AdapterReport::default();
    for result in parsed.results {
        let title = result
            .check_id
            .rsplit('.')
            .next()
            .unwrap_or("Unknown Issue")
            .to_string();

        report.findings.push(RawFinding {
            title: Some(title),
            description: Some(result.extra.message),
            recommendation: Some("Review and address the identified pattern".to_string()),
            severity: Some(map_semgrep_severity(&result.extra.severity).to_string()),
            category: Some(categorize_by_keyword(&result.check_id).to_string()),
            line_number: result.start.and_then(|s| s.line),
            function_name: None,
            file_name: result.path,
            confidence: Some(0.7),
        });
    }

    let reason = (!parsed.errors.is_empty()).then(|| {
        AdapterError::MalformedOutput(format!("semgrep reported {} errors", parsed.errors.len()))
    });
    AdapterOutcome::from_parts(report, reason)
}

fn map_semgrep_severity(severity: &str) -> &'static str {
    match severity.to_uppercase().as_str() {
        "ERROR" => "high",
        "WARNING" => "medium",
        _ => "low",
    }
}

fn malformed(tool: &str, err: serde_json::Error) -> AdapterOutcome {
    AdapterOutcome::Failure(AdapterError::MalformedOutput(format!(
        "{} output is not valid JSON: {}",
        tool, err
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SLITHER: &str = include_str!("../../fixtures/slither.json");
    const MYTHRIL: &str = include_str!("../../fixtures/mythril.json");
    const SEMGREP: &str = include_str!("../../fixtures/semgrep.json");

    fn findings(outcome: &AdapterOutcome) -> &[RawFinding] {
        &outcome.report().expect("outcome has a report").findings
    }

    #[test]
    fn test_parse_slither_fixture() {
        let outcome = parse_slither(SLITHER, false);
        assert!(matches!(outcome, AdapterOutcome::Success(_)));

        let found = findings(&outcome);
        assert_eq!(found.len(), 2);

        let reentrancy = &found[0];
        assert_eq!(reentrancy.title.as_deref(), Some("reentrancy-eth"));
        assert_eq!(reentrancy.severity.as_deref(), Some("high"));
        assert_eq!(reentrancy.category.as_deref(), Some("reentrancy"));
        assert_eq!(reentrancy.confidence, Some(0.7));
        assert_eq!(reentrancy.line_number, Some(21));
        assert_eq!(reentrancy.function_name.as_deref(), Some("withdraw"));

        assert_eq!(found[1].severity.as_deref(), Some("low"));
    }

    #[test]
    fn test_parse_slither_includes_gas_when_requested() {
        let outcome = parse_slither(SLITHER, true);
        let found = findings(&outcome);
        assert_eq!(found.len(), 3);
        assert_eq!(found[2].category.as_deref(), Some("gas"));
    }

    #[test]
    fn test_parse_slither_unsuccessful_run_is_partial() {
        let json = r#"{
            "success": false,
            "error": "compilation warning",
            "results": {"detectors": [{"check": "tx-origin", "impact": "Medium", "confidence": "High"}]}
        }"#;
        let outcome = parse_slither(json, false);
        match outcome {
            AdapterOutcome::PartialFailure { report, reason } => {
                assert_eq!(report.findings.len(), 1);
                assert_eq!(report.findings[0].confidence, Some(0.9));
                assert_eq!(
                    reason,
                    AdapterError::MalformedOutput("compilation warning".to_string())
                );
            }
            other => panic!("expected partial failure, got {:?}", other),
        }

        let failed = r#"{"success": false, "error": "solc missing", "results": {}}"#;
        assert!(parse_slither(failed, false).is_failure());
    }

    #[test]
    fn test_parse_mythril_fixture() {
        let outcome = parse_mythril(MYTHRIL);
        let found = findings(&outcome);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].category.as_deref(), Some("reentrancy"));
        assert_eq!(found[0].severity.as_deref(), Some("high"));
        assert_eq!(found[0].confidence, Some(0.8));
        assert_eq!(found[0].line_number, Some(21));
        assert_eq!(found[1].category.as_deref(), Some("access-control"));
        assert!(found[1]
            .recommendation
            .as_deref()
            .unwrap_or_default()
            .contains("tx.origin"));
    }

    #[test]
    fn test_parse_semgrep_fixture() {
        let outcome = parse_semgrep(SEMGREP);
        let found = findings(&outcome);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].title.as_deref(), Some("unchecked-overflow"));
        assert_eq!(found[0].category.as_deref(), Some("arithmetic"));
        assert_eq!(found[0].severity.as_deref(), Some("medium"));
        assert_eq!(found[1].severity.as_deref(), Some("high"));
        assert_eq!(found[1].line_number, Some(30));
    }

    #[test]
    fn test_semgrep_errors_make_partial_failure() {
        let json = r#"{
            "results": [{"check_id": "rules.reentrancy", "start": {"line": 3}, "extra": {"severity": "ERROR"}}],
            "errors": [{"message": "parse error"}]
        }"#;
        assert!(matches!(
            parse_semgrep(json),
            AdapterOutcome::PartialFailure { .. }
        ));
    }

    #[test]
    fn test_malformed_and_empty_output() {
        assert!(matches!(
            parse_slither("Traceback (most recent call last):", false),
            AdapterOutcome::Failure(AdapterError::MalformedOutput(_))
        ));
        assert!(parse_mythril("{not json").is_failure());
        assert_eq!(
            parse_semgrep("  \n"),
            AdapterOutcome::Success(AdapterReport::default())
        );
    }

    #[test]
    fn test_categorize_by_keyword() {
        assert_eq!(categorize_by_keyword("reentrancy-no-eth"), "reentrancy");
        assert_eq!(categorize_by_keyword("missing-modifier"), "access-control");
        assert_eq!(categorize_by_keyword("integer-overflow"), "arithmetic");
        assert_eq!(categorize_by_keyword("costly-gas-loop"), "gas");
        assert_eq!(categorize_by_keyword("shadowing-state"), "other");
    }

    #[test]
    fn test_normalize_swc() {
        assert_eq!(normalize_swc("SWC-107"), "107");
        assert_eq!(normalize_swc("101"), "101");
    }
}
