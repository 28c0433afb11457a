//! Command-line interface argument parsing.
//!
//! This module handles all CLI argument parsing using clap,
//! including validation and default values.

use crate::adapter::{AdapterFamilies, AnalysisKind};
use crate::models::Severity;
use clap::Parser;
use std::path::PathBuf;

/// AuditMesh - multi-analyzer smart contract auditor
///
/// Runs static scanners (Slither, Mythril, Semgrep) and model reviewers
/// (OpenAI, Anthropic) over a Solidity contract in parallel, merges their
/// findings, and writes a scored Markdown/JSON report.
///
/// Examples:
///   auditmesh --contract Vault.sol
///   auditmesh --contract Vault.sol --kinds security,gas --no-ai
///   auditmesh --contract Vault.sol --format json --output vault.json
///   auditmesh --contract Vault.sol --fail-on high
///   auditmesh --init-config
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    /// Solidity source file to analyze
    #[arg(long, value_name = "FILE", required_unless_present = "init_config")]
    pub contract: Option<PathBuf>,

    /// Contract name shown in prompts and reports
    ///
    /// Defaults to the file stem of --contract.
    #[arg(short, long, value_name = "NAME")]
    pub name: Option<String>,

    /// Analysis kinds to run (comma-separated)
    ///
    /// Example: --kinds security,risk. Defaults to every kind.
    #[arg(short, long, value_name = "KINDS", value_delimiter = ',')]
    pub kinds: Vec<AnalysisKind>,

    /// Output file path for the report
    ///
    /// Defaults to the config file setting (auditmesh_report.md).
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Output format (markdown, json)
    ///
    /// Defaults to the config file setting.
    #[arg(long, value_name = "FORMAT")]
    pub format: Option<OutputFormat>,

    /// Path to configuration file
    ///
    /// If not specified, looks for .auditmesh.toml in the current directory
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Skip the process-based scanners
    #[arg(long, conflicts_with = "no_ai")]
    pub no_static: bool,

    /// Skip the model reviewers
    #[arg(long)]
    pub no_ai: bool,

    /// Per-call timeout for every scanner, in seconds
    ///
    /// Overrides the per-scanner config file settings.
    #[arg(long, value_name = "SECS")]
    pub scanner_timeout: Option<u64>,

    /// OpenAI model name
    #[arg(long, value_name = "MODEL", env = "AUDITMESH_OPENAI_MODEL")]
    pub openai_model: Option<String>,

    /// Anthropic model name
    #[arg(long, value_name = "MODEL", env = "AUDITMESH_ANTHROPIC_MODEL")]
    pub anthropic_model: Option<String>,

    /// Fail if findings at or above this severity are found
    ///
    /// Useful for CI pipelines. Exit code 2 when threshold is exceeded.
    /// Values: critical, high, medium, low
    #[arg(long, value_name = "LEVEL")]
    pub fail_on: Option<FailOnLevel>,

    /// Enable verbose logging output
    #[arg(short, long)]
    pub verbose: bool,

    /// Run in quiet mode (minimal output)
    #[arg(short, long)]
    pub quiet: bool,

    /// Generate a default .auditmesh.toml configuration file
    #[arg(long)]
    pub init_config: bool,
}

/// Output format for the report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Markdown format (default)
    #[default]
    Markdown,
    /// JSON format
    Json,
}

impl OutputFormat {
    /// Parse the config file spelling; unknown values fall back to Markdown.
    pub fn from_config(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "json" => OutputFormat::Json,
            _ => OutputFormat::Markdown,
        }
    }
}

/// Severity level for --fail-on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, clap::ValueEnum)]
pub enum FailOnLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl From<FailOnLevel> for Severity {
    fn from(level: FailOnLevel) -> Self {
        match level {
            FailOnLevel::Low => Severity::Low,
            FailOnLevel::Medium => Severity::Medium,
            FailOnLevel::High => Severity::High,
            FailOnLevel::Critical => Severity::Critical,
        }
    }
}

impl Args {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the parsed arguments.
    pub fn validate(&self) -> Result<(), String> {
        // Skip validation for --init-config
        if self.init_config {
            return Ok(());
        }

        match self.contract {
            None => return Err("--contract is required".to_string()),
            Some(ref path) if !path.is_file() => {
                return Err(format!("Contract file does not exist: {}", path.display()));
            }
            Some(_) => {}
        }

        if self.verbose && self.quiet {
            return Err("Cannot use both --verbose and --quiet".to_string());
        }

        if self.no_static && self.no_ai {
            return Err("Cannot disable both scanners and model reviewers".to_string());
        }

        if let Some(timeout) = self.scanner_timeout {
            if timeout == 0 {
                return Err("Scanner timeout must be at least 1 second".to_string());
            }
        }

        if let Some(ref name) = self.name {
            if name.trim().is_empty() {
                return Err("Contract name cannot be empty".to_string());
            }
        }

        Ok(())
    }

    /// Returns the log level based on verbosity settings.
    pub fn log_level(&self) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else if self.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }

    /// Adapter families left enabled by --no-static / --no-ai.
    pub fn families(&self) -> AdapterFamilies {
        AdapterFamilies {
            scanners: !self.no_static,
            reviewers: !self.no_ai,
        }
    }

    /// Contract name: --name, else the file stem of --contract.
    pub fn contract_name(&self) -> Option<String> {
        self.name.clone().or_else(|| {
            self.contract
                .as_ref()
                .and_then(|path| path.file_stem())
                .map(|stem| stem.to_string_lossy().into_owned())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_args(contract: PathBuf) -> Args {
        Args {
            contract: Some(contract),
            name: None,
            kinds: Vec::new(),
            output: None,
            format: None,
            config: None,
            no_static: false,
            no_ai: false,
            scanner_timeout: None,
            openai_model: None,
            anthropic_model: None,
            fail_on: None,
            verbose: false,
            quiet: false,
            init_config: false,
        }
    }

    fn contract_file() -> tempfile::NamedTempFile {
        let file = tempfile::Builder::new()
            .prefix("Vault")
            .suffix(".sol")
            .tempfile()
            .unwrap();
        std::fs::write(file.path(), "contract Vault {}").unwrap();
        file
    }

    #[test]
    fn test_validation_accepts_existing_contract() {
        let file = contract_file();
        assert!(make_args(file.path().to_path_buf()).validate().is_ok());
    }

    #[test]
    fn test_validation_missing_contract() {
        let args = make_args(PathBuf::from("/nonexistent/Vault.sol"));
        assert!(args.validate().is_err());

        let mut args = make_args(PathBuf::new());
        args.contract = None;
        assert!(args.validate().is_err());
        args.init_config = true;
        assert!(args.validate().is_ok());
    }

    #[test]
    fn test_validation_conflicting_options() {
        let file = contract_file();
        let mut args = make_args(file.path().to_path_buf());
        args.verbose = true;
        args.quiet = true;
        assert!(args.validate().is_err());

        let mut args = make_args(file.path().to_path_buf());
        args.no_static = true;
        args.no_ai = true;
        assert!(args.validate().is_err());

        let mut args = make_args(file.path().to_path_buf());
        args.scanner_timeout = Some(0);
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_log_level() {
        let mut args = make_args(PathBuf::from("x.sol"));
        assert_eq!(args.log_level(), tracing::Level::INFO);

        args.verbose = true;
        assert_eq!(args.log_level(), tracing::Level::DEBUG);

        args.verbose = false;
        args.quiet = true;
        assert_eq!(args.log_level(), tracing::Level::ERROR);
    }

    #[test]
    fn test_families_and_name() {
        let mut args = make_args(PathBuf::from("contracts/Vault.sol"));
        assert_eq!(args.families(), AdapterFamilies::default());
        assert_eq!(args.contract_name().as_deref(), Some("Vault"));

        args.no_ai = true;
        args.name = Some("Treasury".to_string());
        assert!(args.families().scanners);
        assert!(!args.families().reviewers);
        assert_eq!(args.contract_name().as_deref(), Some("Treasury"));
    }

    #[test]
    fn test_parse_kinds_list() {
        let args = Args::try_parse_from([
            "auditmesh",
            "--contract",
            "Vault.sol",
            "--kinds",
            "security,gas",
            "--fail-on",
            "high",
        ])
        .unwrap();
        assert_eq!(args.kinds, vec![AnalysisKind::Security, AnalysisKind::Gas]);
        assert_eq!(args.fail_on.map(Severity::from), Some(Severity::High));
        assert_eq!(OutputFormat::from_config("JSON"), OutputFormat::Json);
        assert_eq!(OutputFormat::from_config("html"), OutputFormat::Markdown);
    }
}
