//! Configuration file handling.
//!
//! This module handles loading and merging configuration from
//! `.auditmesh.toml` files.

use crate::adapter::{ModelBackend, ScannerTool};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default configuration file name.
pub const CONFIG_FILE: &str = ".auditmesh.toml";

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Process-based scanner settings.
    #[serde(default)]
    pub scanners: ScannersConfig,

    /// Model reviewer settings.
    #[serde(default)]
    pub models: ModelsConfig,

    /// Report settings.
    #[serde(default)]
    pub report: ReportConfig,
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Default output file path.
    #[serde(default = "default_output")]
    pub output: String,

    /// Enable verbose logging by default.
    #[serde(default)]
    pub verbose: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            output: default_output(),
            verbose: false,
        }
    }
}

fn default_output() -> String {
    "auditmesh_report.md".to_string()
}

/// Settings for one scanner binary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScannerSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Executable name or path.
    pub binary: String,

    /// Hard per-call budget in seconds.
    pub timeout_seconds: u64,
}

/// Settings for the three scanners.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannersConfig {
    #[serde(default = "default_slither")]
    pub slither: ScannerSettings,

    #[serde(default = "default_mythril")]
    pub mythril: ScannerSettings,

    #[serde(default = "default_semgrep")]
    pub semgrep: ScannerSettings,
}

impl Default for ScannersConfig {
    fn default() -> Self {
        Self {
            slither: default_slither(),
            mythril: default_mythril(),
            semgrep: default_semgrep(),
        }
    }
}

impl ScannersConfig {
    pub fn for_tool(&self, tool: ScannerTool) -> &ScannerSettings {
        match tool {
            ScannerTool::Slither => &self.slither,
            ScannerTool::Mythril => &self.mythril,
            ScannerTool::Semgrep => &self.semgrep,
        }
    }
}

fn default_slither() -> ScannerSettings {
    ScannerSettings {
        enabled: true,
        binary: "slither".to_string(),
        timeout_seconds: 300,
    }
}

fn default_mythril() -> ScannerSettings {
    ScannerSettings {
        enabled: true,
        binary: "myth".to_string(),
        timeout_seconds: 300,
    }
}

fn default_semgrep() -> ScannerSettings {
    ScannerSettings {
        enabled: true,
        binary: "semgrep".to_string(),
        timeout_seconds: 120,
    }
}

/// Settings for one model backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// API base URL.
    pub base_url: String,

    /// Model name.
    pub model: String,

    /// Environment variable holding the API key.
    pub api_key_env: String,

    /// Temperature for generation.
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Maximum tokens in response.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Request timeout in seconds.
    #[serde(default = "default_model_timeout")]
    pub timeout_seconds: u64,

    /// Attempts per call, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry; doubles on each further attempt.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

/// Settings for the two model reviewers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    #[serde(default = "default_openai")]
    pub openai: ModelSettings,

    #[serde(default = "default_anthropic")]
    pub anthropic: ModelSettings,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            openai: default_openai(),
            anthropic: default_anthropic(),
        }
    }
}

impl ModelsConfig {
    pub fn for_backend(&self, backend: ModelBackend) -> &ModelSettings {
        match backend {
            ModelBackend::OpenAi => &self.openai,
            ModelBackend::Anthropic => &self.anthropic,
        }
    }
}

fn default_openai() -> ModelSettings {
    ModelSettings {
        enabled: true,
        base_url: "https://api.openai.com".to_string(),
        model: "gpt-4-1106-preview".to_string(),
        api_key_env: "OPENAI_API_KEY".to_string(),
        temperature: default_temperature(),
        max_tokens: default_max_tokens(),
        timeout_seconds: default_model_timeout(),
        max_attempts: default_max_attempts(),
        base_delay_ms: default_base_delay_ms(),
    }
}

fn default_anthropic() -> ModelSettings {
    ModelSettings {
        enabled: true,
        base_url: "https://api.anthropic.com".to_string(),
        model: "claude-3-sonnet-20240229".to_string(),
        api_key_env: "ANTHROPIC_API_KEY".to_string(),
        temperature: default_temperature(),
        max_tokens: default_max_tokens(),
        timeout_seconds: default_model_timeout(),
        max_attempts: default_max_attempts(),
        base_delay_ms: default_base_delay_ms(),
    }
}

fn default_true() -> bool {
    true
}

fn default_temperature() -> f32 {
    0.1
}

fn default_max_tokens() -> u32 {
    4000
}

fn default_model_timeout() -> u64 {
    180
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

/// Report generation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportConfig {
    /// Default report format ("markdown" or "json").
    #[serde(default = "default_format")]
    pub format: String,

    /// Include the risks table.
    #[serde(default = "default_true")]
    pub include_risks: bool,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            format: default_format(),
            include_risks: true,
        }
    }
}

fn default_format() -> String {
    "markdown".to_string()
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Try to load configuration from the default location.
    ///
    /// Returns `Ok(None)` if the file doesn't exist, `Err` if it exists but can't be parsed.
    pub fn load_default() -> Result<Option<Self>> {
        let default_path = Path::new(CONFIG_FILE);

        if default_path.exists() {
            Ok(Some(Self::load(default_path)?))
        } else {
            Ok(None)
        }
    }

    /// Merge this configuration with CLI arguments.
    ///
    /// CLI arguments take precedence over config file settings.
    pub fn merge_with_args(&mut self, args: &crate::cli::Args) {
        if let Some(timeout) = args.scanner_timeout {
            self.scanners.slither.timeout_seconds = timeout;
            self.scanners.mythril.timeout_seconds = timeout;
            self.scanners.semgrep.timeout_seconds = timeout;
        }

        if let Some(ref model) = args.openai_model {
            self.models.openai.model = model.clone();
        }
        if let Some(ref model) = args.anthropic_model {
            self.models.anthropic.model = model.clone();
        }

        if args.verbose {
            self.general.verbose = true;
        }
    }

    /// Generate a default configuration file content.
    pub fn default_toml() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.scanners.slither.binary, "slither");
        assert_eq!(config.scanners.semgrep.timeout_seconds, 120);
        assert_eq!(config.models.openai.max_attempts, 3);
        assert_eq!(config.models.anthropic.api_key_env, "ANTHROPIC_API_KEY");
    }

    #[test]
    fn test_parse_config() {
        let toml_content = r#"
[general]
output = "custom_report.md"
verbose = true

[scanners.mythril]
enabled = false
binary = "/opt/bin/myth"
timeout_seconds = 60

[models.openai]
base_url = "http://localhost:8080"
model = "gpt-4o"
api_key_env = "LOCAL_KEY"
max_attempts = 5
"#;

        let config: Config = toml::from_str(toml_content).unwrap();
        assert_eq!(config.general.output, "custom_report.md");
        assert!(config.general.verbose);
        assert!(!config.scanners.mythril.enabled);
        assert_eq!(config.scanners.mythril.binary, "/opt/bin/myth");
        assert_eq!(config.scanners.slither, default_slither());
        assert_eq!(config.models.openai.model, "gpt-4o");
        assert_eq!(config.models.openai.max_attempts, 5);
        assert_eq!(config.models.openai.base_delay_ms, 1000);
        assert_eq!(config.models.anthropic, default_anthropic());
    }

    #[test]
    fn test_lookup_by_tool_and_backend() {
        let config = Config::default();
        assert_eq!(config.scanners.for_tool(ScannerTool::Mythril).binary, "myth");
        assert_eq!(
            config.models.for_backend(ModelBackend::Anthropic).base_url,
            "https://api.anthropic.com"
        );
    }

    #[test]
    fn test_default_toml_generation() {
        let toml_str = Config::default_toml();
        assert!(!toml_str.is_empty());
        assert!(toml_str.contains("[general]"));
        assert!(toml_str.contains("[scanners.slither]"));
        assert!(toml_str.contains("[models.openai]"));

        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.scanners.mythril, default_mythril());
    }
}
