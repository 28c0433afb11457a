//! Process-based scanner adapters.
//!
//! Each call stages the contract source in a temporary `.sol` file,
//! spawns the tool under a hard budget and parses its JSON output.
//! There is no retry: a timeout or unreadable output settles the call.

use super::parsers;
use super::{AdapterOutcome, AnalysisKind, Analyzer};
use crate::config::ScannerSettings;
use crate::error::AdapterError;
use crate::models::{AdapterId, Contract};
use async_trait::async_trait;
use std::io::Write;
use std::path::Path;
use std::process::{Output, Stdio};
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// The three supported scanners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScannerTool {
    Slither,
    Mythril,
    Semgrep,
}

impl ScannerTool {
    /// The scanner behind an adapter id; `None` for model reviewers.
    pub fn for_adapter(id: AdapterId) -> Option<Self> {
        match id {
            AdapterId::Slither => Some(ScannerTool::Slither),
            AdapterId::Mythril => Some(ScannerTool::Mythril),
            AdapterId::Semgrep => Some(ScannerTool::Semgrep),
            AdapterId::OpenAi | AdapterId::Anthropic => None,
        }
    }

    pub fn adapter_id(&self) -> AdapterId {
        match self {
            ScannerTool::Slither => AdapterId::Slither,
            ScannerTool::Mythril => AdapterId::Mythril,
            ScannerTool::Semgrep => AdapterId::Semgrep,
        }
    }

    pub fn supports(&self, kind: AnalysisKind) -> bool {
        match self {
            ScannerTool::Slither => matches!(kind, AnalysisKind::Security | AnalysisKind::Gas),
            ScannerTool::Mythril | ScannerTool::Semgrep => kind == AnalysisKind::Security,
        }
    }

    /// Command-line arguments for scanning `file`.
    pub fn args(&self, file: &Path) -> Vec<String> {
        let file = file.display().to_string();
        match self {
            ScannerTool::Slither => vec![file, "--json".into(), "-".into(), "--disable-color".into()],
            ScannerTool::Mythril => vec![
                "analyze".into(),
                file,
                "-o".into(),
                "json".into(),
                "--max-depth".into(),
                "12".into(),
            ],
            ScannerTool::Semgrep => vec![
                "--config=auto".into(),
                "--json".into(),
                "--lang=solidity".into(),
                file,
            ],
        }
    }

    /// Turn a finished process into an outcome.
    pub fn interpret(&self, output: &Output, kinds: &[AnalysisKind]) -> AdapterOutcome {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        match self {
            // Slither exits non-zero whenever it reports detectors.
            ScannerTool::Slither => {
                if !output.status.success() && stdout.trim().is_empty() {
                    return AdapterOutcome::Failure(AdapterError::Unavailable(first_line(&stderr)));
                }
                parsers::parse_slither(&stdout, kinds.contains(&AnalysisKind::Gas))
            }
            ScannerTool::Mythril => {
                if !output.status.success() {
                    return AdapterOutcome::Failure(AdapterError::Unavailable(first_line(&stderr)));
                }
                parsers::parse_mythril(&stdout)
            }
            ScannerTool::Semgrep => {
                if !output.status.success() && stdout.trim().is_empty() {
                    return AdapterOutcome::Failure(AdapterError::Unavailable(first_line(&stderr)));
                }
                parsers::parse_semgrep(&stdout)
            }
        }
    }
}

fn first_line(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("process exited with an error")
        .to_string()
}

/// A scanner invoked as an external process.
pub struct ProcessScanner {
    tool: ScannerTool,
    binary: String,
    timeout: Duration,
}

impl ProcessScanner {
    pub fn new(tool: ScannerTool, binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            tool,
            binary: binary.into(),
            timeout,
        }
    }

    pub fn from_config(tool: ScannerTool, settings: &ScannerSettings) -> Self {
        Self::new(
            tool,
            settings.binary.clone(),
            Duration::from_secs(settings.timeout_seconds),
        )
    }

    fn command(&self, file: &Path) -> Command {
        let mut command = Command::new(&self.binary);
        command.args(self.tool.args(file));
        command
    }
}

#[async_trait]
impl Analyzer for ProcessScanner {
    fn id(&self) -> AdapterId {
        self.tool.adapter_id()
    }

    fn supports(&self, kind: AnalysisKind) -> bool {
        self.tool.supports(kind)
    }

    async fn analyze(&self, contract: &Contract, kinds: &[AnalysisKind]) -> AdapterOutcome {
        let started = Instant::now();

        // The file must outlive the child process.
        let staged = match stage_source(contract) {
            Ok(file) => file,
            Err(e) => {
                warn!("{}: failed to stage contract source: {}", self.id(), e);
                return AdapterOutcome::Failure(AdapterError::Unavailable(format!(
                    "could not stage contract source: {}",
                    e
                )));
            }
        };

        debug!("{}: scanning {}", self.id(), staged.path().display());

        let outcome = match run_process(self.command(staged.path()), self.timeout).await {
            Ok(output) => self.tool.interpret(&output, kinds),
            Err(err) => AdapterOutcome::Failure(err),
        };

        info!(
            "{} {} in {:.1}s",
            self.id(),
            outcome.label(),
            started.elapsed().as_secs_f64()
        );
        outcome
    }
}

/// Write the contract source to a temporary `.sol` file.
fn stage_source(contract: &Contract) -> std::io::Result<NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("auditmesh-")
        .suffix(".sol")
        .tempfile()?;
    file.write_all(contract.source_code.as_bytes())?;
    file.flush()?;
    Ok(file)
}

/// Run a command to completion under a hard budget.
///
/// The child is killed if the budget runs out.
pub async fn run_process(mut command: Command, budget: Duration) -> Result<Output, AdapterError> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = command.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            AdapterError::Unavailable("executable not found".to_string())
        } else {
            AdapterError::Unavailable(format!("failed to spawn: {}", e))
        }
    })?;

    match tokio::time::timeout(budget, child.wait_with_output()).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) => Err(AdapterError::Unavailable(format!("failed to collect output: {}", e))),
        Err(_) => Err(AdapterError::Timeout(budget)),
    }
}
