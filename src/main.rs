//! AuditMesh - multi-analyzer smart contract auditor
//!
//! A CLI tool that fans a Solidity contract out to static scanners and
//! model reviewers in parallel, merges their findings into one scored
//! result, and writes a Markdown or JSON audit report.
//!
//! Exit codes:
//!   0 - Success (no findings above threshold, or no --fail-on set)
//!   1 - Runtime error or failed analysis run
//!   2 - Findings found above --fail-on threshold

mod adapter;
mod analysis;
mod broadcast;
mod cli;
mod config;
mod error;
mod models;
mod orchestrator;
mod report;
mod store;

use anyhow::{bail, Context, Result};
use broadcast::{ChannelKey, ClientSession, EventPayload, ProgressBroadcaster};
use chrono::Utc;
use cli::{Args, OutputFormat};
use config::{Config, CONFIG_FILE};
use error::EngineError;
use indicatif::{ProgressBar, ProgressStyle};
use models::{AnalysisStatus, Contract, Severity};
use orchestrator::OrchestrationEngine;
use report::{Report, ReportMetadata};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use store::MemoryStore;
use tracing::{debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse_args();

    // Validate arguments
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    // Handle --init-config early (no logging needed)
    if args.init_config {
        return handle_init_config();
    }

    init_logging(&args);

    info!("AuditMesh v{}", env!("CARGO_PKG_VERSION"));
    debug!("Arguments: {:?}", args);

    match run_audit(args).await {
        Ok(exit_code) => {
            std::process::exit(exit_code);
        }
        Err(e) => {
            error!("Audit failed: {:#}", e);
            eprintln!("\n❌ Error: {}", e);
            std::process::exit(1);
        }
    }
}

/// Handle --init-config: generate a default .auditmesh.toml.
fn handle_init_config() -> Result<()> {
    let path = Path::new(CONFIG_FILE);

    if path.exists() {
        eprintln!("⚠️  {} already exists. Remove it first or edit it manually.", CONFIG_FILE);
        std::process::exit(1);
    }

    let content = Config::default_toml();
    std::fs::write(path, &content).with_context(|| format!("Failed to write {}", CONFIG_FILE))?;

    println!("✅ Created {} with default settings.", CONFIG_FILE);
    println!("   Edit it to configure scanner binaries, model endpoints, and timeouts.");
    Ok(())
}

/// Initialize logging based on verbosity settings.
fn init_logging(args: &Args) {
    let level = args.log_level();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }
}

/// Run the complete audit workflow. Returns the process exit code.
async fn run_audit(args: Args) -> Result<i32> {
    let start_time = Instant::now();

    let mut config = load_config(&args)?;
    config.merge_with_args(&args);

    let contract = Arc::new(load_contract(&args)?);
    println!("📄 Contract: {} ({})", contract.display_name(), contract.id);

    let adapters = adapter::build_adapters(&config, args.families());
    if adapters.is_empty() {
        bail!("No analyzers enabled; check the [scanners] and [models] config sections");
    }
    let analyzers: Vec<String> = adapters.iter().map(|a| a.id().to_string()).collect();
    let scanners = adapters.iter().filter(|a| a.id().is_scanner()).count();
    println!(
        "🔬 Analyzers: {} ({} scanners, {} reviewers)",
        analyzers.join(", "),
        scanners,
        adapters.len() - scanners
    );

    let broadcaster = Arc::new(ProgressBroadcaster::new());
    let engine = OrchestrationEngine::new(
        adapters,
        Arc::new(MemoryStore::new()),
        Arc::clone(&broadcaster),
    );

    // Subscribe before starting so the first milestone is not missed.
    let subscription = broadcaster.subscribe(ChannelKey::analysis(&contract.id));
    debug!("Progress subscription {} on {}", subscription.id, subscription.key);
    let renderer = tokio::spawn(render_progress(
        ClientSession::new(subscription),
        Arc::clone(&broadcaster),
        args.quiet,
    ));

    let outcome = engine.start(Arc::clone(&contract), &args.kinds).await?;
    if outcome.already_running {
        info!("Joined analysis {} already in flight", outcome.analysis_id);
    } else {
        info!("Analysis {} is {}", outcome.analysis_id, outcome.status);
    }
    outcome.finished().await;
    if let Err(e) = renderer.await {
        warn!("Progress renderer stopped: {}", e);
    }

    let results = match engine.results(&contract.id).await {
        Ok(results) => results,
        Err(EngineError::NotCompleted { status, .. }) => {
            let status_view = engine.status(&contract.id).await?;
            eprintln!(
                "\n❌ Analysis {}: {}",
                status,
                status_view.summary.as_deref().unwrap_or("no summary")
            );
            return Ok(1);
        }
        Err(e) => return Err(e.into()),
    };

    let format = args
        .format
        .unwrap_or_else(|| OutputFormat::from_config(&config.report.format));
    let output_path = args
        .output
        .clone()
        .unwrap_or_else(|| PathBuf::from(&config.general.output));

    let duration = start_time.elapsed().as_secs_f64();
    let report = Report {
        metadata: ReportMetadata {
            contract_id: contract.id.clone(),
            contract_name: contract.display_name().to_string(),
            analysis_date: Utc::now(),
            analyzers,
            duration_seconds: duration,
        },
        results,
        include_risks: config.report.include_risks,
    };

    println!("\n📝 Generating report...");
    let output = match format {
        OutputFormat::Json => report::generate_json_report(&report)?,
        OutputFormat::Markdown => report::generate_markdown_report(&report),
    };
    report::write_report(&output, &output_path)
        .with_context(|| format!("Failed to write report to {}", output_path.display()))?;

    let summary = &report.results.summary;
    println!("\n📊 Analysis Summary:");
    println!(
        "   Risk score: {:.2}",
        report.results.analysis.risk_score.unwrap_or(0.0)
    );
    println!("   Total findings: {}", summary.total_findings);
    println!(
        "   - 🔴 Critical: {} | 🟠 High: {} | 🟡 Medium: {} | 🟢 Low: {}",
        summary.critical, summary.high, summary.medium, summary.low
    );
    println!("   Total risks: {}", summary.total_risks);
    if let Some(ref text) = report.results.analysis.summary {
        println!("   {}", text);
    }
    println!("   Duration: {:.1}s", duration);
    println!(
        "\n✅ Audit complete! Report saved to: {}",
        output_path.display()
    );

    // Check --fail-on threshold
    if let Some(fail_level) = args.fail_on {
        let threshold = Severity::from(fail_level);
        let above = report
            .results
            .findings
            .iter()
            .any(|finding| finding.severity >= threshold);

        if above {
            eprintln!(
                "\n⛔ Findings at or above {} severity. Failing (exit code 2).",
                threshold
            );
            return Ok(2);
        }
    }

    Ok(0)
}

/// Render run events until the terminal one arrives.
async fn render_progress(
    mut session: ClientSession,
    broadcaster: Arc<ProgressBroadcaster>,
    quiet: bool,
) {
    let pb = if quiet {
        ProgressBar::hidden()
    } else {
        ProgressBar::new(100)
    };
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );

    let request = serde_json::json!({
        "type": "subscribe",
        "events": ["analysis_progress", "analysis_complete"],
    });
    if !session.handle(&broadcaster, &request.to_string()) {
        warn!("Progress session {} closed before subscribing", session.id());
    }

    while let Some(event) = session.next_event().await {
        debug!("Progress event: {}", event.to_json());
        match event.payload {
            EventPayload::AnalysisProgress {
                status,
                progress,
                message,
            } => {
                pb.set_position(u64::from(progress));
                if status == AnalysisStatus::Failed {
                    pb.abandon_with_message(message);
                    break;
                }
                pb.set_message(message);
            }
            EventPayload::AnalysisComplete { .. } => {
                pb.finish_with_message("Analysis complete");
                break;
            }
            EventPayload::Subscribed { .. } => {
                debug!("Session {} topics: {:?}", session.id(), session.topics());
            }
            other => debug!("Ignoring {} event", other.kind()),
        }
    }

    if !pb.is_finished() {
        pb.abandon();
    }
    let stats = broadcaster.stats();
    debug!(
        "Closing progress session ({} subscribers on {} keys)",
        stats.total_subscribers, stats.total_keys
    );
    session.close(&broadcaster);
}

/// Read the contract source named by --contract.
fn load_contract(args: &Args) -> Result<Contract> {
    let Some(ref path) = args.contract else {
        bail!("--contract is required");
    };

    let source = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read contract: {}", path.display()))?;
    if source.trim().is_empty() {
        bail!("Contract file is empty: {}", path.display());
    }

    let mut contract = Contract::new(path.display().to_string(), source);
    contract.name = args.contract_name();
    Ok(contract)
}

/// Load configuration from file or use defaults.
fn load_config(args: &Args) -> Result<Config> {
    // Try explicit config path
    if let Some(ref config_path) = args.config {
        info!("Loading config from: {}", config_path.display());
        return Config::load(config_path);
    }

    // Try default location
    match Config::load_default() {
        Ok(Some(config)) => {
            info!("Loaded default config from {}", CONFIG_FILE);
            Ok(config)
        }
        Ok(None) => {
            debug!("No config file found, using defaults");
            Ok(Config::default())
        }
        Err(e) => {
            warn!("Failed to load config: {}", e);
            Ok(Config::default())
        }
    }
}
