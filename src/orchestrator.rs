//! Analysis orchestration.
//!
//! One run per contract at a time. A run fans out one task per applicable
//! adapter, waits for every task to settle, merges and scores the
//! outcomes, then persists and publishes the result. Adapter failures are
//! data; only persistence or internal faults fail a run. A run task that
//! panics is recorded as an internal fault.

use crate::adapter::{select_applicable, AdapterOutcome, AnalysisKind, Analyzer, TaggedOutcome};
use crate::analysis::{aggregator, scoring, MergeEngine, MergedEntities};
use crate::broadcast::{ChannelKey, EventPayload, ProgressBroadcaster};
use crate::error::{AdapterError, EngineError};
use crate::models::{Analysis, AnalysisResults, AnalysisStatus, Contract, FindingSummary};
use crate::store::AnalysisStore;
use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Progress milestones.
const PROGRESS_STARTED: u8 = 0;
const PROGRESS_FANOUT_BASE: usize = 10;
const PROGRESS_FANOUT_SPAN: usize = 70;
const PROGRESS_MERGED: u8 = 85;
const PROGRESS_PERSISTING: u8 = 95;
const PROGRESS_DONE: u8 = 100;

/// Result of a start request.
#[derive(Debug)]
pub struct StartOutcome {
    pub analysis_id: Uuid,
    pub status: AnalysisStatus,
    /// True when the call found a run already in flight.
    pub already_running: bool,
    task: Option<JoinHandle<()>>,
}

impl StartOutcome {
    /// Wait for the run this call started. Returns at once for a
    /// short-circuited start.
    pub async fn finished(self) {
        if let Some(task) = self.task {
            if let Err(e) = task.await {
                error!("Analysis task {} aborted: {}", self.analysis_id, e);
            }
        }
    }
}

/// Snapshot returned by status queries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisStatusView {
    pub analysis_id: Uuid,
    pub status: AnalysisStatus,
    pub progress: u8,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    pub risk_score: Option<f64>,
    pub summary: Option<String>,
}

struct RunState {
    analysis_id: Uuid,
    progress: u8,
}

type ActiveRuns = Arc<Mutex<HashMap<String, RunState>>>;

fn lock(active: &ActiveRuns) -> MutexGuard<'_, HashMap<String, RunState>> {
    active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Per-contract exclusion token; releasing it ends the run's claim.
struct RunGuard {
    active: ActiveRuns,
    contract_id: String,
}

impl RunGuard {
    fn set_progress(&self, progress: u8) {
        if let Some(state) = lock(&self.active).get_mut(&self.contract_id) {
            state.progress = progress;
        }
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        lock(&self.active).remove(&self.contract_id);
    }
}

/// Coordinates adapters, merging, scoring, persistence and progress.
#[derive(Clone)]
pub struct OrchestrationEngine {
    adapters: Arc<Vec<Arc<dyn Analyzer>>>,
    store: Arc<dyn AnalysisStore>,
    broadcaster: Arc<ProgressBroadcaster>,
    merger: MergeEngine,
    active: ActiveRuns,
}

impl OrchestrationEngine {
    pub fn new(
        adapters: Vec<Arc<dyn Analyzer>>,
        store: Arc<dyn AnalysisStore>,
        broadcaster: Arc<ProgressBroadcaster>,
    ) -> Self {
        Self {
            adapters: Arc::new(adapters),
            store,
            broadcaster,
            merger: MergeEngine,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn broadcaster(&self) -> &Arc<ProgressBroadcaster> {
        &self.broadcaster
    }

    /// Claim the contract for `analysis_id`, or report the run already
    /// holding it. The id is recorded in the same critical section as the
    /// claim, so a concurrent caller never observes a placeholder.
    fn try_claim(&self, contract_id: &str, analysis_id: Uuid) -> Result<RunGuard, Uuid> {
        let mut active = lock(&self.active);
        if let Some(state) = active.get(contract_id) {
            return Err(state.analysis_id);
        }
        active.insert(
            contract_id.to_string(),
            RunState {
                analysis_id,
                progress: PROGRESS_STARTED,
            },
        );
        Ok(RunGuard {
            active: Arc::clone(&self.active),
            contract_id: contract_id.to_string(),
        })
    }

    /// Start analyzing a contract, or return the run already in flight.
    pub async fn start(
        &self,
        contract: Arc<Contract>,
        kinds: &[AnalysisKind],
    ) -> Result<StartOutcome, EngineError> {
        let mut analysis = match self.store.load_analysis(&contract.id).await? {
            Some(existing) if existing.status == AnalysisStatus::Pending => existing,
            _ => Analysis::pending(contract.id.clone()),
        };

        let guard = match self.try_claim(&contract.id, analysis.id) {
            Ok(guard) => guard,
            Err(analysis_id) => {
                info!("Analysis for {} already running", contract.id);
                return Ok(StartOutcome {
                    analysis_id,
                    status: AnalysisStatus::Analyzing,
                    already_running: true,
                    task: None,
                });
            }
        };

        analysis.begin(Utc::now()).map_err(EngineError::Internal)?;
        self.store.save_analysis(&analysis).await?;

        let kinds = AnalysisKind::or_all(kinds);
        info!(
            "Starting analysis {} of {} ({})",
            analysis.id,
            contract.id,
            kinds
                .iter()
                .map(|k| k.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );
        self.broadcaster.publish(
            &ChannelKey::analysis(&contract.id),
            EventPayload::AnalysisProgress {
                status: AnalysisStatus::Analyzing,
                progress: PROGRESS_STARTED,
                message: "Analysis started".to_string(),
            },
        );

        let analysis_id = analysis.id;
        let engine = self.clone();
        let task = tokio::spawn(async move {
            let guard = Arc::new(guard);
            let runner = {
                let engine = engine.clone();
                let guard = Arc::clone(&guard);
                let analysis = analysis.clone();
                tokio::spawn(async move { engine.run(&guard, analysis, contract, kinds).await })
            };
            if let Err(e) = runner.await {
                engine.recover(analysis, e).await;
            }
            drop(guard);
        });

        Ok(StartOutcome {
            analysis_id,
            status: AnalysisStatus::Analyzing,
            already_running: false,
            task: Some(task),
        })
    }

    async fn run(
        &self,
        guard: &RunGuard,
        analysis: Analysis,
        contract: Arc<Contract>,
        kinds: Vec<AnalysisKind>,
    ) {
        let key = ChannelKey::analysis(&contract.id);

        let outcomes = self.fan_out(guard, &key, &contract, &kinds).await;

        self.progress(guard, &key, PROGRESS_MERGED, "Merging results");
        let merged = self.merger.merge(outcomes);
        for (adapter, contribution) in &merged.stats.per_adapter {
            debug!(
                "{}: kept {}/{} findings, {}/{} risks",
                adapter,
                contribution.kept_findings,
                contribution.raw_findings,
                contribution.kept_risks,
                contribution.raw_risks
            );
        }
        if !merged.stats.partial.is_empty() {
            warn!(
                "Partial results from: {}",
                merged
                    .stats
                    .partial
                    .iter()
                    .map(|a| a.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
        let risk_score = scoring::score(&merged.findings, &merged.risks);
        let summary = aggregator::summary_text(&merged.findings, &merged.risks, &merged.stats);

        self.progress(guard, &key, PROGRESS_PERSISTING, "Saving results");
        match self.persist(&analysis, &merged, risk_score, summary).await {
            Ok(completed) => {
                guard.set_progress(PROGRESS_DONE);
                info!(
                    "Analysis {} completed: {} findings, {} risks, score {:.2}",
                    completed.id,
                    merged.findings.len(),
                    merged.risks.len(),
                    risk_score
                );
                self.broadcaster.publish(
                    &key,
                    EventPayload::AnalysisProgress {
                        status: AnalysisStatus::Completed,
                        progress: PROGRESS_DONE,
                        message: "Analysis completed".to_string(),
                    },
                );
                self.broadcaster.publish(
                    &key,
                    EventPayload::AnalysisComplete {
                        risk_score,
                        summary: completed.summary.clone().unwrap_or_default(),
                        findings_count: merged.findings.len(),
                        risks_count: merged.risks.len(),
                        duration: completed.duration_seconds,
                    },
                );
            }
            Err(fault) => self.fail(analysis, &key, fault).await,
        }
    }

    /// Settle a run whose task died before it recorded an outcome.
    async fn recover(&self, analysis: Analysis, cause: JoinError) {
        match self.store.load_analysis(&analysis.contract_id).await {
            Ok(Some(current)) if current.id == analysis.id && current.status.is_terminal() => {
                warn!(
                    "Analysis {} task aborted after it settled: {}",
                    analysis.id, cause
                );
                return;
            }
            Ok(_) => {}
            Err(e) => warn!("Could not reload analysis {}: {}", analysis.id, e),
        }

        let key = ChannelKey::analysis(&analysis.contract_id);
        let fault = EngineError::Internal(format!("analysis task aborted: {}", cause));
        self.fail(analysis, &key, fault).await;
    }

    /// Run every applicable adapter concurrently and wait for all of them.
    async fn fan_out(
        &self,
        guard: &RunGuard,
        key: &ChannelKey,
        contract: &Arc<Contract>,
        kinds: &[AnalysisKind],
    ) -> Vec<TaggedOutcome> {
        let selected = select_applicable(&self.adapters, kinds);
        let total = selected.len();
        if total == 0 {
            warn!("No analyzers apply to {}", contract.id);
            return Vec::new();
        }

        let mut pending: FuturesUnordered<_> = selected
            .into_iter()
            .map(|adapter| {
                let id = adapter.id();
                let contract = Arc::clone(contract);
                let kinds = kinds.to_vec();
                let task = tokio::spawn(async move { adapter.analyze(&contract, &kinds).await });
                async move { (id, task.await) }
            })
            .collect();

        let mut outcomes = Vec::with_capacity(total);
        while let Some((adapter, joined)) = pending.next().await {
            let outcome = joined.unwrap_or_else(|e| {
                error!("Adapter {} task aborted: {}", adapter, e);
                AdapterOutcome::Failure(AdapterError::Unavailable("adapter task aborted".to_string()))
            });

            match outcome.error() {
                Some(err) => warn!("{} {}: {}", adapter, outcome.label(), err),
                None => debug!("{} {}", adapter, outcome.label()),
            }
            outcomes.push(TaggedOutcome { adapter, outcome });

            let settled = outcomes.len();
            let progress = PROGRESS_FANOUT_BASE + PROGRESS_FANOUT_SPAN * settled / total;
            self.progress(
                guard,
                key,
                progress as u8,
                &format!("{} of {} analyzers finished", settled, total),
            );
        }

        outcomes
    }

    fn progress(&self, guard: &RunGuard, key: &ChannelKey, progress: u8, message: &str) {
        guard.set_progress(progress);
        self.broadcaster.publish(
            key,
            EventPayload::AnalysisProgress {
                status: AnalysisStatus::Analyzing,
                progress,
                message: message.to_string(),
            },
        );
    }

    /// Write results, then commit the completed record.
    async fn persist(
        &self,
        analysis: &Analysis,
        merged: &MergedEntities,
        risk_score: f64,
        summary: String,
    ) -> Result<Analysis, EngineError> {
        self.store.append_findings(analysis.id, &merged.findings).await?;
        self.store.append_risks(analysis.id, &merged.risks).await?;

        let mut completed = analysis.clone();
        completed
            .complete(Utc::now(), risk_score, summary)
            .map_err(EngineError::Internal)?;
        self.store.save_analysis(&completed).await?;
        Ok(completed)
    }

    /// Roll back a faulted run and record it as failed.
    async fn fail(&self, mut analysis: Analysis, key: &ChannelKey, fault: EngineError) {
        error!("Analysis {} for {} failed: {}", analysis.id, analysis.contract_id, fault);
        let message = fault.user_message().to_string();

        if let Err(e) = self.store.discard_results(analysis.id).await {
            error!("Failed to discard results of {}: {}", analysis.id, e);
        }

        match analysis.fail(Utc::now(), message.clone()) {
            Ok(()) => {
                if let Err(e) = self.store.save_analysis(&analysis).await {
                    error!("Failed to record failure of {}: {}", analysis.id, e);
                }
            }
            Err(e) => error!("Cannot mark {} failed: {}", analysis.id, e),
        }

        let progress = lock(&self.active)
            .get(&analysis.contract_id)
            .map(|state| state.progress)
            .unwrap_or(PROGRESS_PERSISTING);

        self.broadcaster.publish(
            key,
            EventPayload::AnalysisProgress {
                status: AnalysisStatus::Failed,
                progress,
                message,
            },
        );
    }

    /// Current status of a contract's analysis.
    pub async fn status(&self, contract_id: &str) -> Result<AnalysisStatusView, EngineError> {
        let analysis = self
            .store
            .load_analysis(contract_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(contract_id.to_string()))?;

        let progress = match analysis.status {
            AnalysisStatus::Completed => PROGRESS_DONE,
            AnalysisStatus::Analyzing => lock(&self.active)
                .get(contract_id)
                .filter(|state| state.analysis_id == analysis.id)
                .map(|state| state.progress)
                .unwrap_or(PROGRESS_STARTED),
            _ => 0,
        };

        Ok(AnalysisStatusView {
            analysis_id: analysis.id,
            status: analysis.status,
            progress,
            started_at: analysis.started_at,
            completed_at: analysis.completed_at,
            duration_seconds: analysis.duration_seconds,
            risk_score: analysis.risk_score,
            summary: analysis.summary,
        })
    }

    /// Full results of a completed analysis.
    pub async fn results(&self, contract_id: &str) -> Result<AnalysisResults, EngineError> {
        let analysis = self
            .store
            .load_analysis(contract_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(contract_id.to_string()))?;

        if analysis.status != AnalysisStatus::Completed {
            return Err(EngineError::NotCompleted {
                contract_id: contract_id.to_string(),
                status: analysis.status,
            });
        }

        let findings = self.store.load_findings(analysis.id).await?;
        let risks = self.store.load_risks(analysis.id).await?;
        let summary = FindingSummary::from_entities(&findings, &risks);

        Ok(AnalysisResults {
            analysis,
            findings,
            risks,
            summary,
        })
    }
}
