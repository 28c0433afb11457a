//! Error taxonomy.
//!
//! Adapter-level conditions never cross the adapter boundary as control
//! flow: they are carried as data inside an `AdapterOutcome`. Only
//! `EngineError` terminates a run.

use std::time::Duration;
use thiserror::Error;

/// A contained failure of a single adapter call.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AdapterError {
    /// Process-based call exceeded its budget.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The external tool or backend could not be invoked at all.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Output could not be parsed into the expected structured shape.
    #[error("malformed output: {0}")]
    MalformedOutput(String),

    /// Model backend call kept failing after every retry attempt.
    #[error("failed after {attempts} attempts: {message}")]
    TransientFailure { attempts: u32, message: String },
}

impl AdapterError {
    /// Taxonomy-level text safe to show to users.
    pub fn user_message(&self) -> &'static str {
        match self {
            AdapterError::Timeout(_) => "analyzer timed out",
            AdapterError::Unavailable(_) => "analyzer unavailable",
            AdapterError::MalformedOutput(_) => "analyzer returned unreadable output",
            AdapterError::TransientFailure { .. } => "analyzer backend kept failing",
        }
    }
}

/// Errors from the persisted-state collaborator.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Orchestration-level faults and query errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    /// Persistence failed while a run was in flight.
    #[error("persistence failure: {0}")]
    Store(#[from] StoreError),

    /// Internal engine error unrelated to any single adapter.
    #[error("internal error: {0}")]
    Internal(String),

    /// No analysis exists for the contract.
    #[error("no analysis found for contract {0}")]
    NotFound(String),

    /// Results were requested before the analysis completed.
    #[error("analysis for contract {contract_id} is {status}, not completed")]
    NotCompleted {
        contract_id: String,
        status: crate::models::AnalysisStatus,
    },
}

impl EngineError {
    /// Taxonomy-level text for the failed run's summary.
    pub fn user_message(&self) -> &'static str {
        match self {
            EngineError::Store(_) => "Analysis failed: results could not be saved",
            EngineError::Internal(_) => "Analysis failed: internal error",
            EngineError::NotFound(_) => "Analysis failed: analysis record not found",
            EngineError::NotCompleted { .. } => "Analysis failed: analysis not completed",
        }
    }
}
