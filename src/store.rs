//! Persisted analysis state.
//!
//! The orchestrator only talks to [`AnalysisStore`]. Each call is
//! all-or-nothing; [`AnalysisStore::discard_results`] drops writes of a
//! run that faulted before its record was committed.

use crate::error::StoreError;
use crate::models::{Analysis, Finding, Risk};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

#[async_trait]
pub trait AnalysisStore: Send + Sync {
    /// Current analysis record for a contract, if any.
    async fn load_analysis(&self, contract_id: &str) -> Result<Option<Analysis>, StoreError>;

    /// Insert or replace the contract's current analysis record.
    async fn save_analysis(&self, analysis: &Analysis) -> Result<(), StoreError>;

    async fn append_findings(&self, analysis_id: Uuid, findings: &[Finding]) -> Result<(), StoreError>;

    async fn append_risks(&self, analysis_id: Uuid, risks: &[Risk]) -> Result<(), StoreError>;

    async fn load_findings(&self, analysis_id: Uuid) -> Result<Vec<Finding>, StoreError>;

    async fn load_risks(&self, analysis_id: Uuid) -> Result<Vec<Risk>, StoreError>;

    /// Drop every finding and risk written for an analysis.
    async fn discard_results(&self, analysis_id: Uuid) -> Result<(), StoreError>;
}

#[derive(Default)]
struct Tables {
    analyses: HashMap<String, Analysis>,
    findings: HashMap<Uuid, Vec<Finding>>,
    risks: HashMap<Uuid, Vec<Risk>>,
}

/// In-process store.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        self.tables
            .lock()
            .map_err(|_| StoreError::Backend("store lock poisoned".to_string()))
    }
}

#[async_trait]
impl AnalysisStore for MemoryStore {
    async fn load_analysis(&self, contract_id: &str) -> Result<Option<Analysis>, StoreError> {
        Ok(self.tables()?.analyses.get(contract_id).cloned())
    }

    async fn save_analysis(&self, analysis: &Analysis) -> Result<(), StoreError> {
        let mut tables = self.tables()?;

        if let Some(existing) = tables.analyses.get(&analysis.contract_id) {
            if existing.id == analysis.id && existing.status.is_terminal() {
                return Err(StoreError::Backend(format!(
                    "analysis {} is {} and cannot change",
                    existing.id, existing.status
                )));
            }
        }

        tables
            .analyses
            .insert(analysis.contract_id.clone(), analysis.clone());
        Ok(())
    }

    async fn append_findings(&self, analysis_id: Uuid, findings: &[Finding]) -> Result<(), StoreError> {
        self.tables()?
            .findings
            .entry(analysis_id)
            .or_default()
            .extend_from_slice(findings);
        Ok(())
    }

    async fn append_risks(&self, analysis_id: Uuid, risks: &[Risk]) -> Result<(), StoreError> {
        self.tables()?
            .risks
            .entry(analysis_id)
            .or_default()
            .extend_from_slice(risks);
        Ok(())
    }

    async fn load_findings(&self, analysis_id: Uuid) -> Result<Vec<Finding>, StoreError> {
        Ok(self
            .tables()?
            .findings
            .get(&analysis_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn load_risks(&self, analysis_id: Uuid) -> Result<Vec<Risk>, StoreError> {
        Ok(self
            .tables()?
            .risks
            .get(&analysis_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn discard_results(&self, analysis_id: Uuid) -> Result<(), StoreError> {
        let mut tables = self.tables()?;
        tables.findings.remove(&analysis_id);
        tables.risks.remove(&analysis_id);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Store wrappers that fail a chosen operation or yield before
    //! touching the record.

    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum FailOn {
        AppendRisks,
        CompletedSave,
        /// Panics inside `append_findings`.
        PanicOnAppend,
    }

    pub struct FailingStore {
        pub inner: MemoryStore,
        fail_on: FailOn,
    }

    impl FailingStore {
        pub fn new(fail_on: FailOn) -> Self {
            Self {
                inner: MemoryStore::new(),
                fail_on,
            }
        }

        fn backend_error() -> StoreError {
            StoreError::Backend("disk full".to_string())
        }
    }

    #[async_trait]
    impl AnalysisStore for FailingStore {
        async fn load_analysis(&self, contract_id: &str) -> Result<Option<Analysis>, StoreError> {
            self.inner.load_analysis(contract_id).await
        }

        async fn save_analysis(&self, analysis: &Analysis) -> Result<(), StoreError> {
            if self.fail_on == FailOn::CompletedSave
                && analysis.status == crate::models::AnalysisStatus::Completed
            {
                return Err(Self::backend_error());
            }
            self.inner.save_analysis(analysis).await
        }

        async fn append_findings(&self, analysis_id: Uuid, findings: &[Finding]) -> Result<(), StoreError> {
            if self.fail_on == FailOn::PanicOnAppend {
                panic!("findings table corrupted");
            }
            self.inner.append_findings(analysis_id, findings).await
        }

        async fn append_risks(&self, analysis_id: Uuid, risks: &[Risk]) -> Result<(), StoreError> {
            if self.fail_on == FailOn::AppendRisks {
                return Err(Self::backend_error());
            }
            self.inner.append_risks(analysis_id, risks).await
        }

        async fn load_findings(&self, analysis_id: Uuid) -> Result<Vec<Finding>, StoreError> {
            self.inner.load_findings(analysis_id).await
        }

        async fn load_risks(&self, analysis_id: Uuid) -> Result<Vec<Risk>, StoreError> {
            self.inner.load_risks(analysis_id).await
        }

        async fn discard_results(&self, analysis_id: Uuid) -> Result<(), StoreError> {
            self.inner.discard_results(analysis_id).await
        }
    }

    /// Hands control back to the runtime before every record read or
    /// write, so concurrent callers interleave at those points.
    #[derive(Default)]
    pub struct YieldingStore {
        pub inner: MemoryStore,
    }

    #[async_trait]
    impl AnalysisStore for YieldingStore {
        async fn load_analysis(&self, contract_id: &str) -> Result<Option<Analysis>, StoreError> {
            tokio::task::yield_now().await;
            self.inner.load_analysis(contract_id).await
        }

        async fn save_analysis(&self, analysis: &Analysis) -> Result<(), StoreError> {
            tokio::task::yield_now().await;
            self.inner.save_analysis(analysis).await
        }

        async fn append_findings(&self, analysis_id: Uuid, findings: &[Finding]) -> Result<(), StoreError> {
            self.inner.append_findings(analysis_id, findings).await
        }

        async fn append_risks(&self, analysis_id: Uuid, risks: &[Risk]) -> Result<(), StoreError> {
            self.inner.append_risks(analysis_id, risks).await
        }

        async fn load_findings(&self, analysis_id: Uuid) -> Result<Vec<Finding>, StoreError> {
            self.inner.load_findings(analysis_id).await
        }

        async fn load_risks(&self, analysis_id: Uuid) -> Result<Vec<Risk>, StoreError> {
            self.inner.load_risks(analysis_id).await
        }

        async fn discard_results(&self, analysis_id: Uuid) -> Result<(), StoreError> {
            self.inner.discard_results(analysis_id).await
        }
    }
}
