//! Pipeline error taxonomy.
//!
//! Adapter failures arrive as [`AdapterError`]s. The orchestrator wraps the
//! ones that abort a run in a [`PipelineError`] naming the failing
//! [`Stage`] and repository. [`PipelineError::class`] collapses the variants
//! into the four classes callers act on.

use std::fmt;

use code_analyzer_core::adapters::{AdapterError, ErrorKind};
use thiserror::Error;

use crate::retry::RetryError;

/// The orchestrator step an error was raised from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    CountEmbeddings,
    CreateCollection,
    Snapshot,
    Embed,
    Persist,
    Cleanup,
    EmbedQuery,
    QueryNearest,
    Complete,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::CountEmbeddings => "count_embeddings",
            Stage::CreateCollection => "create_collection",
            Stage::Snapshot => "snapshot",
            Stage::Embed => "embed",
            Stage::Persist => "persist",
            Stage::Cleanup => "cleanup",
            Stage::EmbedQuery => "embed_query",
            Stage::QueryNearest => "query_nearest",
            Stage::Complete => "complete",
        }
    }

    /// Query-time stages.
    pub fn is_retrieval(&self) -> bool {
        matches!(
            self,
            Stage::EmbedQuery | Stage::QueryNearest | Stage::Complete
        )
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// A transient adapter failure at query time that outlived its retry
    /// budget.
    TransientAdapter,
    /// The run aborted. Exhausted retries inside an ingestion stage land
    /// here too.
    FatalStage,
    Cancelled,
    InvalidInput,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("stage {stage} failed for {repository} ({failed} of {total} task(s) failed): {source}")]
    Stage {
        stage: Stage,
        repository: String,
        failed: usize,
        total: usize,
        #[source]
        source: AdapterError,
    },

    #[error("stage {stage} cancelled for {repository}")]
    Cancelled { stage: Stage, repository: String },

    #[error("run {run_id} cannot be resumed: {reason}")]
    NotResumable { run_id: String, reason: String },

    #[error("run {run_id} was claimed by another process")]
    OwnershipLost { run_id: String },

    #[error("run ledger: {0}")]
    Ledger(#[from] sqlx::Error),
}

impl PipelineError {
    /// A stage error for a single adapter call.
    pub fn stage(stage: Stage, repository: impl Into<String>, source: AdapterError) -> Self {
        PipelineError::Stage {
            stage,
            repository: repository.into(),
            failed: 1,
            total: 1,
            source,
        }
    }

    pub fn cancelled(stage: Stage, repository: impl Into<String>) -> Self {
        PipelineError::Cancelled {
            stage,
            repository: repository.into(),
        }
    }

    /// Wrap the outcome of a retried adapter call.
    pub fn from_retry(stage: Stage, repository: impl Into<String>, err: RetryError) -> Self {
        match err {
            RetryError::Cancelled { .. } => Self::cancelled(stage, repository),
            RetryError::Exhausted { source, .. } | RetryError::TooLong { source, .. } => {
                Self::stage(stage, repository, source)
            }
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            PipelineError::InvalidInput(_) | PipelineError::NotResumable { .. } => {
                ErrorClass::InvalidInput
            }
            PipelineError::Stage { stage, source, .. }
                if stage.is_retrieval() && source.kind == ErrorKind::Transient =>
            {
                ErrorClass::TransientAdapter
            }
            PipelineError::Stage { .. }
            | PipelineError::OwnershipLost { .. }
            | PipelineError::Ledger(_) => ErrorClass::FatalStage,
            PipelineError::Cancelled { .. } => ErrorClass::Cancelled,
        }
    }

}
