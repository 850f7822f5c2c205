//! The pipeline orchestrator.
//!
//! [`Analyzer`] is the single entry point for running the pipelines. It owns
//! the adapters, the run ledger and the pipeline settings, and exposes:
//!
//! | Method | Does |
//! |--------|------|
//! | [`analyze`](Analyzer::analyze) | Ingest if needed, then answer a question |
//! | [`ingest`](Analyzer::ingest) | Ingest only (forced or if needed) |
//! | [`ask`](Analyzer::ask) | Answer from the existing corpus, no ledger |
//! | [`resume`](Analyzer::resume) | Take over a specific unfinished run |
//!
//! Every run is recorded in the [`RunLedger`]. Before starting a fresh run,
//! `analyze` and `ingest` try to claim an abandoned run of the same
//! repository (unfinished and idle for `pipeline.resume_grace_secs`) and
//! continue it from its last committed stage.
//!
//! # Ingestion-needed rule
//!
//! A fresh run ingests when the repository has no embeddings, or when the
//! newest other run of the repository stopped before its inserts were
//! committed. Otherwise it moves straight to `Ingested`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use sqlx::SqlitePool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use code_analyzer_core::adapters::{
    AdapterResult, BlobStore, ChatCompleter, Embedder, SnapshotSource, VectorStore,
};
use code_analyzer_core::models::RepositoryId;

use crate::blob_fs::FsBlobStore;
use crate::blob_s3::S3BlobStore;
use crate::chaos::{ChaosBlobStore, ChaosMonkey};
use crate::completion::OpenAiCompleter;
use crate::config::Config;
use crate::embedding::OpenAiEmbedder;
use crate::error::{PipelineError, Stage};
use crate::ingest::{self, IngestReport};
use crate::progress::{NoProgress, ProgressEvent, ProgressReporter};
use crate::retrieve::{self, Answer};
use crate::retry::RetryPolicy;
use crate::runs::{PipelineRun, RunLedger, RunStage};
use crate::snapshot_git::GitSnapshot;
use crate::sqlite_store::SqliteVectorStore;

/// The external collaborators the orchestrator drives.
#[derive(Clone)]
pub struct Adapters {
    pub snapshot: Arc<dyn SnapshotSource>,
    pub blobs: Arc<dyn BlobStore>,
    pub embedder: Arc<dyn Embedder>,
    pub completer: Arc<dyn ChatCompleter>,
    pub vectors: Arc<dyn VectorStore>,
}

impl Adapters {
    /// Build the concrete adapters named by `config`.
    ///
    /// Reads `OPENAI_API_KEY` (or the configured variable) and, for the S3
    /// backend, the AWS credentials from the environment.
    pub fn from_config(config: &Config, pool: SqlitePool) -> anyhow::Result<Self> {
        let chaos = Arc::new(ChaosMonkey::new(&config.chaos));
        if chaos.is_enabled() {
            tracing::warn!("fault injection enabled");
        }

        let backend: Arc<dyn BlobStore> = match config.blob.backend.as_str() {
            "s3" => Arc::new(S3BlobStore::new(&config.blob.s3)?),
            "filesystem" => {
                let root = config
                    .blob
                    .root
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("blob.root must be set"))?;
                Arc::new(FsBlobStore::new(root))
            }
            other => anyhow::bail!("Unknown blob backend: '{}'", other),
        };
        let blobs: Arc<dyn BlobStore> = if chaos.is_enabled() {
            Arc::new(ChaosBlobStore::new(backend, chaos.clone()))
        } else {
            backend
        };

        let embedder = Arc::new(OpenAiEmbedder::new(&config.embedding)?);
        let vectors = Arc::new(SqliteVectorStore::new(pool, embedder.model_name()));

        Ok(Self {
            snapshot: Arc::new(GitSnapshot::new(&config.snapshot, blobs.clone(), chaos)?),
            blobs,
            embedder,
            completer: Arc::new(OpenAiCompleter::new(&config.completion)?),
            vectors,
        })
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Upper bound on in-flight fan-out tasks.
    pub concurrency: usize,
    pub embed_retry: RetryPolicy,
    pub top_k: usize,
    pub timeout: Option<Duration>,
    pub resume_grace: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            concurrency: 16,
            embed_retry: RetryPolicy::default(),
            top_k: 5,
            timeout: None,
            resume_grace: Duration::from_secs(900),
        }
    }
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            concurrency: config.pipeline.concurrency,
            embed_retry: config.pipeline.embed_retry.policy(),
            top_k: config.retrieval.top_k,
            timeout: config.pipeline.timeout_secs.map(Duration::from_secs),
            resume_grace: Duration::from_secs(config.pipeline.resume_grace_secs),
        }
    }
}

/// Per-call overrides for [`Analyzer::analyze`].
#[derive(Debug, Clone, Default)]
pub struct AnalyzeOptions {
    /// Number of related files to retrieve; `None` uses the configured default.
    pub top_k: Option<usize>,
    /// Overrides `pipeline.timeout_secs`.
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalyzeOutcome {
    pub run_id: String,
    pub response: String,
    pub sources: Vec<String>,
    /// Present when this call ingested the repository.
    pub ingestion: Option<IngestReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestOutcome {
    pub run_id: String,
    /// `None` when the repository was already ingested.
    pub report: Option<IngestReport>,
}

pub struct Analyzer {
    pub(crate) adapters: Adapters,
    pub(crate) ledger: RunLedger,
    pub(crate) settings: PipelineSettings,
    pub(crate) progress: Arc<dyn ProgressReporter>,
}

impl Analyzer {
    pub fn new(adapters: Adapters, ledger: RunLedger, settings: PipelineSettings) -> Self {
        Self {
            adapters,
            ledger,
            settings,
            progress: Arc::new(NoProgress),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn ledger(&self) -> &RunLedger {
        &self.ledger
    }

    /// Ingest `repository` if needed, then answer `query` from its corpus.
    pub async fn analyze(
        &self,
        repository: &str,
        query: &str,
        options: AnalyzeOptions,
        cancel: &CancellationToken,
    ) -> Result<AnalyzeOutcome, PipelineError> {
        let repository = parse_repository(repository)?;
        let query = parse_query(query)?;
        check_top_k(options.top_k)?;

        let deadline = Deadline::start(cancel, options.timeout.or(self.settings.timeout));
        let mut run = match self
            .ledger
            .claim_resumable(&repository, Some(query), self.settings.resume_grace)
            .await?
        {
            Some(run) => {
                tracing::info!(run_id = %run.run_id, stage = %run.stage, "resuming abandoned run");
                run
            }
            None => self.ledger.start(&repository, Some(query)).await?,
        };

        let result = self
            .answer_run(&mut run, query, options.top_k, &deadline.token)
            .await;
        self.settle(&mut run, result).await
    }

    /// Ingest `repository`. Without `force`, a repository that is already
    /// ingested is left alone.
    pub async fn ingest(
        &self,
        repository: &str,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<IngestOutcome, PipelineError> {
        let repository = parse_repository(repository)?;
        let deadline = Deadline::start(cancel, self.settings.timeout);

        let mut run = match self
            .ledger
            .claim_resumable(&repository, None, self.settings.resume_grace)
            .await?
        {
            Some(run) => run,
            None => self.ledger.start(&repository, None).await?,
        };

        let result = self.ensure_ingested(&mut run, force, &deadline.token).await;
        let report = self.settle(&mut run, result).await?;
        Ok(IngestOutcome {
            run_id: run.run_id,
            report,
        })
    }

    /// Answer `query` from whatever is already stored for `repository`.
    pub async fn ask(
        &self,
        repository: &str,
        query: &str,
        top_k: Option<usize>,
        cancel: &CancellationToken,
    ) -> Result<Answer, PipelineError> {
        let repository = parse_repository(repository)?;
        let query = parse_query(query)?;
        check_top_k(top_k)?;
        let deadline = Deadline::start(cancel, self.settings.timeout);
        retrieve::retrieve(
            &self.adapters,
            &self.settings,
            &repository,
            query,
            top_k,
            &deadline.token,
        )
        .await
    }

    /// Take over run `run_id` regardless of how recently it was updated and
    /// drive it to an answer for `query`.
    pub async fn resume(
        &self,
        run_id: &str,
        query: &str,
        options: AnalyzeOptions,
        cancel: &CancellationToken,
    ) -> Result<AnalyzeOutcome, PipelineError> {
        let query = parse_query(query)?;
        check_top_k(options.top_k)?;
        let deadline = Deadline::start(cancel, options.timeout.or(self.settings.timeout));

        let mut run = self.ledger.claim(run_id, Some(query)).await?;
        tracing::info!(run_id = %run.run_id, stage = %run.stage, "resuming run");
        let result = self
            .answer_run(&mut run, query, options.top_k, &deadline.token)
            .await;
        self.settle(&mut run, result).await
    }

    async fn answer_run(
        &self,
        run: &mut PipelineRun,
        query: &str,
        top_k: Option<usize>,
        cancel: &CancellationToken,
    ) -> Result<AnalyzeOutcome, PipelineError> {
        let ingestion = self.ensure_ingested(run, false, cancel).await?;
        let answer = retrieve::retrieve(
            &self.adapters,
            &self.settings,
            &run.repository,
            query,
            top_k,
            cancel,
        )
        .await?;
        self.commit(run, RunStage::Answered).await?;

        Ok(AnalyzeOutcome {
            run_id: run.run_id.clone(),
            response: answer.response,
            sources: answer.sources,
            ingestion,
        })
    }

    /// Bring the run to `Ingested`, ingesting only when required.
    async fn ensure_ingested(
        &self,
        run: &mut PipelineRun,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<Option<IngestReport>, PipelineError> {
        if run.stage >= RunStage::Ingested {
            return Ok(None);
        }
        if run.stage > RunStage::Started {
            tracing::info!(run_id = %run.run_id, stage = %run.stage, "continuing ingestion");
            return ingest::run_ingestion(self, run, cancel).await.map(Some);
        }
        if force || self.ingestion_needed(run, cancel).await? {
            return ingest::run_ingestion(self, run, cancel).await.map(Some);
        }

        tracing::info!(run_id = %run.run_id, repository = %run.repository, "already ingested");
        self.commit(run, RunStage::Ingested).await?;
        Ok(None)
    }

    async fn ingestion_needed(
        &self,
        run: &PipelineRun,
        cancel: &CancellationToken,
    ) -> Result<bool, PipelineError> {
        let count = guarded(
            cancel,
            Stage::CountEmbeddings,
            run.repository.as_str(),
            self.adapters.vectors.count_embeddings(&run.repository),
        )
        .await?;
        if count == 0 {
            return Ok(true);
        }

        if let Some(previous) = self
            .ledger
            .previous_attempt(&run.repository, &run.run_id)
            .await?
        {
            if previous.left_partial_corpus() {
                tracing::warn!(
                    run_id = %run.run_id,
                    previous_run = %previous.run_id,
                    previous_stage = %previous.stage,
                    existing = count,
                    "previous run stopped before persisting; re-ingesting"
                );
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Persist `stage` for the run and report it.
    pub(crate) async fn commit(
        &self,
        run: &mut PipelineRun,
        stage: RunStage,
    ) -> Result<(), PipelineError> {
        self.ledger.advance(run, stage).await?;
        self.progress.report(ProgressEvent::Stage {
            run_id: run.run_id.clone(),
            stage,
        });
        Ok(())
    }

    pub(crate) fn report_tasks(&self, run: &PipelineRun, stage: Stage, n: usize, total: usize) {
        self.progress.report(ProgressEvent::Tasks {
            run_id: run.run_id.clone(),
            stage,
            n: n as u64,
            total: total as u64,
        });
    }

    /// Record a failed run in the ledger before handing the error back.
    async fn settle<T>(
        &self,
        run: &mut PipelineRun,
        result: Result<T, PipelineError>,
    ) -> Result<T, PipelineError> {
        if let Err(ref err) = result {
            tracing::warn!(
                run_id = %run.run_id,
                repository = %run.repository,
                class = ?err.class(),
                error = %err,
                "run failed"
            );
            if !matches!(err, PipelineError::OwnershipLost { .. }) {
                if let Err(ledger_err) = self.ledger.fail(run, err).await {
                    tracing::error!(run_id = %run.run_id, error = %ledger_err, "could not record failure");
                }
            }
        }
        result
    }
}

/// Race an adapter call against cancellation, tagging failures with `stage`.
pub(crate) async fn guarded<T>(
    cancel: &CancellationToken,
    stage: Stage,
    repository: &str,
    call: impl Future<Output = AdapterResult<T>>,
) -> Result<T, PipelineError> {
    if cancel.is_cancelled() {
        return Err(PipelineError::cancelled(stage, repository));
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(PipelineError::cancelled(stage, repository)),
        result = call => result.map_err(|e| PipelineError::stage(stage, repository, e)),
    }
}

/// A child cancellation token that also fires when the timeout elapses.
struct Deadline {
    token: CancellationToken,
    timer: Option<JoinHandle<()>>,
}

impl Deadline {
    fn start(parent: &CancellationToken, timeout: Option<Duration>) -> Self {
        let token = parent.child_token();
        let timer = timeout.map(|limit| {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                tracing::warn!(timeout_secs = limit.as_secs_f64(), "pipeline timeout elapsed");
                token.cancel();
            })
        });
        Self { token, timer }
    }
}

impl Drop for Deadline {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

fn parse_repository(raw: &str) -> Result<RepositoryId, PipelineError> {
    RepositoryId::parse(raw)
        .ok_or_else(|| PipelineError::InvalidInput("repository must not be empty".to_string()))
}

fn parse_query(raw: &str) -> Result<&str, PipelineError> {
    let query = raw.trim();
    if query.is_empty() {
        return Err(PipelineError::InvalidInput(
            "query must not be empty".to_string(),
        ));
    }
    Ok(query)
}

pub(crate) fn check_top_k(top_k: Option<usize>) -> Result<(), PipelineError> {
    if top_k == Some(0) {
        return Err(PipelineError::InvalidInput(
            "top_k must be at least 1".to_string(),
        ));
    }
    Ok(())
}
