//! Ingestion pipeline.
//!
//! Drives one run from its last committed stage to `Ingested`:
//!
//! 1. create the run's collection
//! 2. snapshot the repository into it (keys are recorded in the ledger)
//! 3. fan out one embed task per key, then fan in
//! 4. fan out one insert per embedded key, then fan in
//! 5. delete the objects and the collection (best effort)
//!
//! Each stage is committed to the ledger before the next one is dispatched,
//! so a resumed run skips whatever already happened. Embedding results are
//! kept in memory only; a run resumed in `Embedded` embeds again.

use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use code_analyzer_core::adapters::{BlobStore, Embedder, VectorStore};
use code_analyzer_core::models::{CollectionName, EmbeddingRecord};

use crate::analyze::{guarded, Analyzer};
use crate::embedding::check_dims;
use crate::error::{PipelineError, Stage};
use crate::fanout::{fan_out, FanIn, TaskOutcome};
use crate::retry::{retry_adapter, RetryError, RetryPolicy};
use crate::runs::{PipelineRun, RunStage};

/// Counters of a completed ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    /// Files produced by the snapshot.
    pub keys: usize,
    pub embedded: u64,
    /// Files excluded because the model rejected them as too long or
    /// returned no vector.
    pub skipped: u64,
    pub inserted: u64,
}

impl From<&PipelineRun> for IngestReport {
    fn from(run: &PipelineRun) -> Self {
        Self {
            keys: run.snapshot_keys.len(),
            embedded: run.embedded,
            skipped: run.skipped,
            inserted: run.inserted,
        }
    }
}

/// An embedded file waiting to be persisted.
struct Embedded {
    key: String,
    content: String,
    vector: Vec<f32>,
}

pub(crate) async fn run_ingestion(
    analyzer: &Analyzer,
    run: &mut PipelineRun,
    cancel: &CancellationToken,
) -> Result<IngestReport, PipelineError> {
    tracing::info!(
        run_id = %run.run_id,
        repository = %run.repository,
        collection = %run.collection,
        stage = %run.stage,
        "ingesting"
    );

    if run.stage < RunStage::CollectionCreated {
        guarded(
            cancel,
            Stage::CreateCollection,
            run.repository.as_str(),
            analyzer.adapters.blobs.create_collection(&run.collection),
        )
        .await?;
        analyzer.commit(run, RunStage::CollectionCreated).await?;
    }

    let populated = populate(analyzer, run, cancel).await;

    if run.stage < RunStage::CollectionTorndown {
        match &populated {
            Err(PipelineError::OwnershipLost { .. }) => {
                tracing::warn!(run_id = %run.run_id, "run taken over; leaving collection to its new owner");
            }
            _ => cleanup(analyzer, run).await,
        }
    }
    populated?;

    if run.stage < RunStage::CollectionTorndown {
        analyzer.commit(run, RunStage::CollectionTorndown).await?;
    }
    analyzer.commit(run, RunStage::Ingested).await?;

    let report = IngestReport::from(&*run);
    tracing::info!(
        run_id = %run.run_id,
        repository = %run.repository,
        keys = report.keys,
        embedded = report.embedded,
        skipped = report.skipped,
        inserted = report.inserted,
        "ingestion complete"
    );
    Ok(report)
}

/// Snapshot, embed and persist, skipping stages the ledger already holds.
async fn populate(
    analyzer: &Analyzer,
    run: &mut PipelineRun,
    cancel: &CancellationToken,
) -> Result<(), PipelineError> {
    let adapters = &analyzer.adapters;

    if run.stage < RunStage::Snapshotted {
        let keys = guarded(
            cancel,
            Stage::Snapshot,
            run.repository.as_str(),
            adapters.snapshot.snapshot(&run.repository, &run.collection),
        )
        .await?;
        tracing::info!(run_id = %run.run_id, files = keys.len(), "snapshot uploaded");
        run.snapshot_keys = keys;
        analyzer.commit(run, RunStage::Snapshotted).await?;
    }

    if run.stage >= RunStage::Persisted {
        return Ok(());
    }

    let embedded = embed_all(analyzer, run, cancel).await?;
    analyzer.commit(run, RunStage::Embedded).await?;

    run.inserted = persist_all(analyzer, run, embedded, cancel).await?;
    analyzer.commit(run, RunStage::Persisted).await
}

async fn embed_all(
    analyzer: &Analyzer,
    run: &mut PipelineRun,
    cancel: &CancellationToken,
) -> Result<Vec<Embedded>, PipelineError> {
    let blobs = analyzer.adapters.blobs.clone();
    let embedder = analyzer.adapters.embedder.clone();
    let collection = run.collection.clone();
    let policy = analyzer.settings.embed_retry;
    let task_cancel = cancel.clone();

    let outcomes = fan_out(
        run.snapshot_keys.clone(),
        analyzer.settings.concurrency,
        cancel,
        move |key| {
            embed_object(
                blobs.clone(),
                embedder.clone(),
                collection.clone(),
                key,
                policy,
                task_cancel.clone(),
            )
        },
        |n, total| analyzer.report_tasks(&*run, Stage::Embed, n, total),
    )
    .await;

    let fan_in = FanIn::collect(outcomes);
    let repo = run.repository.as_str();
    if fan_in.cancelled > 0 || cancel.is_cancelled() {
        return Err(PipelineError::cancelled(Stage::Embed, repo));
    }
    if let Some(first) = fan_in.failures.first() {
        return Err(PipelineError::Stage {
            stage: Stage::Embed,
            repository: repo.to_string(),
            failed: fan_in.failures.len(),
            total: fan_in.total,
            source: first.clone(),
        });
    }

    run.embedded = fan_in.completed.len() as u64;
    run.skipped = fan_in.skipped as u64;
    tracing::info!(
        run_id = %run.run_id,
        embedded = run.embedded,
        skipped = run.skipped,
        "embedding fan-in complete"
    );
    Ok(fan_in.completed)
}

/// Read one object and embed its text. Both calls are retried together.
async fn embed_object(
    blobs: Arc<dyn BlobStore>,
    embedder: Arc<dyn Embedder>,
    collection: CollectionName,
    key: String,
    policy: RetryPolicy,
    cancel: CancellationToken,
) -> TaskOutcome<Embedded> {
    let blobs = &*blobs;
    let embedder = &*embedder;
    let collection = &collection;
    let object_key = key.as_str();

    let result = retry_adapter(&cancel, policy, "embed", || async move {
        let bytes = blobs.get_object(collection, object_key).await?;
        let content = String::from_utf8_lossy(&bytes).into_owned();
        let vector = embedder.embed(&content).await?;
        Ok((content, vector))
    })
    .await;

    match result {
        Ok((_, vector)) if vector.is_empty() => {
            tracing::warn!(key = %key, "empty embedding; skipping");
            TaskOutcome::Skipped(format!("{}: empty embedding", key))
        }
        Ok((content, vector)) => {
            if let Err(err) = check_dims(embedder.model_name(), &vector, embedder.dims()) {
                tracing::warn!(key = %key, error = %err, "wrong embedding dimension");
                return TaskOutcome::Failed(err);
            }
            TaskOutcome::Completed(Embedded {
                key,
                content,
                vector,
            })
        }
        Err(RetryError::TooLong { source, .. }) => {
            tracing::warn!(key = %key, error = %source, "too long to embed; skipping");
            TaskOutcome::Skipped(format!("{}: {}", key, source))
        }
        Err(RetryError::Exhausted { source, .. }) => TaskOutcome::Failed(source),
        Err(RetryError::Cancelled { .. }) => TaskOutcome::Cancelled,
    }
}

async fn persist_all(
    analyzer: &Analyzer,
    run: &PipelineRun,
    embedded: Vec<Embedded>,
    cancel: &CancellationToken,
) -> Result<u64, PipelineError> {
    let records: Vec<EmbeddingRecord> = embedded
        .into_iter()
        .map(|item| EmbeddingRecord {
            repository: run.repository.clone(),
            key: item.key,
            content: item.content,
            vector: item.vector,
        })
        .collect();
    let vectors = analyzer.adapters.vectors.clone();

    let outcomes = fan_out(
        records,
        analyzer.settings.concurrency,
        cancel,
        move |record| insert_record(vectors.clone(), record),
        |n, total| analyzer.report_tasks(run, Stage::Persist, n, total),
    )
    .await;

    let fan_in = FanIn::collect(outcomes);
    let repo = run.repository.as_str();
    if fan_in.cancelled > 0 || cancel.is_cancelled() {
        return Err(PipelineError::cancelled(Stage::Persist, repo));
    }
    if let Some(first) = fan_in.failures.first() {
        return Err(PipelineError::Stage {
            stage: Stage::Persist,
            repository: repo.to_string(),
            failed: fan_in.failures.len(),
            total: fan_in.total,
            source: first.clone(),
        });
    }
    Ok(fan_in.completed.len() as u64)
}

async fn insert_record(vectors: Arc<dyn VectorStore>, record: EmbeddingRecord) -> TaskOutcome<()> {
    match vectors.insert_embedding(&record).await {
        Ok(()) => TaskOutcome::Completed(()),
        Err(err) => {
            tracing::warn!(key = %record.key, error = %err, "insert failed");
            TaskOutcome::Failed(err)
        }
    }
}

/// Delete the run's objects, then its collection. Failures are logged only.
///
/// Runs under its own token so a cancelled run still cleans up.
async fn cleanup(analyzer: &Analyzer, run: &PipelineRun) {
    let blobs = analyzer.adapters.blobs.clone();
    let collection = run.collection.clone();
    let keys = run.snapshot_keys.clone();

    let outcomes = fan_out(
        keys.clone(),
        analyzer.settings.concurrency,
        &CancellationToken::new(),
        {
            let blobs = blobs.clone();
            let collection = collection.clone();
            move |key: String| delete_object(blobs.clone(), collection.clone(), key)
        },
        |n, total| analyzer.report_tasks(run, Stage::Cleanup, n, total),
    )
    .await;

    for (key, outcome) in keys.iter().zip(&outcomes) {
        if let TaskOutcome::Failed(err) = outcome {
            tracing::warn!(run_id = %run.run_id, key = %key, error = %err, "could not delete object");
        }
    }

    if let Err(err) = blobs.delete_collection(&collection).await {
        tracing::warn!(
            run_id = %run.run_id,
            collection = %collection,
            error = %err,
            "could not delete collection"
        );
    }
}

async fn delete_object(
    blobs: Arc<dyn BlobStore>,
    collection: CollectionName,
    key: String,
) -> TaskOutcome<()> {
    match blobs.delete_object(&collection, &key).await {
        Ok(()) => TaskOutcome::Completed(()),
        Err(err) => TaskOutcome::Failed(err),
    }
}
