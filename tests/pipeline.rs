//! End-to-end tests of the Analyze, Ingestion and Retrieval pipelines.
//!
//! The adapters are scripted fakes; the run ledger is a real SQLite file in
//! a temp directory.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::SqlitePool;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use code_analyzer::analyze::{Adapters, AnalyzeOptions, Analyzer, PipelineSettings};
use code_analyzer::error::{ErrorClass, PipelineError, Stage};
use code_analyzer::retry::RetryPolicy;
use code_analyzer::runs::{RunLedger, RunStage};
use code_analyzer::{db, migrate};
use code_analyzer_core::adapters::{
    AdapterError, AdapterResult, BlobStore, ChatCompleter, Embedder, SnapshotSource, VectorStore,
};
use code_analyzer_core::filter;
use code_analyzer_core::models::{
    ChatMessage, CollectionName, EmbeddingRecord, RelatedDocument, RepositoryId,
};
use code_analyzer_core::store::{MemoryBlobStore, MemoryVectorStore};

const REPO: &str = "https://github.com/example/widgets.git";

fn repo() -> RepositoryId {
    RepositoryId::parse(REPO).unwrap()
}

// ============ Fakes ============

/// Uploads a fixed file set, dropping what the filter rejects.
struct FakeSnapshot {
    files: Vec<(String, String)>,
    blobs: Arc<MemoryBlobStore>,
    calls: AtomicUsize,
    fail: AtomicBool,
}

impl FakeSnapshot {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SnapshotSource for FakeSnapshot {
    async fn snapshot(
        &self,
        _repository: &RepositoryId,
        collection: &CollectionName,
    ) -> AdapterResult<Vec<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(AdapterError::permanent("repository not found"));
        }
        let mut keys = Vec::new();
        for (path, content) in &self.files {
            if !filter::should_ingest(path) {
                continue;
            }
            self.blobs
                .put_object(collection, path, content.as_bytes().to_vec())
                .await?;
            keys.push(path.clone());
        }
        Ok(keys)
    }
}

/// Embeds by content marker:
/// `TOO_LONG` is rejected, `FLAKY` always fails transiently, `SLOW` never
/// returns, `EMPTY` yields no vector, `WIDE` yields one dimension too many.
/// Anything else gets a small vector.
struct FakeEmbedder {
    calls: Mutex<HashMap<String, usize>>,
    log: Arc<Mutex<Vec<String>>>,
}

impl FakeEmbedder {
    fn calls_for(&self, text: &str) -> usize {
        self.calls.lock().unwrap().get(text).copied().unwrap_or(0)
    }

    fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl Embedder for FakeEmbedder {
    fn model_name(&self) -> &str {
        "fake-embedder"
    }

    fn dims(&self) -> usize {
        3
    }

    async fn embed(&self, text: &str) -> AdapterResult<Vec<f32>> {
        *self.calls.lock().unwrap().entry(text.to_string()).or_default() += 1;
        self.log.lock().unwrap().push(format!("embed:{}", text));

        if text.contains("TOO_LONG") {
            return Err(AdapterError::too_long("maximum context length is 8191 tokens"));
        }
        if text.contains("FLAKY") {
            return Err(AdapterError::transient("HTTP 503"));
        }
        if text.contains("SLOW") {
            std::future::pending::<()>().await;
        }
        if text.contains("EMPTY") {
            return Ok(Vec::new());
        }
        if text.contains("WIDE") {
            return Ok(vec![1.0, 0.0, 0.5, 0.25]);
        }
        Ok(vec![1.0, text.len() as f32 / 100.0, 0.5])
    }
}

struct RecordingCompleter {
    conversations: Mutex<Vec<Vec<ChatMessage>>>,
}

impl RecordingCompleter {
    fn calls(&self) -> usize {
        self.conversations.lock().unwrap().len()
    }

    /// The retrieved-context message of the last conversation.
    fn last_context(&self) -> String {
        let conversations = self.conversations.lock().unwrap();
        let last = conversations.last().expect("no completion call");
        last[last.len() - 2].content.clone()
    }
}

#[async_trait]
impl ChatCompleter for RecordingCompleter {
    fn model_name(&self) -> &str {
        "fake-chat"
    }

    async fn complete(&self, conversation: &[ChatMessage]) -> AdapterResult<String> {
        self.conversations
            .lock()
            .unwrap()
            .push(conversation.to_vec());
        Ok("Here is how it works.".to_string())
    }
}

/// Memory store that logs inserts and can return a fixed nearest list.
/// Records whose content contains `REJECT` fail to insert.
struct RecordingVectors {
    inner: MemoryVectorStore,
    inserts: AtomicUsize,
    log: Arc<Mutex<Vec<String>>>,
    fixed_nearest: Option<Vec<RelatedDocument>>,
}

#[async_trait]
impl VectorStore for RecordingVectors {
    async fn insert_embedding(&self, record: &EmbeddingRecord) -> AdapterResult<()> {
        self.inserts.fetch_add(1, Ordering::SeqCst);
        self.log
            .lock()
            .unwrap()
            .push(format!("insert:{}", record.key));
        if record.content.contains("REJECT") {
            return Err(AdapterError::permanent("constraint violation"));
        }
        self.inner.insert_embedding(record).await
    }

    async fn count_embeddings(&self, repository: &RepositoryId) -> AdapterResult<u64> {
        self.inner.count_embeddings(repository).await
    }

    async fn query_nearest(
        &self,
        repository: &RepositoryId,
        vector: &[f32],
        limit: usize,
    ) -> AdapterResult<Vec<RelatedDocument>> {
        match self.fixed_nearest {
            Some(ref docs) => Ok(docs.iter().take(limit).cloned().collect()),
            None => self.inner.query_nearest(repository, vector, limit).await,
        }
    }
}

/// Memory blob store whose deletes can be made to fail.
struct ScriptedBlobs {
    inner: Arc<MemoryBlobStore>,
    fail_deletes: AtomicBool,
    delete_attempts: AtomicUsize,
}

impl ScriptedBlobs {
    fn delete_result(&self) -> AdapterResult<()> {
        self.delete_attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(AdapterError::transient("HTTP 503"));
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStore for ScriptedBlobs {
    async fn create_collection(&self, collection: &CollectionName) -> AdapterResult<()> {
        self.inner.create_collection(collection).await
    }

    async fn delete_collection(&self, collection: &CollectionName) -> AdapterResult<()> {
        self.delete_result()?;
        self.inner.delete_collection(collection).await
    }

    async fn put_object(
        &self,
        collection: &CollectionName,
        key: &str,
        bytes: Vec<u8>,
    ) -> AdapterResult<()> {
        self.inner.put_object(collection, key, bytes).await
    }

    async fn get_object(&self, collection: &CollectionName, key: &str) -> AdapterResult<Vec<u8>> {
        self.inner.get_object(collection, key).await
    }

    async fn delete_object(&self, collection: &CollectionName, key: &str) -> AdapterResult<()> {
        self.delete_result()?;
        self.inner.delete_object(collection, key).await
    }
}

// ============ Harness ============

struct Harness {
    _tmp: TempDir,
    pool: SqlitePool,
    blobs: Arc<MemoryBlobStore>,
    scripted_blobs: Arc<ScriptedBlobs>,
    snapshot: Arc<FakeSnapshot>,
    embedder: Arc<FakeEmbedder>,
    completer: Arc<RecordingCompleter>,
    vectors: Arc<RecordingVectors>,
    log: Arc<Mutex<Vec<String>>>,
    settings: PipelineSettings,
}

impl Harness {
    async fn new(files: &[(&str, &str)]) -> Self {
        Self::build(files, None).await
    }

    async fn with_nearest(docs: Vec<RelatedDocument>) -> Self {
        Self::build(&[], Some(docs)).await
    }

    async fn build(files: &[(&str, &str)], fixed_nearest: Option<Vec<RelatedDocument>>) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let pool = db::connect_path(&tmp.path().join("analyzer.sqlite"))
            .await
            .unwrap();
        migrate::apply_schema(&pool).await.unwrap();

        let log = Arc::new(Mutex::new(Vec::new()));
        let blobs = Arc::new(MemoryBlobStore::new());
        let snapshot = Arc::new(FakeSnapshot {
            files: files
                .iter()
                .map(|(p, c)| (p.to_string(), c.to_string()))
                .collect(),
            blobs: blobs.clone(),
            calls: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
        });

        Self {
            _tmp: tmp,
            pool,
            scripted_blobs: Arc::new(ScriptedBlobs {
                inner: blobs.clone(),
                fail_deletes: AtomicBool::new(false),
                delete_attempts: AtomicUsize::new(0),
            }),
            blobs,
            snapshot,
            embedder: Arc::new(FakeEmbedder {
                calls: Mutex::new(HashMap::new()),
                log: log.clone(),
            }),
            completer: Arc::new(RecordingCompleter {
                conversations: Mutex::new(Vec::new()),
            }),
            vectors: Arc::new(RecordingVectors {
                inner: MemoryVectorStore::new(),
                inserts: AtomicUsize::new(0),
                log: log.clone(),
                fixed_nearest,
            }),
            log,
            settings: PipelineSettings {
                concurrency: 4,
                embed_retry: RetryPolicy {
                    initial_backoff: Duration::from_millis(1),
                    max_attempts: 5,
                    multiplier: 2.0,
                    max_backoff: Duration::from_millis(5),
                },
                top_k: 5,
                timeout: None,
                resume_grace: Duration::from_secs(3600),
            },
        }
    }

    fn analyzer(&self) -> Analyzer {
        let adapters = Adapters {
            snapshot: self.snapshot.clone(),
            blobs: self.scripted_blobs.clone(),
            embedder: self.embedder.clone(),
            completer: self.completer.clone(),
            vectors: self.vectors.clone(),
        };
        Analyzer::new(
            adapters,
            RunLedger::new(self.pool.clone()),
            self.settings.clone(),
        )
    }

    async fn count(&self) -> u64 {
        self.vectors.count_embeddings(&repo()).await.unwrap()
    }

    fn inserts(&self) -> usize {
        self.vectors.inserts.load(Ordering::SeqCst)
    }
}

fn no_cancel() -> CancellationToken {
    CancellationToken::new()
}

// ============ Analyze ============

#[tokio::test]
async fn test_analyze_ingests_filtered_files_then_answers() {
    let h = Harness::new(&[("a.py", "print('a')"), ("b.md", "# B"), ("c.png", "PNG")]).await;
    let analyzer = h.analyzer();

    let outcome = analyzer
        .analyze(REPO, "What does a.py print?", AnalyzeOptions::default(), &no_cancel())
        .await
        .unwrap();

    assert_eq!(outcome.response, "Here is how it works.");
    let report = outcome.ingestion.expect("first analyze ingests");
    assert_eq!(report.keys, 2);
    assert_eq!(report.inserted, 2);
    assert_eq!(h.count().await, 2);
    assert_eq!(h.vectors.inner.keys(&repo()), vec!["a.py", "b.md"]);
    assert_eq!(h.completer.calls(), 1);
    assert_eq!(h.blobs.collection_count(), 0, "collection torn down");

    let run = analyzer
        .ledger()
        .get(&outcome.run_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(run.stage, RunStage::Answered);
    assert_eq!(run.snapshot_keys, vec!["a.py", "b.md"]);
}

#[tokio::test]
async fn test_second_analyze_only_retrieves() {
    let h = Harness::new(&[("a.py", "print('a')"), ("b.md", "# B")]).await;
    let analyzer = h.analyzer();
    analyzer
        .analyze(REPO, "first?", AnalyzeOptions::default(), &no_cancel())
        .await
        .unwrap();
    let embeds_after_first = h.embedder.total_calls();

    let outcome = analyzer
        .analyze(REPO, "second?", AnalyzeOptions::default(), &no_cancel())
        .await
        .unwrap();

    assert!(outcome.ingestion.is_none());
    assert_eq!(h.snapshot.calls(), 1);
    assert_eq!(h.inserts(), 2);
    assert_eq!(h.embedder.total_calls(), embeds_after_first + 1, "only the query");
    assert_eq!(h.embedder.calls_for("second?"), 1);
    assert_eq!(h.completer.calls(), 2);
}

#[tokio::test]
async fn test_zero_top_k_is_invalid_input() {
    let h = Harness::new(&[("a.py", "print('a')")]).await;
    let analyzer = h.analyzer();
    let options = AnalyzeOptions {
        top_k: Some(0),
        timeout: None,
    };

    let err = analyzer
        .analyze(REPO, "q", options, &no_cancel())
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::InvalidInput(_)));
    assert_eq!(err.class(), ErrorClass::InvalidInput);
    assert_eq!(h.snapshot.calls(), 0);
    assert!(analyzer.ledger().list(None, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_blank_repository_and_query_are_rejected() {
    let h = Harness::new(&[]).await;
    let analyzer = h.analyzer();
    let err = analyzer
        .analyze("  ", "q", AnalyzeOptions::default(), &no_cancel())
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::InvalidInput(_)));

    let err = analyzer
        .ask(REPO, "   ", None, &no_cancel())
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::InvalidInput(_)));
}

#[tokio::test]
async fn test_partial_previous_run_forces_reingestion() {
    let h = Harness::new(&[("a.py", "print('a')"), ("b.md", "# B")]).await;
    let analyzer = h.analyzer();
    analyzer
        .analyze(REPO, "first?", AnalyzeOptions::default(), &no_cancel())
        .await
        .unwrap();

    // A later run that died after creating its collection.
    let ledger = RunLedger::with_owner(h.pool.clone(), "other-process");
    let mut broken = ledger.start(&repo(), Some("q")).await.unwrap();
    ledger
        .advance(&mut broken, RunStage::CollectionCreated)
        .await
        .unwrap();
    ledger
        .fail(&mut broken, &PipelineError::cancelled(Stage::Snapshot, REPO))
        .await
        .unwrap();

    let outcome = analyzer
        .analyze(REPO, "again?", AnalyzeOptions::default(), &no_cancel())
        .await
        .unwrap();

    assert!(outcome.ingestion.is_some());
    assert_eq!(h.snapshot.calls(), 2);
    assert_eq!(h.count().await, 2, "upserts keep one row per key");
}

#[tokio::test]
async fn test_run_failed_before_count_does_not_hide_partial_corpus() {
    let h = Harness::new(&[("a.py", "print('a')"), ("b.md", "# B")]).await;
    let analyzer = h.analyzer();
    analyzer
        .analyze(REPO, "first?", AnalyzeOptions::default(), &no_cancel())
        .await
        .unwrap();

    // Another process died halfway through persisting.
    let ledger = RunLedger::with_owner(h.pool.clone(), "other-process");
    let mut broken = ledger.start(&repo(), Some("q")).await.unwrap();
    for stage in [
        RunStage::CollectionCreated,
        RunStage::Snapshotted,
        RunStage::Embedded,
    ] {
        ledger.advance(&mut broken, stage).await.unwrap();
    }
    ledger
        .fail(&mut broken, &PipelineError::cancelled(Stage::Persist, REPO))
        .await
        .unwrap();

    // A run cancelled before it could even count the stored rows.
    let cancelled = CancellationToken::new();
    cancelled.cancel();
    let err = analyzer
        .analyze(REPO, "interrupted?", AnalyzeOptions::default(), &cancelled)
        .await
        .unwrap_err();
    assert!(
        matches!(
            err,
            PipelineError::Cancelled {
                stage: Stage::CountEmbeddings,
                ..
            }
        ),
        "got {err:?}"
    );
    let runs = analyzer.ledger().list(None, 1).await.unwrap();
    assert_eq!(runs[0].failed_stage, Some(RunStage::Started));

    let outcome = analyzer
        .analyze(REPO, "again?", AnalyzeOptions::default(), &no_cancel())
        .await
        .unwrap();

    assert!(outcome.ingestion.is_some(), "partial corpus must be re-ingested");
    assert_eq!(h.snapshot.calls(), 2);
}

// ============ Ingestion ============

#[tokio::test]
async fn test_too_long_file_is_skipped() {
    let h = Harness::new(&[
        ("a.py", "print('a')"),
        ("big.py", "TOO_LONG ".repeat(10).as_str()),
        ("b.md", "# B"),
        ("empty.py", "EMPTY"),
    ])
    .await;

    let outcome = h.analyzer().ingest(REPO, false, &no_cancel()).await.unwrap();

    let report = outcome.report.unwrap();
    assert_eq!(report.keys, 4);
    assert_eq!(report.embedded, 2);
    assert_eq!(report.skipped, 2);
    assert_eq!(report.inserted, 2);
    assert_eq!(h.vectors.inner.keys(&repo()), vec!["a.py", "b.md"]);
    assert_eq!(h.embedder.calls_for(&"TOO_LONG ".repeat(10)), 1, "no retry");
}

#[tokio::test]
async fn test_all_embeds_settle_before_first_insert() {
    let files: Vec<(String, String)> = (0..12)
        .map(|i| (format!("src/m{}.rs", i), format!("fn m{}() {{}}", i)))
        .collect();
    let refs: Vec<(&str, &str)> = files
        .iter()
        .map(|(p, c)| (p.as_str(), c.as_str()))
        .collect();
    let h = Harness::new(&refs).await;

    let outcome = h.analyzer().ingest(REPO, false, &no_cancel()).await.unwrap();
    assert_eq!(outcome.report.unwrap().inserted, 12);

    let log = h.log.lock().unwrap().clone();
    let embeds = log.iter().filter(|e| e.starts_with("embed:")).count();
    let first_insert = log.iter().position(|e| e.starts_with("insert:")).unwrap();
    assert_eq!(embeds, 12, "one embed task per key");
    assert!(
        log[..first_insert].iter().all(|e| e.starts_with("embed:")),
        "insert dispatched before embed fan-in: {:?}",
        log
    );
    assert_eq!(log[first_insert..].len(), 12);
}

#[tokio::test]
async fn test_retry_exhaustion_fails_embed_stage() {
    let h = Harness::new(&[("a.py", "print('a')"), ("flaky.py", "FLAKY")]).await;
    let analyzer = h.analyzer();

    let err = analyzer
        .analyze(REPO, "q", AnalyzeOptions::default(), &no_cancel())
        .await
        .unwrap_err();

    match err {
        PipelineError::Stage {
            stage,
            ref repository,
            failed,
            total,
            ..
        } => {
            assert_eq!(stage, Stage::Embed);
            assert_eq!(repository, REPO);
            assert_eq!((failed, total), (1, 2));
        }
        ref other => panic!("expected embed stage error, got {other:?}"),
    }
    assert_eq!(err.class(), ErrorClass::FatalStage);
    assert_eq!(h.embedder.calls_for("FLAKY"), 5);
    assert_eq!(h.inserts(), 0);
    assert_eq!(h.completer.calls(), 0);
    assert_eq!(h.blobs.collection_count(), 0, "cleanup after failure");

    let runs = analyzer.ledger().list(None, 10).await.unwrap();
    assert_eq!(runs[0].stage, RunStage::Failed);
    assert_eq!(runs[0].failed_stage, Some(RunStage::Snapshotted));
    assert!(runs[0].error.as_deref().unwrap().contains("embed"));
}

#[tokio::test]
async fn test_wrong_dimension_fails_embed_stage() {
    let h = Harness::new(&[("a.py", "print('a')"), ("wide.py", "WIDE")]).await;

    let err = h
        .analyzer()
        .ingest(REPO, false, &no_cancel())
        .await
        .unwrap_err();

    assert!(
        matches!(
            err,
            PipelineError::Stage {
                stage: Stage::Embed,
                failed: 1,
                total: 2,
                ..
            }
        ),
        "got {err:?}"
    );
    assert!(err.to_string().contains("4-dimensional"));
    assert_eq!(h.embedder.calls_for("WIDE"), 1);
    assert_eq!(h.inserts(), 0);
    assert_eq!(h.count().await, 0);
}

#[tokio::test]
async fn test_insert_failure_fails_persist_stage_and_cleans_up() {
    let h = Harness::new(&[("a.py", "print('a')"), ("bad.py", "REJECT me")]).await;
    let analyzer = h.analyzer();

    let err = analyzer
        .analyze(REPO, "q", AnalyzeOptions::default(), &no_cancel())
        .await
        .unwrap_err();

    match err {
        PipelineError::Stage {
            stage,
            failed,
            total,
            ..
        } => {
            assert_eq!(stage, Stage::Persist);
            assert_eq!((failed, total), (1, 2));
        }
        ref other => panic!("expected persist stage error, got {other:?}"),
    }
    assert_eq!(err.class(), ErrorClass::FatalStage);
    assert_eq!(h.inserts(), 2, "every insert settles before fan-in");
    assert_eq!(h.completer.calls(), 0);
    assert_eq!(h.blobs.collection_count(), 0, "cleanup after failure");

    let runs = analyzer.ledger().list(None, 10).await.unwrap();
    assert_eq!(runs[0].stage, RunStage::Failed);
    assert_eq!(runs[0].failed_stage, Some(RunStage::Embedded));
}

#[tokio::test]
async fn test_cleanup_failure_is_not_fatal() {
    let h = Harness::new(&[("a.py", "print('a')"), ("b.md", "# B")]).await;
    h.scripted_blobs.fail_deletes.store(true, Ordering::SeqCst);
    let analyzer = h.analyzer();

    let outcome = analyzer
        .analyze(REPO, "q", AnalyzeOptions::default(), &no_cancel())
        .await
        .unwrap();

    assert_eq!(outcome.response, "Here is how it works.");
    assert_eq!(outcome.ingestion.unwrap().inserted, 2);
    assert_eq!(
        h.scripted_blobs.delete_attempts.load(Ordering::SeqCst),
        3,
        "two objects, then the collection"
    );
    assert_eq!(h.blobs.collection_count(), 1, "collection left behind");

    let run = analyzer
        .ledger()
        .get(&outcome.run_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(run.stage, RunStage::Answered);
    assert!(run.error.is_none());
}

#[tokio::test]
async fn test_snapshot_failure_is_fatal() {
    let h = Harness::new(&[("a.py", "print('a')")]).await;
    h.snapshot.fail.store(true, Ordering::SeqCst);
    let analyzer = h.analyzer();

    let err = analyzer
        .analyze(REPO, "q", AnalyzeOptions::default(), &no_cancel())
        .await
        .unwrap_err();

    assert!(
        matches!(
            err,
            PipelineError::Stage {
                stage: Stage::Snapshot,
                ..
            }
        ),
        "got {err:?}"
    );
    assert_eq!(err.class(), ErrorClass::FatalStage);
    assert!(err.to_string().contains(REPO));
    assert_eq!(h.embedder.total_calls(), 0);
    assert_eq!(h.inserts(), 0);
    assert_eq!(h.completer.calls(), 0);
    assert_eq!(h.blobs.collection_count(), 0, "collection removed");

    let runs = analyzer.ledger().list(None, 10).await.unwrap();
    assert_eq!(runs[0].failed_stage, Some(RunStage::CollectionCreated));
}

#[tokio::test]
async fn test_cancellation_stops_run_and_cleans_up() {
    let h = Harness::new(&[("a.py", "print('a')"), ("slow.py", "SLOW")]).await;
    let analyzer = h.analyzer();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let err = analyzer
        .analyze(REPO, "q", AnalyzeOptions::default(), &cancel)
        .await
        .unwrap_err();

    assert!(
        matches!(err, PipelineError::Cancelled { stage: Stage::Embed, .. }),
        "got {err:?}"
    );
    assert_eq!(err.class(), ErrorClass::Cancelled);
    assert_eq!(h.inserts(), 0);
    assert_eq!(h.blobs.collection_count(), 0);
    let runs = analyzer.ledger().list(None, 10).await.unwrap();
    assert_eq!(runs[0].stage, RunStage::Failed);
}

#[tokio::test]
async fn test_timeout_cancels_run() {
    let h = Harness::new(&[("slow.py", "SLOW")]).await;
    let options = AnalyzeOptions {
        top_k: None,
        timeout: Some(Duration::from_millis(50)),
    };

    let err = h
        .analyzer()
        .analyze(REPO, "q", options, &no_cancel())
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::Cancelled { .. }), "got {err:?}");
}

#[tokio::test]
async fn test_forced_ingest_runs_again() {
    let h = Harness::new(&[("a.py", "print('a')")]).await;
    let analyzer = h.analyzer();
    analyzer.ingest(REPO, false, &no_cancel()).await.unwrap();

    let unforced = analyzer.ingest(REPO, false, &no_cancel()).await.unwrap();
    assert!(unforced.report.is_none());
    assert_eq!(h.snapshot.calls(), 1);

    let forced = analyzer.ingest(REPO, true, &no_cancel()).await.unwrap();
    assert_eq!(forced.report.unwrap().inserted, 1);
    assert_eq!(h.snapshot.calls(), 2);
    assert_eq!(h.count().await, 1);
}

// ============ Resume ============

#[tokio::test]
async fn test_resume_skips_committed_snapshot() {
    let h = Harness::new(&[("a.py", "print('a')"), ("b.md", "# B")]).await;

    // A process that crashed right after its snapshot committed.
    let crashed = RunLedger::with_owner(h.pool.clone(), "crashed");
    let mut run = crashed.start(&repo(), Some("old question")).await.unwrap();
    h.blobs.create_collection(&run.collection).await.unwrap();
    crashed
        .advance(&mut run, RunStage::CollectionCreated)
        .await
        .unwrap();
    for (key, content) in [("a.py", "print('a')"), ("b.md", "# B")] {
        h.blobs
            .put_object(&run.collection, key, content.as_bytes().to_vec())
            .await
            .unwrap();
    }
    run.snapshot_keys = vec!["a.py".to_string(), "b.md".to_string()];
    crashed
        .advance(&mut run, RunStage::Snapshotted)
        .await
        .unwrap();

    let analyzer = h.analyzer();
    let outcome = analyzer
        .resume(&run.run_id, "new question", AnalyzeOptions::default(), &no_cancel())
        .await
        .unwrap();

    assert_eq!(outcome.run_id, run.run_id);
    assert_eq!(h.snapshot.calls(), 0);
    assert_eq!(outcome.ingestion.unwrap().inserted, 2);
    assert_eq!(h.count().await, 2);
    assert_eq!(h.blobs.collection_count(), 0);

    let stored = analyzer.ledger().get(&run.run_id).await.unwrap().unwrap();
    assert_eq!(stored.stage, RunStage::Answered);
    assert_eq!(stored.query.as_deref(), Some("new question"));

    let err = crashed
        .advance(&mut run, RunStage::Embedded)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::OwnershipLost { .. }));
}

#[tokio::test]
async fn test_analyze_claims_abandoned_run() {
    let mut h = Harness::new(&[("a.py", "print('a')")]).await;
    h.settings.resume_grace = Duration::ZERO;

    let crashed = RunLedger::with_owner(h.pool.clone(), "crashed");
    let mut run = crashed.start(&repo(), Some("q")).await.unwrap();
    h.blobs.create_collection(&run.collection).await.unwrap();
    crashed
        .advance(&mut run, RunStage::CollectionCreated)
        .await
        .unwrap();

    let outcome = h
        .analyzer()
        .analyze(REPO, "q", AnalyzeOptions::default(), &no_cancel())
        .await
        .unwrap();

    assert_eq!(outcome.run_id, run.run_id);
    assert_eq!(h.snapshot.calls(), 1);
    assert_eq!(h.count().await, 1);
}

#[tokio::test]
async fn test_resume_rejects_answered_run() {
    let h = Harness::new(&[("a.py", "print('a')")]).await;
    let analyzer = h.analyzer();
    let outcome = analyzer
        .analyze(REPO, "q", AnalyzeOptions::default(), &no_cancel())
        .await
        .unwrap();

    let err = analyzer
        .resume(&outcome.run_id, "q", AnalyzeOptions::default(), &no_cancel())
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::NotResumable { .. }));
}

// ============ Retrieval ============

#[tokio::test]
async fn test_prompt_lists_closest_file_first() {
    let h = Harness::with_nearest(vec![
        RelatedDocument {
            key: "k1.py".to_string(),
            content: "closest content".to_string(),
            distance: 0.1,
        },
        RelatedDocument {
            key: "k2.py".to_string(),
            content: "farther content".to_string(),
            distance: 0.3,
        },
    ])
    .await;

    let answer = h
        .analyzer()
        .ask(REPO, "where?", None, &no_cancel())
        .await
        .unwrap();

    assert_eq!(answer.sources, vec!["k1.py", "k2.py"]);
    let context = h.completer.last_context();
    let first = context.find("closest content").unwrap();
    let second = context.find("farther content").unwrap();
    assert!(first < second);
    assert!(context.contains("File: k1.py\nclosest content"));
}

#[tokio::test]
async fn test_top_k_limits_retrieved_files() {
    let docs = (0..4)
        .map(|i| RelatedDocument {
            key: format!("f{}.py", i),
            content: format!("content {}", i),
            distance: i as f32 / 10.0,
        })
        .collect();
    let h = Harness::with_nearest(docs).await;

    let answer = h
        .analyzer()
        .ask(REPO, "where?", Some(2), &no_cancel())
        .await
        .unwrap();
    assert_eq!(answer.sources, vec!["f0.py", "f1.py"]);
}

#[tokio::test]
async fn test_empty_corpus_still_completes() {
    let h = Harness::new(&[]).await;

    let answer = h
        .analyzer()
        .ask(REPO, "anything here?", None, &no_cancel())
        .await
        .unwrap();

    assert!(answer.sources.is_empty());
    assert_eq!(h.completer.calls(), 1);
    assert_eq!(
        h.completer.last_context(),
        "Here are the files from the Git repository that are relevant to the user's question:"
    );
}

#[tokio::test]
async fn test_query_embed_failure_is_fatal() {
    let h = Harness::new(&[]).await;

    let err = h
        .analyzer()
        .ask(REPO, "FLAKY question", None, &no_cancel())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        PipelineError::Stage {
            stage: Stage::EmbedQuery,
            ..
        }
    ));
    assert_eq!(err.class(), ErrorClass::TransientAdapter);
    assert_eq!(h.embedder.calls_for("FLAKY question"), 5);
    assert_eq!(h.completer.calls(), 0);
}
