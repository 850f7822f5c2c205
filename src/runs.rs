//! Durable run ledger.
//!
//! Every Analyze or Ingest invocation is recorded as a row in the
//! `pipeline_runs` table. The orchestrator persists each stage transition
//! before dispatching the next stage, so a restarted process can tell which
//! stages already committed their side effects and skip them.
//!
//! Rows carry an `owner` token. Every write is a compare-and-set on that
//! token: a process that lost ownership of a run (because another process
//! resumed it) gets [`PipelineError::OwnershipLost`] instead of silently
//! overwriting the newer owner's progress.
//!
//! ```text
//! Started ─▶ CollectionCreated ─▶ Snapshotted ─▶ Embedded ─▶ Persisted
//!    │                                                          │
//!    │ (already ingested)                                       ▼
//!    └──────────────────────────▶ Ingested ◀──────── CollectionTorndown
//!                                    │
//!                                    ▼
//!                                 Answered          Failed (from anywhere)
//! ```

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use code_analyzer_core::models::{CollectionName, RepositoryId};

use crate::error::PipelineError;

/// Last committed stage of a run. Ordered by pipeline position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    Started,
    CollectionCreated,
    Snapshotted,
    Embedded,
    Persisted,
    CollectionTorndown,
    Ingested,
    Answered,
    Failed,
}

impl RunStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStage::Started => "started",
            RunStage::CollectionCreated => "collection_created",
            RunStage::Snapshotted => "snapshotted",
            RunStage::Embedded => "embedded",
            RunStage::Persisted => "persisted",
            RunStage::CollectionTorndown => "collection_torndown",
            RunStage::Ingested => "ingested",
            RunStage::Answered => "answered",
            RunStage::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "started" => RunStage::Started,
            "collection_created" => RunStage::CollectionCreated,
            "snapshotted" => RunStage::Snapshotted,
            "embedded" => RunStage::Embedded,
            "persisted" => RunStage::Persisted,
            "collection_torndown" => RunStage::CollectionTorndown,
            "ingested" => RunStage::Ingested,
            "answered" => RunStage::Answered,
            "failed" => RunStage::Failed,
            _ => return None,
        })
    }
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the ledger.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineRun {
    pub run_id: String,
    #[serde(skip)]
    pub owner: String,
    pub repository: RepositoryId,
    pub collection: CollectionName,
    pub query: Option<String>,
    pub stage: RunStage,
    /// Last committed stage before the run failed.
    pub failed_stage: Option<RunStage>,
    pub snapshot_keys: Vec<String>,
    pub embedded: u64,
    pub skipped: u64,
    pub inserted: u64,
    pub error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl PipelineRun {
    /// Answered, failed, or ingested with no question pending.
    pub fn is_finished(&self) -> bool {
        match self.stage {
            RunStage::Answered | RunStage::Failed => true,
            RunStage::Ingested => self.query.is_none(),
            _ => false,
        }
    }

    /// True if the run stopped (or is still running) before its inserts
    /// were committed, so rows it wrote may be an incomplete corpus.
    pub fn left_partial_corpus(&self) -> bool {
        let reached = match self.stage {
            RunStage::Failed => self.failed_stage.unwrap_or(RunStage::Started),
            stage => stage,
        };
        reached > RunStage::Started && reached < RunStage::Persisted
    }
}

const RUN_COLUMNS: &str = "run_id, owner, repository, collection, query, stage, failed_stage, \
     snapshot_keys, embedded, skipped, inserted, error, created_at, updated_at";

const UNFINISHED: &str =
    "stage NOT IN ('answered', 'failed') AND NOT (stage = 'ingested' AND query IS NULL)";

fn ledger_decode(column: &str, err: impl std::error::Error + Send + Sync + 'static) -> sqlx::Error {
    sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: Box::new(err),
    }
}

#[derive(Debug)]
struct InvalidValue(String);

impl fmt::Display for InvalidValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid value '{}'", self.0)
    }
}

impl std::error::Error for InvalidValue {}

fn parse_stage(column: &str, raw: &str) -> Result<RunStage, sqlx::Error> {
    RunStage::parse(raw).ok_or_else(|| ledger_decode(column, InvalidValue(raw.to_string())))
}

fn row_to_run(row: &SqliteRow) -> Result<PipelineRun, sqlx::Error> {
    let repository: String = row.try_get("repository")?;
    let stage: String = row.try_get("stage")?;
    let failed_stage: Option<String> = row.try_get("failed_stage")?;
    let keys_json: String = row.try_get("snapshot_keys")?;
    let snapshot_keys: Vec<String> =
        serde_json::from_str(&keys_json).map_err(|e| ledger_decode("snapshot_keys", e))?;

    Ok(PipelineRun {
        run_id: row.try_get("run_id")?,
        owner: row.try_get("owner")?,
        repository: RepositoryId::parse(&repository)
            .ok_or_else(|| ledger_decode("repository", InvalidValue(repository.clone())))?,
        collection: CollectionName::from_stored(row.try_get::<String, _>("collection")?),
        query: row.try_get("query")?,
        stage: parse_stage("stage", &stage)?,
        failed_stage: failed_stage
            .as_deref()
            .map(|s| parse_stage("failed_stage", s))
            .transpose()?,
        snapshot_keys,
        embedded: row.try_get::<i64, _>("embedded")?.max(0) as u64,
        skipped: row.try_get::<i64, _>("skipped")?.max(0) as u64,
        inserted: row.try_get::<i64, _>("inserted")?.max(0) as u64,
        error: row.try_get("error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Handle on the `pipeline_runs` table for one process.
#[derive(Clone)]
pub struct RunLedger {
    pool: SqlitePool,
    owner: String,
}

impl RunLedger {
    /// A ledger writing under a fresh owner token.
    pub fn new(pool: SqlitePool) -> Self {
        Self::with_owner(pool, uuid::Uuid::new_v4().to_string())
    }

    pub fn with_owner(pool: SqlitePool, owner: impl Into<String>) -> Self {
        Self {
            pool,
            owner: owner.into(),
        }
    }

    /// Record a new run in [`RunStage::Started`] with its own collection.
    pub async fn start(
        &self,
        repository: &RepositoryId,
        query: Option<&str>,
    ) -> Result<PipelineRun, PipelineError> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let now = chrono::Utc::now().timestamp();
        let run = PipelineRun {
            collection: CollectionName::for_run(repository, &run_id),
            run_id,
            owner: self.owner.clone(),
            repository: repository.clone(),
            query: query.map(str::to_string),
            stage: RunStage::Started,
            failed_stage: None,
            snapshot_keys: Vec::new(),
            embedded: 0,
            skipped: 0,
            inserted: 0,
            error: None,
            created_at: now,
            updated_at: now,
        };

        sqlx::query(
            r#"
            INSERT INTO pipeline_runs (run_id, owner, repository, collection, query, stage,
                                       snapshot_keys, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, '[]', ?, ?)
            "#,
        )
        .bind(&run.run_id)
        .bind(&run.owner)
        .bind(run.repository.as_str())
        .bind(run.collection.as_str())
        .bind(&run.query)
        .bind(run.stage.as_str())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(run)
    }

    pub async fn get(&self, run_id: &str) -> Result<Option<PipelineRun>, PipelineError> {
        let sql = format!("SELECT {} FROM pipeline_runs WHERE run_id = ?", RUN_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_run).transpose()?)
    }

    /// Take over the newest unfinished run of `repository` that has been
    /// idle for at least `grace`. `query` replaces the run's query.
    ///
    /// Returns `None` if there is no such run or another process won the
    /// claim first.
    pub async fn claim_resumable(
        &self,
        repository: &RepositoryId,
        query: Option<&str>,
        grace: Duration,
    ) -> Result<Option<PipelineRun>, PipelineError> {
        let cutoff = chrono::Utc::now().timestamp() - grace.as_secs() as i64;
        let sql = format!(
            "SELECT {} FROM pipeline_runs WHERE repository = ? AND updated_at <= ? AND {} \
             ORDER BY created_at DESC, rowid DESC LIMIT 1",
            RUN_COLUMNS, UNFINISHED
        );
        let row = sqlx::query(&sql)
            .bind(repository.as_str())
            .bind(cutoff)
            .fetch_optional(&self.pool)
            .await?;
        let candidate = match row.as_ref().map(row_to_run).transpose()? {
            Some(run) => run,
            None => return Ok(None),
        };

        self.take_over(candidate, query).await
    }

    /// Take over a specific unfinished run regardless of how recently it
    /// was updated.
    pub async fn claim(
        &self,
        run_id: &str,
        query: Option<&str>,
    ) -> Result<PipelineRun, PipelineError> {
        let candidate = self
            .get(run_id)
            .await?
            .ok_or_else(|| PipelineError::NotResumable {
                run_id: run_id.to_string(),
                reason: "no such run".to_string(),
            })?;
        if candidate.stage == RunStage::Failed || candidate.stage == RunStage::Answered {
            return Err(PipelineError::NotResumable {
                run_id: run_id.to_string(),
                reason: format!("run already {}", candidate.stage),
            });
        }

        self.take_over(candidate, query)
            .await?
            .ok_or_else(|| PipelineError::OwnershipLost {
                run_id: run_id.to_string(),
            })
    }

    async fn take_over(
        &self,
        mut run: PipelineRun,
        query: Option<&str>,
    ) -> Result<Option<PipelineRun>, PipelineError> {
        let now = chrono::Utc::now().timestamp();
        let query = query.map(str::to_string);
        let claimed = sqlx::query(
            "UPDATE pipeline_runs SET owner = ?, query = ?, updated_at = ? \
             WHERE run_id = ? AND owner = ? AND updated_at = ?",
        )
        .bind(&self.owner)
        .bind(&query)
        .bind(now)
        .bind(&run.run_id)
        .bind(&run.owner)
        .bind(run.updated_at)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if claimed != 1 {
            tracing::debug!(run_id = %run.run_id, "lost claim race");
            return Ok(None);
        }

        tracing::info!(
            run_id = %run.run_id,
            repository = %run.repository,
            stage = %run.stage,
            previous_owner = %run.owner,
            "claimed run"
        );
        run.owner = self.owner.clone();
        run.query = query;
        run.updated_at = now;
        Ok(Some(run))
    }

    /// Commit `stage` together with the run's keys and counters.
    pub async fn advance(
        &self,
        run: &mut PipelineRun,
        stage: RunStage,
    ) -> Result<(), PipelineError> {
        run.stage = stage;
        self.write(run).await?;
        tracing::debug!(run_id = %run.run_id, stage = %stage, "run advanced");
        Ok(())
    }

    /// Mark the run failed, keeping its last committed stage.
    pub async fn fail(
        &self,
        run: &mut PipelineRun,
        error: &PipelineError,
    ) -> Result<(), PipelineError> {
        if run.stage != RunStage::Failed {
            run.failed_stage = Some(run.stage);
        }
        run.stage = RunStage::Failed;
        run.error = Some(error.to_string());
        self.write(run).await
    }

    async fn write(&self, run: &mut PipelineRun) -> Result<(), PipelineError> {
        let now = chrono::Utc::now().timestamp();
        let keys = serde_json::to_string(&run.snapshot_keys)
            .map_err(|e| PipelineError::Ledger(ledger_decode("snapshot_keys", e)))?;
        let written = sqlx::query(
            r#"
            UPDATE pipeline_runs SET
                stage = ?, failed_stage = ?, snapshot_keys = ?,
                embedded = ?, skipped = ?, inserted = ?, error = ?, updated_at = ?
            WHERE run_id = ? AND owner = ?
            "#,
        )
        .bind(run.stage.as_str())
        .bind(run.failed_stage.map(|s| s.as_str()))
        .bind(keys)
        .bind(run.embedded as i64)
        .bind(run.skipped as i64)
        .bind(run.inserted as i64)
        .bind(&run.error)
        .bind(now)
        .bind(&run.run_id)
        .bind(&run.owner)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if written != 1 {
            return Err(PipelineError::OwnershipLost {
                run_id: run.run_id.clone(),
            });
        }
        run.updated_at = now;
        Ok(())
    }

    /// The newest run of `repository` other than `run_id` that got past
    /// [`RunStage::Started`]. Runs that never created a collection wrote no
    /// rows and must not hide an older run that did.
    pub async fn previous_attempt(
        &self,
        repository: &RepositoryId,
        run_id: &str,
    ) -> Result<Option<PipelineRun>, PipelineError> {
        let sql = format!(
            "SELECT {} FROM pipeline_runs WHERE repository = ? AND run_id != ? \
             AND COALESCE(failed_stage, stage) NOT IN ('started', 'failed') \
             ORDER BY created_at DESC, rowid DESC LIMIT 1",
            RUN_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(repository.as_str())
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_run).transpose()?)
    }

    /// Newest runs first, optionally for one repository.
    pub async fn list(
        &self,
        repository: Option<&RepositoryId>,
        limit: i64,
    ) -> Result<Vec<PipelineRun>, PipelineError> {
        let rows = match repository {
            Some(repository) => {
                let sql = format!(
                    "SELECT {} FROM pipeline_runs WHERE repository = ? \
                     ORDER BY created_at DESC, rowid DESC LIMIT ?",
                    RUN_COLUMNS
                );
                sqlx::query(&sql)
                    .bind(repository.as_str())
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let sql = format!(
                    "SELECT {} FROM pipeline_runs ORDER BY created_at DESC, rowid DESC LIMIT ?",
                    RUN_COLUMNS
                );
                sqlx::query(&sql).bind(limit).fetch_all(&self.pool).await?
            }
        };
        Ok(rows.iter().map(row_to_run).collect::<Result<_, _>>()?)
    }
}
