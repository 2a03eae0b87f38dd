/// Processing batch state machine
///
/// A batch row is the mutual-exclusion gate for the whole pipeline: at
/// most one row may hold status `running`. Opening checks and inserts in
/// one transaction; committing applies every side effect of a run in one
/// transaction, so either all of a run's writes land or none do.
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

use super::activities::NewActivity;
use super::parse_timestamp;
use super::projects::{NewProject, ProposalTally};
use crate::errors::StoreError;

/// Batch status enum
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Running,
    Completed,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &str {
        match self {
            BatchStatus::Running => "running",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "running" => BatchStatus::Running,
            "completed" => BatchStatus::Completed,
            _ => BatchStatus::Failed,
        }
    }
}

/// Processing batch record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingBatch {
    pub id: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub total_events: i64,
    pub processed_count: i64,
    pub status: BatchStatus,
    pub error_message: Option<String>,
    pub model: String,
    pub tokens_used: i64,
    pub created_at: DateTime<Utc>,
}

/// Every side effect of one successful run, committed atomically.
#[derive(Debug, Default)]
pub struct BatchCommit {
    /// Raw event ids to flip to processed
    pub event_ids: Vec<i64>,
    /// Activities to insert
    pub activities: Vec<NewActivity>,
    /// Projects to create (insert-or-ignore; name is the merge key)
    pub project_creates: Vec<NewProject>,
    /// Replacement keyword sets for projects that absorbed a proposal
    pub keyword_merges: Vec<(String, Vec<String>)>,
    /// Proposal tallies to upsert (under-threshold proposals)
    pub tally_upserts: Vec<ProposalTally>,
    /// Proposal tallies to delete (promoted to projects)
    pub tally_deletes: Vec<String>,
    /// Total tokens consumed by the run
    pub tokens_used: i64,
}

/// Batch repository for database operations
pub struct BatchRepository {
    pool: SqlitePool,
}

impl BatchRepository {
    /// Create a new batch repository
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open a new batch with status running.
    ///
    /// Fails with `StoreError::BatchRunning` if another batch already
    /// holds the running status. The existence check and the insert
    /// happen inside one transaction.
    pub async fn open(&self, total_events: i64, model: &str) -> Result<i64, StoreError> {
        let now = Utc::now().to_rfc3339();

        let mut tx = self.pool.begin().await?;

        let running: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM processing_batches WHERE status = 'running'")
                .fetch_one(&mut *tx)
                .await?;

        if running > 0 {
            return Err(StoreError::BatchRunning);
        }

        let result = sqlx::query(
            "INSERT INTO processing_batches \
             (start_time, total_events, processed_count, status, model, tokens_used, created_at) \
             VALUES (?, ?, 0, 'running', ?, 0, ?)",
        )
        .bind(&now)
        .bind(total_events)
        .bind(model)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(result.last_insert_rowid())
    }

    /// Commit a finished run: insert activities (and any tweet drafts),
    /// apply project writes, update proposal tallies, mark the source
    /// events processed, and close the batch — all in one transaction.
    ///
    /// Refuses with `StoreError::BatchNotRunning` unless the batch row is
    /// still running; nothing partial is ever observable.
    pub async fn commit(&self, batch_id: i64, commit: &BatchCommit) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();

        let mut tx = self.pool.begin().await?;

        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM processing_batches WHERE id = ?")
                .bind(batch_id)
                .fetch_optional(&mut *tx)
                .await?;

        if status.as_deref() != Some("running") {
            return Err(StoreError::BatchNotRunning(batch_id));
        }

        for activity in &commit.activities {
            let tweet_draft_id = match &activity.tweet_draft {
                Some(draft) => {
                    let result = sqlx::query(
                        "INSERT INTO tweet_drafts (content, project_name, activity_ids, timestamp, generated_at) \
                         VALUES (?, ?, '[]', ?, ?)",
                    )
                    .bind(draft)
                    .bind(&activity.project_name)
                    .bind(activity.timestamp.to_rfc3339())
                    .bind(&now)
                    .execute(&mut *tx)
                    .await?;
                    Some(result.last_insert_rowid())
                }
                None => None,
            };

            sqlx::query(
                "INSERT INTO activities \
                 (timestamp, project_name, activity_type, description, source_refs, raw_event_ids, tweet_draft_id, created_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(activity.timestamp.to_rfc3339())
            .bind(&activity.project_name)
            .bind(&activity.activity_type)
            .bind(&activity.description)
            .bind(serde_json::to_string(&activity.source_refs).unwrap_or_else(|_| "[]".into()))
            .bind(serde_json::to_string(&activity.raw_event_ids).unwrap_or_else(|_| "[]".into()))
            .bind(tweet_draft_id)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }

        for project in &commit.project_creates {
            sqlx::query(
                "INSERT OR IGNORE INTO projects (name, description, keywords, active, created_at) \
                 VALUES (?, ?, ?, 1, ?)",
            )
            .bind(&project.name)
            .bind(&project.description)
            .bind(serde_json::to_string(&project.keywords).unwrap_or_else(|_| "[]".into()))
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }

        for (name, keywords) in &commit.keyword_merges {
            sqlx::query("UPDATE projects SET keywords = ? WHERE name = ?")
                .bind(serde_json::to_string(keywords).unwrap_or_else(|_| "[]".into()))
                .bind(name)
                .execute(&mut *tx)
                .await?;
        }

        for tally in &commit.tally_upserts {
            sqlx::query(
                "INSERT INTO project_proposals \
                 (normalized_name, display_name, keywords, activity_count, activity_days, first_seen, last_seen) \
                 VALUES (?, ?, ?, ?, ?, ?, ?) \
                 ON CONFLICT(normalized_name) DO UPDATE SET \
                 display_name = excluded.display_name, \
                 keywords = excluded.keywords, \
                 activity_count = excluded.activity_count, \
                 activity_days = excluded.activity_days, \
                 last_seen = excluded.last_seen",
            )
            .bind(&tally.normalized_name)
            .bind(&tally.display_name)
            .bind(serde_json::to_string(&tally.keywords).unwrap_or_else(|_| "[]".into()))
            .bind(tally.activity_count)
            .bind(serde_json::to_string(&tally.activity_days).unwrap_or_else(|_| "[]".into()))
            .bind(tally.first_seen.to_rfc3339())
            .bind(tally.last_seen.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }

        for normalized_name in &commit.tally_deletes {
            sqlx::query("DELETE FROM project_proposals WHERE normalized_name = ?")
                .bind(normalized_name)
                .execute(&mut *tx)
                .await?;
        }

        for event_id in &commit.event_ids {
            sqlx::query("UPDATE raw_events SET processed = 1 WHERE id = ?")
                .bind(event_id)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query(
            "UPDATE processing_batches \
             SET status = 'completed', end_time = ?, processed_count = ?, tokens_used = ? \
             WHERE id = ?",
        )
        .bind(&now)
        .bind(commit.event_ids.len() as i64)
        .bind(commit.tokens_used)
        .bind(batch_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(())
    }

    /// Mark a batch as failed. Its events stay unprocessed and remain
    /// eligible for a future run.
    pub async fn fail(&self, batch_id: i64, error: &str) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();

        let result = sqlx::query(
            "UPDATE processing_batches \
             SET status = 'failed', end_time = ?, error_message = ? \
             WHERE id = ? AND status = 'running'",
        )
        .bind(&now)
        .bind(error)
        .bind(batch_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::BatchNotRunning(batch_id));
        }

        Ok(())
    }

    /// Fail any running batch older than `max_age`, releasing the
    /// mutual-exclusion gate. Called with a zero age at startup (any
    /// running batch then belongs to a dead process) and with the
    /// configured staleness timeout on each tick.
    pub async fn reconcile_stale(&self, max_age: Duration) -> Result<u64, StoreError> {
        let now = Utc::now();
        let cutoff = (now - max_age).to_rfc3339();

        let result = sqlx::query(
            "UPDATE processing_batches \
             SET status = 'failed', end_time = ?, error_message = 'stale batch abandoned by a previous run' \
             WHERE status = 'running' AND start_time <= ?",
        )
        .bind(now.to_rfc3339())
        .bind(&cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// The currently running batch, if any.
    pub async fn running(&self) -> Result<Option<ProcessingBatch>, StoreError> {
        let row = sqlx::query(
            "SELECT id, start_time, end_time, total_events, processed_count, status, \
             error_message, model, tokens_used, created_at \
             FROM processing_batches WHERE status = 'running' LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_batch).transpose()
    }

    /// Most recently finished batch (completed or failed), by end time.
    pub async fn last_finished(&self) -> Result<Option<ProcessingBatch>, StoreError> {
        let row = sqlx::query(
            "SELECT id, start_time, end_time, total_events, processed_count, status, \
             error_message, model, tokens_used, created_at \
             FROM processing_batches WHERE status IN ('completed', 'failed') \
             ORDER BY end_time DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_batch).transpose()
    }

    /// The last N batches, newest first. Used for cooldown tracking.
    pub async fn recent(&self, limit: i64) -> Result<Vec<ProcessingBatch>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, start_time, end_time, total_events, processed_count, status, \
             error_message, model, tokens_used, created_at \
             FROM processing_batches ORDER BY created_at DESC, id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_batch).collect()
    }

    /// Get a batch by id.
    pub async fn get(&self, batch_id: i64) -> Result<Option<ProcessingBatch>, StoreError> {
        let row = sqlx::query(
            "SELECT id, start_time, end_time, total_events, processed_count, status, \
             error_message, model, tokens_used, created_at \
             FROM processing_batches WHERE id = ?",
        )
        .bind(batch_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_batch).transpose()
    }
}

fn row_to_batch(r: sqlx::sqlite::SqliteRow) -> Result<ProcessingBatch, StoreError> {
    let end_time = r
        .get::<Option<String>, _>("end_time")
        .map(|s| parse_timestamp(&s))
        .transpose()?;

    Ok(ProcessingBatch {
        id: r.get("id"),
        start_time: parse_timestamp(&r.get::<String, _>("start_time"))?,
        end_time,
        total_events: r.get("total_events"),
        processed_count: r.get("processed_count"),
        status: BatchStatus::from_str(&r.get::<String, _>("status")),
        error_message: r.get("error_message"),
        model: r.get("model"),
        tokens_used: r.get("tokens_used"),
        created_at: parse_timestamp(&r.get::<String, _>("created_at"))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Database;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_open_and_fail_releases_gate() {
        let temp = TempDir::new().unwrap();
        let db = Database::new(&temp.path().join("test.db")).await.unwrap();
        let batches = db.batches();

        let id = batches.open(5, "openai/gpt-4o-mini").await.unwrap();
        assert!(matches!(
            batches.open(3, "openai/gpt-4o-mini").await,
            Err(StoreError::BatchRunning)
        ));

        batches.fail(id, "boom").await.unwrap();

        let failed = batches.get(id).await.unwrap().unwrap();
        assert_eq!(failed.status, BatchStatus::Failed);
        assert_eq!(failed.error_message.as_deref(), Some("boom"));
        assert!(failed.end_time.is_some());

        // Gate released
        batches.open(3, "openai/gpt-4o-mini").await.unwrap();
    }

    #[tokio::test]
    async fn test_fail_requires_running() {
        let temp = TempDir::new().unwrap();
        let db = Database::new(&temp.path().join("test.db")).await.unwrap();
        let batches = db.batches();

        let id = batches.open(1, "m").await.unwrap();
        batches.fail(id, "first").await.unwrap();
        assert!(matches!(
            batches.fail(id, "second").await,
            Err(StoreError::BatchNotRunning(_))
        ));
    }

    #[tokio::test]
    async fn test_reconcile_stale_fails_running_batch() {
        let temp = TempDir::new().unwrap();
        let db = Database::new(&temp.path().join("test.db")).await.unwrap();
        let batches = db.batches();

        let id = batches.open(1, "m").await.unwrap();

        let reconciled = batches.reconcile_stale(Duration::zero()).await.unwrap();
        assert_eq!(reconciled, 1);

        let batch = batches.get(id).await.unwrap().unwrap();
        assert_eq!(batch.status, BatchStatus::Failed);
        assert!(batches.running().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reconcile_respects_age() {
        let temp = TempDir::new().unwrap();
        let db = Database::new(&temp.path().join("test.db")).await.unwrap();
        let batches = db.batches();

        batches.open(1, "m").await.unwrap();

        // A two hour staleness window leaves a fresh batch alone
        let reconciled = batches.reconcile_stale(Duration::hours(2)).await.unwrap();
        assert_eq!(reconciled, 0);
        assert!(batches.running().await.unwrap().is_some());
    }
}
