/// Activity persistence
///
/// Activities are only ever inserted as part of a committed batch (see
/// `BatchRepository::commit`) and are immutable thereafter. This
/// repository covers the read side, which the notes writer consumes.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

use super::parse_timestamp;
use crate::errors::StoreError;

/// A classified, project-attributed unit of work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Activity {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub project_name: String,
    pub activity_type: String,
    pub description: String,
    pub source_refs: Vec<String>,
    pub raw_event_ids: Vec<i64>,
    pub tweet_draft_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// An activity awaiting insertion inside a batch commit
#[derive(Debug, Clone)]
pub struct NewActivity {
    pub timestamp: DateTime<Utc>,
    pub project_name: String,
    pub activity_type: String,
    pub description: String,
    pub source_refs: Vec<String>,
    pub raw_event_ids: Vec<i64>,
    pub tweet_draft: Option<String>,
}

/// Activity repository for database operations
pub struct ActivityRepository {
    pool: SqlitePool,
}

impl ActivityRepository {
    /// Create a new activity repository
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Activities in a time window, newest first, optionally restricted
    /// to one project.
    pub async fn for_period(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        project: Option<&str>,
    ) -> Result<Vec<Activity>, StoreError> {
        let rows = match project {
            Some(name) => {
                sqlx::query(
                    "SELECT id, timestamp, project_name, activity_type, description, \
                     source_refs, raw_event_ids, tweet_draft_id, created_at \
                     FROM activities \
                     WHERE timestamp >= ? AND timestamp < ? AND project_name = ? \
                     ORDER BY timestamp DESC",
                )
                .bind(start.to_rfc3339())
                .bind(end.to_rfc3339())
                .bind(name)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT id, timestamp, project_name, activity_type, description, \
                     source_refs, raw_event_ids, tweet_draft_id, created_at \
                     FROM activities \
                     WHERE timestamp >= ? AND timestamp < ? \
                     ORDER BY timestamp DESC",
                )
                .bind(start.to_rfc3339())
                .bind(end.to_rfc3339())
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter().map(row_to_activity).collect()
    }

    /// Total activity count (status reporting).
    pub async fn count(&self) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM activities")
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }
}

fn row_to_activity(r: sqlx::sqlite::SqliteRow) -> Result<Activity, StoreError> {
    let source_refs: Vec<String> =
        serde_json::from_str(&r.get::<String, _>("source_refs")).unwrap_or_default();
    let raw_event_ids: Vec<i64> =
        serde_json::from_str(&r.get::<String, _>("raw_event_ids")).unwrap_or_default();

    Ok(Activity {
        id: r.get("id"),
        timestamp: parse_timestamp(&r.get::<String, _>("timestamp"))?,
        project_name: r.get("project_name"),
        activity_type: r.get("activity_type"),
        description: r.get("description"),
        source_refs,
        raw_event_ids,
        tweet_draft_id: r.get("tweet_draft_id"),
        created_at: parse_timestamp(&r.get::<String, _>("created_at"))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{BatchCommit, Database};
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn activity_at(ts: DateTime<Utc>, project: &str) -> NewActivity {
        NewActivity {
            timestamp: ts,
            project_name: project.to_string(),
            activity_type: "work".to_string(),
            description: "did a thing".to_string(),
            source_refs: vec!["github".to_string()],
            raw_event_ids: vec![1],
            tweet_draft: None,
        }
    }

    #[tokio::test]
    async fn test_for_period_filters_by_window_and_project() {
        let temp = TempDir::new().unwrap();
        let db = Database::new(&temp.path().join("test.db")).await.unwrap();

        let day1 = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let day2 = Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap();
        let day5 = Utc.with_ymd_and_hms(2026, 3, 5, 12, 0, 0).unwrap();

        let batch_id = db.batches().open(0, "m").await.unwrap();
        let commit = BatchCommit {
            activities: vec![
                activity_at(day1, "pulse"),
                activity_at(day2, "misc"),
                activity_at(day5, "pulse"),
            ],
            ..Default::default()
        };
        db.batches().commit(batch_id, &commit).await.unwrap();

        let window_start = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        let window_end = Utc.with_ymd_and_hms(2026, 3, 3, 0, 0, 0).unwrap();

        let all = db
            .activities()
            .for_period(window_start, window_end, None)
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
        // Newest first
        assert_eq!(all[0].timestamp, day2);

        let pulse_only = db
            .activities()
            .for_period(window_start, window_end, Some("pulse"))
            .await
            .unwrap();
        assert_eq!(pulse_only.len(), 1);
        assert_eq!(pulse_only[0].project_name, "pulse");
    }

    #[tokio::test]
    async fn test_tweet_draft_linked() {
        let temp = TempDir::new().unwrap();
        let db = Database::new(&temp.path().join("test.db")).await.unwrap();

        let ts = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let mut activity = activity_at(ts, "pulse");
        activity.tweet_draft = Some("shipped the batch scheduler".to_string());

        let batch_id = db.batches().open(0, "m").await.unwrap();
        let commit = BatchCommit {
            activities: vec![activity],
            ..Default::default()
        };
        db.batches().commit(batch_id, &commit).await.unwrap();

        let start = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap();
        let found = db.activities().for_period(start, end, None).await.unwrap();
        assert_eq!(found.len(), 1);
        assert!(found[0].tweet_draft_id.is_some());
    }
}
