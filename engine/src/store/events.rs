/// Raw event persistence
///
/// Raw events are the append-only staging area the collectors write into.
/// A row is immutable once written except for the processed flag, which
/// flips false -> true exactly once, inside a committed batch.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

use super::parse_timestamp;
use crate::errors::StoreError;

/// One collected activity event awaiting classification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEvent {
    pub id: i64,
    pub source: String,
    pub event_type: String,
    /// Source-specific payload, stored as its JSON text
    pub payload: String,
    pub event_time: DateTime<Utc>,
    pub processed: bool,
    pub created_at: DateTime<Utc>,
}

impl RawEvent {
    /// Character size of this event as seen by the context budget and the
    /// token estimator. Adding fields or events never shrinks this total.
    pub fn estimated_chars(&self) -> usize {
        self.payload.len()
            + self.source.len()
            + self.event_type.len()
            + self.event_time.to_rfc3339().len()
    }
}

/// Event repository for database operations
pub struct EventRepository {
    pool: SqlitePool,
}

impl EventRepository {
    /// Create a new event repository
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append one raw event. Never fails on duplicate content; dedup is a
    /// collector concern, not a store concern.
    pub async fn insert(
        &self,
        source: &str,
        event_type: &str,
        payload: &str,
        event_time: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let now = Utc::now();

        let result = sqlx::query(
            "INSERT INTO raw_events (source, event_type, payload, event_time, processed, created_at) \
             VALUES (?, ?, ?, ?, 0, ?)",
        )
        .bind(source)
        .bind(event_type)
        .bind(payload)
        .bind(event_time.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Unprocessed events, oldest first, ties broken by id so the order
    /// is deterministic.
    pub async fn unprocessed(&self, limit: i64) -> Result<Vec<RawEvent>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, source, event_type, payload, event_time, processed, created_at \
             FROM raw_events WHERE processed = 0 \
             ORDER BY event_time ASC, id ASC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_event).collect()
    }

    /// Number of events still awaiting processing.
    pub async fn pending_count(&self) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM raw_events WHERE processed = 0")
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }

    /// Fetch specific events by id (test and inspection helper).
    pub async fn get(&self, id: i64) -> Result<Option<RawEvent>, StoreError> {
        let row = sqlx::query(
            "SELECT id, source, event_type, payload, event_time, processed, created_at \
             FROM raw_events WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_event).transpose()
    }
}

fn row_to_event(r: sqlx::sqlite::SqliteRow) -> Result<RawEvent, StoreError> {
    Ok(RawEvent {
        id: r.get("id"),
        source: r.get("source"),
        event_type: r.get("event_type"),
        payload: r.get("payload"),
        event_time: parse_timestamp(&r.get::<String, _>("event_time"))?,
        processed: r.get::<i64, _>("processed") != 0,
        created_at: parse_timestamp(&r.get::<String, _>("created_at"))?,
    })
}
