//! Event collectors
//!
//! A collector gathers raw activity events from some outside source and
//! appends them to the event store. The trait keeps the store agnostic of
//! where events come from; the engine ships a JSONL file collector for
//! hook scripts and manual ingest, and new sources implement the same
//! trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::path::PathBuf;
use tracing::{debug, warn};

use crate::errors::PipelineError;
use crate::store::EventRepository;

#[async_trait]
pub trait Collector: Send + Sync {
    /// Collector name, also the default `source` attributed to its events
    fn name(&self) -> &str;

    /// Gather events and append them to the store. Returns the number of
    /// events inserted.
    async fn collect(&self, events: &EventRepository) -> Result<u64, PipelineError>;
}

/// One line of a JSONL ingest file.
#[derive(Debug, Deserialize)]
struct IngestRecord {
    #[serde(default)]
    source: Option<String>,

    event_type: String,

    payload: serde_json::Value,

    timestamp: DateTime<Utc>,
}

/// Reads newline-delimited JSON events from a file.
///
/// Malformed lines are logged and skipped rather than failing the whole
/// file; collectors append whatever they saw, duplicates included.
pub struct JsonlCollector {
    path: PathBuf,
    default_source: String,
}

impl JsonlCollector {
    pub fn new(path: PathBuf, default_source: impl Into<String>) -> Self {
        Self {
            path,
            default_source: default_source.into(),
        }
    }
}

#[async_trait]
impl Collector for JsonlCollector {
    fn name(&self) -> &str {
        &self.default_source
    }

    async fn collect(&self, events: &EventRepository) -> Result<u64, PipelineError> {
        let contents = tokio::fs::read_to_string(&self.path).await?;

        let mut inserted = 0u64;

        for (line_number, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let record: IngestRecord = match serde_json::from_str(line) {
                Ok(record) => record,
                Err(e) => {
                    warn!(
                        file = %self.path.display(),
                        line = line_number + 1,
                        error = %e,
                        "skipping malformed ingest line"
                    );
                    continue;
                }
            };

            let source = record.source.as_deref().unwrap_or(&self.default_source);
            events
                .insert(
                    source,
                    &record.event_type,
                    &record.payload.to_string(),
                    record.timestamp,
                )
                .await?;
            inserted += 1;
        }

        debug!(
            file = %self.path.display(),
            inserted,
            "ingest file collected"
        );

        Ok(inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Database;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_jsonl_collector_inserts_events() {
        let temp = TempDir::new().unwrap();
        let db = Database::new(&temp.path().join("test.db")).await.unwrap();

        let file = temp.path().join("events.jsonl");
        std::fs::write(
            &file,
            concat!(
                "{\"event_type\": \"commit\", \"payload\": {\"msg\": \"fix\"}, \"timestamp\": \"2026-03-01T09:00:00Z\"}\n",
                "\n",
                "{\"source\": \"browser\", \"event_type\": \"visit\", \"payload\": {}, \"timestamp\": \"2026-03-01T09:05:00Z\"}\n",
            ),
        )
        .unwrap();

        let collector = JsonlCollector::new(file, "git");
        let inserted = collector.collect(&db.events()).await.unwrap();
        assert_eq!(inserted, 2);

        let events = db.events().unprocessed(10).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].source, "git");
        assert_eq!(events[1].source, "browser");
    }

    #[tokio::test]
    async fn test_jsonl_collector_skips_malformed_lines() {
        let temp = TempDir::new().unwrap();
        let db = Database::new(&temp.path().join("test.db")).await.unwrap();

        let file = temp.path().join("events.jsonl");
        std::fs::write(
            &file,
            concat!(
                "not json at all\n",
                "{\"event_type\": \"commit\", \"payload\": {}, \"timestamp\": \"2026-03-01T09:00:00Z\"}\n",
            ),
        )
        .unwrap();

        let collector = JsonlCollector::new(file, "git");
        let inserted = collector.collect(&db.events()).await.unwrap();
        assert_eq!(inserted, 1);
    }

    #[tokio::test]
    async fn test_jsonl_collector_missing_file_errors() {
        let temp = TempDir::new().unwrap();
        let db = Database::new(&temp.path().join("test.db")).await.unwrap();

        let collector = JsonlCollector::new(temp.path().join("absent.jsonl"), "git");
        assert!(collector.collect(&db.events()).await.is_err());
    }
}
