/// Token usage audit trail
///
/// Append-only. Written per classification attempt, outside the batch
/// transaction, so failed attempts are still accounted for.
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

use crate::errors::StoreError;

/// One recorded call to the completion service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenUsageRecord {
    pub timestamp: DateTime<Utc>,
    pub operation: String,
    pub model: String,
    pub tokens_input: i64,
    pub tokens_output: i64,
    pub cost_estimate: f64,
}

/// Per-model usage breakdown
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelUsage {
    pub model: String,
    pub calls: i64,
    pub tokens_input: i64,
    pub tokens_output: i64,
    pub cost_estimate: f64,
}

/// Usage summary for operator reporting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageStats {
    pub days: i64,
    pub calls: i64,
    pub tokens_input: i64,
    pub tokens_output: i64,
    pub cost_estimate: f64,
    pub by_model: Vec<ModelUsage>,
}

/// Usage repository for database operations
pub struct UsageRepository {
    pool: SqlitePool,
}

impl UsageRepository {
    /// Create a new usage repository
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append one usage record.
    pub async fn record(&self, record: &TokenUsageRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO token_usage (timestamp, operation, model, tokens_input, tokens_output, cost_estimate) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(record.timestamp.to_rfc3339())
        .bind(&record.operation)
        .bind(&record.model)
        .bind(record.tokens_input)
        .bind(record.tokens_output)
        .bind(record.cost_estimate)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Usage summary over the trailing N days, with a per-model breakdown.
    pub async fn stats(&self, days: i64) -> Result<UsageStats, StoreError> {
        let cutoff = (Utc::now() - Duration::days(days)).to_rfc3339();

        let totals = sqlx::query(
            "SELECT COUNT(*) AS calls, \
             COALESCE(SUM(tokens_input), 0) AS tokens_input, \
             COALESCE(SUM(tokens_output), 0) AS tokens_output, \
             COALESCE(SUM(cost_estimate), 0.0) AS cost_estimate \
             FROM token_usage WHERE timestamp >= ?",
        )
        .bind(&cutoff)
        .fetch_one(&self.pool)
        .await?;

        let model_rows = sqlx::query(
            "SELECT model, COUNT(*) AS calls, \
             COALESCE(SUM(tokens_input), 0) AS tokens_input, \
             COALESCE(SUM(tokens_output), 0) AS tokens_output, \
             COALESCE(SUM(cost_estimate), 0.0) AS cost_estimate \
             FROM token_usage WHERE timestamp >= ? \
             GROUP BY model ORDER BY cost_estimate DESC",
        )
        .bind(&cutoff)
        .fetch_all(&self.pool)
        .await?;

        let by_model = model_rows
            .into_iter()
            .map(|r| ModelUsage {
                model: r.get("model"),
                calls: r.get("calls"),
                tokens_input: r.get("tokens_input"),
                tokens_output: r.get("tokens_output"),
                cost_estimate: r.get("cost_estimate"),
            })
            .collect();

        Ok(UsageStats {
            days,
            calls: totals.get("calls"),
            tokens_input: totals.get("tokens_input"),
            tokens_output: totals.get("tokens_output"),
            cost_estimate: totals.get("cost_estimate"),
            by_model,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Database;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_record_and_stats() {
        let temp = TempDir::new().unwrap();
        let db = Database::new(&temp.path().join("test.db")).await.unwrap();
        let usage = db.usage();

        usage
            .record(&TokenUsageRecord {
                timestamp: Utc::now(),
                operation: "classify".to_string(),
                model: "openai/gpt-4o-mini".to_string(),
                tokens_input: 1200,
                tokens_output: 300,
                cost_estimate: 0.00036,
            })
            .await
            .unwrap();

        usage
            .record(&TokenUsageRecord {
                timestamp: Utc::now(),
                operation: "reformat".to_string(),
                model: "openai/gpt-4o-mini".to_string(),
                tokens_input: 400,
                tokens_output: 100,
                cost_estimate: 0.00012,
            })
            .await
            .unwrap();

        let stats = usage.stats(7).await.unwrap();
        assert_eq!(stats.calls, 2);
        assert_eq!(stats.tokens_input, 1600);
        assert_eq!(stats.tokens_output, 400);
        assert_eq!(stats.by_model.len(), 1);
        assert_eq!(stats.by_model[0].calls, 2);
    }

    #[tokio::test]
    async fn test_stats_window_excludes_old_rows() {
        let temp = TempDir::new().unwrap();
        let db = Database::new(&temp.path().join("test.db")).await.unwrap();
        let usage = db.usage();

        usage
            .record(&TokenUsageRecord {
                timestamp: Utc::now() - Duration::days(30),
                operation: "classify".to_string(),
                model: "m".to_string(),
                tokens_input: 100,
                tokens_output: 10,
                cost_estimate: 0.0001,
            })
            .await
            .unwrap();

        let stats = usage.stats(7).await.unwrap();
        assert_eq!(stats.calls, 0);
    }
}
