/// Project and proposal-tally persistence
///
/// Projects are created only inside a batch commit, and only after the
/// registry's conservative-creation rule approves them. Proposal tallies
/// accumulate evidence for names that have not yet met the bar; they are
/// keyed by normalized name and deleted on promotion.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

use super::parse_timestamp;
use crate::errors::StoreError;

/// A named grouping of related activities
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub keywords: Vec<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// A project awaiting creation inside a batch commit
#[derive(Debug, Clone)]
pub struct NewProject {
    pub name: String,
    pub description: String,
    pub keywords: Vec<String>,
}

/// Accumulated evidence for a proposed project that has not yet met the
/// conservative-creation bar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposalTally {
    pub normalized_name: String,
    pub display_name: String,
    pub keywords: Vec<String>,
    pub activity_count: i64,
    /// Distinct calendar days (YYYY-MM-DD) with attributed activities
    pub activity_days: Vec<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Project repository for database operations
pub struct ProjectRepository {
    pool: SqlitePool,
}

impl ProjectRepository {
    /// Create a new project repository
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// All active projects, oldest first so pre-existing projects win
    /// similarity ties deterministically.
    pub async fn active(&self) -> Result<Vec<Project>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, name, description, keywords, active, created_at \
             FROM projects WHERE active = 1 ORDER BY created_at ASC, id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_project).collect()
    }

    /// Look up a project by its unique name.
    pub async fn get_by_name(&self, name: &str) -> Result<Option<Project>, StoreError> {
        let row = sqlx::query(
            "SELECT id, name, description, keywords, active, created_at \
             FROM projects WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_project).transpose()
    }

    /// All pending proposal tallies.
    pub async fn pending_proposals(&self) -> Result<Vec<ProposalTally>, StoreError> {
        let rows = sqlx::query(
            "SELECT normalized_name, display_name, keywords, activity_count, activity_days, \
             first_seen, last_seen \
             FROM project_proposals ORDER BY normalized_name ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_tally).collect()
    }
}

fn row_to_project(r: sqlx::sqlite::SqliteRow) -> Result<Project, StoreError> {
    let keywords: Vec<String> =
        serde_json::from_str(&r.get::<String, _>("keywords")).unwrap_or_default();

    Ok(Project {
        id: r.get("id"),
        name: r.get("name"),
        description: r.get("description"),
        keywords,
        active: r.get::<i64, _>("active") != 0,
        created_at: parse_timestamp(&r.get::<String, _>("created_at"))?,
    })
}

fn row_to_tally(r: sqlx::sqlite::SqliteRow) -> Result<ProposalTally, StoreError> {
    let keywords: Vec<String> =
        serde_json::from_str(&r.get::<String, _>("keywords")).unwrap_or_default();
    let activity_days: Vec<String> =
        serde_json::from_str(&r.get::<String, _>("activity_days")).unwrap_or_default();

    Ok(ProposalTally {
        normalized_name: r.get("normalized_name"),
        display_name: r.get("display_name"),
        keywords,
        activity_count: r.get("activity_count"),
        activity_days,
        first_seen: parse_timestamp(&r.get::<String, _>("first_seen"))?,
        last_seen: parse_timestamp(&r.get::<String, _>("last_seen"))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{BatchCommit, Database};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_project_create_and_keyword_merge_via_commit() {
        let temp = TempDir::new().unwrap();
        let db = Database::new(&temp.path().join("test.db")).await.unwrap();

        let batch_id = db.batches().open(0, "m").await.unwrap();
        let commit = BatchCommit {
            project_creates: vec![NewProject {
                name: "data pipeline".to_string(),
                description: "etl work".to_string(),
                keywords: vec!["etl".to_string(), "sqlite".to_string()],
            }],
            ..Default::default()
        };
        db.batches().commit(batch_id, &commit).await.unwrap();

        let project = db
            .projects()
            .get_by_name("data pipeline")
            .await
            .unwrap()
            .unwrap();
        assert!(project.active);
        assert_eq!(project.keywords, vec!["etl", "sqlite"]);

        // Keyword union applied on a later merge
        let batch_id = db.batches().open(0, "m").await.unwrap();
        let commit = BatchCommit {
            keyword_merges: vec![(
                "data pipeline".to_string(),
                vec!["etl".to_string(), "rust".to_string(), "sqlite".to_string()],
            )],
            ..Default::default()
        };
        db.batches().commit(batch_id, &commit).await.unwrap();

        let project = db
            .projects()
            .get_by_name("data pipeline")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(project.keywords, vec!["etl", "rust", "sqlite"]);
    }

    #[tokio::test]
    async fn test_tally_upsert_and_delete_via_commit() {
        let temp = TempDir::new().unwrap();
        let db = Database::new(&temp.path().join("test.db")).await.unwrap();

        let now = Utc::now();
        let tally = ProposalTally {
            normalized_name: "garden sensors".to_string(),
            display_name: "Garden Sensors".to_string(),
            keywords: vec!["esp32".to_string()],
            activity_count: 2,
            activity_days: vec!["2026-03-01".to_string()],
            first_seen: now,
            last_seen: now,
        };

        let batch_id = db.batches().open(0, "m").await.unwrap();
        let commit = BatchCommit {
            tally_upserts: vec![tally.clone()],
            ..Default::default()
        };
        db.batches().commit(batch_id, &commit).await.unwrap();

        let pending = db.projects().pending_proposals().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].activity_count, 2);

        // Promotion deletes the tally
        let batch_id = db.batches().open(0, "m").await.unwrap();
        let commit = BatchCommit {
            tally_deletes: vec!["garden sensors".to_string()],
            ..Default::default()
        };
        db.batches().commit(batch_id, &commit).await.unwrap();

        assert!(db.projects().pending_proposals().await.unwrap().is_empty());
    }
}
