//! End-to-end tests for the batch scheduler: full pipeline runs against a
//! canned completion backend, plus the gating rules (cooldown, volume
//! floor, running-batch exclusion).

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};
use tempfile::TempDir;

use pulse_engine::classifier::{Classifier, Completion, CompletionBackend};
use pulse_engine::config::{ClassifierConfig, PipelineConfig, RegistryConfig};
use pulse_engine::errors::{ClassifierError, PipelineError};
use pulse_engine::registry::Registry;
use pulse_engine::scheduler::{Scheduler, SkipReason};
use pulse_engine::store::{BatchStatus, Database};

/// Serves scripted completions in order; errors once the script runs out.
struct CannedBackend {
    responses: Mutex<VecDeque<Result<String, String>>>,
}

impl CannedBackend {
    fn new(responses: Vec<Result<String, String>>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().collect()),
        }
    }
}

#[async_trait]
impl CompletionBackend for CannedBackend {
    fn name(&self) -> &str {
        "canned"
    }

    fn model(&self) -> &str {
        "canned/test-model"
    }

    async fn complete(&self, _system: &str, user: &str) -> Result<Completion, ClassifierError> {
        let next = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err("script exhausted".to_string()));
        match next {
            Ok(content) => Ok(Completion {
                input_tokens: (user.len() / 4) as i64,
                output_tokens: (content.len() / 4) as i64,
                content,
            }),
            Err(msg) => Err(ClassifierError::ServerError(msg)),
        }
    }
}

fn fast_classifier_config() -> ClassifierConfig {
    ClassifierConfig {
        base_delay_ms: 1,
        max_delay_ms: 5,
        jitter_factor: 0.0,
        ..Default::default()
    }
}

async fn setup_scheduler(
    temp: &TempDir,
    responses: Vec<Result<String, String>>,
) -> (Database, Scheduler) {
    let db_path = temp.path().join("test.db");
    let db = Database::new(&db_path).await.unwrap();
    let scheduler_db = Database::new(&db_path).await.unwrap();

    let classifier_config = fast_classifier_config();
    let backend = CannedBackend::new(responses);
    let classifier = Classifier::new(Box::new(backend), &classifier_config, scheduler_db.usage());
    let registry = Registry::new(RegistryConfig::default());

    let scheduler = Scheduler::new(
        scheduler_db,
        classifier,
        registry,
        PipelineConfig::default(),
        "canned/test-model".to_string(),
    );
    (db, scheduler)
}

/// Inserts two clusters of raw events separated by a 90-minute quiet
/// stretch: 7 events in the morning, 5 before lunch, 12 in total.
async fn seed_two_clusters(db: &Database) {
    let morning = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
    for i in 0..7 {
        db.events()
            .insert(
                "git",
                "commit",
                &format!(r#"{{"msg": "portfolio change {}"}}"#, i),
                morning + Duration::minutes(i * 8),
            )
            .await
            .unwrap();
    }

    let late = morning + Duration::minutes(6 * 8) + Duration::minutes(90);
    for i in 0..5 {
        db.events()
            .insert(
                "browser",
                "visit",
                &format!(r#"{{"url": "article-{}"}}"#, i),
                late + Duration::minutes(i * 5),
            )
            .await
            .unwrap();
    }
}

const FIRST_RUN_RESPONSE: &str = r#"{
    "activities": [
        {
            "project": "portfolio site",
            "description": "Iterated on the landing page",
            "date": "2026-03-01",
            "activity_type": "coding",
            "technologies": ["css"],
            "session": 0
        },
        {
            "project": "portfolio site",
            "description": "Wired up the contact form",
            "date": "2026-03-01",
            "activity_type": "coding",
            "session": 0
        },
        {
            "project": "reading notes",
            "description": "Read articles on typography",
            "date": "2026-03-01",
            "activity_type": "research",
            "session": 1
        }
    ],
    "new_projects": [
        {"name": "portfolio site", "reason": "repeated site work", "keywords": ["portfolio", "css"]},
        {"name": "reading notes", "keywords": ["reading"]}
    ]
}"#;

#[tokio::test]
async fn test_twelve_events_end_to_end() {
    let temp = TempDir::new().unwrap();
    let (db, scheduler) = setup_scheduler(&temp, vec![Ok(FIRST_RUN_RESPONSE.to_string())]).await;

    seed_two_clusters(&db).await;

    let report = scheduler.run_once(true).await.unwrap().unwrap();

    assert_eq!(report.events_processed, 12);
    assert_eq!(report.sessions, 2);
    assert_eq!(report.activities, 3);
    // Neither proposal meets the creation bar yet; only the catch-all
    // bucket gets created
    assert_eq!(report.projects_created, 1);
    assert!(report.tokens_used > 0);

    // Every event consumed exactly once
    assert_eq!(db.events().pending_count().await.unwrap(), 0);

    let batch = db.batches().last_finished().await.unwrap().unwrap();
    assert_eq!(batch.status, BatchStatus::Completed);
    assert_eq!(batch.processed_count, 12);

    // All activities routed to the catch-all bucket
    let start = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
    let activities = db
        .activities()
        .for_period(start, start + Duration::days(1), None)
        .await
        .unwrap();
    assert_eq!(activities.len(), 3);
    assert!(activities.iter().all(|a| a.project_name == "misc"));

    assert!(db.projects().get_by_name("misc").await.unwrap().is_some());
    assert!(db
        .projects()
        .get_by_name("portfolio site")
        .await
        .unwrap()
        .is_none());

    // Both proposals are tallied for future batches
    let pending = db.projects().pending_proposals().await.unwrap();
    assert_eq!(pending.len(), 2);
    let portfolio = pending
        .iter()
        .find(|p| p.normalized_name == "portfolio site")
        .unwrap();
    assert_eq!(portfolio.activity_count, 2);
    assert_eq!(portfolio.activity_days, vec!["2026-03-01".to_string()]);
}

const SECOND_RUN_RESPONSE: &str = r#"{
    "activities": [
        {
            "project": "portfolio site",
            "description": "Deployed the site",
            "date": "2026-03-02",
            "activity_type": "coding",
            "session": 0
        }
    ],
    "new_projects": [
        {"name": "portfolio site", "keywords": ["deploy"]}
    ]
}"#;

#[tokio::test]
async fn test_proposal_promoted_across_batches() {
    let temp = TempDir::new().unwrap();
    let (db, scheduler) = setup_scheduler(
        &temp,
        vec![
            Ok(FIRST_RUN_RESPONSE.to_string()),
            Ok(SECOND_RUN_RESPONSE.to_string()),
        ],
    )
    .await;

    seed_two_clusters(&db).await;
    scheduler.run_once(true).await.unwrap().unwrap();

    // A second day of work on the same proposal
    let next_day = Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap();
    db.events()
        .insert("git", "push", r#"{"branch": "main"}"#, next_day)
        .await
        .unwrap();

    let report = scheduler.run_once(true).await.unwrap().unwrap();

    // 2 prior activities + 1 new, across 2 distinct days: promoted
    assert_eq!(report.projects_created, 1);
    let project = db
        .projects()
        .get_by_name("portfolio site")
        .await
        .unwrap()
        .unwrap();
    assert!(project.keywords.contains(&"portfolio".to_string()));
    assert!(project.keywords.contains(&"deploy".to_string()));

    // The tally is consumed by the promotion
    let pending = db.projects().pending_proposals().await.unwrap();
    assert!(pending.iter().all(|p| p.normalized_name != "portfolio site"));

    let start = Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap();
    let activities = db
        .activities()
        .for_period(start, start + Duration::days(1), Some("portfolio site"))
        .await
        .unwrap();
    assert_eq!(activities.len(), 1);
}

#[tokio::test]
async fn test_classifier_failure_leaves_events_for_next_run() {
    let temp = TempDir::new().unwrap();
    // Transient errors persist through every retry attempt
    let (db, scheduler) = setup_scheduler(
        &temp,
        vec![
            Err("boom".to_string()),
            Err("boom".to_string()),
            Err("boom".to_string()),
        ],
    )
    .await;

    seed_two_clusters(&db).await;

    let err = scheduler.run_once(true).await.unwrap_err();
    assert!(matches!(err, PipelineError::Classifier(_)));

    // The batch is marked failed and every event stays eligible
    let batch = db.batches().last_finished().await.unwrap().unwrap();
    assert_eq!(batch.status, BatchStatus::Failed);
    assert!(batch.error_message.is_some());
    assert_eq!(db.events().pending_count().await.unwrap(), 12);
    assert_eq!(db.activities().count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_skip_when_no_events() {
    let temp = TempDir::new().unwrap();
    let (_db, scheduler) = setup_scheduler(&temp, vec![]).await;

    let skip = scheduler.run_once(true).await.unwrap().unwrap_err();
    assert_eq!(skip, SkipReason::NoEvents);
}

#[tokio::test]
async fn test_skip_below_volume_floor() {
    let temp = TempDir::new().unwrap();
    let (db, scheduler) = setup_scheduler(&temp, vec![]).await;

    // A single tiny event clears neither the token nor the event floor
    db.events()
        .insert("git", "commit", r#"{"m": 1}"#, Utc::now() - Duration::hours(12))
        .await
        .unwrap();

    let skip = scheduler.run_once(false).await.unwrap().unwrap_err();
    assert!(matches!(skip, SkipReason::BelowVolumeFloor { events: 1, .. }));
}

#[tokio::test]
async fn test_gate_decision_is_stable_without_new_events() {
    let temp = TempDir::new().unwrap();
    let (db, scheduler) = setup_scheduler(&temp, vec![]).await;

    db.events()
        .insert("git", "commit", r#"{"m": 1}"#, Utc::now() - Duration::hours(12))
        .await
        .unwrap();

    // With no new events and no elapsed interval, asking twice gives the
    // same answer twice and consumes nothing
    let first = scheduler.run_once(false).await.unwrap().unwrap_err();
    let second = scheduler.run_once(false).await.unwrap().unwrap_err();

    assert!(matches!(first, SkipReason::BelowVolumeFloor { events: 1, .. }));
    assert_eq!(first, second);
    assert_eq!(db.events().pending_count().await.unwrap(), 1);
    assert!(db.batches().last_finished().await.unwrap().is_none());
}

#[tokio::test]
async fn test_skip_while_another_batch_runs() {
    let temp = TempDir::new().unwrap();
    let (db, scheduler) = setup_scheduler(&temp, vec![]).await;

    seed_two_clusters(&db).await;
    db.batches().open(1, "other").await.unwrap();

    let skip = scheduler.run_once(true).await.unwrap().unwrap_err();
    assert_eq!(skip, SkipReason::BatchAlreadyRunning);
}

#[tokio::test]
async fn test_cooldown_after_failed_batch() {
    let temp = TempDir::new().unwrap();
    let (db, scheduler) = setup_scheduler(&temp, vec![]).await;

    seed_two_clusters(&db).await;

    // A fresh failure puts the scheduler in a doubled cooldown window
    let batch_id = db.batches().open(1, "m").await.unwrap();
    db.batches().fail(batch_id, "boom").await.unwrap();

    let skip = scheduler.run_once(false).await.unwrap().unwrap_err();
    assert!(matches!(skip, SkipReason::CoolingDown { .. }));

    // Force bypasses the cooldown, though here the script is empty so the
    // run itself fails downstream
    assert!(scheduler.run_once(true).await.is_err());
}
