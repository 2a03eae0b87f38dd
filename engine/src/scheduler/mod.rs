//! Batch scheduler
//!
//! Decides when enough activity has accumulated to be worth a completion
//! call, selects the batch without splitting sessions, and drives one run
//! end to end: open the batch gate, classify, resolve projects, commit
//! atomically. Failed runs leave their events unprocessed and push the
//! next attempt out with a doubling cooldown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{debug, error, info, warn};

use crate::classifier::Classifier;
use crate::config::PipelineConfig;
use crate::errors::{ErrorExt, PipelineError, StoreError};
use crate::grouper::{group_into_sessions, Session};
use crate::registry::Registry;
use crate::store::{BatchCommit, Database, RawEvent};

/// Ceiling on events pulled into one scheduling pass. Selection trims to
/// the character budget anyway; this just bounds memory.
const FETCH_LIMIT: i64 = 10_000;

/// Why a tick decided not to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    NoEvents,
    BatchAlreadyRunning,
    CoolingDown { until_elapsed_secs: i64 },
    BelowVolumeFloor { tokens: i64, events: usize },
}

/// Outcome of one completed run.
#[derive(Debug)]
pub struct RunReport {
    pub batch_id: i64,
    pub events_processed: usize,
    pub sessions: usize,
    pub activities: usize,
    pub projects_created: usize,
    pub tokens_used: i64,
}

pub struct Scheduler {
    db: Database,
    classifier: Classifier,
    registry: Registry,
    config: PipelineConfig,
    model: String,
}

impl Scheduler {
    pub fn new(
        db: Database,
        classifier: Classifier,
        registry: Registry,
        config: PipelineConfig,
        model: String,
    ) -> Self {
        Self {
            db,
            classifier,
            registry,
            config,
            model,
        }
    }

    /// Estimated prompt tokens for a set of events, with a fixed overhead
    /// for the instructions around them.
    pub fn estimate_tokens(events: &[RawEvent]) -> i64 {
        let chars: usize = events.iter().map(|e| e.estimated_chars()).sum();
        (chars / 4 + 500) as i64
    }

    /// One run of the pipeline. With `force`, the interval and volume
    /// gates are bypassed; the mutual-exclusion gate never is.
    ///
    /// Returns the skip reason when nothing ran.
    pub async fn run_once(&self, force: bool) -> Result<Result<RunReport, SkipReason>, PipelineError> {
        let events = self.db.events().unprocessed(FETCH_LIMIT).await?;
        if events.is_empty() {
            return Ok(Err(SkipReason::NoEvents));
        }

        if !force {
            if let Some(reason) = self.gate(&events).await? {
                return Ok(Err(reason));
            }
        }

        let gap = Duration::minutes(self.config.session_gap_minutes as i64);
        let sessions = group_into_sessions(events, gap);
        let selected = select_batch(sessions, self.config.max_context_chars);
        let session_count = selected.len();

        let event_ids: Vec<i64> = selected.iter().flat_map(|s| s.event_ids()).collect();

        let batch_id = match self
            .db
            .batches()
            .open(event_ids.len() as i64, &self.model)
            .await
        {
            Ok(id) => id,
            Err(StoreError::BatchRunning) => {
                debug!("another batch holds the running gate, skipping");
                return Ok(Err(SkipReason::BatchAlreadyRunning));
            }
            Err(e) => return Err(e.into()),
        };

        info!(
            batch_id,
            events = event_ids.len(),
            sessions = session_count,
            "processing batch opened"
        );

        match self.classify_and_commit(batch_id, &selected, &event_ids).await {
            Ok(report) => {
                info!(
                    batch_id,
                    events = report.events_processed,
                    activities = report.activities,
                    tokens = report.tokens_used,
                    "batch committed"
                );
                Ok(Ok(report))
            }
            Err(e) => {
                warn!(batch_id, error = %e, "batch failed");
                self.db.batches().fail(batch_id, &e.to_string()).await?;
                Err(e)
            }
        }
    }

    async fn classify_and_commit(
        &self,
        batch_id: i64,
        sessions: &[Session],
        event_ids: &[i64],
    ) -> Result<RunReport, PipelineError> {
        let existing = self.db.projects().active().await?;
        let pending = self.db.projects().pending_proposals().await?;

        let outcome = self.classifier.classify(sessions, &existing).await?;

        let resolution = self.registry.resolve(
            &outcome.response,
            sessions,
            event_ids,
            &existing,
            &pending,
            Utc::now(),
        );

        let activities = resolution.activities.len();
        let projects_created = resolution.project_creates.len();

        let commit = BatchCommit {
            event_ids: event_ids.to_vec(),
            activities: resolution.activities,
            project_creates: resolution.project_creates,
            keyword_merges: resolution.keyword_merges,
            tally_upserts: resolution.tally_upserts,
            tally_deletes: resolution.tally_deletes,
            tokens_used: outcome.tokens_used,
        };

        self.db.batches().commit(batch_id, &commit).await?;

        Ok(RunReport {
            batch_id,
            events_processed: event_ids.len(),
            sessions: sessions.len(),
            activities,
            projects_created,
            tokens_used: outcome.tokens_used,
        })
    }

    /// Interval, cooldown, and volume gates. `None` means run.
    async fn gate(&self, events: &[RawEvent]) -> Result<Option<SkipReason>, PipelineError> {
        let batches = self.db.batches();

        if batches.running().await?.is_some() {
            return Ok(Some(SkipReason::BatchAlreadyRunning));
        }

        if let Some(last) = batches.last_finished().await? {
            let interval = Duration::hours(self.config.processing_interval_hours as i64);
            let failures = self.consecutive_failures().await?;
            let multiplier = 2u32
                .saturating_pow(failures)
                .min(self.config.cooldown_max_multiplier);
            let required = interval * multiplier as i32;

            let reference = last.end_time.unwrap_or(last.start_time);
            let elapsed = Utc::now() - reference;
            if elapsed < required {
                return Ok(Some(SkipReason::CoolingDown {
                    until_elapsed_secs: (required - elapsed).num_seconds(),
                }));
            }
        }

        let tokens = Self::estimate_tokens(events);
        if tokens < self.config.min_batch_tokens && events.len() < self.config.min_batch_events {
            return Ok(Some(SkipReason::BelowVolumeFloor {
                tokens,
                events: events.len(),
            }));
        }

        Ok(None)
    }

    /// Number of failed batches since the last completed one.
    async fn consecutive_failures(&self) -> Result<u32, PipelineError> {
        let recent = self
            .db
            .batches()
            .recent(self.config.cooldown_max_multiplier as i64 + 1)
            .await?;

        let mut failures = 0u32;
        for batch in recent {
            match batch.status {
                crate::store::BatchStatus::Failed => failures += 1,
                crate::store::BatchStatus::Completed => break,
                crate::store::BatchStatus::Running => continue,
            }
        }

        Ok(failures)
    }

    /// Daemon loop: reconcile stale batches and attempt a run on every
    /// tick until `shutdown` is set.
    ///
    /// Recoverable failures are logged and retried on a later tick (the
    /// cooldown pushes the retry out); unrecoverable ones stop the loop.
    pub async fn run_loop(&self, shutdown: Arc<AtomicBool>) -> Result<(), PipelineError> {
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_secs(self.config.tick_seconds));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            tick_seconds = self.config.tick_seconds,
            interval_hours = self.config.processing_interval_hours,
            "scheduler loop started"
        );

        while !shutdown.load(Ordering::SeqCst) {
            ticker.tick().await;
            if shutdown.load(Ordering::SeqCst) {
                break;
            }

            let stale_age = Duration::minutes(self.config.stale_batch_minutes as i64);
            match self.db.batches().reconcile_stale(stale_age).await {
                Ok(0) => {}
                Ok(n) => warn!(count = n, "reconciled stale running batches"),
                Err(e) => warn!(error = %e, "stale batch reconciliation failed"),
            }

            match self.run_once(false).await {
                Ok(Ok(_)) => {}
                Ok(Err(reason)) => debug!(?reason, "tick skipped"),
                Err(e) if e.is_recoverable() => {
                    warn!(error = %e, "run failed, will retry after cooldown");
                }
                Err(e) => {
                    error!(error = %e, hint = e.user_hint(), "unrecoverable failure, stopping");
                    return Err(e);
                }
            }
        }

        info!("scheduler loop stopped");
        Ok(())
    }
}

/// Select whole sessions, oldest first, until the character budget is
/// spent. A first session that alone exceeds the budget is taken in full
/// anyway; selection stops at the first session that does not fit, so
/// later sessions never leapfrog an earlier one.
pub fn select_batch(sessions: Vec<Session>, max_chars: usize) -> Vec<Session> {
    let mut selected = Vec::new();
    let mut used = 0usize;

    for session in sessions {
        let chars = session.estimated_chars();
        if selected.is_empty() || used + chars <= max_chars {
            used += chars;
            selected.push(session);
            if used > max_chars {
                break;
            }
        } else {
            break;
        }
    }

    selected
}
