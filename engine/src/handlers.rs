//! Command handlers for CLI operations
//!
//! This module implements the handlers for all CLI commands:
//! - start: run the daemon scheduler loop in the foreground
//! - stop: signal a running daemon
//! - status: show daemon and pipeline state
//! - run: process one batch immediately
//! - ingest: load events from a JSONL file
//! - activities / stats: query what the pipeline produced

use anyhow::{Context, Result};
use serde_json::json;

use crate::classifier::{Classifier, OpenRouterBackend};
use crate::collector::{Collector, JsonlCollector};
use crate::config::Config;
use crate::daemon::DaemonManager;
use crate::registry::Registry;
use crate::scheduler::Scheduler;
use crate::store::Database;

/// Output format for command results
#[derive(Debug, Clone, Copy)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for machine consumption
    Json,
}

/// Wire up the full pipeline: database, completion backend, classifier,
/// registry, scheduler. The API key is resolved here so a missing key
/// fails at startup rather than mid-batch.
async fn build_scheduler(config: &Config) -> Result<(Database, Scheduler)> {
    let database = Database::new(&config.db_path())
        .await
        .context("Failed to open database")?;

    let api_key = config.api_key()?;
    let backend = OpenRouterBackend::new(&config.classifier, api_key)
        .context("Failed to build completion backend")?;

    let classifier = Classifier::new(Box::new(backend), &config.classifier, database.usage());
    let registry = Registry::new(config.registry.clone());

    let scheduler = Scheduler::new(
        Database::new(&config.db_path())
            .await
            .context("Failed to open database")?,
        classifier,
        registry,
        config.pipeline.clone(),
        config.classifier.model.clone(),
    );

    Ok((database, scheduler))
}

/// Start the daemon: claim the PID file, reconcile anything a dead
/// process left behind, then run the scheduler loop until SIGTERM.
pub async fn handle_start(config: &Config, format: OutputFormat) -> Result<()> {
    let manager = DaemonManager::new(config);
    manager.start()?;

    let (database, scheduler) = build_scheduler(config).await?;

    // Any batch still running at startup belongs to a dead process
    let reconciled = database
        .batches()
        .reconcile_stale(chrono::Duration::zero())
        .await?;
    if reconciled > 0 {
        tracing::warn!(count = reconciled, "reconciled batches from a previous run");
    }

    match format {
        OutputFormat::Text => println!("Pulse daemon started (pid {})", std::process::id()),
        OutputFormat::Json => println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "status": "started",
                "pid": std::process::id(),
            }))?
        ),
    }

    let result = scheduler.run_loop(manager.shutdown_flag()).await;

    database.close().await?;

    result.map_err(Into::into)
}

/// Stop the running daemon via SIGTERM.
pub async fn handle_stop(config: &Config, format: OutputFormat) -> Result<()> {
    DaemonManager::stop(config).await?;

    match format {
        OutputFormat::Text => println!("Pulse daemon stopped"),
        OutputFormat::Json => println!(
            "{}",
            serde_json::to_string_pretty(&json!({"status": "stopped"}))?
        ),
    }

    Ok(())
}

/// Show daemon and pipeline status.
pub async fn handle_status(config: &Config, format: OutputFormat) -> Result<()> {
    let status = DaemonManager::status(config);

    let database = Database::new(&config.db_path())
        .await
        .context("Failed to open database")?;

    let pending_events = database.events().pending_count().await?;
    let activity_count = database.activities().count().await?;
    let running = database.batches().running().await?;
    let last = database.batches().last_finished().await?;

    match format {
        OutputFormat::Text => {
            println!("Pulse Status");
            println!("============");
            println!();
            if status.is_running {
                println!("Daemon:          running (pid {})", status.pid.unwrap_or(0));
            } else {
                println!("Daemon:          not running");
            }
            println!(
                "API key:         {}",
                if status.api_key_configured {
                    "configured"
                } else {
                    "NOT configured"
                }
            );
            println!("Pending events:  {}", pending_events);
            println!("Activities:      {}", activity_count);

            match &running {
                Some(batch) => println!(
                    "Current batch:   #{} running since {}",
                    batch.id,
                    batch.start_time.format("%Y-%m-%d %H:%M:%S")
                ),
                None => println!("Current batch:   none"),
            }

            match &last {
                Some(batch) => {
                    println!(
                        "Last batch:      #{} {} ({} events, {} tokens)",
                        batch.id,
                        batch.status.as_str(),
                        batch.processed_count,
                        batch.tokens_used
                    );
                    if let Some(error) = &batch.error_message {
                        println!("                 error: {}", error);
                    }
                }
                None => println!("Last batch:      never run"),
            }
        }
        OutputFormat::Json => {
            let output = json!({
                "daemon": {
                    "running": status.is_running,
                    "pid": status.pid,
                    "api_key_configured": status.api_key_configured,
                },
                "pending_events": pending_events,
                "activities": activity_count,
                "current_batch": running,
                "last_batch": last,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    database.close().await?;
    Ok(())
}

/// Run one batch immediately, bypassing the interval and volume gates.
pub async fn handle_run(config: &Config, format: OutputFormat) -> Result<()> {
    let (database, scheduler) = build_scheduler(config).await?;

    database
        .batches()
        .reconcile_stale(chrono::Duration::minutes(
            config.pipeline.stale_batch_minutes as i64,
        ))
        .await?;

    let outcome = scheduler.run_once(true).await;

    let result = match outcome {
        Ok(Ok(report)) => {
            match format {
                OutputFormat::Text => {
                    println!("Batch #{} completed", report.batch_id);
                    println!("  Events:     {}", report.events_processed);
                    println!("  Sessions:   {}", report.sessions);
                    println!("  Activities: {}", report.activities);
                    println!("  Projects:   {} created", report.projects_created);
                    println!("  Tokens:     {}", report.tokens_used);
                }
                OutputFormat::Json => println!(
                    "{}",
                    serde_json::to_string_pretty(&json!({
                        "status": "completed",
                        "batch_id": report.batch_id,
                        "events": report.events_processed,
                        "sessions": report.sessions,
                        "activities": report.activities,
                        "projects_created": report.projects_created,
                        "tokens_used": report.tokens_used,
                    }))?
                ),
            }
            Ok(())
        }
        Ok(Err(reason)) => {
            match format {
                OutputFormat::Text => println!("Nothing to process: {:?}", reason),
                OutputFormat::Json => println!(
                    "{}",
                    serde_json::to_string_pretty(&json!({
                        "status": "skipped",
                        "reason": format!("{:?}", reason),
                    }))?
                ),
            }
            Ok(())
        }
        Err(e) => {
            match format {
                OutputFormat::Text => println!("Batch failed: {}", e),
                OutputFormat::Json => println!(
                    "{}",
                    serde_json::to_string_pretty(&json!({
                        "status": "failed",
                        "error": e.to_string(),
                    }))?
                ),
            }
            Err(e.into())
        }
    };

    database.close().await?;
    result
}

/// Ingest events from a JSONL file.
pub async fn handle_ingest(
    file: std::path::PathBuf,
    source: String,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let database = Database::new(&config.db_path())
        .await
        .context("Failed to open database")?;

    let collector = JsonlCollector::new(file.clone(), source);
    let inserted = collector.collect(&database.events()).await?;

    match format {
        OutputFormat::Text => {
            println!("Ingested {} events from {}", inserted, file.display())
        }
        OutputFormat::Json => println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "status": "ingested",
                "file": file.display().to_string(),
                "events": inserted,
            }))?
        ),
    }

    database.close().await?;
    Ok(())
}

/// Show activities from the trailing window.
pub async fn handle_activities(
    days: i64,
    project: Option<String>,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let database = Database::new(&config.db_path())
        .await
        .context("Failed to open database")?;

    let end = chrono::Utc::now();
    let start = end - chrono::Duration::days(days);

    let activities = database
        .activities()
        .for_period(start, end, project.as_deref())
        .await?;

    match format {
        OutputFormat::Text => {
            if activities.is_empty() {
                println!("No activities in the last {} days", days);
            } else {
                println!("Activities (last {} days):", days);
                println!();
                for activity in &activities {
                    println!(
                        "{}  [{}] {}",
                        activity.timestamp.format("%Y-%m-%d %H:%M"),
                        activity.project_name,
                        activity.description
                    );
                }
            }
        }
        OutputFormat::Json => {
            let output = json!({
                "days": days,
                "project": project,
                "count": activities.len(),
                "activities": activities,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    database.close().await?;
    Ok(())
}

/// Show token usage and cost statistics.
pub async fn handle_stats(days: i64, config: &Config, format: OutputFormat) -> Result<()> {
    let database = Database::new(&config.db_path())
        .await
        .context("Failed to open database")?;

    let stats = database.usage().stats(days).await?;

    match format {
        OutputFormat::Text => {
            println!("Token Usage (last {} days):", days);
            println!();
            println!("  Calls:         {}", stats.calls);
            println!("  Input tokens:  {}", stats.tokens_input);
            println!("  Output tokens: {}", stats.tokens_output);
            println!("  Est. cost:     ${:.4}", stats.cost_estimate);

            if !stats.by_model.is_empty() {
                println!();
                println!("  By model:");
                for model in &stats.by_model {
                    println!(
                        "    {:<30} {} calls, {} in / {} out, ${:.4}",
                        model.model,
                        model.calls,
                        model.tokens_input,
                        model.tokens_output,
                        model.cost_estimate
                    );
                }
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&json!(stats))?);
        }
    }

    database.close().await?;
    Ok(())
}
