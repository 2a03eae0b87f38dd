//! CLI interface for Pulse
//!
//! This module provides the command-line interface using clap's derive API.
//! It defines all commands and global flags for controlling the Pulse daemon.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Pulse activity intelligence engine
///
/// Collects raw activity events on your machine, groups them into work
/// sessions, and periodically classifies them into project activities with
/// an external completion service.
#[derive(Parser, Debug)]
#[command(name = "pulse")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log: Option<String>,

    /// Specify alternate configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the daemon (scheduler loop in the foreground)
    Start,

    /// Stop the running daemon
    Stop,

    /// Show daemon and pipeline status
    Status,

    /// Run one processing batch immediately, bypassing interval and
    /// volume gates
    Run,

    /// Ingest events from a JSONL file
    Ingest {
        /// Path to the JSONL file
        file: PathBuf,

        /// Default source attributed to events without one
        #[arg(long, default_value = "manual")]
        source: String,
    },

    /// Show recent activities
    Activities {
        /// Number of trailing days to show
        #[arg(short, long, default_value = "7")]
        days: i64,

        /// Only show activities for this project
        #[arg(short, long)]
        project: Option<String>,
    },

    /// Show token usage and cost statistics
    Stats {
        /// Number of trailing days to aggregate
        #[arg(short, long, default_value = "30")]
        days: i64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::parse_from(["pulse", "status"]);
        assert!(matches!(cli.command, Command::Status));
        assert!(!cli.json);
        assert!(cli.log.is_none());
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_global_flags() {
        let cli = Cli::parse_from(["pulse", "--json", "--log", "debug", "status"]);
        assert!(cli.json);
        assert_eq!(cli.log, Some("debug".to_string()));
    }

    #[test]
    fn test_ingest_command() {
        let cli = Cli::parse_from(["pulse", "ingest", "events.jsonl", "--source", "git"]);
        if let Command::Ingest { file, source } = cli.command {
            assert_eq!(file, PathBuf::from("events.jsonl"));
            assert_eq!(source, "git");
        } else {
            panic!("Expected Ingest command");
        }
    }

    #[test]
    fn test_ingest_default_source() {
        let cli = Cli::parse_from(["pulse", "ingest", "events.jsonl"]);
        if let Command::Ingest { source, .. } = cli.command {
            assert_eq!(source, "manual");
        } else {
            panic!("Expected Ingest command");
        }
    }

    #[test]
    fn test_activities_command() {
        let cli = Cli::parse_from(["pulse", "activities", "--days", "14", "--project", "misc"]);
        if let Command::Activities { days, project } = cli.command {
            assert_eq!(days, 14);
            assert_eq!(project, Some("misc".to_string()));
        } else {
            panic!("Expected Activities command");
        }
    }

    #[test]
    fn test_stats_defaults() {
        let cli = Cli::parse_from(["pulse", "stats"]);
        if let Command::Stats { days } = cli.command {
            assert_eq!(days, 30);
        } else {
            panic!("Expected Stats command");
        }
    }
}
