//! Pulse Engine Library
//!
//! This library provides the core functionality of the Pulse engine.
//! It is used by both the main binary and integration tests.

/// Configuration management module
pub mod config;

/// Error taxonomy shared across the pipeline
pub mod errors;

/// Event store persistence module
pub mod store;

/// Session grouping module
pub mod grouper;

/// Batch scheduling and pipeline orchestration
pub mod scheduler;

/// Activity classification via an external completion service
pub mod classifier;

/// Project registry resolution
pub mod registry;

/// Event collectors
pub mod collector;

/// Tracing subscriber setup
pub mod telemetry;

/// Daemon lifecycle management module
pub mod daemon;

/// CLI interface module
pub mod cli;

/// Command handlers module
pub mod handlers;
