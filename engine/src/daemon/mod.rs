//! Daemon lifecycle management
//!
//! Handles PID file management (~/.pulse/pulse.pid), start/stop/status
//! operations, and graceful shutdown via SIGTERM. Only one daemon instance
//! runs at a time: the manager checks for an existing PID file, verifies
//! the process is actually alive, and removes stale PID files left behind
//! by a crashed process.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::config::{Config, API_KEY_ENV};
use crate::errors::PipelineError;

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Daemon status information
#[derive(Debug, Clone)]
pub struct DaemonStatus {
    /// Whether the daemon is currently running
    pub is_running: bool,

    /// Process ID if running
    pub pid: Option<u32>,

    /// Path to the PID file
    pub pid_file: PathBuf,

    /// Whether the completion service API key is configured
    pub api_key_configured: bool,
}

/// Daemon manager for lifecycle operations
///
/// The PID file lives in the data directory and contains the process ID of
/// the running daemon. The manager creates it on start, refuses to start
/// over a live daemon, removes stale files, and cleans up on drop.
pub struct DaemonManager {
    pid_file: PathBuf,

    /// Shutdown flag shared with the scheduler loop
    shutdown_flag: Arc<AtomicBool>,
}

impl DaemonManager {
    pub fn new(config: &Config) -> Self {
        Self {
            pid_file: Self::pid_file_for(config),
            shutdown_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Starts the daemon lifecycle: claims the PID file and installs the
    /// SIGTERM handler.
    ///
    /// Returns `DaemonAlreadyRunning` if a live daemon holds the PID file.
    pub fn start(&self) -> Result<()> {
        if self.is_daemon_running()? {
            return Err(PipelineError::DaemonAlreadyRunning);
        }

        self.write_pid_file()?;

        let _signal_handle = Self::setup_signal_handler(Arc::clone(&self.shutdown_flag));
        tracing::info!("SIGTERM signal handler installed");

        Ok(())
    }

    /// The shutdown flag the scheduler loop polls.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown_flag)
    }

    /// Stops a running daemon: sends SIGTERM and waits for the process to
    /// exit, removing the PID file if the daemon left it behind.
    pub async fn stop(config: &Config) -> Result<()> {
        let pid_file = Self::pid_file_for(config);
        let pid = Self::read_pid_file(&pid_file)?;

        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            tracing::info!("Sending SIGTERM to daemon process {}", pid);
            kill(Pid::from_raw(pid as i32), Signal::SIGTERM).map_err(|e| {
                PipelineError::Io(std::io::Error::other(format!(
                    "Failed to send SIGTERM: {}",
                    e
                )))
            })?;

            tracing::info!("Waiting for daemon to shut down gracefully");
            let wait_result = timeout(Duration::from_secs(35), async {
                loop {
                    if !Self::is_process_running(pid) {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            })
            .await;

            if wait_result.is_err() {
                tracing::warn!("Daemon did not stop within 35 seconds");
            } else {
                tracing::info!("Daemon stopped successfully");
            }

            if pid_file.exists() {
                fs::remove_file(&pid_file)?;
            }

            Ok(())
        }

        #[cfg(not(unix))]
        {
            let _ = pid;
            Err(PipelineError::Config(
                "Daemon stop is only supported on unix".to_string(),
            ))
        }
    }

    /// Reports whether a daemon is running and whether the API key is
    /// configured in the environment.
    pub fn status(config: &Config) -> DaemonStatus {
        let pid_file = Self::pid_file_for(config);

        let (is_running, pid) = match Self::read_pid_file(&pid_file) {
            Ok(pid) if Self::is_process_running(pid) => (true, Some(pid)),
            _ => (false, None),
        };

        DaemonStatus {
            is_running,
            pid,
            pid_file,
            api_key_configured: std::env::var(API_KEY_ENV).is_ok(),
        }
    }

    /// Signals the daemon to shut down.
    pub fn signal_shutdown(&self) {
        self.shutdown_flag.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown_signaled(&self) -> bool {
        self.shutdown_flag.load(Ordering::SeqCst)
    }

    pub fn pid_file_path(&self) -> &Path {
        &self.pid_file
    }

    #[cfg(unix)]
    fn setup_signal_handler(shutdown_flag: Arc<AtomicBool>) -> JoinHandle<()> {
        use tokio::signal::unix::{signal, SignalKind};

        tokio::spawn(async move {
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    tracing::error!("Failed to install SIGTERM handler: {}", e);
                    return;
                }
            };

            sigterm.recv().await;
            tracing::info!("Received SIGTERM signal");
            shutdown_flag.store(true, Ordering::SeqCst);
        })
    }

    #[cfg(not(unix))]
    fn setup_signal_handler(_shutdown_flag: Arc<AtomicBool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(u64::MAX)).await;
        })
    }

    /// True if a live daemon holds the PID file. Stale PID files (process
    /// no longer exists) are removed along the way.
    fn is_daemon_running(&self) -> Result<bool> {
        if !self.pid_file.exists() {
            return Ok(false);
        }

        let pid = Self::read_pid_file(&self.pid_file)?;

        if Self::is_process_running(pid) {
            Ok(true)
        } else {
            fs::remove_file(&self.pid_file)?;
            Ok(false)
        }
    }

    fn write_pid_file(&self) -> Result<()> {
        let pid = std::process::id();

        if let Some(parent) = self.pid_file.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(&self.pid_file, pid.to_string())?;

        tracing::info!("Wrote PID {} to {:?}", pid, self.pid_file);

        Ok(())
    }

    fn read_pid_file(pid_file: &Path) -> Result<u32> {
        let content = fs::read_to_string(pid_file)?;

        content
            .trim()
            .parse::<u32>()
            .map_err(|e| PipelineError::Config(format!("Invalid PID in file: {}", e)))
    }

    fn is_process_running(_pid: u32) -> bool {
        #[cfg(unix)]
        {
            use nix::sys::signal::kill;
            use nix::unistd::Pid;

            // Signal 0 checks existence without delivering anything
            kill(Pid::from_raw(_pid as i32), None).is_ok()
        }

        #[cfg(not(unix))]
        {
            false
        }
    }

    /// The data directory is already expanded by config validation.
    fn pid_file_for(config: &Config) -> PathBuf {
        config.core.data_dir.join("pulse.pid")
    }
}

impl Drop for DaemonManager {
    /// Removes the PID file when the daemon manager is dropped.
    fn drop(&mut self) {
        if self.pid_file.exists() {
            if let Err(e) = fs::remove_file(&self.pid_file) {
                tracing::warn!("Failed to remove PID file on drop: {}", e);
            }
        }
    }
}
