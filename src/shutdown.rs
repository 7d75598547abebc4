// Graceful shutdown handling for signal trapping

use anyhow::Result;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Shared shutdown state between signal handlers and the scheduler
#[derive(Clone)]
pub struct ShutdownState {
    /// Flag indicating shutdown has been requested
    shutdown_requested: Arc<AtomicBool>,
    /// Flag indicating cleanup has completed
    cleanup_complete: Arc<AtomicBool>,
}

impl ShutdownState {
    pub fn new() -> Self {
        Self {
            shutdown_requested: Arc::new(AtomicBool::new(false)),
            cleanup_complete: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
        log::info!("Shutdown requested");
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    pub fn mark_cleanup_complete(&self) {
        self.cleanup_complete.store(true, Ordering::SeqCst);
        log::info!("Cleanup complete");
    }

    pub fn is_cleanup_complete(&self) -> bool {
        self.cleanup_complete.load(Ordering::SeqCst)
    }

    /// Resolves once shutdown is requested, checking every `poll`
    pub async fn requested(&self, poll: Duration) {
        while !self.is_shutdown_requested() {
            tokio::time::sleep(poll).await;
        }
    }
}

impl Default for ShutdownState {
    fn default() -> Self {
        Self::new()
    }
}

/// What an interrupted run left behind
#[derive(Debug, Clone, Default)]
pub struct ShutdownSummary {
    /// Workers that were still running and got killed
    pub workers_stopped: usize,
    /// Isolated workspaces left on disk for inspection
    pub workspaces_left: Vec<PathBuf>,
    /// Steps still `in_progress`; the next run resets them
    pub steps_in_progress: Vec<String>,
    /// Any errors encountered during cleanup
    pub errors: Vec<String>,
}

impl ShutdownSummary {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn log(&self) {
        log::info!(
            "Shutdown complete: {} worker(s) stopped, {} workspace(s) left for inspection",
            self.workers_stopped,
            self.workspaces_left.len()
        );
        for path in &self.workspaces_left {
            log::info!("Preserved workspace: {:?}", path);
        }
        if !self.steps_in_progress.is_empty() {
            log::info!(
                "Steps {} will be reset to pending on the next run",
                self.steps_in_progress.join(",")
            );
        }
        for error in &self.errors {
            log::warn!("Cleanup error: {}", error);
        }
    }
}

/// Register signal handlers for graceful shutdown
/// This sets up handlers for SIGINT (Ctrl+C), SIGTERM, and SIGHUP
#[cfg(unix)]
pub fn register_signal_handlers(state: ShutdownState) -> Result<()> {
    use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;
    use std::thread;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])
        .map_err(|e| anyhow::anyhow!("Failed to register signal handlers: {}", e))?;

    thread::spawn(move || {
        for signal in signals.forever() {
            match signal {
                SIGINT => log::info!("Received SIGINT (Ctrl+C)"),
                SIGTERM => log::info!("Received SIGTERM"),
                SIGHUP => log::info!("Received SIGHUP"),
                _ => continue,
            }
            state.request_shutdown();
        }
    });

    log::debug!("Signal handlers registered (SIGINT, SIGTERM, SIGHUP)");
    Ok(())
}

/// Register signal handlers for Windows
#[cfg(windows)]
pub fn register_signal_handlers(state: ShutdownState) -> Result<()> {
    ctrlc::set_handler(move || {
        log::info!("Received Ctrl+C");
        state.request_shutdown();
    })
    .map_err(|e| anyhow::anyhow!("Failed to register Ctrl+C handler: {}", e))?;

    log::debug!("Signal handler registered (Ctrl+C)");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_state_new() {
        let state = ShutdownState::new();
        assert!(!state.is_shutdown_requested());
        assert!(!state.is_cleanup_complete());
    }

    #[test]
    fn test_shutdown_state_clone_shares_flag() {
        let state1 = ShutdownState::new();
        let state2 = state1.clone();

        state1.request_shutdown();
        assert!(state2.is_shutdown_requested());

        state2.mark_cleanup_complete();
        assert!(state1.is_cleanup_complete());
    }

    #[tokio::test]
    async fn test_requested_resolves_after_flag_is_set() {
        let state = ShutdownState::new();
        let waiter = state.clone();
        let handle =
            tokio::spawn(async move { waiter.requested(Duration::from_millis(5)).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        state.request_shutdown();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_shutdown_summary_is_clean() {
        let mut summary = ShutdownSummary::default();
        assert!(summary.is_clean());

        summary.errors.push("Failed to release lock".to_string());
        assert!(!summary.is_clean());
    }
}
