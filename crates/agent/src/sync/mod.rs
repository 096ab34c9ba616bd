//! Reconciliation engine.
//!
//! Drives the app manager and the web server toward declared state. A run:
//!
//! 1. Reads the sites from the [`StateStore`]
//! 2. Converges apps
//! 3. Converges web-server configuration
//! 4. Restarts the server if either step changed something, then waits for
//!    the restart to settle
//!
//! Runs never overlap. [`SyncEngine::trigger_run`] queues at most one run
//! behind the one in flight; triggers arriving while a run is already
//! queued are absorbed by it, since the queued run reads state only once it
//! starts.

mod collaborators;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use sitekeeper_common::RunId;

use crate::metrics::Metrics;
use crate::state::StateStore;

pub use collaborators::{AppManager, ManifestAppManager, ManifestWebServer, WebServer};

/// Default wait after requesting a restart
pub const DEFAULT_RESTART_SETTLE: Duration = Duration::from_millis(150);

/// Errors from a reconciliation run
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("Failed to read declared state: {0}")]
    State(String),

    #[error("App sync failed: {0}")]
    Apps(String),

    #[error("Web server sync failed: {0}")]
    WebServer(String),

    #[error("Web server restart failed: {0}")]
    Restart(String),

    #[error("Sync engine is shut down")]
    Closed,
}

/// What a successful run changed
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SyncOutcome {
    pub apps_changed: bool,
    pub config_changed: bool,
    pub restarted: bool,
}

/// Snapshot of the engine's bookkeeping
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStatus {
    pub running: bool,
    pub last_run_started: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub runs: u64,
}

#[derive(Debug, Default)]
struct RunBook {
    last_started: Option<DateTime<Utc>>,
    last_error: Option<SyncError>,
    runs: u64,
}

/// Single-flight reconciliation engine
pub struct SyncEngine {
    store: Arc<dyn StateStore>,
    apps: Arc<dyn AppManager>,
    webserver: Arc<dyn WebServer>,
    /// Held for the whole run body
    gate: Semaphore,
    /// A triggered run is waiting for the gate
    pending: AtomicBool,
    running: AtomicBool,
    book: RwLock<RunBook>,
    restart_settle: Duration,
    shutdown: CancellationToken,
    metrics: Option<Arc<Metrics>>,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn StateStore>,
        apps: Arc<dyn AppManager>,
        webserver: Arc<dyn WebServer>,
    ) -> Self {
        Self {
            store,
            apps,
            webserver,
            gate: Semaphore::new(1),
            pending: AtomicBool::new(false),
            running: AtomicBool::new(false),
            book: RwLock::new(RunBook::default()),
            restart_settle: DEFAULT_RESTART_SETTLE,
            shutdown: CancellationToken::new(),
            metrics: None,
        }
    }

    /// Set how long to wait after a restart before the run completes
    pub fn with_restart_settle(mut self, settle: Duration) -> Self {
        self.restart_settle = settle;
        self
    }

    /// Stop accepting triggers once `shutdown` fires
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Queue a run without waiting for it
    pub fn trigger_run(self: &Arc<Self>) {
        if self.shutdown.is_cancelled() {
            debug!("Sync engine is shut down, ignoring trigger");
            return;
        }
        if self.pending.swap(true, Ordering::AcqRel) {
            trace!("Sync run already queued");
            return;
        }

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let Ok(_permit) = engine.gate.acquire().await else {
                return;
            };
            // Triggers from here on queue another run
            engine.pending.store(false, Ordering::Release);
            if engine.shutdown.is_cancelled() {
                return;
            }
            // Errors are recorded in the run book
            let _ = engine.run_locked().await;
        });
    }

    /// Run now, waiting for any run in flight to finish first
    pub async fn run_sync(&self) -> Result<SyncOutcome, SyncError> {
        if self.shutdown.is_cancelled() {
            return Err(SyncError::Closed);
        }
        let _permit = self.gate.acquire().await.map_err(|_| SyncError::Closed)?;
        self.run_locked().await
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn last_run_time(&self) -> Option<DateTime<Utc>> {
        self.book.read().last_started
    }

    pub fn last_run_error(&self) -> Option<SyncError> {
        self.book.read().last_error.clone()
    }

    pub fn status(&self) -> RunStatus {
        let book = self.book.read();
        RunStatus {
            running: self.is_running(),
            last_run_started: book.last_started,
            last_error: book.last_error.as_ref().map(ToString::to_string),
            runs: book.runs,
        }
    }

    /// Run body; the caller holds the gate
    async fn run_locked(&self) -> Result<SyncOutcome, SyncError> {
        let run_id = RunId::new();
        self.running.store(true, Ordering::Release);
        {
            let mut book = self.book.write();
            book.last_started = Some(Utc::now());
            book.runs += 1;
        }
        if let Some(ref metrics) = self.metrics {
            metrics.record_sync_run();
        }

        debug!(run_id = %run_id, "Starting sync run");
        let result = self.converge(&run_id).await;

        self.book.write().last_error = result.as_ref().err().cloned();
        self.running.store(false, Ordering::Release);

        match result {
            Ok(outcome) => {
                info!(
                    run_id = %run_id,
                    apps_changed = outcome.apps_changed,
                    config_changed = outcome.config_changed,
                    restarted = outcome.restarted,
                    "Sync run complete"
                );
            }
            Err(ref e) => {
                error!(run_id = %run_id, error = %e, "Sync run failed");
                if let Some(ref metrics) = self.metrics {
                    metrics.record_sync_failure();
                }
            }
        }
        result
    }

    async fn converge(&self, run_id: &RunId) -> Result<SyncOutcome, SyncError> {
        let sites = self
            .store
            .get_sites()
            .await
            .map_err(|e| SyncError::State(e.to_string()))?;
        trace!(run_id = %run_id, sites = sites.len(), "Loaded declared sites");

        // Apps first: server config may reference them
        let apps_changed = self
            .apps
            .converge(&sites)
            .await
            .map_err(|e| SyncError::Apps(format!("{e:#}")))?;

        let config_changed = self
            .webserver
            .converge(&sites)
            .await
            .map_err(|e| SyncError::WebServer(format!("{e:#}")))?;

        let mut outcome = SyncOutcome {
            apps_changed,
            config_changed,
            restarted: false,
        };

        if apps_changed || config_changed {
            info!(run_id = %run_id, "Restarting web server");
            if let Some(ref metrics) = self.metrics {
                metrics.record_restart();
            }
            self.webserver
                .restart()
                .await
                .map_err(|e| SyncError::Restart(format!("{e:#}")))?;
            outcome.restarted = true;

            // Give the server time to re-bind before reporting the run done
            tokio::time::sleep(self.restart_settle).await;
        }

        Ok(outcome)
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("status", &self.status())
            .field("restart_settle", &self.restart_settle)
            .finish_non_exhaustive()
    }
}
