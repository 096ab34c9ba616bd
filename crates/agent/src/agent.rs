//! Agent wiring and event loop.
//!
//! The [`Agent`] owns every long-running component of a node:
//!
//! ```text
//!  state events ─┐
//!  SIGUSR1 ──────┼──▶ SyncEngine::trigger_run
//!  resync timer ─┘
//!  SIGHUP / new certificates ──▶ MonitorHandle::refresh ──▶ CertificateMonitor
//!  SIGINT / SIGTERM ──▶ CancellationToken
//! ```
//!
//! Startup reconciliation runs to completion before the event loop starts.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use sitekeeper_config::AgentConfig;

use crate::certs::{
    CertificateIssuer, CertificateMonitor, LocalIssuer, MonitorHandle, MonitorSettings,
};
use crate::jobs::{Job, JobError, JobProcessor, JobWorkerPool};
use crate::metrics::Metrics;
use crate::notify::{LogNotifier, NotificationDispatcher, Notifier, WebhookNotifier};
use crate::signals::SignalType;
use crate::state::{secrets, CertificateStore, LocalStateStore, StateEvent, StateStore};
use crate::sync::{
    AppManager, ManifestAppManager, ManifestWebServer, RunStatus, SyncEngine, WebServer,
};

/// Collaborators the agent is assembled from
pub struct Components {
    pub store: Arc<dyn StateStore>,
    pub issuer: Arc<dyn CertificateIssuer>,
    pub notifier: Arc<dyn Notifier>,
    pub apps: Arc<dyn AppManager>,
    pub webserver: Arc<dyn WebServer>,
}

impl Components {
    /// Build the production collaborators described by `config`
    pub async fn from_config(config: &AgentConfig) -> Result<Self> {
        let secret_store =
            secrets::from_backend(&config.secrets).context("Failed to open secret store")?;
        let certificates = CertificateStore::new(secret_store);

        let store: Arc<dyn StateStore> = match config.state.path {
            Some(ref path) => Arc::new(
                LocalStateStore::open(path, certificates)
                    .await
                    .with_context(|| format!("Failed to open state file {}", path.display()))?,
            ),
            None => {
                warn!("No state path configured, declared state will not survive restarts");
                Arc::new(LocalStateStore::in_memory(certificates))
            }
        };

        let validity_days = u64::try_from(config.certificates.self_signed_validity_days)
            .context("self-signed-validity-days must be positive")?;
        let validity_secs = validity_days
            .checked_mul(86400)
            .context("self-signed-validity-days is out of range")?;
        let issuer = LocalIssuer::new().with_validity(Duration::from_secs(validity_secs));

        let notifier: Arc<dyn Notifier> = match config.notifications.webhook {
            Some(ref url) => {
                Arc::new(WebhookNotifier::new(url).context("Failed to build webhook client")?)
            }
            None => Arc::new(LogNotifier),
        };

        Ok(Self {
            store,
            issuer: Arc::new(issuer),
            notifier,
            apps: Arc::new(ManifestAppManager::new(config.apps.manifest.clone())),
            webserver: Arc::new(ManifestWebServer::new(
                config.webserver.manifest.clone(),
                config.webserver.restart_command.clone(),
            )),
        })
    }
}

/// A running node
pub struct Agent {
    node_name: String,
    store: Arc<dyn StateStore>,
    engine: Arc<SyncEngine>,
    monitor: Arc<CertificateMonitor>,
    monitor_handle: MonitorHandle,
    monitor_rx: Option<mpsc::Receiver<()>>,
    jobs: JobWorkerPool,
    metrics: Arc<Metrics>,
    resync_interval: Option<Duration>,
    shutdown: CancellationToken,
}

impl Agent {
    /// Assemble an agent; no background work starts until [`run`](Self::run)
    pub fn new(
        config: &AgentConfig,
        components: Components,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let metrics = Arc::new(Metrics::new()?);

        let engine = SyncEngine::new(
            components.store.clone(),
            components.apps,
            components.webserver,
        )
        .with_restart_settle(Duration::from_millis(config.sync.restart_settle_ms))
        .with_shutdown(shutdown.clone())
        .with_metrics(metrics.clone());

        let notifications =
            NotificationDispatcher::new(components.notifier, config.notifications.max_in_flight)
                .with_metrics(metrics.clone());
        let monitor = CertificateMonitor::new(
            components.store.clone(),
            components.issuer.clone(),
            notifications,
            MonitorSettings::from(&config.certificates),
        )
        .with_metrics(metrics.clone());
        let (monitor_handle, monitor_rx) = MonitorHandle::channel();

        let processor = JobProcessor::new(components.issuer, components.store.clone());
        let jobs = JobWorkerPool::start(
            Arc::new(processor),
            config.jobs.workers,
            config.jobs.queue_depth,
        );

        let resync_interval =
            (config.sync.interval_secs > 0).then(|| Duration::from_secs(config.sync.interval_secs));

        Ok(Self {
            node_name: config.node.name.clone(),
            store: components.store,
            engine: Arc::new(engine),
            monitor: Arc::new(monitor),
            monitor_handle,
            monitor_rx: Some(monitor_rx),
            jobs,
            metrics,
            resync_interval,
            shutdown,
        })
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub fn monitor(&self) -> &Arc<CertificateMonitor> {
        &self.monitor
    }

    pub fn monitor_handle(&self) -> MonitorHandle {
        self.monitor_handle.clone()
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn status(&self) -> RunStatus {
        self.engine.status()
    }

    /// Queue a certificate issuance job
    ///
    /// This is the enqueue hook for whatever front end hands jobs to the
    /// node, such as a control API. The agent itself never creates jobs;
    /// `sitekeeper issue` runs a [`JobProcessor`] directly instead.
    pub fn submit_job(&self, job: Job) -> Result<(), JobError> {
        self.jobs.submit(job)
    }

    /// Run until shutdown
    ///
    /// Performs the startup sync, starts the certificate monitor, then
    /// dispatches state events, signals and timer ticks.
    pub async fn run(mut self, mut signals: mpsc::UnboundedReceiver<SignalType>) -> Result<()> {
        info!(node = %self.node_name, "Starting agent");

        let mut subscription = self.store.subscribe();

        info!("Running startup sync");
        if let Err(e) = self.engine.run_sync().await {
            // The next trigger retries from scratch
            error!(error = %e, "Startup sync failed");
        }

        let monitor_rx = self
            .monitor_rx
            .take()
            .context("Agent event loop already started")?;
        let monitor = Arc::clone(&self.monitor);
        let monitor_shutdown = self.shutdown.clone();
        let monitor_task =
            tokio::spawn(async move { monitor.run(monitor_rx, monitor_shutdown).await });
        self.monitor_handle.refresh();

        let mut resync =
            tokio::time::interval(self.resync_interval.unwrap_or(Duration::from_secs(3600)));
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);
        resync.tick().await;
        let resync_enabled = self.resync_interval.is_some();

        let mut signals_open = true;
        let mut events_open = true;

        info!(node = %self.node_name, "Agent ready");

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    info!("Shutdown requested");
                    break;
                }
                event = subscription.recv(), if events_open => match event {
                    Some(StateEvent::SitesChanged { certificates_added }) => {
                        info!("Received new state, triggering a re-sync");
                        self.engine.trigger_run();
                        if certificates_added {
                            self.monitor_handle.refresh();
                        }
                    }
                    Some(StateEvent::CertificateReplaced { old, new }) => {
                        debug!(old = %old, new = %new, "Certificate replaced, triggering a re-sync");
                        self.engine.trigger_run();
                    }
                    None => {
                        warn!("State store closed its event stream");
                        events_open = false;
                    }
                },
                signal = signals.recv(), if signals_open => match signal {
                    Some(SignalType::Sync) => self.engine.trigger_run(),
                    Some(SignalType::RefreshCertificates) => {
                        self.monitor_handle.refresh();
                    }
                    Some(SignalType::Shutdown) => self.shutdown.cancel(),
                    None => signals_open = false,
                },
                _ = resync.tick(), if resync_enabled => {
                    debug!("Periodic re-sync");
                    self.engine.trigger_run();
                }
            }
        }

        subscription.unsubscribe();
        self.jobs.shutdown().await;
        if let Err(e) = monitor_task.await {
            warn!(error = %e, "Certificate monitor ended abnormally");
        }

        info!(node = %self.node_name, "Agent stopped");
        Ok(())
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("node", &self.node_name)
            .field("engine", &self.engine)
            .field("jobs", &self.jobs)
            .finish_non_exhaustive()
    }
}
