//! Agent metrics.
//!
//! Counters for reconciliation runs, server restarts, certificate renewals
//! and notifications, kept in a private registry so several agents (or
//! tests) can live in one process.

use anyhow::{Context, Result};
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

use sitekeeper_common::CertificateType;

/// Agent metrics collector
pub struct Metrics {
    registry: Registry,

    /// Reconciliation runs started
    sync_runs: IntCounter,

    /// Reconciliation runs that ended in an error
    sync_failures: IntCounter,

    /// Web-server restarts requested
    restarts: IntCounter,

    /// Certificates replaced by a renewed one
    /// Labels: type
    cert_renewals: IntCounterVec,

    /// Failed renewal attempts
    /// Labels: type
    cert_renewal_failures: IntCounterVec,

    /// Expiry notifications dispatched
    notifications: IntCounter,
}

impl Metrics {
    /// Create the counters and register them with a fresh registry
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let sync_runs = IntCounter::new(
            "sitekeeper_sync_runs_total",
            "Total number of reconciliation runs",
        )
        .context("Failed to create sync_runs metric")?;
        let sync_failures = IntCounter::new(
            "sitekeeper_sync_failures_total",
            "Reconciliation runs that failed",
        )
        .context("Failed to create sync_failures metric")?;
        let restarts = IntCounter::new(
            "sitekeeper_restarts_total",
            "Web-server restarts requested by reconciliation",
        )
        .context("Failed to create restarts metric")?;
        let cert_renewals = IntCounterVec::new(
            Opts::new(
                "sitekeeper_cert_renewals_total",
                "Certificates renewed and swapped into declared state",
            ),
            &["type"],
        )
        .context("Failed to create cert_renewals metric")?;
        let cert_renewal_failures = IntCounterVec::new(
            Opts::new(
                "sitekeeper_cert_renewal_failures_total",
                "Certificate renewals that failed",
            ),
            &["type"],
        )
        .context("Failed to create cert_renewal_failures metric")?;
        let notifications = IntCounter::new(
            "sitekeeper_notifications_total",
            "Certificate expiry notifications dispatched",
        )
        .context("Failed to create notifications metric")?;

        registry.register(Box::new(sync_runs.clone()))?;
        registry.register(Box::new(sync_failures.clone()))?;
        registry.register(Box::new(restarts.clone()))?;
        registry.register(Box::new(cert_renewals.clone()))?;
        registry.register(Box::new(cert_renewal_failures.clone()))?;
        registry.register(Box::new(notifications.clone()))?;

        Ok(Self {
            registry,
            sync_runs,
            sync_failures,
            restarts,
            cert_renewals,
            cert_renewal_failures,
            notifications,
        })
    }

    pub fn record_sync_run(&self) {
        self.sync_runs.inc();
    }

    pub fn record_sync_failure(&self) {
        self.sync_failures.inc();
    }

    pub fn record_restart(&self) {
        self.restarts.inc();
    }

    pub fn record_renewal(&self, cert_type: CertificateType) {
        self.cert_renewals
            .with_label_values(&[cert_type.as_str()])
            .inc();
    }

    pub fn record_renewal_failure(&self, cert_type: CertificateType) {
        self.cert_renewal_failures
            .with_label_values(&[cert_type.as_str()])
            .inc();
    }

    pub fn record_notification(&self) {
        self.notifications.inc();
    }

    /// Render every metric in the Prometheus text exposition format
    pub fn gather_text(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .context("Failed to encode metrics")?;
        String::from_utf8(buffer).context("Metrics output is not UTF-8")
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("sync_runs", &self.sync_runs.get())
            .field("sync_failures", &self.sync_failures.get())
            .field("restarts", &self.restarts.get())
            .field("notifications", &self.notifications.get())
            .finish_non_exhaustive()
    }
}
