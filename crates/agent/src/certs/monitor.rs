//! Certificate monitor
//!
//! Scans every declared site on a long interval and on demand:
//!
//! - Generated certificates are renewed before they expire. Self-signed
//!   certificates renew [`MonitorSettings::self_signed_min_days`] ahead of
//!   expiry, ACME certificates [`MonitorSettings::acme_min_days`] ahead. A
//!   site that asks for ACME while holding a self-signed certificate is
//!   upgraded right away.
//! - Imported certificates are never renewed. Operators are notified as
//!   expiry approaches, at most once per threshold in
//!   [`NOTIFICATION_THRESHOLDS`].
//!
//! A renewed certificate is stored under a new ID and swapped into every
//! site through [`StateStore::replace_certificate`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use sitekeeper_common::{CertificateId, CertificateRecord, CertificateType, Site};
use sitekeeper_config::CertificatesConfig;

use super::issuer::CertificateIssuer;
use super::x509::parse_certificate;
use crate::metrics::Metrics;
use crate::notify::NotificationDispatcher;
use crate::state::StateStore;

/// Days before (positive) or after (negative) expiry at which imported
/// certificates trigger a notification, most urgent first
pub const NOTIFICATION_THRESHOLDS: [i64; 9] = [-2, -1, 0, 1, 2, 3, 7, 14, 30];

/// Default scan interval (24 hours)
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(24 * 3600);

/// Minimum scan interval (1 minute)
const MIN_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Renewal thresholds and scan cadence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorSettings {
    pub check_interval: Duration,
    /// Renew self-signed certificates expiring within this many days
    pub self_signed_min_days: i64,
    /// Renew ACME certificates expiring within this many days
    pub acme_min_days: i64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            check_interval: DEFAULT_CHECK_INTERVAL,
            self_signed_min_days: 60,
            acme_min_days: 21,
        }
    }
}

impl From<&CertificatesConfig> for MonitorSettings {
    fn from(config: &CertificatesConfig) -> Self {
        Self {
            check_interval: Duration::from_secs(config.check_interval_secs),
            self_signed_min_days: config.self_signed_min_days,
            acme_min_days: config.acme_min_days,
        }
    }
}

/// Outcome counts of one scan
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    /// Certificates renewed and swapped in
    pub renewed: usize,
    /// Renewals that failed; the old certificate stays in place
    pub failed: usize,
    /// Notifications sent for imported certificates
    pub notified: usize,
    /// Certificates that could not be loaded
    pub skipped: usize,
}

enum Inspection {
    Current,
    Renewed(CertificateId),
    Failed,
    Skipped,
}

// ============================================================================
// Refresh handle
// ============================================================================

/// Requests an out-of-schedule scan
///
/// Requests made while one is already pending are merged into it.
#[derive(Debug, Clone)]
pub struct MonitorHandle {
    tx: mpsc::Sender<()>,
}

impl MonitorHandle {
    /// Create a handle and the receiver to pass to [`CertificateMonitor::run`]
    pub fn channel() -> (Self, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel(1);
        (Self { tx }, rx)
    }

    /// Ask for a scan; `false` once the monitor has stopped
    pub fn refresh(&self) -> bool {
        match self.tx.try_send(()) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(())) => true,
            Err(mpsc::error::TrySendError::Closed(())) => false,
        }
    }
}

// ============================================================================
// Notification ladder
// ============================================================================

/// Index of the most urgent threshold `not_after` has crossed at `now`
pub fn crossed_threshold(not_after: DateTime<Utc>, now: DateTime<Utc>) -> Option<usize> {
    NOTIFICATION_THRESHOLDS
        .iter()
        .position(|days| not_after < now + chrono::Duration::days(*days))
}

/// Text sent for threshold `index` of [`NOTIFICATION_THRESHOLDS`]
pub fn notification_message(domain: &str, index: usize) -> String {
    let days = NOTIFICATION_THRESHOLDS.get(index).copied().unwrap_or(0);
    let when = match days {
        -2 => "has expired over 2 days ago".to_string(),
        -1 => "has expired 1 day ago".to_string(),
        0 => "has expired today".to_string(),
        1 => "is expiring today".to_string(),
        n => format!("expires in {n} days"),
    };
    format!("Certificate for {domain} {when}")
}

// ============================================================================
// Monitor
// ============================================================================

/// Periodic and on-demand certificate scanner
pub struct CertificateMonitor {
    store: Arc<dyn StateStore>,
    issuer: Arc<dyn CertificateIssuer>,
    notifications: NotificationDispatcher,
    settings: MonitorSettings,
    /// Primary domain -> most urgent threshold index already notified
    watermarks: Mutex<HashMap<String, usize>>,
    metrics: Option<Arc<Metrics>>,
}

impl CertificateMonitor {
    pub fn new(
        store: Arc<dyn StateStore>,
        issuer: Arc<dyn CertificateIssuer>,
        notifications: NotificationDispatcher,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            store,
            issuer,
            notifications,
            settings,
            watermarks: Mutex::new(HashMap::new()),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn settings(&self) -> &MonitorSettings {
        &self.settings
    }

    pub fn notifications(&self) -> &NotificationDispatcher {
        &self.notifications
    }

    /// Threshold index last notified for `domain`
    pub fn watermark(&self, domain: &str) -> Option<usize> {
        self.watermarks.lock().get(domain).copied()
    }

    /// Run the monitor until `shutdown` fires
    ///
    /// The ticker's immediate first tick is swallowed; the initial scan is
    /// expected to come from a refresh request.
    pub async fn run(&self, mut refresh: mpsc::Receiver<()>, shutdown: CancellationToken) {
        let check_interval = self.settings.check_interval.max(MIN_CHECK_INTERVAL);
        info!(
            check_interval_secs = check_interval.as_secs(),
            "Starting certificate monitor"
        );

        let mut ticker = tokio::time::interval(check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        let mut refresh_open = true;
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("Certificate monitor shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    debug!("Running scheduled certificate scan");
                }
                received = refresh.recv(), if refresh_open => {
                    if received.is_none() {
                        refresh_open = false;
                        continue;
                    }
                    debug!("Running requested certificate scan");
                }
            }

            self.scan().await;
        }
    }

    /// Scan every site now
    pub async fn scan(&self) -> ScanReport {
        self.scan_at(Utc::now()).await
    }

    /// Scan every site as of `now`
    pub async fn scan_at(&self, now: DateTime<Utc>) -> ScanReport {
        let mut report = ScanReport::default();

        if !self.store.is_leader() {
            debug!("Not the leader, skipping certificate scan");
            return report;
        }

        let sites = match self.store.get_sites().await {
            Ok(sites) => sites,
            Err(e) => {
                error!(error = %e, "Failed to load sites for certificate scan");
                return report;
            }
        };

        info!(sites = sites.len(), "Starting certificate scan");

        // Old ID -> new ID for certificates renewed during this scan
        let mut renewed: HashMap<CertificateId, CertificateId> = HashMap::new();

        for site in &sites {
            let domains = site.domains();

            if let Some(ref id) = site.generated_cert_id {
                if let Some(new_id) = renewed.get(id) {
                    debug!(
                        domain = %site.domain,
                        certificate_id = %new_id,
                        "Certificate already renewed in this scan"
                    );
                } else {
                    match self.inspect_generated(site, id, &domains, now).await {
                        Inspection::Current => {}
                        Inspection::Renewed(new_id) => {
                            renewed.insert(id.clone(), new_id);
                            report.renewed += 1;
                        }
                        Inspection::Failed => report.failed += 1,
                        Inspection::Skipped => report.skipped += 1,
                    }
                }
            }

            if let Some(ref id) = site.imported_cert_id {
                match self.load(id).await {
                    Some(record) => {
                        if self.inspect_imported(&site.domain, &record, now) {
                            report.notified += 1;
                        }
                    }
                    None => report.skipped += 1,
                }
            }
        }

        info!(
            renewed = report.renewed,
            failed = report.failed,
            notified = report.notified,
            skipped = report.skipped,
            "Certificate scan complete"
        );
        report
    }

    /// Load a certificate record, logging and swallowing failures
    async fn load(&self, id: &CertificateId) -> Option<CertificateRecord> {
        match self.store.get_certificate(id).await {
            Ok((record, _)) => Some(record),
            Err(e) if e.is_not_found() => {
                warn!(certificate_id = %id, "Certificate not found");
                None
            }
            Err(e) => {
                warn!(certificate_id = %id, error = %e, "Failed to load certificate");
                None
            }
        }
    }

    async fn inspect_generated(
        &self,
        site: &Site,
        id: &CertificateId,
        domains: &[String],
        now: DateTime<Utc>,
    ) -> Inspection {
        let Some(record) = self.load(id).await else {
            return Inspection::Skipped;
        };

        let (cert_type, due) = if site.use_acme {
            let expiring = record.expires_within(now, self.settings.acme_min_days);
            (CertificateType::Acme, expiring || record.is_self_signed())
        } else {
            let expiring = record.expires_within(now, self.settings.self_signed_min_days);
            (CertificateType::SelfSigned, expiring)
        };

        if !due {
            debug!(
                domain = %site.domain,
                certificate_id = %id,
                expires = %record.not_after,
                "Certificate is still valid"
            );
            return Inspection::Current;
        }

        info!(
            domain = %site.domain,
            certificate_id = %id,
            expires = %record.not_after,
            cert_type = %cert_type,
            "Certificate needs renewal"
        );

        match self.renew(id, cert_type, domains).await {
            Ok(None) => {
                info!(
                    domain = %site.domain,
                    certificate_id = %id,
                    "Certificate no longer in use, discarded its replacement"
                );
                Inspection::Current
            }
            Ok(Some(new_id)) => {
                info!(
                    domain = %site.domain,
                    old = %id,
                    new = %new_id,
                    "Certificate renewed successfully"
                );
                if let Some(ref metrics) = self.metrics {
                    metrics.record_renewal(cert_type);
                }
                Inspection::Renewed(new_id)
            }
            Err(e) => {
                error!(
                    domain = %site.domain,
                    certificate_id = %id,
                    error = %e,
                    "Certificate renewal failed"
                );
                if let Some(ref metrics) = self.metrics {
                    metrics.record_renewal_failure(cert_type);
                }
                Inspection::Failed
            }
        }
    }

    /// Issue, store and swap in a replacement for `old`
    ///
    /// Returns `None` when no site references `old` any more. The new
    /// certificate is deleted whenever it didn't make it into declared state.
    async fn renew(
        &self,
        old: &CertificateId,
        cert_type: CertificateType,
        domains: &[String],
    ) -> anyhow::Result<Option<CertificateId>> {
        let issued = match cert_type {
            CertificateType::Acme => self.issuer.generate_acme(domains).await?,
            _ => self.issuer.generate_self_signed(domains).await?,
        };

        let new_id = CertificateId::generate();
        let record = parse_certificate(&new_id, cert_type, &issued.cert_pem)?;
        self.store
            .set_certificate(&record, &issued.key_pem, &issued.cert_pem)
            .await?;

        match self.store.replace_certificate(old, &new_id).await {
            Ok(0) => {
                self.discard(&new_id).await;
                Ok(None)
            }
            Ok(_) => Ok(Some(new_id)),
            Err(e) => {
                self.discard(&new_id).await;
                Err(e.into())
            }
        }
    }

    async fn discard(&self, id: &CertificateId) {
        if let Err(e) = self.store.delete_certificate(id).await {
            warn!(certificate_id = %id, error = %e, "Failed to delete unused certificate");
        }
    }

    /// Advance the notification ladder for an imported certificate
    ///
    /// Returns `true` if a notification was dispatched.
    fn inspect_imported(&self, domain: &str, record: &CertificateRecord, now: DateTime<Utc>) -> bool {
        // The watermark only ever moves toward more urgent thresholds
        let Some(index) = crossed_threshold(record.not_after, now) else {
            return false;
        };

        {
            let mut watermarks = self.watermarks.lock();
            let sent = watermarks
                .get(domain)
                .copied()
                .unwrap_or(NOTIFICATION_THRESHOLDS.len());
            if index >= sent {
                return false;
            }
            watermarks.insert(domain.to_string(), index);
        }

        let message = notification_message(domain, index);
        info!(
            domain = %domain,
            certificate_id = %record.id,
            threshold_days = NOTIFICATION_THRESHOLDS[index],
            "Sending certificate expiry notification"
        );
        self.notifications.dispatch(message);
        true
    }
}

impl std::fmt::Debug for CertificateMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateMonitor")
            .field("settings", &self.settings)
            .field("watermarks", &self.watermarks.lock().len())
            .finish_non_exhaustive()
    }
}
