//! Shared test utilities for integration tests
//!
//! In-memory fakes for the collaborators the agent talks to, plus helpers
//! for seeding stores with certificates.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use parking_lot::Mutex;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};

use sitekeeper_agent::certs::{AcmeProvider, IssueError, IssuedPem};
use sitekeeper_agent::state::{CertificateStore, LocalStateStore, MemorySecretStore};
use sitekeeper_agent::sync::{AppManager, WebServer};
use sitekeeper_agent::{Notifier, NotifyError, StateStore};
use sitekeeper_common::{CertificateId, CertificateRecord, CertificateType, Site};

/// Issuer organization used by the fake ACME provider
pub const TEST_ACME_ISSUER: &str = "Test ACME CA";

/// In-memory state store and the secret store behind it
pub fn memory_store() -> (Arc<MemorySecretStore>, Arc<LocalStateStore>) {
    let secrets = Arc::new(MemorySecretStore::new());
    let store = Arc::new(LocalStateStore::in_memory(CertificateStore::new(
        secrets.clone(),
    )));
    (secrets, store)
}

/// Store a certificate record with placeholder PEM blobs
pub async fn seed_certificate(
    store: &LocalStateStore,
    id: &str,
    cert_type: CertificateType,
    not_after: DateTime<Utc>,
    issuer_org: Option<&str>,
) -> CertificateId {
    let record = CertificateRecord {
        id: CertificateId::new(id),
        cert_type,
        not_before: not_after - chrono::Duration::days(365),
        not_after,
        issuer_org: issuer_org.map(str::to_string),
        subjects: vec![],
    };
    store
        .set_certificate(&record, b"test key", b"test cert")
        .await
        .unwrap();
    record.id
}

pub fn site_with_generated(domain: &str, id: &CertificateId, use_acme: bool) -> Site {
    Site {
        generated_cert_id: Some(id.clone()),
        use_acme,
        ..Site::new(domain)
    }
}

pub fn site_with_imported(domain: &str, id: &CertificateId) -> Site {
    Site {
        imported_cert_id: Some(id.clone()),
        ..Site::new(domain)
    }
}

/// Poll `check` until it passes or five seconds elapse
pub async fn wait_for(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ============================================================================
// Notifier
// ============================================================================

#[derive(Default)]
pub struct RecordingNotifier {
    messages: Mutex<Vec<String>>,
    delay: Duration,
}

impl RecordingNotifier {
    /// Notifier that takes `delay` to deliver each message
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, message: &str) -> Result<(), NotifyError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.messages.lock().push(message.to_string());
        Ok(())
    }
}

// ============================================================================
// ACME
// ============================================================================

/// ACME provider that mints 90-day certificates locally
#[derive(Default)]
pub struct FakeAcme {
    orders: AtomicUsize,
    fail: AtomicBool,
}

impl FakeAcme {
    pub fn orders(&self) -> usize {
        self.orders.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl AcmeProvider for FakeAcme {
    async fn order(&self, domains: &[String]) -> Result<IssuedPem, IssueError> {
        self.orders.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(IssueError::Acme("order rejected".to_string()));
        }

        let mut params = CertificateParams::new(domains.to_vec())?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, domains[0].as_str());
        dn.push(DnType::OrganizationName, TEST_ACME_ISSUER);
        params.distinguished_name = dn;

        let today = Utc::now().date_naive();
        let expiry = today + chrono::Duration::days(90);
        params.not_before =
            rcgen::date_time_ymd(today.year(), today.month() as u8, today.day() as u8);
        params.not_after =
            rcgen::date_time_ymd(expiry.year(), expiry.month() as u8, expiry.day() as u8);

        let key_pair = KeyPair::generate()?;
        let cert = params.self_signed(&key_pair)?;
        Ok(IssuedPem {
            key_pem: key_pair.serialize_pem().into_bytes(),
            cert_pem: cert.pem().into_bytes(),
        })
    }
}

// ============================================================================
// Collaborators
// ============================================================================

/// Tracks overlapping calls across the fake collaborators
#[derive(Default)]
pub struct CallLog {
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    events: Mutex<Vec<&'static str>>,
}

impl CallLog {
    fn enter(&self, event: &'static str) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.events.lock().push(event);
    }

    fn exit(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> Vec<&'static str> {
        self.events.lock().clone()
    }

    pub fn count(&self, event: &str) -> usize {
        self.events.lock().iter().filter(|e| **e == event).count()
    }
}

/// App manager reporting a fixed result after an optional delay
pub struct FakeApps {
    pub log: Arc<CallLog>,
    pub changed: AtomicBool,
    pub fail: AtomicBool,
    pub delay: Duration,
}

impl FakeApps {
    pub fn new(log: Arc<CallLog>) -> Self {
        Self {
            log,
            changed: AtomicBool::new(false),
            fail: AtomicBool::new(false),
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl AppManager for FakeApps {
    async fn converge(&self, _sites: &[Site]) -> anyhow::Result<bool> {
        self.log.enter("apps");
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.log.exit();
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("app bundle unavailable");
        }
        Ok(self.changed.load(Ordering::SeqCst))
    }
}

/// Web server reporting a fixed result and counting restarts
pub struct FakeWebServer {
    pub log: Arc<CallLog>,
    pub changed: AtomicBool,
    pub fail: AtomicBool,
}

impl FakeWebServer {
    pub fn new(log: Arc<CallLog>) -> Self {
        Self {
            log,
            changed: AtomicBool::new(false),
            fail: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl WebServer for FakeWebServer {
    async fn converge(&self, _sites: &[Site]) -> anyhow::Result<bool> {
        self.log.enter("webserver");
        self.log.exit();
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("config template failed");
        }
        Ok(self.changed.load(Ordering::SeqCst))
    }

    async fn restart(&self) -> anyhow::Result<()> {
        self.log.enter("restart");
        self.log.exit();
        Ok(())
    }
}
