//! Certificate monitor integration tests

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tempfile::TempDir;

use sitekeeper_agent::certs::{
    CertificateIssuer, CertificateMonitor, IssueError, IssuedPem, LocalIssuer, MonitorSettings,
    ScanReport,
};
use sitekeeper_agent::state::{CertificateStore, MemorySecretStore};
use sitekeeper_agent::{LocalStateStore, NotificationDispatcher, StateStore};
use sitekeeper_common::{CertificateId, CertificateType, Site, SELF_SIGNED_ISSUER};

use common::{
    memory_store, seed_certificate, site_with_generated, site_with_imported, FakeAcme,
    RecordingNotifier, TEST_ACME_ISSUER,
};

struct Harness {
    store: Arc<LocalStateStore>,
    acme: Arc<FakeAcme>,
    notifier: Arc<RecordingNotifier>,
    monitor: CertificateMonitor,
}

fn harness(with_acme: bool) -> Harness {
    let (_secrets, store) = memory_store();
    let acme = Arc::new(FakeAcme::default());
    let notifier = Arc::new(RecordingNotifier::default());

    let mut issuer = LocalIssuer::new();
    if with_acme {
        issuer = issuer.with_acme_provider(acme.clone());
    }

    let monitor = CertificateMonitor::new(
        store.clone(),
        Arc::new(issuer),
        NotificationDispatcher::new(notifier.clone(), 8),
        MonitorSettings::default(),
    );

    Harness {
        store,
        acme,
        notifier,
        monitor,
    }
}

impl Harness {
    async fn generated_id(&self, domain: &str) -> CertificateId {
        let sites = self.store.get_sites().await.unwrap();
        sites
            .into_iter()
            .find(|s| s.domain == domain)
            .and_then(|s| s.generated_cert_id)
            .unwrap()
    }
}

#[tokio::test]
async fn test_self_signed_renewed_inside_threshold() {
    let h = harness(false);
    let now = Utc::now();
    let min_days = h.monitor.settings().self_signed_min_days;

    let old = seed_certificate(
        &h.store,
        "old",
        CertificateType::SelfSigned,
        now + Duration::days(min_days - 1),
        Some(SELF_SIGNED_ISSUER),
    )
    .await;
    h.store
        .set_sites(vec![site_with_generated("a.com", &old, false)])
        .await
        .unwrap();

    let report = h.monitor.scan_at(now).await;
    assert_eq!(report.renewed, 1);

    let new = h.generated_id("a.com").await;
    assert_ne!(new, old);
    let (record, _) = h.store.get_certificate(&new).await.unwrap();
    assert_eq!(record.cert_type, CertificateType::SelfSigned);
    assert!(record.is_self_signed());
    assert!(record.not_after > now + Duration::days(min_days));
    assert!(h.store.get_certificate(&old).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_self_signed_kept_outside_threshold() {
    let h = harness(false);
    let now = Utc::now();
    let min_days = h.monitor.settings().self_signed_min_days;

    let id = seed_certificate(
        &h.store,
        "fresh",
        CertificateType::SelfSigned,
        now + Duration::days(min_days + 1),
        Some(SELF_SIGNED_ISSUER),
    )
    .await;
    h.store
        .set_sites(vec![site_with_generated("a.com", &id, false)])
        .await
        .unwrap();

    assert_eq!(h.monitor.scan_at(now).await, ScanReport::default());
    assert_eq!(h.generated_id("a.com").await, id);
}

#[tokio::test]
async fn test_acme_site_upgrades_self_signed_regardless_of_expiry() {
    let h = harness(true);
    let now = Utc::now();

    let id = seed_certificate(
        &h.store,
        "selfsigned",
        CertificateType::SelfSigned,
        now + Duration::days(300),
        Some(SELF_SIGNED_ISSUER),
    )
    .await;
    h.store
        .set_sites(vec![site_with_generated("a.com", &id, true)])
        .await
        .unwrap();

    let report = h.monitor.scan_at(now).await;
    assert_eq!(report.renewed, 1);
    assert_eq!(h.acme.orders(), 1);

    let new = h.generated_id("a.com").await;
    let (record, _) = h.store.get_certificate(&new).await.unwrap();
    assert_eq!(record.cert_type, CertificateType::Acme);
    assert_eq!(record.issuer_org.as_deref(), Some(TEST_ACME_ISSUER));

    // The ACME certificate is good for 90 days, well outside the window
    assert_eq!(h.monitor.scan_at(now).await.renewed, 0);
    assert_eq!(h.acme.orders(), 1);
}

#[tokio::test]
async fn test_acme_renewed_inside_threshold() {
    let h = harness(true);
    let now = Utc::now();
    let acme_min_days = h.monitor.settings().acme_min_days;

    let id = seed_certificate(
        &h.store,
        "acme-old",
        CertificateType::Acme,
        now + Duration::days(acme_min_days - 1),
        Some(TEST_ACME_ISSUER),
    )
    .await;
    h.store
        .set_sites(vec![site_with_generated("a.com", &id, true)])
        .await
        .unwrap();

    assert_eq!(h.monitor.scan_at(now).await.renewed, 1);
    assert_eq!(h.acme.orders(), 1);
}

#[tokio::test]
async fn test_failed_issuance_keeps_existing_certificate() {
    let h = harness(true);
    h.acme.set_failing(true);
    let now = Utc::now();

    let id = seed_certificate(
        &h.store,
        "expiring",
        CertificateType::Acme,
        now + Duration::days(2),
        Some(TEST_ACME_ISSUER),
    )
    .await;
    let fresh = seed_certificate(
        &h.store,
        "fresh",
        CertificateType::SelfSigned,
        now + Duration::days(10),
        Some(SELF_SIGNED_ISSUER),
    )
    .await;
    h.store
        .set_sites(vec![
            site_with_generated("a.com", &id, true),
            site_with_generated("b.com", &fresh, false),
        ])
        .await
        .unwrap();

    let report = h.monitor.scan_at(now).await;
    assert_eq!(report.failed, 1);
    // The failure doesn't stop the scan from reaching the next site
    assert_eq!(report.renewed, 1);

    assert_eq!(h.generated_id("a.com").await, id);
    assert!(h.store.get_certificate(&id).await.is_ok());
    assert_ne!(h.generated_id("b.com").await, fresh);
}

#[tokio::test]
async fn test_acme_unavailable_is_a_failed_renewal() {
    let h = harness(false);
    let now = Utc::now();

    let id = seed_certificate(
        &h.store,
        "selfsigned",
        CertificateType::SelfSigned,
        now + Duration::days(300),
        Some(SELF_SIGNED_ISSUER),
    )
    .await;
    h.store
        .set_sites(vec![site_with_generated("a.com", &id, true)])
        .await
        .unwrap();

    assert_eq!(h.monitor.scan_at(now).await.failed, 1);
    assert_eq!(h.generated_id("a.com").await, id);
}

#[tokio::test]
async fn test_shared_certificate_renewed_once() {
    let h = harness(false);
    let now = Utc::now();

    let id = seed_certificate(
        &h.store,
        "shared",
        CertificateType::SelfSigned,
        now + Duration::days(1),
        Some(SELF_SIGNED_ISSUER),
    )
    .await;
    h.store
        .set_sites(vec![
            site_with_generated("a.com", &id, false),
            site_with_generated("b.com", &id, false),
        ])
        .await
        .unwrap();

    assert_eq!(h.monitor.scan_at(now).await.renewed, 1);
    let a = h.generated_id("a.com").await;
    let b = h.generated_id("b.com").await;
    assert_eq!(a, b);
    assert_ne!(a, id);
}

#[tokio::test]
async fn test_missing_certificate_is_skipped() {
    let h = harness(false);
    let now = Utc::now();

    let expiring = seed_certificate(
        &h.store,
        "expiring",
        CertificateType::SelfSigned,
        now + Duration::days(1),
        Some(SELF_SIGNED_ISSUER),
    )
    .await;
    h.store
        .set_sites(vec![
            site_with_generated("ghost.com", &CertificateId::new("ghost"), false),
            site_with_generated("a.com", &expiring, false),
        ])
        .await
        .unwrap();

    let report = h.monitor.scan_at(now).await;
    assert_eq!(report.skipped, 1);
    assert_eq!(report.renewed, 1);
}

#[tokio::test]
async fn test_imported_notification_ladder() {
    let h = harness(false);
    let now = Utc::now();

    let id = seed_certificate(
        &h.store,
        "imported",
        CertificateType::Imported,
        now - Duration::hours(25),
        Some("Operator CA"),
    )
    .await;
    h.store
        .set_sites(vec![site_with_imported("a.com", &id)])
        .await
        .unwrap();

    assert_eq!(h.monitor.scan_at(now).await.notified, 1);
    h.monitor.notifications().flush().await;
    assert_eq!(
        h.notifier.messages(),
        vec!["Certificate for a.com has expired 1 day ago"]
    );

    // Same threshold again: nothing new
    assert_eq!(h.monitor.scan_at(now).await.notified, 0);

    // Three days past expiry
    let later = now + Duration::days(2);
    assert_eq!(h.monitor.scan_at(later).await.notified, 1);
    h.monitor.notifications().flush().await;
    assert_eq!(
        h.notifier.messages(),
        vec![
            "Certificate for a.com has expired 1 day ago",
            "Certificate for a.com has expired over 2 days ago",
        ]
    );

    assert_eq!(h.monitor.scan_at(later).await.notified, 0);
    // Imported certificates are never renewed
    let sites = h.store.get_sites().await.unwrap();
    assert_eq!(sites[0].imported_cert_id.as_ref(), Some(&id));
}

#[tokio::test]
async fn test_imported_ladder_skips_to_most_urgent_threshold() {
    let h = harness(false);
    let now = Utc::now();

    let id = seed_certificate(
        &h.store,
        "imported",
        CertificateType::Imported,
        now + Duration::days(5),
        None,
    )
    .await;
    h.store
        .set_sites(vec![site_with_imported("a.com", &id)])
        .await
        .unwrap();

    h.monitor.scan_at(now).await;
    h.monitor.notifications().flush().await;
    assert_eq!(
        h.notifier.messages(),
        vec!["Certificate for a.com expires in 7 days"]
    );

    // Moving back in time never re-sends a less urgent threshold
    h.monitor.scan_at(now - Duration::days(10)).await;
    h.monitor.notifications().flush().await;
    assert_eq!(h.notifier.messages().len(), 1);
}

#[tokio::test]
async fn test_imported_far_from_expiry_sends_nothing() {
    let h = harness(false);
    let now = Utc::now();

    let id = seed_certificate(
        &h.store,
        "imported",
        CertificateType::Imported,
        now + Duration::days(200),
        None,
    )
    .await;
    h.store
        .set_sites(vec![site_with_imported("a.com", &id)])
        .await
        .unwrap();

    assert_eq!(h.monitor.scan_at(now).await.notified, 0);
    assert_eq!(h.monitor.watermark("a.com"), None);
}

#[tokio::test]
async fn test_ladder_never_rewinds_after_reimport() {
    let h = harness(false);
    let now = Utc::now();

    let expiring = seed_certificate(
        &h.store,
        "expiring",
        CertificateType::Imported,
        now + Duration::days(5),
        None,
    )
    .await;
    h.store
        .set_sites(vec![site_with_imported("a.com", &expiring)])
        .await
        .unwrap();
    assert_eq!(h.monitor.scan_at(now).await.notified, 1);
    assert_eq!(h.monitor.watermark("a.com"), Some(6));

    // Operator re-imports a long-lived certificate for the same domain
    let fresh = seed_certificate(
        &h.store,
        "fresh",
        CertificateType::Imported,
        now + Duration::days(200),
        None,
    )
    .await;
    h.store
        .set_sites(vec![site_with_imported("a.com", &fresh)])
        .await
        .unwrap();
    assert_eq!(h.monitor.scan_at(now).await.notified, 0);
    assert_eq!(h.monitor.watermark("a.com"), Some(6));

    // Thresholds already sent for the domain are not sent again
    assert_eq!(
        h.monitor.scan_at(now + Duration::days(190)).await.notified,
        0
    );
    h.monitor.notifications().flush().await;
    assert_eq!(
        h.notifier.messages(),
        vec!["Certificate for a.com expires in 7 days"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_every_crossing_site_is_notified_when_sends_are_slow() {
    let (_secrets, store) = memory_store();
    let notifier = Arc::new(RecordingNotifier::slow(std::time::Duration::from_millis(200)));
    let monitor = CertificateMonitor::new(
        store.clone(),
        Arc::new(LocalIssuer::new()),
        NotificationDispatcher::new(notifier.clone(), 8),
        MonitorSettings::default(),
    );
    let now = Utc::now();

    let mut sites = Vec::new();
    for i in 0..9 {
        let id = seed_certificate(
            &store,
            &format!("imported-{i}"),
            CertificateType::Imported,
            now - Duration::hours(25),
            None,
        )
        .await;
        sites.push(site_with_imported(&format!("s{i}.com"), &id));
    }
    store.set_sites(sites).await.unwrap();

    assert_eq!(monitor.scan_at(now).await.notified, 9);
    monitor.notifications().flush().await;
    assert_eq!(notifier.messages().len(), 9);

    assert_eq!(monitor.scan_at(now).await.notified, 0);
    assert_eq!(monitor.watermark("s8.com"), Some(1));
}

/// Issuer that drops every site from declared state before issuing
struct SitesVanishIssuer {
    store: Arc<LocalStateStore>,
    inner: LocalIssuer,
}

#[async_trait]
impl CertificateIssuer for SitesVanishIssuer {
    async fn generate_self_signed(&self, domains: &[String]) -> Result<IssuedPem, IssueError> {
        self.store.set_sites(Vec::<Site>::new()).await.unwrap();
        self.inner.generate_self_signed(domains).await
    }

    async fn generate_acme(&self, domains: &[String]) -> Result<IssuedPem, IssueError> {
        self.inner.generate_acme(domains).await
    }
}

#[tokio::test]
async fn test_replacement_discarded_when_certificate_no_longer_used() {
    let (secrets, store) = memory_store();
    let monitor = CertificateMonitor::new(
        store.clone(),
        Arc::new(SitesVanishIssuer {
            store: store.clone(),
            inner: LocalIssuer::new(),
        }),
        NotificationDispatcher::new(Arc::new(RecordingNotifier::default()), 8),
        MonitorSettings::default(),
    );
    let now = Utc::now();

    let old = seed_certificate(
        &store,
        "old",
        CertificateType::SelfSigned,
        now + Duration::days(1),
        Some(SELF_SIGNED_ISSUER),
    )
    .await;
    store
        .set_sites(vec![site_with_generated("a.com", &old, false)])
        .await
        .unwrap();

    assert_eq!(monitor.scan_at(now).await, ScanReport::default());
    // Only the old certificate's three blobs remain
    assert_eq!(secrets.len(), 3);
    assert!(store.get_certificate(&old).await.is_ok());
}

#[tokio::test]
async fn test_replacement_discarded_when_swap_fails() {
    let temp_dir = TempDir::new().unwrap();
    let secrets = Arc::new(MemorySecretStore::new());
    let store = Arc::new(
        LocalStateStore::open(
            temp_dir.path().join("state").join("state.json"),
            CertificateStore::new(secrets.clone()),
        )
        .await
        .unwrap(),
    );
    let monitor = CertificateMonitor::new(
        store.clone(),
        Arc::new(LocalIssuer::new()),
        NotificationDispatcher::new(Arc::new(RecordingNotifier::default()), 8),
        MonitorSettings::default(),
    );
    let now = Utc::now();

    let old = seed_certificate(
        &store,
        "old",
        CertificateType::SelfSigned,
        now + Duration::days(1),
        Some(SELF_SIGNED_ISSUER),
    )
    .await;
    store
        .set_sites(vec![site_with_generated("a.com", &old, false)])
        .await
        .unwrap();

    // Turn the state directory into a file so persisting fails
    std::fs::remove_dir_all(temp_dir.path().join("state")).unwrap();
    std::fs::write(temp_dir.path().join("state"), b"blocker").unwrap();

    let report = monitor.scan_at(now).await;
    assert_eq!(report.failed, 1);
    assert_eq!(report.renewed, 0);
    assert_eq!(secrets.len(), 3);
    assert_eq!(
        store.get_sites().await.unwrap()[0].generated_cert_id.as_ref(),
        Some(&old)
    );
}
