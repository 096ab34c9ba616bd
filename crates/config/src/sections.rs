//! Configuration sections.
//!
//! One struct per top-level KDL block. Every field has a default so that an
//! empty document yields a usable single-node configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

// ============================================================================
// Node and state
// ============================================================================

/// Node identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct NodeConfig {
    /// Node name used in logs and status output
    #[validate(length(min = 1))]
    pub name: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: default_node_name(),
        }
    }
}

pub(crate) fn default_node_name() -> String {
    "sitekeeper".to_string()
}

/// Declared-state persistence
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateConfig {
    /// JSON file holding the declared state. `None` keeps state in memory only.
    pub path: Option<PathBuf>,
}

// ============================================================================
// Secrets
// ============================================================================

/// Blob storage backend for certificates and secrets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum SecretBackend {
    /// Files under a local directory
    Local { path: PathBuf },
    /// Process memory; lost on restart
    Memory,
}

impl Default for SecretBackend {
    fn default() -> Self {
        Self::Local {
            path: PathBuf::from("/var/lib/sitekeeper/secrets"),
        }
    }
}

// ============================================================================
// Sync
// ============================================================================

/// Reconciliation engine settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct SyncConfig {
    /// Wait after a web-server restart before the run is reported complete
    #[validate(range(max = 10_000))]
    pub restart_settle_ms: u64,
    /// Periodic re-sync interval; 0 disables the timer
    #[validate(range(max = 2_592_000))]
    pub interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            restart_settle_ms: default_restart_settle_ms(),
            interval_secs: 0,
        }
    }
}

pub(crate) fn default_restart_settle_ms() -> u64 {
    150
}

// ============================================================================
// Certificates
// ============================================================================

/// Certificate monitor settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_certificate_windows"))]
pub struct CertificatesConfig {
    /// Scan interval
    #[validate(range(min = 1, max = 2_592_000))]
    pub check_interval_secs: u64,
    /// Regenerate self-signed certificates expiring within this many days
    #[validate(range(min = 1, max = 3650))]
    pub self_signed_min_days: i64,
    /// Request a new ACME certificate when expiring within this many days
    #[validate(range(min = 1, max = 3650))]
    pub acme_min_days: i64,
    /// Lifetime of freshly generated self-signed certificates
    #[validate(range(min = 1, max = 3650))]
    pub self_signed_validity_days: i64,
}

impl Default for CertificatesConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval_secs(),
            self_signed_min_days: default_self_signed_min_days(),
            acme_min_days: default_acme_min_days(),
            self_signed_validity_days: default_self_signed_validity_days(),
        }
    }
}

pub(crate) fn default_check_interval_secs() -> u64 {
    24 * 3600
}

pub(crate) fn default_self_signed_min_days() -> i64 {
    60
}

pub(crate) fn default_acme_min_days() -> i64 {
    21
}

pub(crate) fn default_self_signed_validity_days() -> i64 {
    365
}

fn validate_certificate_windows(config: &CertificatesConfig) -> Result<(), ValidationError> {
    // A fresh certificate that is already inside the renewal window would be
    // regenerated on every scan.
    if config.self_signed_validity_days <= config.self_signed_min_days {
        let mut err = ValidationError::new("self_signed_window");
        err.message = Some(
            "self-signed-validity-days must be greater than self-signed-min-days".into(),
        );
        return Err(err);
    }
    Ok(())
}

// ============================================================================
// Notifications
// ============================================================================

/// Notification delivery settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct NotificationsConfig {
    /// Webhook receiving `{"message": ...}` POSTs. Logged only when absent.
    #[validate(url)]
    pub webhook: Option<String>,
    /// Upper bound on concurrently running sends
    #[validate(range(min = 1))]
    pub max_in_flight: usize,
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            webhook: None,
            max_in_flight: default_max_in_flight(),
        }
    }
}

pub(crate) fn default_max_in_flight() -> usize {
    8
}

// ============================================================================
// Collaborators
// ============================================================================

/// Web-server configurator settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebServerConfig {
    /// Where the rendered site manifest is written
    pub manifest: Option<PathBuf>,
    /// Shell command run to restart the web server
    pub restart_command: Option<String>,
}

/// App manager settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppsConfig {
    /// Where the deployed-app manifest is written
    pub manifest: Option<PathBuf>,
}

// ============================================================================
// Jobs
// ============================================================================

/// Background certificate job pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct JobsConfig {
    #[validate(range(min = 1, max = 64))]
    pub workers: usize,
    #[validate(range(min = 1))]
    pub queue_depth: usize,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            workers: default_job_workers(),
            queue_depth: default_queue_depth(),
        }
    }
}

pub(crate) fn default_job_workers() -> usize {
    2
}

pub(crate) fn default_queue_depth() -> usize {
    64
}
