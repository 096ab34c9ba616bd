//! TLS certificate lifecycle.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────┐  scan   ┌─────────────┐
//! │ CertificateMonitor │────────▶│ StateStore  │
//! │ (ticker + refresh) │◀────────│ (sites)     │
//! └─────────┬──────────┘  certs  └─────────────┘
//!           │ renew                      ▲
//!           ▼                            │ replace_certificate
//! ┌────────────────────┐                 │
//! │ CertificateIssuer  │─────────────────┘
//! │ (rcgen / ACME)     │
//! └────────────────────┘
//! ```
//!
//! # Components
//!
//! - [`CertificateMonitor`] - Renewal and expiry notification scans
//! - [`LocalIssuer`] - Self-signed issuance plus an optional ACME provider
//! - [`parse_certificate`] - Metadata records from PEM chains

pub mod issuer;
pub mod monitor;
pub mod x509;

pub use issuer::{AcmeProvider, CertificateIssuer, IssueError, IssuedPem, LocalIssuer};
pub use monitor::{
    notification_message, CertificateMonitor, MonitorHandle, MonitorSettings, ScanReport,
    NOTIFICATION_THRESHOLDS,
};
pub use x509::{import_certificate, parse_certificate};
