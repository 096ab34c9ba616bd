//! Certificate issuance.
//!
//! [`LocalIssuer`] mints self-signed certificates with `rcgen` and delegates
//! ACME issuance to an optional [`AcmeProvider`]. Without a provider, ACME
//! requests fail with [`IssueError::AcmeUnavailable`] and callers keep the
//! certificate they already have.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Datelike, Utc};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use thiserror::Error;
use tracing::{debug, info};

use sitekeeper_common::SELF_SIGNED_ISSUER;

/// Default self-signed validity
pub const DEFAULT_SELF_SIGNED_VALIDITY: Duration = Duration::from_secs(365 * 24 * 3600);

/// PEM-encoded private key and certificate chain
#[derive(Clone, PartialEq, Eq)]
pub struct IssuedPem {
    pub key_pem: Vec<u8>,
    pub cert_pem: Vec<u8>,
}

impl std::fmt::Debug for IssuedPem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedPem")
            .field("key_pem", &"[redacted]")
            .field("cert_pem_len", &self.cert_pem.len())
            .finish()
    }
}

/// Errors from certificate issuance
#[derive(Debug, Error)]
pub enum IssueError {
    /// No domains were given
    #[error("Certificate issuance requires at least one domain")]
    NoDomains,

    /// Certificate generation failed
    #[error("Certificate generation failed: {0}")]
    Generation(String),

    /// No ACME provider is configured
    #[error("ACME issuance is not available on this node")]
    AcmeUnavailable,

    /// The ACME provider rejected or failed the order
    #[error("ACME issuance failed: {0}")]
    Acme(String),
}

impl From<rcgen::Error> for IssueError {
    fn from(e: rcgen::Error) -> Self {
        IssueError::Generation(e.to_string())
    }
}

/// Produces key and certificate pairs for a domain set
///
/// The first domain is the primary name. Calls may block for seconds and
/// are not cancellable once started.
#[async_trait]
pub trait CertificateIssuer: Send + Sync {
    async fn generate_self_signed(&self, domains: &[String]) -> Result<IssuedPem, IssueError>;

    async fn generate_acme(&self, domains: &[String]) -> Result<IssuedPem, IssueError>;
}

/// External ACME capability
#[async_trait]
pub trait AcmeProvider: Send + Sync {
    async fn order(&self, domains: &[String]) -> Result<IssuedPem, IssueError>;
}

/// Issuer that signs locally and hands ACME orders to a provider
pub struct LocalIssuer {
    validity: Duration,
    acme: Option<Arc<dyn AcmeProvider>>,
}

impl LocalIssuer {
    pub fn new() -> Self {
        Self {
            validity: DEFAULT_SELF_SIGNED_VALIDITY,
            acme: None,
        }
    }

    /// Set how long self-signed certificates stay valid
    pub fn with_validity(mut self, validity: Duration) -> Self {
        self.validity = validity;
        self
    }

    /// Route ACME requests to `provider`
    pub fn with_acme_provider(mut self, provider: Arc<dyn AcmeProvider>) -> Self {
        self.acme = Some(provider);
        self
    }
}

impl Default for LocalIssuer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LocalIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalIssuer")
            .field("validity_days", &(self.validity.as_secs() / 86400))
            .field("acme", &self.acme.is_some())
            .finish()
    }
}

/// Mint a self-signed certificate covering `domains`
///
/// Validity starts at today's date and runs for `validity`, at day
/// granularity.
pub fn self_signed(domains: &[String], validity: Duration) -> Result<IssuedPem, IssueError> {
    let primary = domains.first().ok_or(IssueError::NoDomains)?;

    let mut params = CertificateParams::new(domains.to_vec())?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, primary.as_str());
    dn.push(DnType::OrganizationName, SELF_SIGNED_ISSUER);
    params.distinguished_name = dn;

    let today = Utc::now().date_naive();
    let days = i64::try_from(validity.as_secs() / 86400)
        .map_err(|_| IssueError::Generation("validity out of range".to_string()))?;
    let expiry = chrono::Duration::try_days(days.max(1))
        .and_then(|window| today.checked_add_signed(window))
        .ok_or_else(|| IssueError::Generation("validity out of range".to_string()))?;
    params.not_before = rcgen::date_time_ymd(today.year(), today.month() as u8, today.day() as u8);
    params.not_after =
        rcgen::date_time_ymd(expiry.year(), expiry.month() as u8, expiry.day() as u8);

    let key_pair = KeyPair::generate()?;
    let cert = params.self_signed(&key_pair)?;

    debug!(primary = %primary, domains = domains.len(), "Generated self-signed certificate");
    Ok(IssuedPem {
        key_pem: key_pair.serialize_pem().into_bytes(),
        cert_pem: cert.pem().into_bytes(),
    })
}

#[async_trait]
impl CertificateIssuer for LocalIssuer {
    async fn generate_self_signed(&self, domains: &[String]) -> Result<IssuedPem, IssueError> {
        if domains.is_empty() {
            return Err(IssueError::NoDomains);
        }
        let domains = domains.to_vec();
        let validity = self.validity;

        // Key generation is CPU-bound
        tokio::task::spawn_blocking(move || self_signed(&domains, validity))
            .await
            .map_err(|e| IssueError::Generation(format!("signing task failed: {e}")))?
    }

    async fn generate_acme(&self, domains: &[String]) -> Result<IssuedPem, IssueError> {
        if domains.is_empty() {
            return Err(IssueError::NoDomains);
        }
        let provider = self.acme.as_ref().ok_or(IssueError::AcmeUnavailable)?;

        info!(domains = ?domains, "Requesting ACME certificate");
        provider.order(domains).await
    }
}
