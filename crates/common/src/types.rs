//! Declared-state data model shared by the store, the sync engine and the
//! certificate monitor.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::CertificateId;

/// Hostname reserved for the catch-all site. Never a legal domain or alias.
pub const DEFAULT_SITE_MARKER: &str = "_default";

/// Issuer organization stamped on every self-signed certificate we mint.
pub const SELF_SIGNED_ISSUER: &str = "sitekeeper self-signed";

// ============================================================================
// Sites
// ============================================================================

/// App deployed on a site
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AppRef {
    pub name: String,
    pub version: String,
}

/// A single site, as declared by the controller
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Site {
    /// Primary hostname
    pub domain: String,
    /// Additional hostnames served by the same site
    #[serde(default)]
    pub aliases: Vec<String>,
    /// App deployed on the site; `None` serves the default app
    #[serde(default)]
    pub app: Option<AppRef>,
    /// Certificate generated by us (self-signed or ACME)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_cert_id: Option<CertificateId>,
    /// Certificate supplied by an operator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imported_cert_id: Option<CertificateId>,
    /// Request generated certificates from ACME instead of self-signing
    #[serde(default, rename = "useACME")]
    pub use_acme: bool,
    /// Last deployment error; output only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Site {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            ..Default::default()
        }
    }

    /// All hostnames the site's certificate must cover, primary first.
    ///
    /// Duplicates are dropped, keeping the first occurrence.
    pub fn domains(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        std::iter::once(&self.domain)
            .chain(self.aliases.iter())
            .filter(|d| seen.insert(d.as_str()))
            .cloned()
            .collect()
    }

    /// True if either certificate slot points at `id`
    pub fn references(&self, id: &CertificateId) -> bool {
        self.generated_cert_id.as_ref() == Some(id) || self.imported_cert_id.as_ref() == Some(id)
    }

    /// Check the site is acceptable as declared state
    pub fn validate(&self) -> Result<(), SiteError> {
        if self.domain.trim().is_empty() {
            return Err(SiteError::EmptyDomain);
        }
        if self.domain == DEFAULT_SITE_MARKER {
            return Err(SiteError::ReservedDomain(self.domain.clone()));
        }
        for alias in &self.aliases {
            if alias.trim().is_empty() {
                return Err(SiteError::EmptyAlias {
                    domain: self.domain.clone(),
                });
            }
            if alias == DEFAULT_SITE_MARKER {
                return Err(SiteError::ReservedAlias {
                    domain: self.domain.clone(),
                });
            }
        }
        if let Some(ref app) = self.app {
            if app.name.is_empty() || app.version.is_empty() {
                return Err(SiteError::IncompleteApp {
                    domain: self.domain.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Invalid declared site
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SiteError {
    #[error("site domain must not be empty")]
    EmptyDomain,

    #[error("'{0}' is reserved and cannot be used as a site domain")]
    ReservedDomain(String),

    #[error("site '{domain}' has an empty alias")]
    EmptyAlias { domain: String },

    #[error("site '{domain}' uses the reserved default-site marker as an alias")]
    ReservedAlias { domain: String },

    #[error("site '{domain}' declares an app without name or version")]
    IncompleteApp { domain: String },
}

// ============================================================================
// Declared state
// ============================================================================

/// Full picture of what a node must serve
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclaredState {
    #[serde(default)]
    pub sites: Vec<Site>,
}

impl DeclaredState {
    pub fn new(sites: Vec<Site>) -> Self {
        Self { sites }
    }

    /// Validate every site
    pub fn validate(&self) -> Result<(), SiteError> {
        self.sites.iter().try_for_each(Site::validate)
    }

    /// Hostnames claimed by more than one site, sorted
    pub fn duplicate_hostnames(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let mut duplicates = BTreeSet::new();
        for hostname in self.sites.iter().flat_map(Site::domains) {
            if !seen.insert(hostname.clone()) {
                duplicates.insert(hostname);
            }
        }
        duplicates.into_iter().collect()
    }

    /// Every certificate ID referenced by any site
    pub fn certificate_ids(&self) -> BTreeSet<CertificateId> {
        self.sites
            .iter()
            .flat_map(|s| [s.generated_cert_id.as_ref(), s.imported_cert_id.as_ref()])
            .flatten()
            .cloned()
            .collect()
    }

    pub fn references(&self, id: &CertificateId) -> bool {
        self.sites.iter().any(|s| s.references(id))
    }

    /// Point every reference to `old` at `new`, returning how many slots changed
    pub fn replace_certificate(&mut self, old: &CertificateId, new: &CertificateId) -> usize {
        let mut replaced = 0;
        for site in &mut self.sites {
            for slot in [&mut site.generated_cert_id, &mut site.imported_cert_id] {
                if slot.as_ref() == Some(old) {
                    *slot = Some(new.clone());
                    replaced += 1;
                }
            }
        }
        replaced
    }
}

// ============================================================================
// Certificates
// ============================================================================

/// Where a certificate came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CertificateType {
    SelfSigned,
    Acme,
    Imported,
}

impl CertificateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CertificateType::SelfSigned => "self-signed",
            CertificateType::Acme => "acme",
            CertificateType::Imported => "imported",
        }
    }
}

impl std::fmt::Display for CertificateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata record stored alongside a certificate's PEM blobs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateRecord {
    pub id: CertificateId,
    #[serde(rename = "type")]
    pub cert_type: CertificateType,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    #[serde(default)]
    pub issuer_org: Option<String>,
    #[serde(default)]
    pub subjects: Vec<String>,
}

impl CertificateRecord {
    /// True for certificates we signed ourselves, whatever the record type says
    pub fn is_self_signed(&self) -> bool {
        self.cert_type == CertificateType::SelfSigned
            || self.issuer_org.as_deref() == Some(SELF_SIGNED_ISSUER)
    }

    /// True if the certificate is no longer valid `days` days from `now`
    ///
    /// A horizon beyond the representable date range never counts as expiring.
    pub fn expires_within(&self, now: DateTime<Utc>, days: i64) -> bool {
        chrono::Duration::try_days(days)
            .and_then(|window| now.checked_add_signed(window))
            .is_some_and(|horizon| self.not_after < horizon)
    }
}
