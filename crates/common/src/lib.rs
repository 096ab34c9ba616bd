//! Common types shared across sitekeeper crates.
//!
//! - [`ids`]: identifier newtypes
//! - [`types`]: the declared-state model (sites, apps, certificate records)

pub mod ids;
pub mod types;

pub use ids::{CertificateId, RunId};
pub use types::{
    AppRef, CertificateRecord, CertificateType, DeclaredState, Site, SiteError,
    DEFAULT_SITE_MARKER, SELF_SIGNED_ISSUER,
};
