//! State, secret and certificate store error types

use std::io;
use thiserror::Error;

use sitekeeper_common::{CertificateId, SiteError};

/// Errors from a secret store backend
#[derive(Debug, Error)]
pub enum SecretError {
    /// Path is empty, absolute or escapes the store root
    #[error("Invalid secret path: '{0}'")]
    InvalidPath(String),

    /// IO error during file operations
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Backend-specific failure
    #[error("Secret backend error: {0}")]
    Backend(String),
}

/// Errors from the certificate store
#[derive(Debug, Error)]
pub enum CertificateError {
    /// No certificate stored under this ID
    #[error("Certificate not found: {0}")]
    NotFound(CertificateId),

    /// ID cannot be used as a storage key
    #[error("Invalid certificate ID: '{0}'")]
    InvalidId(CertificateId),

    /// PEM or metadata could not be parsed
    #[error("Failed to parse certificate {id}: {message}")]
    Parse { id: CertificateId, message: String },

    /// Underlying secret store failed
    #[error("Certificate storage error: {0}")]
    Secret(#[from] SecretError),
}

impl CertificateError {
    /// True for the "nothing stored under this ID" condition
    pub fn is_not_found(&self) -> bool {
        matches!(self, CertificateError::NotFound(_))
    }
}

/// Errors from the declared-state store
#[derive(Debug, Error)]
pub enum StateError {
    /// Declared state failed validation; nothing was written
    #[error("Invalid declared state: {0}")]
    InvalidSite(#[from] SiteError),

    /// Replacement target was never stored
    #[error("Replacement certificate {0} is not in the certificate store")]
    CertificateNotFound(CertificateId),

    /// Certificate store failure
    #[error(transparent)]
    Certificate(#[from] CertificateError),

    /// Secret store failure
    #[error(transparent)]
    Secret(#[from] SecretError),

    /// IO error while persisting state
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Failed to serialize/deserialize state
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StateError {
    fn from(e: serde_json::Error) -> Self {
        StateError::Serialization(e.to_string())
    }
}
