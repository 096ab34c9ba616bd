//! Certificate storage on top of a secret store.
//!
//! Each certificate lives under its own ID:
//!
//! ```text
//! certificates/<id>/key.pem     # Private key
//! certificates/<id>/cert.pem    # Certificate chain
//! certificates/<id>/meta.json   # CertificateRecord
//! ```
//!
//! Records are written once and never mutated; renewal stores a new ID.

use std::sync::Arc;

use tracing::{debug, info};

use sitekeeper_common::{CertificateId, CertificateRecord};

use super::error::CertificateError;
use super::secrets::SecretStore;

const CERTIFICATES_PREFIX: &str = "certificates/";

/// Certificate and key material addressed by certificate ID
#[derive(Clone)]
pub struct CertificateStore {
    secrets: Arc<dyn SecretStore>,
}

impl CertificateStore {
    pub fn new(secrets: Arc<dyn SecretStore>) -> Self {
        Self { secrets }
    }

    /// The secret store backing this certificate store
    pub fn secrets(&self) -> &Arc<dyn SecretStore> {
        &self.secrets
    }

    fn paths(id: &CertificateId) -> Result<[String; 3], CertificateError> {
        if !id.is_path_safe() {
            return Err(CertificateError::InvalidId(id.clone()));
        }
        Ok([
            format!("{CERTIFICATES_PREFIX}{id}/key.pem"),
            format!("{CERTIFICATES_PREFIX}{id}/cert.pem"),
            format!("{CERTIFICATES_PREFIX}{id}/meta.json"),
        ])
    }

    /// Store a certificate under `record.id`
    ///
    /// The metadata record is written last, so a certificate only becomes
    /// visible to [`get_certificate`](Self::get_certificate) once its PEM
    /// blobs are in place.
    pub async fn put_certificate(
        &self,
        record: &CertificateRecord,
        key_pem: &[u8],
        cert_pem: &[u8],
    ) -> Result<(), CertificateError> {
        let [key_path, cert_path, meta_path] = Self::paths(&record.id)?;
        let meta = serde_json::to_vec_pretty(record).map_err(|e| CertificateError::Parse {
            id: record.id.clone(),
            message: e.to_string(),
        })?;

        self.secrets.put(&key_path, key_pem).await?;
        self.secrets.put(&cert_path, cert_pem).await?;
        self.secrets.put(&meta_path, &meta).await?;

        info!(
            certificate_id = %record.id,
            cert_type = %record.cert_type,
            expires = %record.not_after,
            "Saved certificate to storage"
        );
        Ok(())
    }

    /// Load a certificate's record and PEM-encoded chain
    pub async fn get_certificate(
        &self,
        id: &CertificateId,
    ) -> Result<(CertificateRecord, Vec<u8>), CertificateError> {
        let [_, cert_path, meta_path] = Self::paths(id)?;

        let Some(meta) = self.secrets.get(&meta_path).await? else {
            return Err(CertificateError::NotFound(id.clone()));
        };
        let cert_pem = match self.secrets.get(&cert_path).await? {
            Some(pem) if !pem.is_empty() => pem,
            _ => return Err(CertificateError::NotFound(id.clone())),
        };

        let record: CertificateRecord =
            serde_json::from_slice(&meta).map_err(|e| CertificateError::Parse {
                id: id.clone(),
                message: e.to_string(),
            })?;

        debug!(certificate_id = %id, expires = %record.not_after, "Loaded certificate");
        Ok((record, cert_pem))
    }

    /// True if a complete certificate is stored under `id`
    pub async fn contains(&self, id: &CertificateId) -> Result<bool, CertificateError> {
        match self.get_certificate(id).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Delete all blobs of a certificate
    pub async fn delete_certificate(&self, id: &CertificateId) -> Result<(), CertificateError> {
        let paths = Self::paths(id)?;
        // Metadata first: a half-deleted certificate reads as not found
        for path in paths.iter().rev() {
            self.secrets.delete(path).await?;
        }
        info!(certificate_id = %id, "Deleted stored certificate");
        Ok(())
    }
}

impl std::fmt::Debug for CertificateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateStore").finish_non_exhaustive()
    }
}
