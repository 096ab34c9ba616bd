//! Single-node state store.
//!
//! Declared state is held in an [`ArcSwap`] so readers never block, and is
//! optionally persisted to a JSON file. Writers are serialized by an async
//! mutex; each write builds the next state on a copy, persists it, and only
//! then publishes it. A failed persist leaves the published state untouched.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use sitekeeper_common::{CertificateId, CertificateRecord, DeclaredState, Site};

use super::{
    CertificateError, CertificateStore, StateError, StateEvent, StateStore, StateSubscription,
    Subscribers,
};

/// State store for a node running on its own
///
/// Always reports itself as the cluster leader.
pub struct LocalStateStore {
    state: ArcSwap<DeclaredState>,
    write_lock: Mutex<()>,
    path: Option<PathBuf>,
    certificates: CertificateStore,
    subscribers: Subscribers,
}

impl LocalStateStore {
    /// Open a store persisted at `path`
    ///
    /// A missing or empty file yields an empty state, which is written out.
    pub async fn open(
        path: impl Into<PathBuf>,
        certificates: CertificateStore,
    ) -> Result<Self, StateError> {
        let path = path.into();
        info!(path = %path.display(), "Reading state from disk");

        let state = match tokio::fs::read(&path).await {
            Ok(data) if !data.is_empty() => {
                let state: DeclaredState = serde_json::from_slice(&data)?;
                state.validate()?;
                warn_duplicate_hostnames(&state);
                Some(state)
            }
            Ok(_) => None,
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        let state = match state {
            Some(state) => state,
            None => {
                info!(path = %path.display(), "Creating new state file");
                let empty = DeclaredState::default();
                write_state_file(&path, &empty).await?;
                empty
            }
        };

        debug!(sites = state.sites.len(), "Loaded declared state");

        Ok(Self {
            state: ArcSwap::from_pointee(state),
            write_lock: Mutex::new(()),
            path: Some(path),
            certificates,
            subscribers: Subscribers::new(),
        })
    }

    /// A store that keeps declared state in memory only
    pub fn in_memory(certificates: CertificateStore) -> Self {
        Self {
            state: ArcSwap::from_pointee(DeclaredState::default()),
            write_lock: Mutex::new(()),
            path: None,
            certificates,
            subscribers: Subscribers::new(),
        }
    }

    async fn persist(&self, state: &DeclaredState) -> Result<(), StateError> {
        match self.path {
            Some(ref path) => write_state_file(path, state).await,
            None => Ok(()),
        }
    }
}

fn warn_duplicate_hostnames(state: &DeclaredState) {
    for hostname in state.duplicate_hostnames() {
        warn!(hostname = %hostname, "Hostname is declared by more than one site");
    }
}

/// Write the state file through a temporary sibling and rename it into place
async fn write_state_file(path: &Path, state: &DeclaredState) -> Result<(), StateError> {
    debug!(path = %path.display(), "Writing state to disk");
    let data = serde_json::to_vec_pretty(state)?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, data).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn get_sites(&self) -> Result<Vec<Site>, StateError> {
        Ok(self.state.load().sites.clone())
    }

    async fn set_sites(&self, sites: Vec<Site>) -> Result<(), StateError> {
        let next = DeclaredState::new(sites);
        next.validate()?;
        warn_duplicate_hostnames(&next);

        let _guard = self.write_lock.lock().await;
        let previous = self.state.load_full();
        let known = previous.certificate_ids();
        let certificates_added = next.certificate_ids().iter().any(|id| !known.contains(id));

        self.persist(&next).await?;
        self.state.store(Arc::new(next));

        info!(
            sites = self.state.load().sites.len(),
            certificates_added, "Declared state updated"
        );
        self.subscribers
            .publish(StateEvent::SitesChanged { certificates_added });
        Ok(())
    }

    async fn replace_certificate(
        &self,
        old: &CertificateId,
        new: &CertificateId,
    ) -> Result<usize, StateError> {
        if !self.certificates.contains(new).await? {
            return Err(StateError::CertificateNotFound(new.clone()));
        }

        let replaced = {
            let _guard = self.write_lock.lock().await;
            let mut next = DeclaredState::clone(&self.state.load());
            let replaced = next.replace_certificate(old, new);
            if replaced == 0 {
                debug!(old = %old, "No site references the certificate being replaced");
                return Ok(0);
            }

            self.persist(&next).await?;
            self.state.store(Arc::new(next));
            replaced
        };

        info!(old = %old, new = %new, references = replaced, "Replaced certificate");
        self.subscribers.publish(StateEvent::CertificateReplaced {
            old: old.clone(),
            new: new.clone(),
        });

        // Retire the old certificate; failing to clean up doesn't undo the swap
        if let Err(e) = self.certificates.delete_certificate(old).await {
            warn!(certificate_id = %old, error = %e, "Failed to delete replaced certificate");
        }

        Ok(replaced)
    }

    async fn set_certificate(
        &self,
        record: &CertificateRecord,
        key_pem: &[u8],
        cert_pem: &[u8],
    ) -> Result<(), StateError> {
        self.certificates
            .put_certificate(record, key_pem, cert_pem)
            .await?;
        Ok(())
    }

    async fn delete_certificate(&self, id: &CertificateId) -> Result<(), StateError> {
        let _guard = self.write_lock.lock().await;
        if self.state.load().references(id) {
            warn!(certificate_id = %id, "Refusing to delete a certificate that is still in use");
            return Ok(());
        }
        self.certificates.delete_certificate(id).await?;
        Ok(())
    }

    async fn get_certificate(
        &self,
        id: &CertificateId,
    ) -> Result<(CertificateRecord, Vec<u8>), CertificateError> {
        self.certificates.get_certificate(id).await
    }

    async fn set_secret(&self, path: &str, value: &[u8]) -> Result<(), StateError> {
        self.certificates.secrets().put(path, value).await?;
        Ok(())
    }

    async fn get_secret(&self, path: &str) -> Result<Option<Vec<u8>>, StateError> {
        Ok(self.certificates.secrets().get(path).await?)
    }

    fn subscribe(&self) -> StateSubscription {
        self.subscribers.subscribe()
    }

    fn is_leader(&self) -> bool {
        // Single-node mode: always the leader
        true
    }

    async fn healthy(&self) -> bool {
        match self.path {
            Some(ref path) => tokio::fs::metadata(path).await.is_ok(),
            None => true,
        }
    }
}

impl std::fmt::Debug for LocalStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStateStore")
            .field("path", &self.path)
            .field("sites", &self.state.load().sites.len())
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}
