//! Declared-state storage.
//!
//! The [`StateStore`] is the single source of truth for what a node must
//! serve. Other components read sites through it and write certificate
//! changes back through it; nothing mutates declared state in place.
//!
//! # Components
//!
//! - [`StateStore`] - Declared state, certificate writes, change events
//! - [`LocalStateStore`] - Single-node implementation with JSON persistence
//! - [`CertificateStore`] - Certificate blobs and metadata, keyed by ID
//! - [`SecretStore`] - Pluggable blob storage (local disk, memory)
//!
//! # Change events
//!
//! Subscribers receive a [`StateEvent`] after every committed change.
//! A [`StateSubscription`] unregisters itself when dropped.

mod certificates;
mod error;
mod local;
pub mod secrets;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::trace;

use sitekeeper_common::{CertificateId, CertificateRecord, Site};

pub use certificates::CertificateStore;
pub use error::{CertificateError, SecretError, StateError};
pub use local::LocalStateStore;
pub use secrets::{FsSecretStore, MemorySecretStore, SecretStore};

/// Declared-state store contract
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Current list of declared sites
    async fn get_sites(&self) -> Result<Vec<Site>, StateError>;

    /// Replace the declared sites
    ///
    /// Every site is validated first; invalid input is rejected without
    /// side effects.
    async fn set_sites(&self, sites: Vec<Site>) -> Result<(), StateError>;

    /// Point every site referencing `old` at `new`
    ///
    /// Atomic: on success no site references `old` and the old certificate
    /// is retired; on failure no site references `new`. Returns the number
    /// of references rewritten.
    async fn replace_certificate(
        &self,
        old: &CertificateId,
        new: &CertificateId,
    ) -> Result<usize, StateError>;

    /// Store a certificate under `record.id`
    async fn set_certificate(
        &self,
        record: &CertificateRecord,
        key_pem: &[u8],
        cert_pem: &[u8],
    ) -> Result<(), StateError>;

    /// Delete a stored certificate
    ///
    /// Used to discard a certificate that never made it into declared state.
    async fn delete_certificate(&self, id: &CertificateId) -> Result<(), StateError>;

    /// Load a certificate's record and PEM chain
    async fn get_certificate(
        &self,
        id: &CertificateId,
    ) -> Result<(CertificateRecord, Vec<u8>), CertificateError>;

    /// Write an arbitrary secret blob
    async fn set_secret(&self, path: &str, value: &[u8]) -> Result<(), StateError>;

    /// Read an arbitrary secret blob
    async fn get_secret(&self, path: &str) -> Result<Option<Vec<u8>>, StateError>;

    /// Register for change events
    fn subscribe(&self) -> StateSubscription;

    /// True if this node leads the cluster
    fn is_leader(&self) -> bool;

    /// True if the store can serve reads and writes
    async fn healthy(&self) -> bool;
}

/// A committed change to declared state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateEvent {
    /// Sites were replaced
    SitesChanged {
        /// The new state references a certificate the old one did not
        certificates_added: bool,
    },
    /// A certificate was swapped for a renewed one
    CertificateReplaced {
        old: CertificateId,
        new: CertificateId,
    },
}

// ============================================================================
// Subscriptions
// ============================================================================

type SubscriberMap = DashMap<u64, mpsc::UnboundedSender<StateEvent>>;

/// Registry of change-event subscribers
#[derive(Debug, Default)]
pub struct Subscribers {
    next_id: AtomicU64,
    senders: Arc<SubscriberMap>,
}

impl Subscribers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber
    pub fn subscribe(&self) -> StateSubscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.insert(id, tx);
        trace!(subscription_id = id, "State subscription registered");
        StateSubscription {
            id,
            rx,
            registry: Arc::downgrade(&self.senders),
        }
    }

    /// Deliver an event to every live subscriber, pruning closed ones
    pub fn publish(&self, event: StateEvent) {
        self.senders.retain(|_, tx| tx.send(event.clone()).is_ok());
        trace!(subscribers = self.senders.len(), event = ?event, "Published state event");
    }

    pub fn len(&self) -> usize {
        self.senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }
}

/// Handle for receiving state change events
///
/// Dropping the handle (or calling [`unsubscribe`](Self::unsubscribe))
/// removes it from the store.
#[derive(Debug)]
pub struct StateSubscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<StateEvent>,
    registry: std::sync::Weak<SubscriberMap>,
}

impl StateSubscription {
    /// Wait for the next event; `None` once the store is gone
    pub async fn recv(&mut self) -> Option<StateEvent> {
        self.rx.recv().await
    }

    /// Take an already-delivered event without waiting
    pub fn try_recv(&mut self) -> Option<StateEvent> {
        self.rx.try_recv().ok()
    }

    pub fn unsubscribe(self) {}
}

impl Drop for StateSubscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.id);
            trace!(subscription_id = self.id, "State subscription removed");
        }
    }
}
