//! Sitekeeper node agent.
//!
//! Keeps a web-serving node converged with its declared state and keeps its
//! TLS certificates alive.
//!
//! # Architecture
//!
//! ```text
//! crates/agent/src/
//! ├── agent.rs        # Wiring and event loop
//! ├── certs/          # Issuance, PEM parsing, certificate monitor
//! ├── jobs.rs         # Background issuance jobs and worker pool
//! ├── metrics.rs      # Prometheus counters
//! ├── notify.rs       # Operator notifications
//! ├── signals.rs      # Unix signal bridge
//! ├── state/          # Declared state, certificates, secret backends
//! └── sync/           # Reconciliation engine and collaborators
//! ```

pub mod agent;
pub mod certs;
pub mod jobs;
pub mod metrics;
pub mod notify;
pub mod signals;
pub mod state;
pub mod sync;

pub use agent::{Agent, Components};
pub use certs::{CertificateMonitor, LocalIssuer, MonitorHandle, MonitorSettings, ScanReport};
pub use jobs::{Job, JobError, JobKind, JobProcessor, JobWorkerPool};
pub use metrics::Metrics;
pub use notify::{LogNotifier, NotificationDispatcher, Notifier, NotifyError, WebhookNotifier};
pub use state::{
    CertificateError, CertificateStore, LocalStateStore, StateError, StateEvent, StateStore,
};
pub use sync::{RunStatus, SyncEngine, SyncError, SyncOutcome};
