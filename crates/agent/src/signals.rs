//! Signal handling for re-syncs, certificate refreshes and shutdown.
//!
//! Bridges Unix signals onto a channel the agent event loop selects on:
//!
//! - `SIGUSR1` queues a reconciliation run
//! - `SIGHUP` requests a certificate scan
//! - `SIGINT` / `SIGTERM` start a graceful shutdown

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Signal type for the agent event loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalType {
    /// Re-sync declared state (SIGUSR1)
    Sync,
    /// Scan certificates now (SIGHUP)
    RefreshCertificates,
    /// Graceful shutdown (SIGTERM/SIGINT)
    Shutdown,
}

/// Install signal listeners and forward them to `tx`
///
/// The listener task ends when the receiving side is dropped.
pub fn spawn_signal_listener(
    tx: mpsc::UnboundedSender<SignalType>,
) -> std::io::Result<JoinHandle<()>> {
    let mut usr1 = signal(SignalKind::user_defined1())?;
    let mut hup = signal(SignalKind::hangup())?;
    let mut int = signal(SignalKind::interrupt())?;
    let mut term = signal(SignalKind::terminate())?;
    debug!("Installed signal handlers");

    Ok(tokio::spawn(async move {
        loop {
            let signal = tokio::select! {
                _ = usr1.recv() => {
                    info!("Received SIGUSR1, triggering a re-sync");
                    SignalType::Sync
                }
                _ = hup.recv() => {
                    info!("Received SIGHUP, triggering a certificate refresh");
                    SignalType::RefreshCertificates
                }
                _ = int.recv() => {
                    info!("Received SIGINT, initiating graceful shutdown");
                    SignalType::Shutdown
                }
                _ = term.recv() => {
                    info!("Received SIGTERM, initiating graceful shutdown");
                    SignalType::Shutdown
                }
            };
            if tx.send(signal).is_err() {
                break;
            }
        }
    }))
}
