//! Operator notifications.
//!
//! Notifications are best-effort: the [`NotificationDispatcher`] sends in
//! the background and bounds how many sends are in flight. Failures are
//! only logged.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::metrics::Metrics;

/// Default timeout for webhook deliveries
const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors from a notification backend
#[derive(Debug, Error)]
pub enum NotifyError {
    /// Request could not be sent
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Endpoint answered with a non-success status
    #[error("Webhook rejected notification with status {0}")]
    Rejected(u16),
}

/// Sends a human-readable message to operators
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, message: &str) -> Result<(), NotifyError>;
}

/// Notifier that writes messages to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, message: &str) -> Result<(), NotifyError> {
        warn!(notification = %message, "Certificate notification");
        Ok(())
    }
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    message: &'a str,
}

/// Notifier that POSTs `{"message": ...}` to a webhook URL
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, message: &str) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.url)
            .json(&WebhookPayload { message })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Rejected(status.as_u16()));
        }
        debug!(url = %self.url, "Delivered webhook notification");
        Ok(())
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Fire-and-forget front end for a [`Notifier`]
///
/// Every message gets its own background task. At most `max_in_flight`
/// sends run at once; the rest wait for a permit.
#[derive(Clone)]
pub struct NotificationDispatcher {
    notifier: Arc<dyn Notifier>,
    permits: Arc<Semaphore>,
    tasks: TaskTracker,
    max_in_flight: usize,
    metrics: Option<Arc<Metrics>>,
}

impl NotificationDispatcher {
    pub fn new(notifier: Arc<dyn Notifier>, max_in_flight: usize) -> Self {
        let max_in_flight = max_in_flight.clamp(1, Semaphore::MAX_PERMITS);
        Self {
            notifier,
            permits: Arc::new(Semaphore::new(max_in_flight)),
            tasks: TaskTracker::new(),
            max_in_flight,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Send `message` in the background; the outcome is only logged
    pub fn dispatch(&self, message: impl Into<String>) {
        let message = message.into();

        if let Some(ref metrics) = self.metrics {
            metrics.record_notification();
        }

        let notifier = self.notifier.clone();
        let permits = self.permits.clone();
        self.tasks.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                warn!(notification = %message, "Notification dispatcher closed, message not sent");
                return;
            };
            if let Err(e) = notifier.send(&message).await {
                warn!(notification = %message, error = %e, "Failed to send notification");
            }
        });
    }

    /// Number of sends queued or in flight
    pub fn pending(&self) -> usize {
        self.tasks.len()
    }

    /// Wait until every dispatched send has finished
    pub async fn flush(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }
}

impl std::fmt::Debug for NotificationDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationDispatcher")
            .field("max_in_flight", &self.max_in_flight)
            .field("pending", &self.tasks.len())
            .finish()
    }
}
