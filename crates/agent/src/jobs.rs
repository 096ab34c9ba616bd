//! Background certificate issuance jobs.
//!
//! A [`Job`] names the issuance kind and carries a comma-separated domain
//! list. The [`JobProcessor`] issues the certificate and writes it to the
//! secret store at:
//!
//! ```text
//! cert/selfsigned/<primary-domain>.key.pem
//! cert/selfsigned/<primary-domain>.cert.pem
//! cert/acme/<primary-domain>.key.pem
//! cert/acme/<primary-domain>.cert.pem
//! ```
//!
//! Jobs are not retried; whoever submits a job resubmits it on failure.

use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::certs::{CertificateIssuer, IssueError};
use crate::state::{StateError, StateStore};

/// Errors from job submission and processing
#[derive(Debug, Error)]
pub enum JobError {
    /// Payload held no domains
    #[error("Job payload has an empty domain list")]
    EmptyDomainList,

    #[error("Unknown job type: '{0}'")]
    UnknownJobType(String),

    /// Primary domain cannot be used in a storage path
    #[error("Invalid domain in job payload: '{0}'")]
    InvalidDomain(String),

    #[error("Certificate issuance failed: {0}")]
    Issue(#[from] IssueError),

    #[error("Failed to store issued certificate: {0}")]
    Store(#[from] StateError),

    #[error("Job queue is full")]
    QueueFull,

    #[error("Job queue is closed")]
    QueueClosed,
}

/// Kind of certificate a job issues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobKind {
    #[serde(rename = "selfsigned")]
    SelfSignedCert,
    #[serde(rename = "acme")]
    AcmeCert,
}

impl JobKind {
    /// Directory under `cert/` the output is stored in
    pub fn storage_prefix(&self) -> &'static str {
        match self {
            JobKind::SelfSignedCert => "selfsigned",
            JobKind::AcmeCert => "acme",
        }
    }
}

impl FromStr for JobKind {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "selfsigned" => Ok(JobKind::SelfSignedCert),
            "acme" => Ok(JobKind::AcmeCert),
            other => Err(JobError::UnknownJobType(other.to_string())),
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.storage_prefix())
    }
}

/// Certificate issuance job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    #[serde(rename = "type")]
    pub kind: JobKind,
    /// Comma-separated domains, primary first
    pub payload: String,
}

impl Job {
    pub fn new(kind: JobKind, domains: &[&str]) -> Self {
        Self {
            kind,
            payload: domains.join(","),
        }
    }

    /// Domains in the payload, trimmed, with empty entries dropped
    pub fn domains(&self) -> Vec<String> {
        split_domains(&self.payload)
    }
}

pub fn split_domains(payload: &str) -> Vec<String> {
    payload
        .split(',')
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(str::to_string)
        .collect()
}

/// Where a processed job's output was written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutput {
    pub key_path: String,
    pub cert_path: String,
}

/// Runs issuance jobs against an issuer and a state store
pub struct JobProcessor {
    issuer: Arc<dyn CertificateIssuer>,
    store: Arc<dyn StateStore>,
}

impl JobProcessor {
    pub fn new(issuer: Arc<dyn CertificateIssuer>, store: Arc<dyn StateStore>) -> Self {
        Self { issuer, store }
    }

    /// Issue and store the certificate a job asks for
    ///
    /// Input is validated before anything is issued or written.
    pub async fn process(&self, job: &Job) -> Result<JobOutput, JobError> {
        let domains = job.domains();
        let primary = domains.first().ok_or(JobError::EmptyDomainList)?;
        if primary == "." || primary == ".." || primary.contains(['/', '\\']) {
            return Err(JobError::InvalidDomain(primary.clone()));
        }

        debug!(kind = %job.kind, domains = ?domains, "Processing certificate job");
        let issued = match job.kind {
            JobKind::SelfSignedCert => self.issuer.generate_self_signed(&domains).await?,
            JobKind::AcmeCert => self.issuer.generate_acme(&domains).await?,
        };

        let prefix = job.kind.storage_prefix();
        let output = JobOutput {
            key_path: format!("cert/{prefix}/{primary}.key.pem"),
            cert_path: format!("cert/{prefix}/{primary}.cert.pem"),
        };
        self.store.set_secret(&output.key_path, &issued.key_pem).await?;
        self.store
            .set_secret(&output.cert_path, &issued.cert_pem)
            .await?;

        info!(kind = %job.kind, domain = %primary, "Certificate job complete");
        Ok(output)
    }
}

impl std::fmt::Debug for JobProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobProcessor").finish_non_exhaustive()
    }
}

// ============================================================================
// Worker pool
// ============================================================================

/// Fixed set of workers pulling jobs from a bounded queue
pub struct JobWorkerPool {
    tx: parking_lot::Mutex<Option<mpsc::Sender<Job>>>,
    workers: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl JobWorkerPool {
    /// Spawn `workers` workers sharing a queue of `queue_depth` jobs
    pub fn start(processor: Arc<JobProcessor>, workers: usize, queue_depth: usize) -> Self {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        let rx = Arc::new(Mutex::new(rx));

        let handles = (0..workers.max(1))
            .map(|worker_id| {
                let rx = Arc::clone(&rx);
                let processor = Arc::clone(&processor);
                tokio::spawn(async move {
                    debug!(worker_id, "Job worker started");
                    loop {
                        let next = rx.lock().await.recv().await;
                        let Some(job) = next else {
                            break;
                        };
                        if let Err(e) = processor.process(&job).await {
                            error!(
                                worker_id,
                                kind = %job.kind,
                                payload = %job.payload,
                                error = %e,
                                "Certificate job failed"
                            );
                        }
                    }
                    debug!(worker_id, "Job worker stopped");
                })
            })
            .collect();

        info!(workers = workers.max(1), queue_depth, "Started job worker pool");
        Self {
            tx: parking_lot::Mutex::new(Some(tx)),
            workers: parking_lot::Mutex::new(handles),
        }
    }

    /// Queue a job without waiting
    pub fn submit(&self, job: Job) -> Result<(), JobError> {
        let guard = self.tx.lock();
        let tx = guard.as_ref().ok_or(JobError::QueueClosed)?;
        tx.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(job) => {
                warn!(kind = %job.kind, "Job queue full, rejecting job");
                JobError::QueueFull
            }
            mpsc::error::TrySendError::Closed(_) => JobError::QueueClosed,
        })
    }

    /// Close the queue and wait for queued jobs to drain
    pub async fn shutdown(&self) {
        drop(self.tx.lock().take());
        let handles: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Job worker ended abnormally");
            }
        }
        info!("Job worker pool stopped");
    }
}

impl std::fmt::Debug for JobWorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobWorkerPool")
            .field("open", &self.tx.lock().is_some())
            .field("workers", &self.workers.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certs::LocalIssuer;
    use crate::state::{CertificateStore, LocalStateStore, MemorySecretStore, SecretStore};
    use proptest::prelude::*;

    fn setup() -> (Arc<MemorySecretStore>, JobProcessor) {
        let secrets = Arc::new(MemorySecretStore::new());
        let store = Arc::new(LocalStateStore::in_memory(CertificateStore::new(
            secrets.clone(),
        )));
        let processor = JobProcessor::new(Arc::new(LocalIssuer::new()), store);
        (secrets, processor)
    }

    #[test]
    fn test_job_kind_parse() {
        assert_eq!("selfsigned".parse::<JobKind>().unwrap(), JobKind::SelfSignedCert);
        assert_eq!("acme".parse::<JobKind>().unwrap(), JobKind::AcmeCert);
        assert!(matches!(
            "tlscert".parse::<JobKind>(),
            Err(JobError::UnknownJobType(t)) if t == "tlscert"
        ));
    }

    #[test]
    fn test_job_json() {
        let job: Job = serde_json::from_str(r#"{"type":"acme","payload":"a.com,b.com"}"#).unwrap();
        assert_eq!(job.kind, JobKind::AcmeCert);
        assert_eq!(job.domains(), vec!["a.com", "b.com"]);

        assert!(serde_json::from_str::<Job>(r#"{"type":"other","payload":"a.com"}"#).is_err());
    }

    #[tokio::test]
    async fn test_empty_payload_rejected_without_writes() {
        let (secrets, processor) = setup();
        for payload in ["", " , ,"] {
            let job = Job {
                kind: JobKind::SelfSignedCert,
                payload: payload.to_string(),
            };
            assert!(matches!(
                processor.process(&job).await,
                Err(JobError::EmptyDomainList)
            ));
        }
        assert!(secrets.is_empty());
    }

    #[tokio::test]
    async fn test_unsafe_primary_domain_rejected() {
        let (secrets, processor) = setup();
        let job = Job::new(JobKind::SelfSignedCert, &["../etc"]);
        assert!(matches!(
            processor.process(&job).await,
            Err(JobError::InvalidDomain(_))
        ));
        assert!(secrets.is_empty());
    }

    #[tokio::test]
    async fn test_self_signed_job_writes_deterministic_paths() {
        let (secrets, processor) = setup();
        let job = Job::new(JobKind::SelfSignedCert, &["a.com", "www.a.com"]);

        let output = processor.process(&job).await.unwrap();
        assert_eq!(output.key_path, "cert/selfsigned/a.com.key.pem");
        assert_eq!(output.cert_path, "cert/selfsigned/a.com.cert.pem");

        let cert = secrets.get(&output.cert_path).await.unwrap().unwrap();
        assert!(String::from_utf8(cert).unwrap().contains("BEGIN CERTIFICATE"));
        assert_eq!(secrets.len(), 2);
    }

    #[tokio::test]
    async fn test_acme_job_without_provider_fails_without_writes() {
        let (secrets, processor) = setup();
        let job = Job::new(JobKind::AcmeCert, &["a.com"]);
        assert!(matches!(
            processor.process(&job).await,
            Err(JobError::Issue(IssueError::AcmeUnavailable))
        ));
        assert!(secrets.is_empty());
    }

    #[tokio::test]
    async fn test_worker_pool_drains_on_shutdown() {
        let (secrets, processor) = setup();
        let pool = JobWorkerPool::start(Arc::new(processor), 2, 8);

        pool.submit(Job::new(JobKind::SelfSignedCert, &["a.com"])).unwrap();
        pool.submit(Job::new(JobKind::SelfSignedCert, &["b.com"])).unwrap();
        pool.shutdown().await;

        assert_eq!(secrets.len(), 4);
        assert!(matches!(
            pool.submit(Job::new(JobKind::SelfSignedCert, &["c.com"])),
            Err(JobError::QueueClosed)
        ));
    }

    proptest! {
        #[test]
        fn prop_split_domains_has_no_blank_entries(payload in "[a-z., ]{0,40}") {
            for domain in split_domains(&payload) {
                prop_assert!(!domain.is_empty());
                prop_assert_eq!(domain.trim(), domain.as_str());
                prop_assert!(!domain.contains(','));
            }
        }
    }
}
