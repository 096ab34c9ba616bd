//! App and web-server collaborators driven by the sync engine.
//!
//! The shipped implementations record the declared app set and the site to
//! certificate mapping as JSON manifests. Fetching bundles and templating
//! the actual server configuration belong to whatever consumes the
//! manifests.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use sitekeeper_common::{AppRef, CertificateId, Site};

/// Brings deployed apps in line with declared sites
#[async_trait]
pub trait AppManager: Send + Sync {
    /// Returns `true` if anything changed and the server must restart
    async fn converge(&self, sites: &[Site]) -> Result<bool>;
}

/// Brings web-server configuration in line with declared sites
#[async_trait]
pub trait WebServer: Send + Sync {
    /// Returns `true` if the configuration changed and the server must restart
    async fn converge(&self, sites: &[Site]) -> Result<bool>;

    async fn restart(&self) -> Result<()>;
}

/// Write `content` unless it matches what is already recorded
///
/// With a path the file is the record; without one the last content is
/// kept in `last`.
async fn write_if_changed(
    path: Option<&Path>,
    last: &Mutex<Option<Vec<u8>>>,
    content: Vec<u8>,
) -> Result<bool> {
    let Some(path) = path else {
        let mut last = last.lock();
        if last.as_deref() == Some(content.as_slice()) {
            return Ok(false);
        }
        *last = Some(content);
        return Ok(true);
    };

    match tokio::fs::read(path).await {
        Ok(existing) if existing == content => return Ok(false),
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read manifest {}", path.display()))
        }
    }

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, &content)
        .await
        .with_context(|| format!("Failed to write manifest {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("Failed to replace manifest {}", path.display()))?;

    *last.lock() = Some(content);
    debug!(path = %path.display(), "Manifest updated");
    Ok(true)
}

// ============================================================================
// Apps
// ============================================================================

#[derive(Serialize)]
struct AppsManifest<'a> {
    apps: Vec<&'a AppRef>,
}

/// Records the set of apps that must be deployed
#[derive(Debug, Default)]
pub struct ManifestAppManager {
    path: Option<PathBuf>,
    last: Mutex<Option<Vec<u8>>>,
}

impl ManifestAppManager {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            last: Mutex::new(None),
        }
    }
}

#[async_trait]
impl AppManager for ManifestAppManager {
    async fn converge(&self, sites: &[Site]) -> Result<bool> {
        let mut apps: Vec<&AppRef> = sites.iter().filter_map(|s| s.app.as_ref()).collect();
        apps.sort_by(|a, b| (&a.name, &a.version).cmp(&(&b.name, &b.version)));
        apps.dedup();

        let content = serde_json::to_vec_pretty(&AppsManifest { apps })?;
        let changed = write_if_changed(self.path.as_deref(), &self.last, content).await?;
        if changed {
            info!("Deployed app set changed");
        }
        Ok(changed)
    }
}

// ============================================================================
// Web server
// ============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SiteEntry<'a> {
    domain: &'a str,
    aliases: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    app: Option<&'a AppRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    certificate_id: Option<&'a CertificateId>,
}

#[derive(Serialize)]
struct SitesManifest<'a> {
    sites: Vec<SiteEntry<'a>>,
}

/// Records the site to certificate mapping the server must serve
#[derive(Debug, Default)]
pub struct ManifestWebServer {
    path: Option<PathBuf>,
    restart_command: Option<String>,
    last: Mutex<Option<Vec<u8>>>,
}

impl ManifestWebServer {
    pub fn new(path: Option<PathBuf>, restart_command: Option<String>) -> Self {
        Self {
            path,
            restart_command,
            last: Mutex::new(None),
        }
    }
}

#[async_trait]
impl WebServer for ManifestWebServer {
    async fn converge(&self, sites: &[Site]) -> Result<bool> {
        let mut entries: Vec<SiteEntry<'_>> = sites
            .iter()
            .map(|site| SiteEntry {
                domain: &site.domain,
                aliases: &site.aliases,
                app: site.app.as_ref(),
                // Operator-supplied certificates take precedence
                certificate_id: site
                    .imported_cert_id
                    .as_ref()
                    .or(site.generated_cert_id.as_ref()),
            })
            .collect();
        entries.sort_by(|a, b| a.domain.cmp(b.domain));

        let content = serde_json::to_vec_pretty(&SitesManifest { sites: entries })?;
        let changed = write_if_changed(self.path.as_deref(), &self.last, content).await?;
        if changed {
            info!(sites = sites.len(), "Web server configuration changed");
        }
        Ok(changed)
    }

    async fn restart(&self) -> Result<()> {
        let Some(ref command) = self.restart_command else {
            debug!("No restart command configured");
            return Ok(());
        };

        info!(command = %command, "Restarting web server");
        let status = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .status()
            .await
            .with_context(|| format!("Failed to run restart command '{command}'"))?;

        if !status.success() {
            bail!("Restart command '{command}' exited with {status}");
        }
        Ok(())
    }
}
