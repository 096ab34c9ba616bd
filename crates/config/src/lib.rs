//! Configuration loading and validation for the sitekeeper agent.
//!
//! Configuration is written in [KDL](https://kdl.dev). Every block is
//! optional; see [`AgentConfig::default_embedded`] for the shipped defaults.

pub mod kdl;
pub mod sections;

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;
use validator::Validate;

pub use sections::{
    AppsConfig, CertificatesConfig, JobsConfig, NodeConfig, NotificationsConfig, SecretBackend,
    StateConfig, SyncConfig, WebServerConfig,
};

const DEFAULT_CONFIG: &str = include_str!("default.kdl");

/// Root configuration for the agent
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct AgentConfig {
    #[validate(nested)]
    pub node: NodeConfig,
    pub state: StateConfig,
    pub secrets: SecretBackend,
    #[validate(nested)]
    pub sync: SyncConfig,
    #[validate(nested)]
    pub certificates: CertificatesConfig,
    #[validate(nested)]
    pub notifications: NotificationsConfig,
    pub webserver: WebServerConfig,
    pub apps: AppsConfig,
    #[validate(nested)]
    pub jobs: JobsConfig,
}

impl AgentConfig {
    /// Load configuration from a KDL file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "Loading configuration file");
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file {}", path.display()))?;
        Self::from_kdl(&text)
            .with_context(|| format!("Invalid configuration file {}", path.display()))
    }

    /// Parse configuration from KDL text
    pub fn from_kdl(text: &str) -> Result<Self> {
        crate::kdl::parse_config(text)
    }

    /// The configuration compiled into the binary
    pub fn default_embedded() -> Result<Self> {
        Self::from_kdl(DEFAULT_CONFIG).context("Embedded default configuration is invalid")
    }

    /// Semantic validation of all sections
    pub fn validate(&self) -> Result<()> {
        Validate::validate(self).context("Configuration validation failed")
    }
}
