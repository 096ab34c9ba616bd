//! KDL configuration parsing.

mod helpers;

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use kdl::{KdlDocument, KdlNode};
use tracing::{trace, warn};

use crate::sections::*;
use crate::AgentConfig;

use helpers::{child_names, get_int_entry, get_string_entry};

/// Parse a full KDL configuration document
pub fn parse_config(text: &str) -> Result<AgentConfig> {
    let doc: KdlDocument = text
        .parse()
        .map_err(|e| anyhow!("Failed to parse KDL configuration:\n{:?}", miette::Report::new(e)))?;

    let mut config = AgentConfig::default();

    for node in doc.nodes() {
        let name = node.name().value();
        trace!(block = %name, "Parsing configuration block");
        match name {
            "node" => config.node = parse_node_config(node)?,
            "state" => config.state = parse_state_config(node),
            "secrets" => config.secrets = parse_secrets_config(node)?,
            "sync" => config.sync = parse_sync_config(node)?,
            "certificates" => config.certificates = parse_certificates_config(node)?,
            "notifications" => config.notifications = parse_notifications_config(node)?,
            "webserver" => config.webserver = parse_webserver_config(node),
            "apps" => config.apps = parse_apps_config(node),
            "jobs" => config.jobs = parse_jobs_config(node)?,
            other => warn!(block = %other, "Ignoring unknown configuration block"),
        }
    }

    Ok(config)
}

/// Read a non-negative integer setting
fn get_u64_entry(node: &KdlNode, name: &str) -> Result<Option<u64>> {
    get_int_entry(node, name)
        .map(|v| {
            u64::try_from(v).with_context(|| {
                format!(
                    "'{}.{}' must be a non-negative integer, got {}",
                    node.name().value(),
                    name,
                    v
                )
            })
        })
        .transpose()
}

fn get_i64_entry(node: &KdlNode, name: &str) -> Result<Option<i64>> {
    get_int_entry(node, name)
        .map(|v| {
            i64::try_from(v)
                .with_context(|| format!("'{}.{}' is out of range", node.name().value(), name))
        })
        .transpose()
}

fn get_usize_entry(node: &KdlNode, name: &str) -> Result<Option<usize>> {
    get_u64_entry(node, name)?
        .map(|v| usize::try_from(v).with_context(|| format!("'{name}' is out of range")))
        .transpose()
}

fn warn_unknown(node: &KdlNode, known: &[&str]) {
    for child in child_names(node) {
        if !known.contains(&child) {
            warn!(
                block = %node.name().value(),
                setting = %child,
                "Ignoring unknown configuration setting"
            );
        }
    }
}

/// Parse `node { ... }`
pub fn parse_node_config(node: &KdlNode) -> Result<NodeConfig> {
    warn_unknown(node, &["name"]);
    Ok(NodeConfig {
        name: get_string_entry(node, "name").unwrap_or_else(default_node_name),
    })
}

/// Parse `state { ... }`
pub fn parse_state_config(node: &KdlNode) -> StateConfig {
    warn_unknown(node, &["path"]);
    StateConfig {
        path: get_string_entry(node, "path").map(PathBuf::from),
    }
}

/// Parse `secrets { ... }`
pub fn parse_secrets_config(node: &KdlNode) -> Result<SecretBackend> {
    warn_unknown(node, &["backend", "path"]);

    let backend = get_string_entry(node, "backend").unwrap_or_else(|| "local".to_string());
    let config = match backend.to_lowercase().as_str() {
        "local" => match get_string_entry(node, "path") {
            Some(path) => SecretBackend::Local {
                path: PathBuf::from(path),
            },
            None => SecretBackend::default(),
        },
        "memory" => SecretBackend::Memory,
        other => {
            return Err(anyhow!(
                "Unknown secrets backend '{}'. Valid backends: local, memory",
                other
            ))
        }
    };

    trace!(backend = ?config, "Parsed secrets configuration");
    Ok(config)
}

/// Parse `sync { ... }`
pub fn parse_sync_config(node: &KdlNode) -> Result<SyncConfig> {
    warn_unknown(node, &["restart-settle-ms", "interval-secs"]);
    Ok(SyncConfig {
        restart_settle_ms: get_u64_entry(node, "restart-settle-ms")?
            .unwrap_or_else(default_restart_settle_ms),
        interval_secs: get_u64_entry(node, "interval-secs")?.unwrap_or(0),
    })
}

/// Parse `certificates { ... }`
pub fn parse_certificates_config(node: &KdlNode) -> Result<CertificatesConfig> {
    warn_unknown(
        node,
        &[
            "check-interval-secs",
            "self-signed-min-days",
            "acme-min-days",
            "self-signed-validity-days",
        ],
    );

    let config = CertificatesConfig {
        check_interval_secs: get_u64_entry(node, "check-interval-secs")?
            .unwrap_or_else(default_check_interval_secs),
        self_signed_min_days: get_i64_entry(node, "self-signed-min-days")?
            .unwrap_or_else(default_self_signed_min_days),
        acme_min_days: get_i64_entry(node, "acme-min-days")?.unwrap_or_else(default_acme_min_days),
        self_signed_validity_days: get_i64_entry(node, "self-signed-validity-days")?
            .unwrap_or_else(default_self_signed_validity_days),
    };

    trace!(
        check_interval_secs = config.check_interval_secs,
        self_signed_min_days = config.self_signed_min_days,
        acme_min_days = config.acme_min_days,
        "Parsed certificates configuration"
    );

    Ok(config)
}

/// Parse `notifications { ... }`
pub fn parse_notifications_config(node: &KdlNode) -> Result<NotificationsConfig> {
    warn_unknown(node, &["webhook", "max-in-flight"]);
    Ok(NotificationsConfig {
        webhook: get_string_entry(node, "webhook"),
        max_in_flight: get_usize_entry(node, "max-in-flight")?
            .unwrap_or_else(default_max_in_flight),
    })
}

/// Parse `webserver { ... }`
pub fn parse_webserver_config(node: &KdlNode) -> WebServerConfig {
    warn_unknown(node, &["manifest", "restart-command"]);
    WebServerConfig {
        manifest: get_string_entry(node, "manifest").map(PathBuf::from),
        restart_command: get_string_entry(node, "restart-command"),
    }
}

/// Parse `apps { ... }`
pub fn parse_apps_config(node: &KdlNode) -> AppsConfig {
    warn_unknown(node, &["manifest"]);
    AppsConfig {
        manifest: get_string_entry(node, "manifest").map(PathBuf::from),
    }
}

/// Parse `jobs { ... }`
pub fn parse_jobs_config(node: &KdlNode) -> Result<JobsConfig> {
    warn_unknown(node, &["workers", "queue-depth"]);
    Ok(JobsConfig {
        workers: get_usize_entry(node, "workers")?.unwrap_or_else(default_job_workers),
        queue_depth: get_usize_entry(node, "queue-depth")?.unwrap_or_else(default_queue_depth),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_empty_document() {
        let config = parse_config("").unwrap();
        assert_eq!(config, AgentConfig::default());
    }

    #[test]
    fn test_parse_full_document() {
        let text = r#"
node {
    name "edge-7"
}
state {
    path "/tmp/state.json"
}
secrets {
    backend "memory"
}
sync {
    restart-settle-ms 250
    interval-secs 600
}
certificates {
    check-interval-secs 3600
    self-signed-min-days 30
    acme-min-days 10
    self-signed-validity-days 90
}
notifications {
    webhook "https://hooks.example.com/abc"
    max-in-flight 2
}
webserver {
    manifest "/tmp/sites.json"
    restart-command "true"
}
jobs {
    workers 4
    queue-depth 16
}
"#;
        let config = parse_config(text).unwrap();
        assert_eq!(config.node.name, "edge-7");
        assert_eq!(config.state.path, Some(PathBuf::from("/tmp/state.json")));
        assert_eq!(config.secrets, SecretBackend::Memory);
        assert_eq!(config.sync.restart_settle_ms, 250);
        assert_eq!(config.sync.interval_secs, 600);
        assert_eq!(config.certificates.self_signed_min_days, 30);
        assert_eq!(config.certificates.acme_min_days, 10);
        assert_eq!(
            config.notifications.webhook.as_deref(),
            Some("https://hooks.example.com/abc")
        );
        assert_eq!(config.webserver.restart_command.as_deref(), Some("true"));
        assert_eq!(config.jobs.workers, 4);
        assert_eq!(config.jobs.queue_depth, 16);
    }

    #[test]
    fn test_parse_unknown_backend() {
        let err = parse_config("secrets {\n    backend \"s3\"\n}\n").unwrap_err();
        assert!(err.to_string().contains("Unknown secrets backend"));
    }

    #[test]
    fn test_parse_negative_interval() {
        let err = parse_config("sync {\n    interval-secs -5\n}\n").unwrap_err();
        assert!(err.to_string().contains("non-negative"));
    }

    #[test]
    fn test_parse_local_backend_path() {
        let config = parse_config("secrets {\n    backend \"local\"\n    path \"/srv/keys\"\n}\n").unwrap();
        assert_eq!(
            config.secrets,
            SecretBackend::Local {
                path: PathBuf::from("/srv/keys")
            }
        );
    }
}
