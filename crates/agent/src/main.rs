//! Sitekeeper - Main entry point
//!
//! Node agent that converges web-server state and keeps TLS certificates
//! renewed.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use sitekeeper_agent::certs::import_certificate;
use sitekeeper_agent::signals::spawn_signal_listener;
use sitekeeper_agent::state::{secrets, CertificateStore};
use sitekeeper_agent::{Agent, Components, Job, JobKind, JobProcessor, StateStore};
use sitekeeper_config::AgentConfig;

/// Sitekeeper - converge sites and keep their certificates alive
#[derive(Parser, Debug)]
#[command(name = "sitekeeper")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long = "config", env = "SITEKEEPER_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging (debug level)
    #[arg(long = "verbose", global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long = "log-json", global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the agent (default)
    Run,
    /// Validate configuration and state, then exit
    Test,
    /// Issue a certificate into the secret store and exit
    Issue {
        /// Certificate kind: "selfsigned" or "acme"
        #[arg(long = "type", default_value = "selfsigned")]
        kind: String,
        /// Comma-separated domains, primary first
        domains: String,
    },
    /// Import an operator-supplied certificate and print its ID
    Import {
        /// PEM-encoded private key
        #[arg(long)]
        key: PathBuf,
        /// PEM-encoded certificate chain
        #[arg(long)]
        cert: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_json);

    let config = load_config(cli.config.as_deref())?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_agent(config).await,
        Commands::Test => test_config(config, cli.config.as_deref()).await,
        Commands::Issue { kind, domains } => issue(config, &kind, domains).await,
        Commands::Import { key, cert } => import(config, &key, &cert).await,
    }
}

fn init_logging(verbose: bool, json: bool) {
    let log_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn load_config(path: Option<&Path>) -> Result<AgentConfig> {
    let config = match path {
        Some(path) => {
            info!(path = %path.display(), "Loading configuration");
            AgentConfig::from_file(path)?
        }
        None => {
            info!("No configuration specified, using embedded default configuration");
            AgentConfig::default_embedded().context("Failed to load embedded configuration")?
        }
    };
    config.validate().context("Configuration validation failed")?;
    Ok(config)
}

/// Validate configuration and open the state file, then exit
async fn test_config(config: AgentConfig, path: Option<&Path>) -> Result<()> {
    let components = Components::from_config(&config).await?;
    let sites = components
        .store
        .get_sites()
        .await
        .context("Failed to read declared state")?;

    info!("Configuration test successful:");
    info!("  - node: {}", config.node.name);
    info!("  - {} declared site(s)", sites.len());

    println!(
        "sitekeeper: configuration file {} test is successful",
        path.map(|p| p.display().to_string())
            .unwrap_or_else(|| "(embedded)".to_string())
    );
    Ok(())
}

async fn run_agent(config: AgentConfig) -> Result<()> {
    let shutdown = CancellationToken::new();
    let components = Components::from_config(&config).await?;
    let agent = Agent::new(&config, components, shutdown)?;

    let (signal_tx, signal_rx) = mpsc::unbounded_channel();
    let _signals = spawn_signal_listener(signal_tx).context("Failed to install signal handlers")?;

    agent.run(signal_rx).await
}

async fn issue(config: AgentConfig, kind: &str, domains: String) -> Result<()> {
    let job = Job {
        kind: kind.parse::<JobKind>()?,
        payload: domains,
    };
    let components = Components::from_config(&config).await?;
    let processor = JobProcessor::new(components.issuer, components.store);

    let output = processor.process(&job).await?;
    println!("{}\n{}", output.key_path, output.cert_path);
    Ok(())
}

async fn import(config: AgentConfig, key: &Path, cert: &Path) -> Result<()> {
    let key_pem = tokio::fs::read(key)
        .await
        .with_context(|| format!("Failed to read {}", key.display()))?;
    let cert_pem = tokio::fs::read(cert)
        .await
        .with_context(|| format!("Failed to read {}", cert.display()))?;

    let secret_store =
        secrets::from_backend(&config.secrets).context("Failed to open secret store")?;
    let store = CertificateStore::new(secret_store);
    let record = import_certificate(&store, &key_pem, &cert_pem).await?;

    info!(
        certificate_id = %record.id,
        expires = %record.not_after,
        subjects = ?record.subjects,
        "Imported certificate"
    );
    println!("{}", record.id);
    Ok(())
}
