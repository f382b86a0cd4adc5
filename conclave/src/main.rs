//! Conclave server binary.
//!
//! ```bash
//! # Serve the control plane on the default loopback address
//! conclave
//!
//! # Custom bind address and concurrency
//! conclave --bind 127.0.0.1:9000 --capacity 2
//!
//! # With a config file
//! conclave --config conclave.toml
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use conclave::config::OrchestratorConfig;
use conclave::http::{serve, AppState};
use conclave::{
    AdmissionScheduler, ArtifactStore, CliGateway, MemoryRepository, Orchestrator, SandboxManager,
    SharedRepository,
};

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a TOML config file (overrides environment variables)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Bind address for the REST control plane
    #[arg(long)]
    bind: Option<std::net::SocketAddr>,

    /// Artifact root directory
    #[arg(long)]
    artifact_root: Option<PathBuf>,

    /// Concurrent running tasks
    #[arg(long)]
    capacity: Option<usize>,

    /// Disable request rate limiting
    #[arg(long, default_value_t = false)]
    no_rate_limit: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = OrchestratorConfig::from_env();
    if let Some(path) = &args.config {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        config
            .apply_file(&contents)
            .with_context(|| format!("parsing config file {}", path.display()))?;
    }
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }
    if let Some(root) = args.artifact_root {
        config.artifact_root = root;
    }
    if let Some(capacity) = args.capacity {
        config.capacity = capacity;
    }
    if args.no_rate_limit {
        config.rate_limit_per_minute = 0;
    }

    let artifacts = ArtifactStore::new(config.artifact_root.clone());
    let repo: SharedRepository = Arc::new(
        MemoryRepository::open(artifacts.clone()).context("reloading persisted tasks")?,
    );
    let orchestrator = Orchestrator::new(
        Arc::new(CliGateway::new()),
        repo,
        artifacts,
        SandboxManager::new(config.sandbox_base.clone()),
        AdmissionScheduler::new(config.admission()),
        config.coordinator(),
    );

    let state = AppState::new(orchestrator, config);
    serve(state).await.context("control plane server failed")
}
