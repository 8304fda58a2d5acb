//! Continuous Verification Runner - daemon.
//!
//! Owns the build queue and the execution pipeline, and exposes the
//! Unix-socket admission API the webhook layer and operators talk to.

#![forbid(unsafe_code)]

mod api;
mod depcache;
mod diff;
mod events;
mod gitsync;
mod pipeline;
mod ports;
mod profiles;
mod queue;
mod screenshot;
mod simulator;
mod store;

use anyhow::{Context, Result};
use clap::Parser;
use cvr_common::{LogConfig, PipelineConfig, init_logging};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::UnixListener;
use tracing::{info, warn};

use events::EventBus;
use pipeline::Pipeline;
use queue::BuildQueue;
use store::{ConfigStore, FileStore, RepoRegistry};

#[derive(Parser)]
#[command(name = "cvrd")]
#[command(author, version, about = "CVR daemon - continuous verification pipeline")]
struct Cli {
    /// Path to Unix socket
    #[arg(short, long, default_value = "/tmp/cvrd.sock")]
    socket: PathBuf,

    /// Path to the repo registry seed file (TOML)
    #[arg(short, long)]
    repos_config: Option<PathBuf>,

    /// Path to persisted store state (JSON)
    #[arg(long)]
    state_file: Option<PathBuf>,

    /// Override the concurrent job limit
    #[arg(long)]
    max_concurrent: Option<usize>,

    /// Daemon log file (in addition to stderr)
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

/// Shared daemon context passed to all API handlers.
#[derive(Clone)]
pub struct DaemonContext {
    pub queue: BuildQueue,
    pub pipeline: Pipeline,
    /// Daemon start time.
    pub started_at: Instant,
    /// Daemon version.
    pub version: &'static str,
    /// Daemon process ID.
    pub pid: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut log_config = LogConfig::new("info");
    if cli.verbose {
        log_config = log_config.with_level("debug");
    }
    if let Some(file) = &cli.log_file {
        log_config = log_config.with_file(file.clone());
    }
    let _logging_guards = init_logging(&log_config)?;

    info!("Starting CVR daemon...");

    let (mut config, env_errors) = PipelineConfig::from_env();
    for err in &env_errors {
        warn!("configuration: {err}");
    }
    if let Some(limit) = cli.max_concurrent {
        config.max_concurrent_jobs = limit.clamp(1, 16);
    }
    if config.github_token.is_none() {
        warn!("CVR_GITHUB_TOKEN is unset; auto-cloning will fail fast until it is configured");
    }

    let store = Arc::new(match &cli.state_file {
        Some(path) => FileStore::load_or_create(path.clone()),
        None => {
            info!("Store is in-memory only (no persistence)");
            FileStore::in_memory()
        }
    });

    if let Some(path) = &cli.repos_config {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading repo registry {}", path.display()))?;
        let registry: RepoRegistry = toml::from_str(&content)
            .with_context(|| format!("parsing repo registry {}", path.display()))?;
        info!("Loaded {} repos from registry", registry.repos.len());
        store.seed_from_registry(registry);
    }

    let events = EventBus::default();
    forward_events_to_log(&events);

    let pipeline = Pipeline::new(
        config.clone(),
        Arc::clone(&store) as Arc<dyn ConfigStore>,
        events.clone(),
    );
    let queue = BuildQueue::new(
        Arc::new(pipeline.clone()),
        config.max_concurrent_jobs,
        events.clone(),
    );
    info!(
        max_concurrent_jobs = config.max_concurrent_jobs,
        "Build queue ready"
    );

    // Remove existing socket if present
    if cli.socket.exists() {
        std::fs::remove_file(&cli.socket)?;
    }
    let listener = UnixListener::bind(&cli.socket)?;
    info!("Listening on {:?}", cli.socket);

    let context = DaemonContext {
        queue,
        pipeline,
        started_at: Instant::now(),
        version: env!("CARGO_PKG_VERSION"),
        pid: std::process::id(),
    };

    // Main accept loop
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                let ctx = context.clone();
                tokio::spawn(async move {
                    if let Err(e) = api::handle_connection(stream, ctx).await {
                        warn!("Connection error: {}", e);
                    }
                });
            }
            Err(e) => {
                warn!("Accept error: {}", e);
            }
        }
    }
}

/// Mirror pipeline events into the daemon log so a bare deployment has a
/// visible trail even before any notifier subscribes.
fn forward_events_to_log(events: &EventBus) {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => info!(target: "cvrd::events", "{event}"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(target: "cvrd::events", skipped, "event log lagged")
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}
