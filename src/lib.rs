// src/lib.rs

pub mod cli;
pub mod client;
pub mod config;
pub mod engine;
pub mod errors;
pub mod execution;
pub mod fs;
pub mod logging;
pub mod orchestrator;
pub mod types;
pub mod workspace;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::cli::{CliArgs, Command};
use crate::client::HttpExecutionClient;
use crate::config::load_or_default;
use crate::config::model::ConfigFile;
use crate::engine::{JobQueue, Pipeline, Scheduler, WorkerPool};
use crate::execution::{ExecutionStore, FileExecutionStore, MemoryExecutionStore, NewExecution};
use crate::fs::RealFileSystem;
use crate::orchestrator::Orchestrator;
use crate::types::StorageMode;
use crate::workspace::LocalWorkspace;

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - config loading
/// - store / queue / scheduler
/// - the HTTP execution client and the local workspace
/// - the worker pool and Ctrl-C handling (for `run` and `--wait`)
pub async fn run(args: CliArgs) -> Result<()> {
    let cfg = load_or_default(&args.config)?;

    match args.command {
        Command::Check => {
            print_check(&args.config, &cfg);
            Ok(())
        }
        Command::Launch {
            workflow,
            owner,
            name,
            samples,
            wait,
        } => {
            let orchestrator = build_orchestrator(&cfg)?;
            let new = read_launch_request(&workflow, owner, name, samples)?;
            let snapshot = orchestrator.launch(new)?;
            print_json(&snapshot)?;

            if wait {
                drive(&cfg, &orchestrator, true).await?;
                print_json(&orchestrator.state(snapshot.id)?)?;
            }
            Ok(())
        }
        Command::Run { once } => {
            let orchestrator = build_orchestrator(&cfg)?;
            let recovered = orchestrator.recover()?;
            if recovered > 0 {
                info!(recovered, "re-enqueued work for executions missing from the queue");
            }
            drive(&cfg, &orchestrator, once).await
        }
        Command::Cancel { id, wait } => {
            let orchestrator = build_orchestrator(&cfg)?;
            let snapshot = orchestrator.request_cancellation(id)?;
            print_json(&snapshot)?;

            if wait {
                drive(&cfg, &orchestrator, true).await?;
                print_json(&orchestrator.state(id)?)?;
            }
            Ok(())
        }
        Command::Status { id } => {
            let orchestrator = build_orchestrator(&cfg)?;
            print_json(&orchestrator.state(id)?)
        }
        Command::List => {
            let orchestrator = build_orchestrator(&cfg)?;
            print_json(&orchestrator.list()?)
        }
    }
}

/// Build the production orchestrator described by `cfg`.
pub fn build_orchestrator(cfg: &ConfigFile) -> errors::Result<Orchestrator> {
    let store: Arc<dyn ExecutionStore>;
    let queue;
    match cfg.storage.mode {
        StorageMode::File => {
            store = Arc::new(FileExecutionStore::open(cfg.storage.executions_dir())?);
            queue = JobQueue::persistent(cfg.storage.queue_snapshot())?;
        }
        StorageMode::Memory => {
            store = Arc::new(MemoryExecutionStore::new());
            queue = JobQueue::in_memory();
        }
    }

    let client = HttpExecutionClient::new(&cfg.service.base_url, cfg.service.request_timeout)?;
    let workspace = LocalWorkspace::new(
        RealFileSystem,
        cfg.storage.run_dir_root.clone(),
        cfg.storage.outputs_dir.clone(),
    );

    let pipeline = Pipeline::new(
        store,
        Arc::new(client),
        Arc::new(workspace),
        cfg.pipeline_timings(),
    );
    let scheduler = Scheduler::new(queue, pipeline, cfg.retry.clone());

    debug!(mode = ?cfg.storage.mode, base_url = %cfg.service.base_url, "orchestrator built");
    Ok(Orchestrator::new(Arc::new(scheduler)))
}

/// Run the worker pool until Ctrl-C, or until the queue drains when
/// `exit_when_idle` is set.
async fn drive(cfg: &ConfigFile, orchestrator: &Orchestrator, exit_when_idle: bool) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            eprintln!("failed to listen for Ctrl+C: {e}");
            return;
        }
        info!("Ctrl-C received; finishing in-flight jobs");
        let _ = shutdown_tx.send(true);
    });

    let pool = WorkerPool::new(
        Arc::clone(orchestrator.scheduler()),
        cfg.runtime_options(exit_when_idle),
        shutdown_rx,
    );
    pool.run().await?;
    Ok(())
}

/// Read a `NewExecution` from JSON; CLI flags override what the file says.
fn read_launch_request(
    path: &Path,
    owner: Option<String>,
    name: Option<String>,
    samples: Vec<String>,
) -> Result<NewExecution> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("reading workflow file {:?}", path))?;
    let mut new: NewExecution = serde_json::from_str(&contents)
        .with_context(|| format!("parsing workflow file {:?}", path))?;

    if let Some(owner) = owner {
        new.owner = owner;
    } else if new.owner.is_empty() {
        new.owner = std::env::var("USER").unwrap_or_else(|_| "unknown".to_string());
    }
    if let Some(name) = name {
        new.name = name;
    } else if new.name.is_empty() {
        new.name = new.workflow.name.clone();
    }
    if !samples.is_empty() {
        new.samples = samples;
    }
    Ok(new)
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Dry-run output: print the effective settings.
fn print_check(config_path: &str, cfg: &ConfigFile) {
    println!("wesflow check ({config_path})");
    println!("  service.base_url = {}", cfg.service.base_url);
    println!("  service.request_timeout = {:?}", cfg.service.request_timeout);
    println!("  scheduler.workers = {}", cfg.scheduler.workers);
    println!("  scheduler.submission_delay = {:?}", cfg.scheduler.submission_delay);
    println!(
        "  scheduler.status_poll_interval = {:?}",
        cfg.scheduler.status_poll_interval
    );
    println!("  scheduler.idle_wait = {:?}", cfg.scheduler.idle_wait);
    println!("  storage.mode = {:?}", cfg.storage.mode);
    println!("  storage.state_dir = {}", cfg.storage.state_dir.display());
    println!("  storage.run_dir_root = {}", cfg.storage.run_dir_root.display());
    println!("  storage.outputs_dir = {}", cfg.storage.outputs_dir.display());
    println!();

    let default = cfg.retry.default_policy();
    println!(
        "retry: transient_retries = {}, permanent_retries = {}, delay = {:?}",
        default.transient_retries, default.permanent_retries, default.delay
    );
    for (kind, policy) in cfg.retry.overrides() {
        println!(
            "  - {kind}: transient_retries = {}, permanent_retries = {}, delay = {:?}",
            policy.transient_retries, policy.permanent_retries, policy.delay
        );
    }

    debug!("check complete (no execution)");
}
