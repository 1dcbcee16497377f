// src/engine/runtime.rs

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::errors::Result;

use super::scheduler::Scheduler;

/// Runtime options for the worker pool.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeOptions {
    pub workers: usize,
    /// Upper bound on how long an idle worker sleeps before looking again.
    pub idle_wait: Duration,
    /// If true, exit once no job is pending or in flight (used for `--once`
    /// and `--wait`).
    pub exit_when_idle: bool,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            workers: 4,
            idle_wait: Duration::from_secs(1),
            exit_when_idle: false,
        }
    }
}

/// Runs `workers` tokio tasks that pull due jobs from the scheduler.
///
/// This is a pure IO shell around [`Scheduler`], which holds all the job
/// semantics. Job errors never stop a worker; only shutdown (or idleness with
/// `exit_when_idle`) does.
pub struct WorkerPool {
    scheduler: Arc<Scheduler>,
    options: RuntimeOptions,
    shutdown: watch::Receiver<bool>,
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    pub fn new(
        scheduler: Arc<Scheduler>,
        options: RuntimeOptions,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            scheduler,
            options,
            shutdown,
        }
    }

    /// Spawn the workers and wait for all of them to stop.
    pub async fn run(self) -> Result<()> {
        let workers = self.options.workers.max(1);
        info!(workers, exit_when_idle = self.options.exit_when_idle, "worker pool started");

        let mut set = JoinSet::new();
        for worker in 0..workers {
            set.spawn(worker_loop(
                worker,
                Arc::clone(&self.scheduler),
                self.options,
                self.shutdown.clone(),
            ));
        }

        while let Some(joined) = set.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "worker task aborted");
            }
        }

        info!("worker pool exiting");
        Ok(())
    }
}

async fn worker_loop(
    worker: usize,
    scheduler: Arc<Scheduler>,
    options: RuntimeOptions,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(worker, "worker started");
    let mut shutdown_open = true;

    loop {
        if *shutdown.borrow() {
            debug!(worker, "shutdown requested; worker stopping");
            break;
        }

        match scheduler.perform_due(Utc::now()).await {
            Ok(Some(report)) => {
                debug!(
                    worker,
                    job_id = report.job.id,
                    execution_id = report.job.execution_id,
                    job = %report.job.kind,
                    outcome = ?report.outcome,
                    "job finished"
                );
                continue;
            }
            Ok(None) => {}
            Err(err) => {
                error!(worker, error = %err, "scheduler error; backing off");
            }
        }

        if options.exit_when_idle && scheduler.is_idle() {
            debug!(worker, "queue drained; worker stopping");
            break;
        }

        if shutdown_open {
            tokio::select! {
                _ = scheduler.wait_for_work(options.idle_wait) => {}
                changed = shutdown.changed() => {
                    // Sender gone: nobody can ask us to stop any more.
                    shutdown_open = changed.is_ok();
                }
            }
        } else {
            scheduler.wait_for_work(options.idle_wait).await;
        }
    }
}
