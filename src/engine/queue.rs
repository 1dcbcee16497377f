// src/engine/queue.rs

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::engine::job::{Job, JobKind};
use crate::errors::Result;
use crate::fs::lock::{process_alive, FileLock};
use crate::types::{ExecutionId, JobId};

/// Identifies one open queue, so claims made through it can be told apart
/// from claims of other queues (in this or another process) on the same file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueOwner {
    pub pid: u32,
    pub instance: u64,
}

impl QueueOwner {
    fn current() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        let started = Utc::now().timestamp_micros().unsigned_abs();
        Self {
            pid: std::process::id(),
            instance: started.wrapping_add(NEXT.fetch_add(1, Ordering::Relaxed)),
        }
    }
}

/// What gets written to disk: every job not yet finished. Jobs being run
/// right now carry a claim naming the queue that runs them.
#[derive(Debug, Default, Serialize, Deserialize)]
struct QueueSnapshot {
    next_id: JobId,
    jobs: Vec<Job>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    claims: BTreeMap<JobId, QueueOwner>,
}

#[derive(Debug)]
struct SnapshotFile {
    path: PathBuf,
    lock_path: PathBuf,
    owner: QueueOwner,
}

/// Durable queue of jobs waiting for their `run_at`.
///
/// Semantics:
/// - Jobs are handed out in `(run_at, id)` order.
/// - A job is never handed out while another job of the same execution is
///   in flight anywhere; that is what keeps one execution single-threaded.
/// - A claimed job leaves the queue through [`finish`](Self::finish) or
///   [`retry`](Self::retry).
///
/// With a snapshot path the file on disk is the queue. Every claim and
/// mutation takes the lock file next to it, re-reads the snapshot, applies
/// the change and writes it back (temp file plus rename), so several
/// processes can share one state dir. Claims of a process that died are
/// handed out again.
#[derive(Debug)]
pub struct JobQueue {
    next_id: JobId,
    pending: Vec<Job>,
    /// Claimed through this queue.
    in_flight: BTreeMap<ExecutionId, Job>,
    /// Claimed by another live queue sharing the snapshot.
    foreign: Vec<(Job, QueueOwner)>,
    snapshot: Option<SnapshotFile>,
}

impl JobQueue {
    pub fn in_memory() -> Self {
        Self {
            next_id: 1,
            pending: Vec::new(),
            in_flight: BTreeMap::new(),
            foreign: Vec::new(),
            snapshot: None,
        }
    }

    /// Open (or create) a queue backed by a JSON snapshot at `path`.
    pub fn persistent(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating job queue directory {:?}", parent))?;
        }

        let mut queue = Self::in_memory();
        queue.snapshot = Some(SnapshotFile {
            lock_path: path.with_extension("lock"),
            owner: QueueOwner::current(),
            path,
        });
        queue.refresh()?;

        if let Some(file) = &queue.snapshot {
            info!(
                path = ?file.path,
                jobs = queue.pending.len() + queue.foreign.len(),
                "opened job queue snapshot"
            );
        }
        Ok(queue)
    }

    /// Lock the snapshot file, if there is one.
    fn lock(&self) -> Result<Option<FileLock>> {
        match &self.snapshot {
            Some(file) => Ok(Some(FileLock::acquire(&file.lock_path)?)),
            None => Ok(None),
        }
    }

    /// Pick up changes other queues made to the snapshot.
    pub fn refresh(&mut self) -> Result<()> {
        let _lock = self.lock()?;
        self.reload()
    }

    /// Replace the local view with what is on disk. Callers hold the lock.
    fn reload(&mut self) -> Result<()> {
        let Some(file) = &self.snapshot else {
            return Ok(());
        };
        let snapshot = read_snapshot(&file.path)?;
        let owner = file.owner;

        self.next_id = self.next_id.max(snapshot.next_id).max(1);
        self.pending.clear();
        self.foreign.clear();

        for job in snapshot.jobs {
            match snapshot.claims.get(&job.id) {
                Some(claim) if *claim == owner => {
                    if !self.in_flight.values().any(|own| own.id == job.id) {
                        self.pending.push(job);
                    }
                }
                Some(claim) if process_alive(claim.pid) => self.foreign.push((job, *claim)),
                Some(claim) => {
                    info!(
                        job_id = job.id,
                        execution_id = job.execution_id,
                        pid = claim.pid,
                        "claim of an exited process released"
                    );
                    self.pending.push(job);
                }
                None => self.pending.push(job),
            }
        }
        self.sort_pending();
        Ok(())
    }

    /// Add a fresh job (attempt 1) for `execution_id`.
    pub fn enqueue(
        &mut self,
        execution_id: ExecutionId,
        kind: JobKind,
        run_at: DateTime<Utc>,
    ) -> Result<Job> {
        let _lock = self.lock()?;
        self.reload()?;

        let job = Job {
            id: self.next_id,
            execution_id,
            kind,
            attempt: 1,
            run_at,
        };
        self.next_id += 1;

        debug!(
            job_id = job.id,
            execution_id,
            job = %kind,
            run_at = %run_at,
            "enqueued job"
        );

        self.pending.push(job.clone());
        self.sort_pending();
        self.persist()?;
        Ok(job)
    }

    /// Claim the earliest job due at `now`.
    pub fn claim_due(&mut self, now: DateTime<Utc>) -> Result<Option<Job>> {
        self.claim_first(|job| job.run_at <= now)
    }

    /// Claim the earliest claimable job, ignoring `run_at`.
    pub fn claim_next(&mut self) -> Result<Option<Job>> {
        self.claim_first(|_| true)
    }

    /// Claim the earliest claimable job matching `pred`.
    pub fn claim_first(&mut self, pred: impl Fn(&Job) -> bool) -> Result<Option<Job>> {
        let _lock = self.lock()?;
        self.reload()?;

        let Some(idx) = self
            .pending
            .iter()
            .position(|job| !self.busy(job.execution_id) && pred(job))
        else {
            return Ok(None);
        };

        let job = self.pending.remove(idx);
        self.in_flight.insert(job.execution_id, job.clone());
        self.persist()?;

        debug!(
            job_id = job.id,
            execution_id = job.execution_id,
            job = %job.kind,
            attempt = job.attempt,
            "claimed job"
        );
        Ok(Some(job))
    }

    /// The claimed job is done; its execution becomes claimable again.
    pub fn finish(&mut self, job: &Job) -> Result<()> {
        let _lock = self.lock()?;
        self.reload()?;
        self.release(job)?;
        self.persist()
    }

    /// Put a claimed job back with the next attempt number.
    pub fn retry(&mut self, job: &Job, run_at: DateTime<Utc>) -> Result<Job> {
        let _lock = self.lock()?;
        self.reload()?;
        self.release(job)?;
        let next = Job {
            attempt: job.attempt + 1,
            run_at,
            ..job.clone()
        };
        debug!(
            job_id = next.id,
            execution_id = next.execution_id,
            job = %next.kind,
            attempt = next.attempt,
            run_at = %run_at,
            "rescheduled job"
        );
        self.pending.push(next.clone());
        self.sort_pending();
        self.persist()?;
        Ok(next)
    }

    fn release(&mut self, job: &Job) -> Result<()> {
        match self.in_flight.get(&job.execution_id) {
            Some(current) if current.id == job.id => {
                self.in_flight.remove(&job.execution_id);
                Ok(())
            }
            _ => {
                warn!(
                    job_id = job.id,
                    execution_id = job.execution_id,
                    "released a job that was not in flight"
                );
                Err(anyhow::anyhow!("job {} is not in flight", job.id).into())
            }
        }
    }

    fn busy(&self, execution_id: ExecutionId) -> bool {
        self.in_flight.contains_key(&execution_id)
            || self
                .foreign
                .iter()
                .any(|(job, _)| job.execution_id == execution_id)
    }

    /// Earliest `run_at` among jobs that could be claimed right now.
    pub fn next_run_at(&self) -> Option<DateTime<Utc>> {
        self.pending
            .iter()
            .find(|job| !self.busy(job.execution_id))
            .map(|job| job.run_at)
    }

    pub fn pending(&self) -> &[Job] {
        &self.pending
    }

    /// Whether any job (pending or in flight) exists for `execution_id`.
    pub fn has_jobs_for(&self, execution_id: ExecutionId) -> bool {
        self.busy(execution_id) || self.pending.iter().any(|job| job.execution_id == execution_id)
    }

    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.in_flight.is_empty() && self.foreign.is_empty()
    }

    fn sort_pending(&mut self) {
        self.pending.sort_by_key(|job| (job.run_at, job.id));
    }

    /// Write the local view back. Callers hold the lock.
    fn persist(&self) -> Result<()> {
        let Some(file) = &self.snapshot else {
            return Ok(());
        };

        let mut snapshot = QueueSnapshot {
            next_id: self.next_id,
            ..QueueSnapshot::default()
        };
        for job in self.in_flight.values() {
            snapshot.claims.insert(job.id, file.owner);
            snapshot.jobs.push(job.clone());
        }
        for (job, owner) in &self.foreign {
            snapshot.claims.insert(job.id, *owner);
            snapshot.jobs.push(job.clone());
        }
        snapshot.jobs.extend(self.pending.iter().cloned());

        write_atomically(&file.path, &snapshot)
    }

    /// Hand this queue's claims back so another queue can run those jobs.
    fn release_claims(&mut self) -> Result<()> {
        let _lock = self.lock()?;
        self.reload()?;
        let released = std::mem::take(&mut self.in_flight);
        self.pending.extend(released.into_values());
        self.sort_pending();
        self.persist()
    }
}

impl Drop for JobQueue {
    fn drop(&mut self) {
        if self.snapshot.is_none() || self.in_flight.is_empty() {
            return;
        }
        if let Err(err) = self.release_claims() {
            warn!(error = %err, "could not release claimed jobs");
        }
    }
}

fn read_snapshot(path: &Path) -> Result<QueueSnapshot> {
    if !path.exists() {
        return Ok(QueueSnapshot::default());
    }
    let contents = fs::read_to_string(path)
        .with_context(|| format!("reading job queue snapshot {:?}", path))?;
    Ok(serde_json::from_str(&contents)?)
}

fn write_atomically(path: &Path, snapshot: &QueueSnapshot) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    let file = File::create(&tmp).with_context(|| format!("creating {:?}", tmp))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer(&mut writer, snapshot)?;
    writer.flush()?;
    drop(writer);
    fs::rename(&tmp, path).with_context(|| format!("moving queue snapshot to {:?}", path))?;
    Ok(())
}
