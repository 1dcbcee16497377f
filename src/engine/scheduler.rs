// src/engine/scheduler.rs

//! Job scheduler: owns the queue, runs jobs through the pipeline and applies
//! the retry policy to failures.
//!
//! This is the synchronous-stepping core. It never spawns anything itself;
//! tests call [`Scheduler::perform_next`] step by step, while
//! [`WorkerPool`](crate::engine::WorkerPool) calls [`Scheduler::perform_due`]
//! from N worker tasks.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::Notify;
use tracing::{debug, error, warn};

use crate::engine::job::{Job, JobKind, NextJob};
use crate::engine::queue::JobQueue;
use crate::engine::retry::{RetryDecision, RetryPolicies};
use crate::engine::steps::{JobFailure, Pipeline};
use crate::errors::Result;
use crate::execution::ExecutionStore;
use crate::types::ExecutionId;

/// What happened to a job that was run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// The step finished; these jobs were enqueued after it.
    Done { follow_ups: Vec<JobKind> },
    /// The step failed and was put back with the next attempt number.
    Retrying { next_attempt: u32, delay: Duration },
    /// The step failed for good; the execution was moved to `error` (when
    /// still applicable) and these jobs were enqueued.
    GaveUp { follow_ups: Vec<JobKind> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReport {
    pub job: Job,
    pub outcome: JobOutcome,
}

/// `now + delay`, saturating instead of overflowing.
fn run_at_after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Per execution and job kind: fresh jobs enqueued, and attempts run.
#[derive(Debug, Default)]
struct JobCounters {
    enqueued: BTreeMap<(ExecutionId, JobKind), u64>,
    performed: BTreeMap<(ExecutionId, JobKind), u64>,
}

#[derive(Debug)]
pub struct Scheduler {
    queue: Mutex<JobQueue>,
    pipeline: Pipeline,
    retry: RetryPolicies,
    counters: Option<Mutex<JobCounters>>,
    wakeup: Notify,
}

impl Scheduler {
    pub fn new(queue: JobQueue, pipeline: Pipeline, retry: RetryPolicies) -> Self {
        Self {
            queue: Mutex::new(queue),
            pipeline,
            retry,
            counters: None,
            wakeup: Notify::new(),
        }
    }

    /// Keep per-execution job counts for [`enqueued_count`](Self::enqueued_count)
    /// and [`performed_count`](Self::performed_count). They are never pruned,
    /// so this is meant for stepping harnesses, not for a long-running pool.
    pub fn with_job_counters(mut self) -> Self {
        self.counters = Some(Mutex::default());
        self
    }

    fn count(&self, update: impl FnOnce(&mut JobCounters)) {
        if let Some(counters) = &self.counters {
            update(&mut *counters.lock().unwrap_or_else(PoisonError::into_inner));
        }
    }

    fn counted(&self, read: impl FnOnce(&JobCounters) -> Option<u64>) -> u64 {
        self.counters
            .as_ref()
            .and_then(|c| read(&*c.lock().unwrap_or_else(PoisonError::into_inner)))
            .unwrap_or(0)
    }

    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        self.pipeline.store()
    }

    pub fn retry_policies(&self) -> &RetryPolicies {
        &self.retry
    }

    fn queue(&self) -> MutexGuard<'_, JobQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The queue, with changes from other processes sharing it picked up.
    fn fresh_queue(&self) -> MutexGuard<'_, JobQueue> {
        let mut queue = self.queue();
        if let Err(err) = queue.refresh() {
            warn!(error = %err, "could not re-read the job queue; using the last known view");
        }
        queue
    }

    /// Schedule a fresh job for `execution_id`, due after `delay`.
    pub fn enqueue(&self, execution_id: ExecutionId, kind: JobKind, delay: Duration) -> Result<Job> {
        let job = self
            .queue()
            .enqueue(execution_id, kind, run_at_after(Utc::now(), delay))?;
        self.count(|c| *c.enqueued.entry((execution_id, kind)).or_default() += 1);
        self.wakeup.notify_waiters();
        Ok(job)
    }

    /// Run the earliest claimable job regardless of its `run_at`.
    ///
    /// Stepping helper: delays are skipped, ordering is kept.
    pub async fn perform_next(&self) -> Result<Option<StepReport>> {
        let job = self.queue().claim_next()?;
        self.run_claimed(job).await
    }

    /// Like [`perform_next`](Self::perform_next), restricted to jobs matching `pred`.
    pub async fn perform_next_matching(
        &self,
        pred: impl Fn(&Job) -> bool,
    ) -> Result<Option<StepReport>> {
        let job = self.queue().claim_first(pred)?;
        self.run_claimed(job).await
    }

    /// Run the earliest job whose `run_at` has passed.
    pub async fn perform_due(&self, now: DateTime<Utc>) -> Result<Option<StepReport>> {
        let job = self.queue().claim_due(now)?;
        self.run_claimed(job).await
    }

    /// Step until no job is left or `max_steps` jobs have run.
    pub async fn drain(&self, max_steps: usize) -> Result<Vec<StepReport>> {
        let mut reports = Vec::new();
        while reports.len() < max_steps {
            match self.perform_next().await? {
                Some(report) => reports.push(report),
                None => break,
            }
        }
        Ok(reports)
    }

    async fn run_claimed(&self, job: Option<Job>) -> Result<Option<StepReport>> {
        match job {
            Some(job) => self.run_job(job).await.map(Some),
            None => Ok(None),
        }
    }

    async fn run_job(&self, job: Job) -> Result<StepReport> {
        self.count(|c| *c.performed.entry((job.execution_id, job.kind)).or_default() += 1);

        debug!(
            job_id = job.id,
            execution_id = job.execution_id,
            job = %job.kind,
            attempt = job.attempt,
            "performing job"
        );

        let outcome = match self.pipeline.perform(&job).await {
            Ok(follow_ups) => {
                let kinds = self.finish_with(&job, &follow_ups)?;
                JobOutcome::Done { follow_ups: kinds }
            }
            Err(failure) => self.handle_failure(&job, failure)?,
        };

        self.wakeup.notify_waiters();
        Ok(StepReport { job, outcome })
    }

    fn handle_failure(&self, job: &Job, failure: JobFailure) -> Result<JobOutcome> {
        let policy_decision = self.retry.decide(job.kind, failure.class(), job.attempt);

        match policy_decision {
            RetryDecision::RetryAfter(delay) => {
                warn!(
                    execution_id = job.execution_id,
                    job = %job.kind,
                    attempt = job.attempt,
                    class = ?failure.class(),
                    retry_in = ?delay,
                    error = %failure,
                    "job failed; retrying"
                );
                let next = self.queue().retry(job, run_at_after(Utc::now(), delay))?;
                Ok(JobOutcome::Retrying {
                    next_attempt: next.attempt,
                    delay,
                })
            }
            RetryDecision::GiveUp => {
                let follow_ups = match self.pipeline.abandon(job, &failure) {
                    Ok(follow_ups) => follow_ups,
                    Err(err) => {
                        // The worker loop must survive; the execution stays as
                        // it is and startup recovery picks it up again.
                        error!(
                            execution_id = job.execution_id,
                            job = %job.kind,
                            error = %err,
                            "could not record job failure"
                        );
                        Vec::new()
                    }
                };
                let kinds = self.finish_with(job, &follow_ups)?;
                Ok(JobOutcome::GaveUp { follow_ups: kinds })
            }
        }
    }

    /// Enqueue the follow-ups and release the job, atomically with respect to
    /// other workers looking at the queue.
    fn finish_with(&self, job: &Job, follow_ups: &[NextJob]) -> Result<Vec<JobKind>> {
        let now = Utc::now();
        let mut queue = self.queue();
        let mut first_err = None;
        for next in follow_ups {
            match queue.enqueue(job.execution_id, next.kind, run_at_after(now, next.delay)) {
                Ok(_) => self.count(|c| {
                    *c.enqueued.entry((job.execution_id, next.kind)).or_default() += 1
                }),
                Err(err) => {
                    first_err.get_or_insert(err);
                }
            }
        }
        // Always release, or the execution would never be claimable again.
        if let Err(err) = queue.finish(job) {
            first_err.get_or_insert(err);
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(follow_ups.iter().map(|n| n.kind).collect()),
        }
    }

    pub fn pending_jobs(&self) -> Vec<Job> {
        self.fresh_queue().pending().to_vec()
    }

    pub fn has_jobs_for(&self, execution_id: ExecutionId) -> bool {
        self.fresh_queue().has_jobs_for(execution_id)
    }

    /// How many times a job of `kind` ran for `execution_id` (every attempt
    /// counts). Zero unless built [`with_job_counters`](Self::with_job_counters).
    pub fn performed_count(&self, execution_id: ExecutionId, kind: JobKind) -> u64 {
        self.counted(|c| c.performed.get(&(execution_id, kind)).copied())
    }

    /// How many fresh jobs of `kind` this scheduler enqueued for
    /// `execution_id`. Zero unless built [`with_job_counters`](Self::with_job_counters).
    pub fn enqueued_count(&self, execution_id: ExecutionId, kind: JobKind) -> u64 {
        self.counted(|c| c.enqueued.get(&(execution_id, kind)).copied())
    }

    /// No job pending and none in flight, here or in another process
    /// sharing the queue.
    pub fn is_idle(&self) -> bool {
        self.fresh_queue().is_idle()
    }

    pub fn next_run_at(&self) -> Option<DateTime<Utc>> {
        self.fresh_queue().next_run_at()
    }

    /// Sleep until the next job is due, something is enqueued or finishes, or
    /// `max_wait` elapses, whichever comes first.
    pub async fn wait_for_work(&self, max_wait: Duration) {
        let notified = self.wakeup.notified();

        let wait = match self.next_run_at() {
            Some(at) => (at - Utc::now()).to_std().unwrap_or(Duration::ZERO).min(max_wait),
            None => max_wait,
        };
        if wait.is_zero() {
            return;
        }

        tokio::select! {
            _ = notified => {}
            _ = tokio::time::sleep(wait) => {}
        }
    }
}
