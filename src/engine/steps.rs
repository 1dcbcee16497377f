// src/engine/steps.rs

//! The job pipeline: one function per [`JobKind`].
//!
//! Every step follows the same shape:
//! 1. reload the execution and check it is in the state this step expects
//!    (anything else means the job is stale and it does nothing);
//! 2. do the external work (client call, workspace call);
//! 3. commit the new state with compare-and-set on `version`. Losing that
//!    race is a silent no-op.
//!
//! A step returns the follow-up jobs to enqueue. Failures are returned to the
//! scheduler, which consults the retry policy and, when giving up, calls
//! [`Pipeline::abandon`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::client::{ClientError, ErrorClass, ExecutionClient, PollOutcome};
use crate::engine::job::{Job, JobKind, NextJob};
use crate::errors::WesflowError;
use crate::execution::{CasOutcome, Execution, ExecutionState, ExecutionStore, RunDirectory};
use crate::workspace::Workspace;

/// Delays between steps of the normal chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineTimings {
    pub submission_delay: Duration,
    pub status_poll_interval: Duration,
}

impl Default for PipelineTimings {
    fn default() -> Self {
        Self {
            submission_delay: Duration::from_secs(30),
            status_poll_interval: Duration::from_secs(10),
        }
    }
}

/// Why a step did not finish.
#[derive(Debug)]
pub enum JobFailure {
    /// The execution service call failed; subject to the retry policy.
    Client(ClientError),
    /// Local plumbing failed (workspace, store); never retried.
    Local(anyhow::Error),
}

impl JobFailure {
    pub fn class(&self) -> Option<ErrorClass> {
        match self {
            JobFailure::Client(err) => Some(err.class()),
            JobFailure::Local(_) => None,
        }
    }

    pub fn http_status(&self) -> Option<u16> {
        match self {
            JobFailure::Client(err) => err.http_status(),
            JobFailure::Local(_) => None,
        }
    }
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobFailure::Client(err) => write!(f, "{err}"),
            JobFailure::Local(err) => write!(f, "{err:#}"),
        }
    }
}

impl From<ClientError> for JobFailure {
    fn from(err: ClientError) -> Self {
        JobFailure::Client(err)
    }
}

impl From<anyhow::Error> for JobFailure {
    fn from(err: anyhow::Error) -> Self {
        JobFailure::Local(err)
    }
}

impl From<WesflowError> for JobFailure {
    fn from(err: WesflowError) -> Self {
        match err {
            WesflowError::Client(client) => JobFailure::Client(client),
            other => JobFailure::Local(anyhow::Error::new(other)),
        }
    }
}

pub type StepResult = std::result::Result<Vec<NextJob>, JobFailure>;

/// Everything a step needs, shared by all workers.
#[derive(Clone)]
pub struct Pipeline {
    store: Arc<dyn ExecutionStore>,
    client: Arc<dyn ExecutionClient>,
    workspace: Arc<dyn Workspace>,
    timings: PipelineTimings,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("timings", &self.timings)
            .finish_non_exhaustive()
    }
}

/// Load the execution and check its state; `None` means "stale job, skip".
fn expect_state(
    store: &dyn ExecutionStore,
    job: &Job,
    expected: ExecutionState,
) -> Result<Option<Execution>, JobFailure> {
    let Some(exec) = store.load(job.execution_id)? else {
        warn!(execution_id = job.execution_id, job = %job.kind, "execution vanished; dropping job");
        return Ok(None);
    };
    if exec.state != expected {
        debug!(
            execution_id = exec.id,
            job = %job.kind,
            state = %exec.state,
            expected = %expected,
            "execution moved on; skipping job"
        );
        return Ok(None);
    }
    Ok(Some(exec))
}

fn require_run_id(exec: &Execution) -> Result<String, JobFailure> {
    exec.run_id.clone().ok_or_else(|| {
        JobFailure::Local(anyhow::anyhow!(
            "execution {} is {} without a run id",
            exec.id,
            exec.state
        ))
    })
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        client: Arc<dyn ExecutionClient>,
        workspace: Arc<dyn Workspace>,
        timings: PipelineTimings,
    ) -> Self {
        Self {
            store,
            client,
            workspace,
            timings,
        }
    }

    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.store
    }

    pub fn timings(&self) -> PipelineTimings {
        self.timings
    }

    /// Run one attempt of `job`.
    pub async fn perform(&self, job: &Job) -> StepResult {
        match job.kind {
            JobKind::Preparation => self.prepare(job),
            JobKind::Submission => self.submit(job).await,
            JobKind::StatusPoll => self.poll_status(job).await,
            JobKind::Completion => self.complete(job).await,
            JobKind::Cancellation => self.cancel(job).await,
            JobKind::Cleanup => self.clean_up(job),
        }
    }

    /// Commit `next`; `false` means another writer got there first.
    fn commit(&self, read_version: u64, next: Execution) -> Result<bool, JobFailure> {
        match self.store.compare_and_swap(read_version, next)? {
            CasOutcome::Applied(exec) => {
                debug!(
                    execution_id = exec.id,
                    state = %exec.state,
                    version = exec.version,
                    "committed execution"
                );
                Ok(true)
            }
            CasOutcome::Conflict(current) => {
                debug!(
                    execution_id = current.id,
                    state = %current.state,
                    version = current.version,
                    "lost compare-and-set race; leaving execution as is"
                );
                Ok(false)
            }
        }
    }

    fn prepare(&self, job: &Job) -> StepResult {
        let Some(exec) = expect_state(self.store.as_ref(), job, ExecutionState::Initial)? else {
            return Ok(Vec::new());
        };

        let dir = self.workspace.allocate_run_directory(exec.id)?;
        let staged = self
            .workspace
            .build_submission_payload(&exec)
            .and_then(|payload| self.workspace.write_payload(&dir, &payload));
        if let Err(err) = staged {
            self.release_quietly(&exec, &dir);
            return Err(err.into());
        }

        let mut next = exec.clone();
        next.run_directory = Some(dir.clone());
        next.transition(ExecutionState::Prepared, "submission payload staged")?;

        if !self.commit(exec.version, next)? {
            // Canceled while we were preparing; the directory is ours alone.
            self.release_quietly(&exec, &dir);
            return Ok(Vec::new());
        }

        info!(execution_id = exec.id, "execution prepared");
        Ok(vec![NextJob::after(
            JobKind::Submission,
            self.timings.submission_delay,
        )])
    }

    async fn submit(&self, job: &Job) -> StepResult {
        let Some(exec) = expect_state(self.store.as_ref(), job, ExecutionState::Prepared)? else {
            return Ok(Vec::new());
        };

        let dir = exec.run_directory.clone().ok_or_else(|| {
            JobFailure::Local(anyhow::anyhow!("execution {} has no run directory", exec.id))
        })?;
        let payload = self.workspace.read_payload(&dir)?;
        let run_id = self.client.submit(payload).await?;

        let mut next = exec.clone();
        next.mark_submitted(run_id.clone())?;

        if !self.commit(exec.version, next)? {
            self.cancel_orphaned_run(&exec, run_id).await;
            return Ok(Vec::new());
        }

        info!(execution_id = exec.id, run_id = %run_id, "execution submitted");
        Ok(vec![NextJob::after(
            JobKind::StatusPoll,
            self.timings.status_poll_interval,
        )])
    }

    /// The execution changed while the submit call was in flight (typically
    /// a cancellation). Nobody will ever learn about `run_id`, so cancel it
    /// on the spot.
    async fn cancel_orphaned_run(&self, exec: &Execution, run_id: String) {
        warn!(
            execution_id = exec.id,
            run_id = %run_id,
            "execution changed during submission; canceling orphaned remote run"
        );
        if let Err(err) = self.client.cancel(run_id.clone()).await {
            warn!(
                execution_id = exec.id,
                run_id = %run_id,
                error = %err,
                "failed to cancel orphaned remote run"
            );
        }
    }

    async fn poll_status(&self, job: &Job) -> StepResult {
        let Some(exec) = expect_state(self.store.as_ref(), job, ExecutionState::Submitted)? else {
            return Ok(Vec::new());
        };
        let run_id = require_run_id(&exec)?;

        let status = self.client.status(run_id.clone()).await?;
        debug!(execution_id = exec.id, run_id = %run_id, remote = %status, "polled remote run");

        let mut next = exec.clone();
        let follow_up = match status.outcome() {
            PollOutcome::Pending => {
                return Ok(vec![NextJob::after(
                    JobKind::StatusPoll,
                    self.timings.status_poll_interval,
                )]);
            }
            PollOutcome::Succeeded => {
                next.transition(ExecutionState::Completing, format!("remote run {status}"))?;
                NextJob::now(JobKind::Completion)
            }
            PollOutcome::Failed => {
                next.fail(None, format!("remote run ended {status}"))?;
                NextJob::now(JobKind::Cleanup)
            }
        };

        if !self.commit(exec.version, next)? {
            return Ok(Vec::new());
        }
        info!(execution_id = exec.id, run_id = %run_id, remote = %status, "remote run finished");
        Ok(vec![follow_up])
    }

    async fn complete(&self, job: &Job) -> StepResult {
        let Some(exec) = expect_state(self.store.as_ref(), job, ExecutionState::Completing)? else {
            return Ok(Vec::new());
        };
        let run_id = require_run_id(&exec)?;

        let artifacts = self.client.fetch_outputs(run_id).await?;
        self.workspace.ingest_outputs(&exec, &artifacts)?;

        let mut next = exec.clone();
        next.transition(ExecutionState::Completed, "outputs ingested")?;
        if !self.commit(exec.version, next)? {
            return Ok(Vec::new());
        }

        info!(execution_id = exec.id, artifacts = artifacts.len(), "execution completed");
        Ok(vec![NextJob::now(JobKind::Cleanup)])
    }

    async fn cancel(&self, job: &Job) -> StepResult {
        let Some(exec) = expect_state(self.store.as_ref(), job, ExecutionState::Canceling)? else {
            return Ok(Vec::new());
        };

        match &exec.run_id {
            Some(run_id) => {
                let ack = self.client.cancel(run_id.clone()).await?;
                debug!(execution_id = exec.id, run_id = %ack.run_id, "remote cancel acknowledged");
            }
            None => debug!(execution_id = exec.id, "never submitted; nothing to cancel remotely"),
        }

        let mut next = exec.clone();
        next.transition(ExecutionState::Canceled, "cancellation confirmed")?;
        if !self.commit(exec.version, next)? {
            return Ok(Vec::new());
        }

        info!(execution_id = exec.id, "execution canceled");
        Ok(vec![NextJob::now(JobKind::Cleanup)])
    }

    fn clean_up(&self, job: &Job) -> StepResult {
        let Some(exec) = self.store.load(job.execution_id)? else {
            return Ok(Vec::new());
        };
        if !exec.state.is_terminal() {
            warn!(execution_id = exec.id, state = %exec.state, "cleanup before terminal state; skipping");
            return Ok(Vec::new());
        }
        if exec.cleaned {
            debug!(execution_id = exec.id, "already cleaned");
            return Ok(Vec::new());
        }

        if let Some(dir) = &exec.run_directory {
            self.workspace.release_run_directory(dir)?;
        }

        let mut next = exec.clone();
        next.mark_cleaned();
        if self.commit(exec.version, next)? {
            info!(execution_id = exec.id, state = %exec.state, "execution cleaned up");
        }
        Ok(Vec::new())
    }

    /// Retries are exhausted (or the failure was never retryable): move the
    /// execution to `error` and return the follow-up jobs.
    pub fn abandon(&self, job: &Job, failure: &JobFailure) -> StepResult {
        let expected = match job.kind {
            JobKind::Preparation => ExecutionState::Initial,
            JobKind::Submission => ExecutionState::Prepared,
            JobKind::StatusPoll => ExecutionState::Submitted,
            JobKind::Completion => ExecutionState::Completing,
            JobKind::Cancellation => ExecutionState::Canceling,
            JobKind::Cleanup => {
                // State is already terminal; leave `cleaned` unset so startup
                // recovery tries again.
                warn!(
                    execution_id = job.execution_id,
                    error = %failure,
                    "cleanup failed; execution left uncleaned"
                );
                return Ok(Vec::new());
            }
        };

        let Some(exec) = expect_state(self.store.as_ref(), job, expected)? else {
            return Ok(Vec::new());
        };

        let mut next = exec.clone();
        next.fail(
            failure.http_status(),
            format!("{} failed after {} attempt(s): {failure}", job.kind, job.attempt),
        )?;

        // Nothing was allocated that outlives a failed preparation.
        let preparation_failed = job.kind == JobKind::Preparation;
        if preparation_failed {
            next.mark_cleaned();
        }

        if !self.commit(exec.version, next)? {
            return Ok(Vec::new());
        }

        warn!(
            execution_id = exec.id,
            job = %job.kind,
            attempt = job.attempt,
            http_status = ?failure.http_status(),
            error = %failure,
            "giving up; execution moved to error"
        );

        if preparation_failed {
            Ok(Vec::new())
        } else {
            Ok(vec![NextJob::now(JobKind::Cleanup)])
        }
    }

    fn release_quietly(&self, exec: &Execution, dir: &RunDirectory) {
        if let Err(err) = self.workspace.release_run_directory(dir) {
            warn!(
                execution_id = exec.id,
                error = %format!("{err:#}"),
                "failed to release run directory"
            );
        }
    }
}
