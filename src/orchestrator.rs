// src/orchestrator.rs

//! The surface collaborators use: create executions, ask for cancellation,
//! read state. Everything else happens in jobs.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::engine::{JobKind, Scheduler};
use crate::errors::{Result, WesflowError};
use crate::execution::{
    CasOutcome, Execution, ExecutionState, ExecutionStore, NewExecution, StateSnapshot,
};
use crate::types::ExecutionId;

/// How often `request_cancellation` re-reads after losing a CAS race before
/// giving up with [`WesflowError::Conflict`].
const CANCEL_CAS_ATTEMPTS: usize = 8;

#[derive(Clone)]
pub struct Orchestrator {
    store: Arc<dyn ExecutionStore>,
    scheduler: Arc<Scheduler>,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

/// The job that moves an execution in `state` forward, if one is needed.
fn job_for(exec: &Execution) -> Option<JobKind> {
    match exec.state {
        ExecutionState::Initial => Some(JobKind::Preparation),
        ExecutionState::Prepared => Some(JobKind::Submission),
        ExecutionState::Submitted => Some(JobKind::StatusPoll),
        ExecutionState::Completing => Some(JobKind::Completion),
        ExecutionState::Canceling => Some(JobKind::Cancellation),
        ExecutionState::Completed | ExecutionState::Canceled | ExecutionState::Error => {
            (!exec.cleaned).then_some(JobKind::Cleanup)
        }
    }
}

impl Orchestrator {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self {
            store: Arc::clone(scheduler.store()),
            scheduler,
        }
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.store
    }

    /// Create an execution in `initial` and queue its preparation.
    pub fn launch(&self, new: NewExecution) -> Result<StateSnapshot> {
        let exec = self.store.insert(new)?;
        self.scheduler
            .enqueue(exec.id, JobKind::Preparation, Duration::ZERO)?;
        info!(execution_id = exec.id, name = %exec.name, owner = %exec.owner, "execution launched");
        Ok(exec.snapshot())
    }

    /// Move the execution to `canceling` and queue the cancellation job.
    ///
    /// Only `initial`, `prepared` and `submitted` are cancelable; anything
    /// else yields [`WesflowError::NotCancelable`] with the current state.
    pub fn request_cancellation(&self, id: ExecutionId) -> Result<StateSnapshot> {
        for _ in 0..CANCEL_CAS_ATTEMPTS {
            let exec = self
                .store
                .load(id)?
                .ok_or(WesflowError::ExecutionNotFound(id))?;

            if !exec.state.is_cancelable() {
                return Err(WesflowError::NotCancelable {
                    id,
                    state: exec.state,
                });
            }

            let mut next = exec.clone();
            next.transition(ExecutionState::Canceling, "cancellation requested")?;

            match self.store.compare_and_swap(exec.version, next)? {
                CasOutcome::Applied(updated) => {
                    self.scheduler
                        .enqueue(id, JobKind::Cancellation, Duration::ZERO)?;
                    info!(execution_id = id, from = %exec.state, "cancellation requested");
                    return Ok(updated.snapshot());
                }
                CasOutcome::Conflict(current) => {
                    warn!(
                        execution_id = id,
                        state = %current.state,
                        "execution changed while requesting cancellation; re-reading"
                    );
                }
            }
        }

        Err(WesflowError::Conflict(id))
    }

    pub fn state(&self, id: ExecutionId) -> Result<StateSnapshot> {
        self.store
            .load(id)?
            .map(|exec| exec.snapshot())
            .ok_or(WesflowError::ExecutionNotFound(id))
    }

    pub fn execution(&self, id: ExecutionId) -> Result<Execution> {
        self.store
            .load(id)?
            .ok_or(WesflowError::ExecutionNotFound(id))
    }

    pub fn list(&self) -> Result<Vec<StateSnapshot>> {
        Ok(self.store.list()?.iter().map(Execution::snapshot).collect())
    }

    /// Re-enqueue work for executions the queue no longer knows about (for
    /// example after the queue snapshot was lost). Returns how many jobs were
    /// enqueued.
    pub fn recover(&self) -> Result<usize> {
        let mut recovered = 0;
        for exec in self.store.list()? {
            if self.scheduler.has_jobs_for(exec.id) {
                continue;
            }
            if let Some(kind) = job_for(&exec) {
                self.scheduler.enqueue(exec.id, kind, Duration::ZERO)?;
                info!(execution_id = exec.id, state = %exec.state, job = %kind, "recovered execution");
                recovered += 1;
            }
        }
        Ok(recovered)
    }
}
