use std::sync::Arc;
use std::time::Duration;

use wesflow::engine::{JobKind, JobQueue, Pipeline, PipelineTimings, RetryPolicies, RetryPolicy, Scheduler};
use wesflow::execution::{Execution, ExecutionState, ExecutionStore, MemoryExecutionStore};
use wesflow::fs::mock::MockFileSystem;
use wesflow::orchestrator::Orchestrator;
use wesflow::types::ExecutionId;
use wesflow::workspace::LocalWorkspace;

use crate::fake_client::ScriptedClient;

pub const RUN_ROOT: &str = "/runs";
pub const OUTPUTS_DIR: &str = "/outputs";

/// Step delays of zero, so stepping never has to wait.
pub fn instant_timings() -> PipelineTimings {
    PipelineTimings {
        submission_delay: Duration::ZERO,
        status_poll_interval: Duration::ZERO,
    }
}

/// Default ceilings (5 transient, 2 permanent) with no delay between attempts.
pub fn instant_retries() -> RetryPolicies {
    RetryPolicies::new(RetryPolicy {
        delay: Duration::ZERO,
        ..RetryPolicy::default()
    })
}

/// An in-memory orchestrator wired to a scripted client and a mock filesystem.
pub struct Harness {
    pub orchestrator: Orchestrator,
    pub scheduler: Arc<Scheduler>,
    pub client: Arc<ScriptedClient>,
    pub fs: MockFileSystem,
    pub workspace: Arc<LocalWorkspace<MockFileSystem>>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_retries(instant_retries())
    }

    pub fn with_retries(retry: RetryPolicies) -> Self {
        let fs = MockFileSystem::new();
        let workspace = Arc::new(LocalWorkspace::new(fs.clone(), RUN_ROOT, OUTPUTS_DIR));
        let client = ScriptedClient::new();
        let store: Arc<dyn ExecutionStore> = Arc::new(MemoryExecutionStore::new());

        let pipeline = Pipeline::new(
            store,
            client.clone(),
            workspace.clone(),
            instant_timings(),
        );
        let scheduler = Arc::new(
            Scheduler::new(JobQueue::in_memory(), pipeline, retry).with_job_counters(),
        );
        let orchestrator = Orchestrator::new(Arc::clone(&scheduler));

        Self {
            orchestrator,
            scheduler,
            client,
            fs,
            workspace,
        }
    }

    pub fn execution(&self, id: ExecutionId) -> Execution {
        self.orchestrator
            .execution(id)
            .expect("execution should exist")
    }

    pub fn state(&self, id: ExecutionId) -> ExecutionState {
        self.execution(id).state
    }

    pub fn performed(&self, id: ExecutionId, kind: JobKind) -> u64 {
        self.scheduler.performed_count(id, kind)
    }

    pub fn enqueued(&self, id: ExecutionId, kind: JobKind) -> u64 {
        self.scheduler.enqueued_count(id, kind)
    }

    /// Step jobs until the queue is empty; panics if it never empties.
    pub async fn run_to_idle(&self) {
        self.scheduler
            .drain(500)
            .await
            .expect("stepping should not fail");
        assert!(self.scheduler.is_idle(), "queue did not drain");
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}
