#![allow(dead_code)]

pub use wesflow_test_utils::builders::NewExecutionBuilder;
pub use wesflow_test_utils::fake_client::{rejected, unavailable, ClientCall, ScriptedClient};
pub use wesflow_test_utils::harness::{instant_retries, instant_timings, Harness};
pub use wesflow_test_utils::{init_tracing, with_timeout};

use wesflow::execution::ExecutionState;
use wesflow::types::ExecutionId;

pub type TestResult = Result<(), Box<dyn std::error::Error>>;

/// Step jobs one at a time until `id` reaches `target`.
pub async fn step_until(h: &Harness, id: ExecutionId, target: ExecutionState) {
    for _ in 0..50 {
        if h.state(id) == target {
            return;
        }
        let stepped = h
            .scheduler
            .perform_next()
            .await
            .expect("stepping should not fail");
        assert!(
            stepped.is_some(),
            "queue emptied before execution {id} reached {target} (now {})",
            h.state(id)
        );
    }
    panic!("execution {id} never reached {target}");
}
