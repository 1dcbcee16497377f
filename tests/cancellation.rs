mod common;
use crate::common::{
    init_tracing, rejected, step_until, unavailable, with_timeout, Harness, NewExecutionBuilder,
    TestResult,
};

use std::sync::Arc;

use wesflow::engine::{JobKind, JobOutcome};
use wesflow::errors::WesflowError;
use wesflow::execution::ExecutionState;
use wesflow::fs::FileSystem;
use wesflow::types::ExecutionId;

/// Launch one execution and step it to `submitted`.
async fn submitted(h: &Harness) -> Result<ExecutionId, WesflowError> {
    let id = h
        .orchestrator
        .launch(NewExecutionBuilder::new("to-cancel").build())?
        .id;
    step_until(h, id, ExecutionState::Submitted).await;
    Ok(id)
}

#[tokio::test]
async fn cancel_retries_transient_failures_until_it_succeeds() -> TestResult {
    init_tracing();
    let h = Harness::new();
    h.client.script_cancel(unavailable(5));
    let id = submitted(&h).await?;

    let snapshot = h.orchestrator.request_cancellation(id)?;
    assert_eq!(snapshot.state, ExecutionState::Canceling);

    h.run_to_idle().await;

    let exec = h.execution(id);
    assert_eq!(exec.state, ExecutionState::Canceled);
    assert!(exec.cleaned);
    assert_eq!(exec.http_error_code, None);
    assert_eq!(h.performed(id, JobKind::Cancellation), 6);
    assert_eq!(h.enqueued(id, JobKind::Cancellation), 1);
    assert_eq!(h.enqueued(id, JobKind::Cleanup), 1);
    assert_eq!(h.client.cancel_calls(), vec!["run-1".to_string(); 6]);
    Ok(())
}

#[tokio::test]
async fn cancel_gives_up_after_three_permanent_failures() -> TestResult {
    init_tracing();
    let h = Harness::new();
    h.client.script_cancel(rejected(3, 400));
    let id = submitted(&h).await?;

    h.orchestrator.request_cancellation(id)?;
    h.run_to_idle().await;

    let exec = h.execution(id);
    assert_eq!(exec.state, ExecutionState::Error);
    assert_eq!(exec.http_error_code, Some(400));
    assert!(exec.cleaned);
    assert_eq!(h.performed(id, JobKind::Cancellation), 3);
    assert_eq!(h.enqueued(id, JobKind::Cleanup), 1);
    assert_eq!(h.performed(id, JobKind::Cleanup), 1);
    Ok(())
}

#[tokio::test]
async fn cancel_gives_up_after_six_transient_failures() -> TestResult {
    init_tracing();
    let h = Harness::new();
    h.client.script_cancel(unavailable(6));
    let id = submitted(&h).await?;

    h.orchestrator.request_cancellation(id)?;
    h.run_to_idle().await;

    let exec = h.execution(id);
    assert_eq!(exec.state, ExecutionState::Error);
    assert_eq!(exec.http_error_code, Some(503));
    assert_eq!(h.performed(id, JobKind::Cancellation), 6);
    assert_eq!(h.enqueued(id, JobKind::Cleanup), 1);
    Ok(())
}

#[tokio::test]
async fn single_transient_failure_costs_one_extra_attempt() -> TestResult {
    init_tracing();
    let h = Harness::new();
    h.client.script_cancel(unavailable(1));
    let id = submitted(&h).await?;

    h.orchestrator.request_cancellation(id)?;

    // Pending status poll is stale once the execution is canceling.
    let first = h
        .scheduler
        .perform_next_matching(|job| job.kind == JobKind::Cancellation)
        .await?
        .expect("cancellation job");
    assert!(matches!(
        first.outcome,
        JobOutcome::Retrying { next_attempt: 2, .. }
    ));

    h.run_to_idle().await;

    assert_eq!(h.state(id), ExecutionState::Canceled);
    assert_eq!(h.performed(id, JobKind::Cancellation), 2);
    Ok(())
}

#[tokio::test]
async fn cancel_before_submission_never_contacts_the_service() -> TestResult {
    init_tracing();
    let h = Harness::new();
    let id = h
        .orchestrator
        .launch(NewExecutionBuilder::new("early").build())?
        .id;
    step_until(&h, id, ExecutionState::Prepared).await;
    assert!(h.fs.is_dir(h.workspace.run_directory_for(id).path()));

    h.orchestrator.request_cancellation(id)?;
    h.run_to_idle().await;

    let exec = h.execution(id);
    assert_eq!(exec.state, ExecutionState::Canceled);
    assert_eq!(exec.run_id, None);
    assert!(exec.cleaned);
    assert_eq!(h.client.submit_count(), 0);
    assert!(h.client.cancel_calls().is_empty());
    assert!(!h.fs.exists(h.workspace.run_directory_for(id).path()));
    Ok(())
}

#[tokio::test]
async fn cancel_of_a_fresh_execution_skips_preparation() -> TestResult {
    init_tracing();
    let h = Harness::new();
    let id = h
        .orchestrator
        .launch(NewExecutionBuilder::new("fresh").build())?
        .id;

    h.orchestrator.request_cancellation(id)?;
    h.run_to_idle().await;

    let exec = h.execution(id);
    assert_eq!(exec.state, ExecutionState::Canceled);
    assert_eq!(exec.run_directory, None);
    assert!(exec.cleaned);
    assert_eq!(h.enqueued(id, JobKind::Submission), 0);
    Ok(())
}

#[tokio::test]
async fn terminal_executions_are_not_cancelable() -> TestResult {
    init_tracing();
    let h = Harness::new();
    let id = h
        .orchestrator
        .launch(NewExecutionBuilder::new("done").build())?
        .id;
    h.run_to_idle().await;
    let version = h.execution(id).version;

    let err = h
        .orchestrator
        .request_cancellation(id)
        .expect_err("completed execution cannot be canceled");
    assert!(matches!(
        err,
        WesflowError::NotCancelable {
            state: ExecutionState::Completed,
            ..
        }
    ));
    assert_eq!(h.execution(id).version, version);
    assert_eq!(h.enqueued(id, JobKind::Cancellation), 0);
    Ok(())
}

#[tokio::test]
async fn second_cancel_request_is_rejected() -> TestResult {
    init_tracing();
    let h = Harness::new();
    let id = submitted(&h).await?;

    h.orchestrator.request_cancellation(id)?;
    let err = h
        .orchestrator
        .request_cancellation(id)
        .expect_err("canceling cannot be canceled again");
    assert!(matches!(
        err,
        WesflowError::NotCancelable {
            state: ExecutionState::Canceling,
            ..
        }
    ));
    assert_eq!(h.enqueued(id, JobKind::Cancellation), 1);
    Ok(())
}

#[tokio::test]
async fn cancel_of_unknown_execution_is_not_found() {
    init_tracing();
    let h = Harness::new();
    let err = h
        .orchestrator
        .request_cancellation(42)
        .expect_err("nothing to cancel");
    assert!(matches!(err, WesflowError::ExecutionNotFound(42)));
}

#[tokio::test]
async fn cancel_during_submission_cancels_the_orphaned_run() -> TestResult {
    init_tracing();
    let h = Harness::new();
    let id = h
        .orchestrator
        .launch(NewExecutionBuilder::new("racy").build())?
        .id;
    step_until(&h, id, ExecutionState::Prepared).await;

    let gate = h.client.hold_submissions();
    let scheduler = Arc::clone(&h.scheduler);
    let submitting = tokio::spawn(async move { scheduler.perform_next().await });

    with_timeout(gate.entered.notified()).await;
    h.orchestrator.request_cancellation(id)?;
    gate.release.notify_one();

    let report = with_timeout(submitting).await??.expect("submission job");
    assert_eq!(report.job.kind, JobKind::Submission);
    assert_eq!(report.outcome, JobOutcome::Done { follow_ups: vec![] });

    // The submit lost the race: no run id recorded, remote run canceled.
    let exec = h.execution(id);
    assert_eq!(exec.state, ExecutionState::Canceling);
    assert_eq!(exec.run_id, None);
    assert_eq!(h.client.cancel_calls(), vec!["run-1".to_string()]);

    h.run_to_idle().await;

    let exec = h.execution(id);
    assert_eq!(exec.state, ExecutionState::Canceled);
    assert!(exec.cleaned);
    assert_eq!(h.enqueued(id, JobKind::StatusPoll), 0);
    assert_eq!(h.client.cancel_calls().len(), 1);
    Ok(())
}
