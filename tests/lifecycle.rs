mod common;
use crate::common::{
    init_tracing, rejected, step_until, unavailable, ClientCall, Harness, NewExecutionBuilder,
    TestResult,
};

use std::path::Path;

use wesflow::client::{Artifact, ArtifactSet, ClientError, RemoteStatus};
use wesflow::engine::{JobKind, JobOutcome};
use wesflow::execution::ExecutionState;
use wesflow::fs::FileSystem;
use wesflow::workspace::Workspace;
use wesflow_test_utils::harness::RUN_ROOT;

fn artifact(name: &str) -> Artifact {
    Artifact {
        name: name.to_string(),
        url: format!("file:///results/{name}"),
    }
}

#[tokio::test]
async fn happy_path_runs_through_every_state_and_cleans_up() -> TestResult {
    init_tracing();
    let h = Harness::new();
    h.client.set_default_outputs(ArtifactSet::new(vec![
        artifact("S1.assembly.fa"),
        artifact("summary.txt"),
    ]));

    let snapshot = h
        .orchestrator
        .launch(NewExecutionBuilder::new("assembly").sample("S1").build())?;
    assert_eq!(snapshot.state, ExecutionState::Initial);
    let id = snapshot.id;

    h.run_to_idle().await;

    let exec = h.execution(id);
    assert_eq!(exec.state, ExecutionState::Completed);
    assert!(exec.cleaned);
    assert_eq!(exec.run_id.as_deref(), Some("run-1"));
    assert_eq!(exec.http_error_code, None);
    assert_eq!(exec.invariant_violation(), None);

    let visited: Vec<ExecutionState> = exec.history.iter().map(|t| t.to).collect();
    assert_eq!(
        visited,
        vec![
            ExecutionState::Prepared,
            ExecutionState::Submitted,
            ExecutionState::Completing,
            ExecutionState::Completed,
        ]
    );

    for kind in JobKind::ALL {
        let expected = u64::from(kind != JobKind::Cancellation);
        assert_eq!(h.performed(id, kind), expected, "performed {kind}");
    }

    // Run directory released, outputs recorded.
    let dir = h.workspace.run_directory_for(id);
    assert!(!h.fs.exists(dir.path()));
    let outputs = h.fs.read_to_string(&h.workspace.outputs_path(id))?;
    let doc: serde_json::Value = serde_json::from_str(&outputs)?;
    assert_eq!(doc["run_id"], "run-1");
    assert_eq!(doc["samples"]["S1"][0]["name"], "S1.assembly.fa");
    assert_eq!(doc["run_outputs"][0]["name"], "summary.txt");

    Ok(())
}

#[tokio::test]
async fn submitted_payload_carries_workflow_and_tags() -> TestResult {
    init_tracing();
    let h = Harness::new();
    let id = h
        .orchestrator
        .launch(
            NewExecutionBuilder::new("assembly")
                .owner("jdoe")
                .tag("project", "p7")
                .build(),
        )?
        .id;

    step_until(&h, id, ExecutionState::Submitted).await;

    let submitted = h
        .client
        .calls()
        .into_iter()
        .find_map(|c| match c {
            ClientCall::Submit(req) => Some(req),
            _ => None,
        })
        .expect("one submit call");
    assert_eq!(submitted.workflow_url, "https://github.com/phac-nml/iridanextexample");
    assert_eq!(submitted.workflow_type, "NFL");
    assert_eq!(submitted.tags["project"], "p7");
    assert_eq!(submitted.tags["owner"], "jdoe");
    assert_eq!(submitted.tags["execution_id"], id.to_string());

    // The payload the client saw is the one staged in the run directory.
    let dir = h
        .execution(id)
        .run_directory
        .expect("prepared execution has a run directory");
    assert_eq!(h.workspace.read_payload(&dir)?, submitted);
    Ok(())
}

#[tokio::test]
async fn status_polling_repeats_while_the_run_is_pending() -> TestResult {
    init_tracing();
    let h = Harness::new();
    h.client.script_status([
        Ok(RemoteStatus::Queued),
        Ok(RemoteStatus::Initializing),
        Ok(RemoteStatus::Running),
    ]);
    let id = h.orchestrator.launch(NewExecutionBuilder::new("slow").build())?.id;

    h.run_to_idle().await;

    assert_eq!(h.state(id), ExecutionState::Completed);
    assert_eq!(h.performed(id, JobKind::StatusPoll), 4);
    // Re-polls are fresh jobs, not retries.
    assert_eq!(h.enqueued(id, JobKind::StatusPoll), 4);
    Ok(())
}

#[tokio::test]
async fn remote_failure_moves_execution_to_error_without_http_code() -> TestResult {
    init_tracing();
    let h = Harness::new();
    h.client.script_status([Ok(RemoteStatus::Running), Ok(RemoteStatus::ExecutorError)]);
    let id = h.orchestrator.launch(NewExecutionBuilder::new("broken").build())?.id;

    h.run_to_idle().await;

    let exec = h.execution(id);
    assert_eq!(exec.state, ExecutionState::Error);
    assert_eq!(exec.http_error_code, None);
    assert!(exec.cleaned);
    assert_eq!(h.performed(id, JobKind::Completion), 0);
    assert_eq!(h.enqueued(id, JobKind::Cleanup), 1);
    assert!(
        !h.client
            .calls()
            .iter()
            .any(|c| matches!(c, ClientCall::FetchOutputs(_)))
    );
    Ok(())
}

#[tokio::test]
async fn canceled_remote_status_counts_as_failure() -> TestResult {
    init_tracing();
    let h = Harness::new();
    h.client.script_status([Ok(RemoteStatus::Canceled)]);
    let id = h.orchestrator.launch(NewExecutionBuilder::new("killed").build())?.id;

    h.run_to_idle().await;

    assert_eq!(h.state(id), ExecutionState::Error);
    Ok(())
}

#[tokio::test]
async fn preparation_failure_skips_submission_and_is_cleaned() -> TestResult {
    init_tracing();
    let h = Harness::new();
    let id = h
        .orchestrator
        .launch(NewExecutionBuilder::new("no-url").workflow_url("  ").build())?
        .id;

    let report = h.scheduler.perform_next().await?.expect("preparation job");
    assert_eq!(report.job.kind, JobKind::Preparation);
    assert_eq!(report.outcome, JobOutcome::GaveUp { follow_ups: vec![] });

    h.run_to_idle().await;

    let exec = h.execution(id);
    assert_eq!(exec.state, ExecutionState::Error);
    assert!(exec.cleaned);
    assert_eq!(exec.http_error_code, None);
    assert_eq!(h.performed(id, JobKind::Preparation), 1);
    assert_eq!(h.enqueued(id, JobKind::Submission), 0);
    assert_eq!(h.client.submit_count(), 0);
    // The half-built run directory did not survive.
    assert!(!h.fs.exists(h.workspace.run_directory_for(id).path()));
    Ok(())
}

#[tokio::test]
async fn unwritable_run_root_fails_preparation() -> TestResult {
    init_tracing();
    let h = Harness::new();
    h.fs.deny_writes_under(Path::new(RUN_ROOT));
    let id = h.orchestrator.launch(NewExecutionBuilder::new("readonly").build())?.id;

    h.run_to_idle().await;

    assert_eq!(h.state(id), ExecutionState::Error);
    assert!(h.execution(id).cleaned);
    assert_eq!(h.enqueued(id, JobKind::Submission), 0);
    Ok(())
}

#[tokio::test]
async fn preparation_rerun_reuses_the_directory_of_an_interrupted_attempt() -> TestResult {
    init_tracing();
    let h = Harness::new();
    // An earlier attempt got as far as creating the directory and staging a payload.
    let leftover = h.workspace.run_directory_for(1);
    h.fs.create_dir_all(leftover.path())?;
    h.fs.write(&leftover.path().join("payload.json"), b"{\"truncated\":")?;

    let id = h.orchestrator.launch(NewExecutionBuilder::new("rerun").build())?.id;
    assert_eq!(id, 1);
    step_until(&h, id, ExecutionState::Prepared).await;
    let staged = h.workspace.read_payload(&leftover)?;
    assert!(staged.tags.contains_key("execution_id"));

    h.run_to_idle().await;

    let exec = h.execution(id);
    assert_eq!(exec.state, ExecutionState::Completed);
    assert!(exec.cleaned);
    assert!(!h.fs.exists(leftover.path()));
    Ok(())
}

#[tokio::test]
async fn submission_rejection_records_http_status() -> TestResult {
    init_tracing();
    let h = Harness::new();
    h.client.script_submit(rejected(3, 400));
    let id = h.orchestrator.launch(NewExecutionBuilder::new("bad-params").build())?.id;

    h.run_to_idle().await;

    let exec = h.execution(id);
    assert_eq!(exec.state, ExecutionState::Error);
    assert_eq!(exec.http_error_code, Some(400));
    assert_eq!(exec.run_id, None);
    assert!(exec.cleaned);
    assert_eq!(h.performed(id, JobKind::Submission), 3);
    assert_eq!(h.enqueued(id, JobKind::Cleanup), 1);
    Ok(())
}

#[tokio::test]
async fn transient_poll_failures_are_retried_then_give_up() -> TestResult {
    init_tracing();
    let h = Harness::new();
    h.client.script_status([
        Err(ClientError::Timeout("read timed out".to_string())),
        Err(ClientError::Connection("reset".to_string())),
    ]);
    h.client
        .script_status(unavailable(4));
    let id = h.orchestrator.launch(NewExecutionBuilder::new("flaky").build())?.id;

    h.run_to_idle().await;

    let exec = h.execution(id);
    assert_eq!(exec.state, ExecutionState::Error);
    assert_eq!(exec.http_error_code, Some(503));
    assert_eq!(h.performed(id, JobKind::StatusPoll), 6);
    assert_eq!(h.enqueued(id, JobKind::StatusPoll), 1);
    Ok(())
}

#[tokio::test]
async fn outputs_fetch_recovers_after_a_transient_failure() -> TestResult {
    init_tracing();
    let h = Harness::new();
    h.client
        .script_outputs([Err(ClientError::status(502, "bad gateway"))]);
    let id = h.orchestrator.launch(NewExecutionBuilder::new("outputs").build())?.id;

    h.run_to_idle().await;

    assert_eq!(h.state(id), ExecutionState::Completed);
    assert_eq!(h.performed(id, JobKind::Completion), 2);
    Ok(())
}

#[tokio::test]
async fn cleanup_is_idempotent() -> TestResult {
    init_tracing();
    let h = Harness::new();
    let id = h.orchestrator.launch(NewExecutionBuilder::new("twice").build())?.id;
    h.run_to_idle().await;

    let before = h.execution(id);
    assert!(before.cleaned);

    h.scheduler
        .enqueue(id, JobKind::Cleanup, std::time::Duration::ZERO)?;
    h.run_to_idle().await;

    let after = h.execution(id);
    assert_eq!(h.performed(id, JobKind::Cleanup), 2);
    assert_eq!(after.version, before.version);
    assert_eq!(after.state, ExecutionState::Completed);
    assert!(after.cleaned);
    Ok(())
}

#[tokio::test]
async fn cleanup_before_terminal_state_does_nothing() -> TestResult {
    init_tracing();
    let h = Harness::new();
    let id = h.orchestrator.launch(NewExecutionBuilder::new("early").build())?.id;
    step_until(&h, id, ExecutionState::Prepared).await;

    h.scheduler
        .enqueue(id, JobKind::Cleanup, std::time::Duration::ZERO)?;
    let report = h
        .scheduler
        .perform_next_matching(|job| job.kind == JobKind::Cleanup)
        .await?
        .expect("cleanup job");
    assert_eq!(report.outcome, JobOutcome::Done { follow_ups: vec![] });

    let exec = h.execution(id);
    assert_eq!(exec.state, ExecutionState::Prepared);
    assert!(!exec.cleaned);
    assert!(h.fs.is_dir(h.workspace.run_directory_for(id).path()));
    Ok(())
}

#[tokio::test]
async fn stale_jobs_are_skipped_after_the_execution_moves_on() -> TestResult {
    init_tracing();
    let h = Harness::new();
    let id = h.orchestrator.launch(NewExecutionBuilder::new("stale").build())?.id;
    h.run_to_idle().await;
    let version = h.execution(id).version;

    for kind in [JobKind::Preparation, JobKind::Submission, JobKind::StatusPoll] {
        h.scheduler.enqueue(id, kind, std::time::Duration::ZERO)?;
    }
    h.run_to_idle().await;

    assert_eq!(h.execution(id).version, version);
    assert_eq!(h.client.submit_count(), 1);
    Ok(())
}

#[tokio::test]
async fn executions_progress_independently() -> TestResult {
    init_tracing();
    let h = Harness::new();
    h.client.script_submit([Ok("run-a".to_string()), Err(ClientError::status(422, "bad"))]);
    h.client.script_submit(rejected(2, 422));

    let a = h.orchestrator.launch(NewExecutionBuilder::new("a").build())?.id;
    let b = h.orchestrator.launch(NewExecutionBuilder::new("b").build())?.id;
    assert_ne!(a, b);

    h.run_to_idle().await;

    assert_eq!(h.state(a), ExecutionState::Completed);
    assert_eq!(h.execution(a).run_id.as_deref(), Some("run-a"));
    assert_eq!(h.state(b), ExecutionState::Error);
    assert_eq!(h.execution(b).http_error_code, Some(422));

    let listed = h.orchestrator.list()?;
    assert_eq!(listed.len(), 2);
    Ok(())
}
