use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use wesflow::client::{
    ArtifactSet, BoxFuture, CancelAck, ClientError, ClientResult, ExecutionClient, RemoteStatus,
    RunId, RunRequest,
};

/// One recorded call against the fake.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientCall {
    Submit(RunRequest),
    Status(RunId),
    Cancel(RunId),
    FetchOutputs(RunId),
}

/// Lets a test park `submit` mid-flight.
#[derive(Debug, Clone, Default)]
pub struct SubmitGate {
    /// Notified when a submit call has started and is waiting.
    pub entered: Arc<Notify>,
    /// Notify this to let the parked submit return.
    pub release: Arc<Notify>,
}

#[derive(Debug, Default)]
struct Scripts {
    submit: VecDeque<ClientResult<RunId>>,
    status: VecDeque<ClientResult<RemoteStatus>>,
    cancel: VecDeque<ClientResult<()>>,
    outputs: VecDeque<ClientResult<ArtifactSet>>,
}

/// A fake execution client that:
/// - answers each operation from a per-operation script (FIFO)
/// - falls back to a happy answer once a script runs dry
///   (`run-<n>` ids, `COMPLETE`, acknowledged cancels, the default outputs)
/// - records every call
#[derive(Debug, Default)]
pub struct ScriptedClient {
    scripts: Mutex<Scripts>,
    calls: Mutex<Vec<ClientCall>>,
    default_outputs: Mutex<ArtifactSet>,
    gate: Mutex<Option<SubmitGate>>,
    next_run: AtomicU64,
}

impl ScriptedClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script_submit(&self, results: impl IntoIterator<Item = ClientResult<RunId>>) {
        self.scripts.lock().unwrap().submit.extend(results);
    }

    pub fn script_status(&self, results: impl IntoIterator<Item = ClientResult<RemoteStatus>>) {
        self.scripts.lock().unwrap().status.extend(results);
    }

    pub fn script_cancel(&self, results: impl IntoIterator<Item = ClientResult<()>>) {
        self.scripts.lock().unwrap().cancel.extend(results);
    }

    pub fn script_outputs(&self, results: impl IntoIterator<Item = ClientResult<ArtifactSet>>) {
        self.scripts.lock().unwrap().outputs.extend(results);
    }

    /// Outputs returned once the outputs script is empty.
    pub fn set_default_outputs(&self, outputs: ArtifactSet) {
        *self.default_outputs.lock().unwrap() = outputs;
    }

    /// Park every following submit until `gate.release` is notified.
    pub fn hold_submissions(&self) -> SubmitGate {
        let gate = SubmitGate::default();
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn calls(&self) -> Vec<ClientCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn cancel_calls(&self) -> Vec<RunId> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                ClientCall::Cancel(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    pub fn submit_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, ClientCall::Submit(_)))
            .count()
    }

    fn record(&self, call: ClientCall) {
        self.calls.lock().unwrap().push(call);
    }
}

/// `n` copies of a transient failure (HTTP 503).
pub fn unavailable<T>(n: usize) -> Vec<ClientResult<T>> {
    (0..n)
        .map(|_| Err(ClientError::status(503, "service unavailable")))
        .collect()
}

/// `n` copies of a permanent failure with the given 4xx status.
pub fn rejected<T>(n: usize, status: u16) -> Vec<ClientResult<T>> {
    (0..n)
        .map(|_| Err(ClientError::status(status, "rejected")))
        .collect()
}

impl ExecutionClient for ScriptedClient {
    fn submit(&self, request: RunRequest) -> BoxFuture<'_, ClientResult<RunId>> {
        Box::pin(async move {
            self.record(ClientCall::Submit(request));

            let gate = self.gate.lock().unwrap().clone();
            if let Some(gate) = gate {
                gate.entered.notify_one();
                gate.release.notified().await;
            }

            let scripted = self.scripts.lock().unwrap().submit.pop_front();
            scripted.unwrap_or_else(|| {
                let n = self.next_run.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(format!("run-{n}"))
            })
        })
    }

    fn status(&self, run_id: RunId) -> BoxFuture<'_, ClientResult<RemoteStatus>> {
        Box::pin(async move {
            self.record(ClientCall::Status(run_id));
            let scripted = self.scripts.lock().unwrap().status.pop_front();
            scripted.unwrap_or(Ok(RemoteStatus::Complete))
        })
    }

    fn cancel(&self, run_id: RunId) -> BoxFuture<'_, ClientResult<CancelAck>> {
        Box::pin(async move {
            self.record(ClientCall::Cancel(run_id.clone()));
            let scripted = self.scripts.lock().unwrap().cancel.pop_front();
            scripted.unwrap_or(Ok(())).map(|()| CancelAck { run_id })
        })
    }

    fn fetch_outputs(&self, run_id: RunId) -> BoxFuture<'_, ClientResult<ArtifactSet>> {
        Box::pin(async move {
            self.record(ClientCall::FetchOutputs(run_id));
            let scripted = self.scripts.lock().unwrap().outputs.pop_front();
            scripted.unwrap_or_else(|| Ok(self.default_outputs.lock().unwrap().clone()))
        })
    }
}
