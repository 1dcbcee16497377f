// src/client/mod.rs

//! Protocol adapter for the external execution engine.
//!
//! Jobs only see the [`ExecutionClient`] trait. Production uses
//! [`HttpExecutionClient`]; tests plug in scripted fakes.

use std::future::Future;
use std::pin::Pin;

pub mod error;
pub mod http;
pub mod wire;

pub use error::{ClientError, ErrorClass};
pub use http::HttpExecutionClient;
pub use wire::{
    Artifact, ArtifactSet, CancelAck, PollOutcome, RemoteStatus, RunId, RunLog, RunRequest,
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub type ClientResult<T> = std::result::Result<T, ClientError>;

/// Operations the job pipeline needs from the execution service.
pub trait ExecutionClient: Send + Sync {
    /// Create a remote run and return its engine-assigned id.
    fn submit(&self, request: RunRequest) -> BoxFuture<'_, ClientResult<RunId>>;

    fn status(&self, run_id: RunId) -> BoxFuture<'_, ClientResult<RemoteStatus>>;

    fn cancel(&self, run_id: RunId) -> BoxFuture<'_, ClientResult<CancelAck>>;

    /// Outputs of a finished run.
    fn fetch_outputs(&self, run_id: RunId) -> BoxFuture<'_, ClientResult<ArtifactSet>>;
}
