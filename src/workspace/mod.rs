// src/workspace/mod.rs

//! Collaborator contract for everything the pipeline does locally: building
//! the submission payload, owning run directories, and handing finished
//! outputs back to the samples they belong to.
//!
//! Failures here are local: they are never retried.

use anyhow::Result;

use crate::client::{ArtifactSet, RunRequest};
use crate::execution::{Execution, RunDirectory};
use crate::types::ExecutionId;

pub mod local;

pub use local::LocalWorkspace;

pub trait Workspace: Send + Sync {
    /// Reserve the storage location of one execution. Calling it again for
    /// the same id hands back the same location.
    fn allocate_run_directory(&self, id: ExecutionId) -> Result<RunDirectory>;

    fn build_submission_payload(&self, exec: &Execution) -> Result<RunRequest>;

    fn write_payload(&self, dir: &RunDirectory, payload: &RunRequest) -> Result<()>;

    fn read_payload(&self, dir: &RunDirectory) -> Result<RunRequest>;

    /// Link the outputs of a finished run back to the execution's samples.
    fn ingest_outputs(&self, exec: &Execution, artifacts: &ArtifactSet) -> Result<()>;

    /// Give the storage back. Releasing an already released directory is
    /// not an error.
    fn release_run_directory(&self, dir: &RunDirectory) -> Result<()>;
}
