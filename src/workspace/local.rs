// src/workspace/local.rs

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use serde_json::json;
use tracing::{debug, info};

use crate::client::{Artifact, ArtifactSet, RunRequest};
use crate::execution::{Execution, RunDirectory};
use crate::fs::FileSystem;
use crate::types::ExecutionId;

use super::Workspace;

const PAYLOAD_FILE: &str = "payload.json";

/// Run directories under `run_root/execution-<id>`, ingested outputs as one
/// JSON document per execution under `outputs_dir`.
#[derive(Debug, Clone)]
pub struct LocalWorkspace<F: FileSystem> {
    fs: F,
    run_root: PathBuf,
    outputs_dir: PathBuf,
}

impl<F: FileSystem> LocalWorkspace<F> {
    pub fn new(fs: F, run_root: impl Into<PathBuf>, outputs_dir: impl Into<PathBuf>) -> Self {
        Self {
            fs,
            run_root: run_root.into(),
            outputs_dir: outputs_dir.into(),
        }
    }

    pub fn run_directory_for(&self, id: ExecutionId) -> RunDirectory {
        RunDirectory::new(self.run_root.join(format!("execution-{id}")))
    }

    pub fn outputs_path(&self, id: ExecutionId) -> PathBuf {
        self.outputs_dir.join(format!("execution-{id}.json"))
    }
}

/// Group artifacts by the sample whose id occurs in the artifact name.
/// Artifacts matching no sample are returned separately.
fn link_to_samples<'a>(
    samples: &[String],
    artifacts: &'a ArtifactSet,
) -> (BTreeMap<String, Vec<&'a Artifact>>, Vec<&'a Artifact>) {
    let mut linked: BTreeMap<String, Vec<&Artifact>> = BTreeMap::new();
    let mut unlinked = Vec::new();

    for artifact in &artifacts.artifacts {
        let owners: Vec<&String> = samples
            .iter()
            .filter(|s| !s.is_empty() && artifact.name.contains(s.as_str()))
            .collect();
        if owners.is_empty() {
            unlinked.push(artifact);
        }
        for owner in owners {
            linked.entry(owner.clone()).or_default().push(artifact);
        }
    }

    (linked, unlinked)
}

impl<F: FileSystem> Workspace for LocalWorkspace<F> {
    fn allocate_run_directory(&self, id: ExecutionId) -> Result<RunDirectory> {
        let dir = self.run_directory_for(id);
        if self.fs.is_dir(dir.path()) {
            // Left by an earlier attempt of the same preparation.
            debug!(execution_id = id, path = ?dir.path(), "reusing run directory");
            return Ok(dir);
        }
        if self.fs.exists(dir.path()) {
            bail!("run directory {:?} exists but is not a directory", dir.path());
        }
        self.fs
            .create_dir_all(dir.path())
            .with_context(|| format!("allocating run directory for execution {id}"))?;
        debug!(execution_id = id, path = ?dir.path(), "allocated run directory");
        Ok(dir)
    }

    fn build_submission_payload(&self, exec: &Execution) -> Result<RunRequest> {
        if exec.workflow.url.trim().is_empty() {
            bail!("execution {} has no workflow url", exec.id);
        }

        let mut tags = exec.tags.clone();
        tags.insert("execution_id".to_string(), exec.id.to_string());
        if !exec.owner.is_empty() {
            tags.insert("owner".to_string(), exec.owner.clone());
        }
        if !exec.name.is_empty() {
            tags.insert("name".to_string(), exec.name.clone());
        }

        Ok(RunRequest {
            workflow_params: exec.workflow_params.clone(),
            workflow_type: exec.workflow.workflow_type.clone(),
            workflow_type_version: exec.workflow.workflow_type_version.clone(),
            workflow_url: exec.workflow.url.clone(),
            workflow_engine: exec.workflow.engine.clone(),
            workflow_engine_version: exec.workflow.engine_version.clone(),
            workflow_engine_parameters: exec.engine_params.clone(),
            tags,
        })
    }

    fn write_payload(&self, dir: &RunDirectory, payload: &RunRequest) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(payload)?;
        self.fs.write(&dir.path().join(PAYLOAD_FILE), &bytes)
    }

    fn read_payload(&self, dir: &RunDirectory) -> Result<RunRequest> {
        let path = dir.path().join(PAYLOAD_FILE);
        let contents = self.fs.read_to_string(&path)?;
        serde_json::from_str(&contents).with_context(|| format!("decoding payload {:?}", path))
    }

    fn ingest_outputs(&self, exec: &Execution, artifacts: &ArtifactSet) -> Result<()> {
        let (linked, unlinked) = link_to_samples(&exec.samples, artifacts);

        let document = json!({
            "execution_id": exec.id,
            "run_id": exec.run_id,
            "workflow": exec.workflow.name,
            "samples": linked,
            "run_outputs": unlinked,
        });

        let path = self.outputs_path(exec.id);
        self.fs
            .write(&path, &serde_json::to_vec_pretty(&document)?)
            .with_context(|| format!("writing outputs of execution {}", exec.id))?;

        info!(
            execution_id = exec.id,
            artifacts = artifacts.len(),
            linked_samples = linked.len(),
            path = ?path,
            "ingested run outputs"
        );
        Ok(())
    }

    fn release_run_directory(&self, dir: &RunDirectory) -> Result<()> {
        if !self.fs.is_dir(dir.path()) {
            debug!(path = ?dir.path(), "run directory already released");
            return Ok(());
        }
        self.fs.remove_dir_all(dir.path())?;
        debug!(path = ?dir.path(), "released run directory");
        Ok(())
    }
}
