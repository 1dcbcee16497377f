// src/execution/model.rs

//! The execution entity and the values that travel with it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{Result, WesflowError};
use crate::execution::state::ExecutionState;
use crate::types::ExecutionId;

/// Workflow being launched, as published by the pipeline registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowMetadata {
    pub name: String,
    pub version: String,
    /// Location the execution engine fetches the workflow from.
    pub url: String,
    #[serde(default = "default_workflow_type")]
    pub workflow_type: String,
    #[serde(default = "default_workflow_type_version")]
    pub workflow_type_version: String,
    #[serde(default)]
    pub engine: Option<String>,
    #[serde(default)]
    pub engine_version: Option<String>,
}

fn default_workflow_type() -> String {
    "NFL".to_string()
}

fn default_workflow_type_version() -> String {
    "DSL2".to_string()
}

/// Opaque handle to the storage location owned by one execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunDirectory(PathBuf);

impl RunDirectory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn path(&self) -> &Path {
        &self.0
    }
}

/// Everything the requester supplies when creating an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewExecution {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub samples: Vec<String>,
    pub workflow: WorkflowMetadata,
    #[serde(default)]
    pub workflow_params: Value,
    #[serde(default)]
    pub engine_params: Value,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// One entry of the append-only transition log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub from: ExecutionState,
    pub to: ExecutionState,
    pub at: DateTime<Utc>,
    pub reason: String,
}

/// A launched pipeline run and its lifecycle state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub name: String,
    pub owner: String,
    pub samples: Vec<String>,
    pub workflow: WorkflowMetadata,
    pub workflow_params: Value,
    pub engine_params: Value,
    pub tags: BTreeMap<String, String>,

    pub state: ExecutionState,
    /// Assigned by the execution engine once submitted; never changed afterwards.
    pub run_id: Option<String>,
    pub run_directory: Option<RunDirectory>,
    /// Status code of the client failure that moved the execution to `error`.
    pub http_error_code: Option<u16>,
    pub cleaned: bool,

    /// Bumped by the store on every successful write.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub history: Vec<Transition>,
}

impl Execution {
    /// Build a fresh record in `initial`. Only stores should call this.
    pub fn create(id: ExecutionId, new: NewExecution, now: DateTime<Utc>) -> Self {
        Self {
            id,
            name: new.name,
            owner: new.owner,
            samples: new.samples,
            workflow: new.workflow,
            workflow_params: new.workflow_params,
            engine_params: new.engine_params,
            tags: new.tags,
            state: ExecutionState::Initial,
            run_id: None,
            run_directory: None,
            http_error_code: None,
            cleaned: false,
            version: 0,
            created_at: now,
            updated_at: now,
            history: Vec::new(),
        }
    }

    /// Move along one edge of the state machine, recording it in `history`.
    pub fn transition(&mut self, next: ExecutionState, reason: impl Into<String>) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(WesflowError::InvalidTransition {
                id: self.id,
                from: self.state,
                to: next,
            });
        }

        let now = Utc::now();
        self.history.push(Transition {
            from: self.state,
            to: next,
            at: now,
            reason: reason.into(),
        });
        self.state = next;
        self.updated_at = now;
        Ok(())
    }

    /// Transition to `error`, recording the client status code if there is one.
    pub fn fail(&mut self, http_error_code: Option<u16>, reason: impl Into<String>) -> Result<()> {
        self.transition(ExecutionState::Error, reason)?;
        self.http_error_code = http_error_code;
        Ok(())
    }

    /// Record the engine-assigned run id and move to `submitted`.
    pub fn mark_submitted(&mut self, run_id: impl Into<String>) -> Result<()> {
        self.transition(ExecutionState::Submitted, "submitted to execution service")?;
        self.run_id = Some(run_id.into());
        Ok(())
    }

    pub fn mark_cleaned(&mut self) {
        self.cleaned = true;
        self.updated_at = Utc::now();
    }

    /// Check the record-level invariants, returning a description of the first
    /// violation found.
    pub fn invariant_violation(&self) -> Option<String> {
        match &self.run_id {
            Some(_) if !self.state.permits_run_id() => {
                return Some(format!("run_id present in state {}", self.state));
            }
            None if self.state.requires_run_id() => {
                return Some(format!("run_id missing in state {}", self.state));
            }
            _ => {}
        }

        if self.cleaned && !self.state.is_terminal() {
            return Some(format!("cleaned while still {}", self.state));
        }

        if self.http_error_code.is_some() && self.state != ExecutionState::Error {
            return Some(format!("http_error_code set in state {}", self.state));
        }

        let mut expected = ExecutionState::Initial;
        for step in &self.history {
            if step.from != expected || !step.from.can_transition_to(step.to) {
                return Some(format!("illegal history step {} -> {}", step.from, step.to));
            }
            expected = step.to;
        }
        if expected != self.state {
            return Some(format!(
                "history ends in {expected} but state is {}",
                self.state
            ));
        }

        None
    }

    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            id: self.id,
            name: self.name.clone(),
            state: self.state,
            run_id: self.run_id.clone(),
            http_error_code: self.http_error_code,
            cleaned: self.cleaned,
            version: self.version,
            updated_at: self.updated_at,
        }
    }
}

/// Read-only view handed to collaborators asking "where is this run at?".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub id: ExecutionId,
    pub name: String,
    pub state: ExecutionState,
    pub run_id: Option<String>,
    pub http_error_code: Option<u16>,
    pub cleaned: bool,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}
