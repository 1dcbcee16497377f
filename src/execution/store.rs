// src/execution/store.rs

//! Persistence for execution records.
//!
//! Every write goes through [`ExecutionStore::compare_and_swap`]: the caller
//! states which `version` it read, and the write is rejected if anything else
//! updated the record in between. Jobs never hold locks across external calls;
//! they re-read, act, and try to commit.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::Context;
use chrono::Utc;
use tracing::{debug, info};

use crate::errors::{Result, WesflowError};
use crate::execution::model::{Execution, NewExecution};
use crate::fs::lock::FileLock;
use crate::types::ExecutionId;

const LOCK_FILE: &str = "store.lock";

/// Result of a conditional write.
#[derive(Debug, Clone, PartialEq)]
pub enum CasOutcome {
    /// The write landed; this is the stored record (with its new version).
    Applied(Execution),
    /// Someone else wrote first; this is what is stored now.
    Conflict(Execution),
}

/// Abstract storage for execution records.
pub trait ExecutionStore: Send + Sync {
    /// Persist a new record in `initial`, assigning its id.
    fn insert(&self, new: NewExecution) -> Result<Execution>;

    fn load(&self, id: ExecutionId) -> Result<Option<Execution>>;

    /// Replace the stored record if its version still equals
    /// `expected_version`.
    ///
    /// Rejects (with an error, not a conflict) writes whose state change is
    /// not an edge of the state machine.
    fn compare_and_swap(&self, expected_version: u64, next: Execution) -> Result<CasOutcome>;

    /// All records, ordered by id.
    fn list(&self) -> Result<Vec<Execution>>;
}

/// Shared CAS check for both store flavours.
fn check_write(current: &Execution, expected_version: u64, next: &Execution) -> Result<bool> {
    if current.version != expected_version {
        return Ok(false);
    }
    if current.state != next.state && !current.state.can_transition_to(next.state) {
        return Err(WesflowError::InvalidTransition {
            id: current.id,
            from: current.state,
            to: next.state,
        });
    }
    if current.run_id.is_some() && current.run_id != next.run_id {
        return Err(WesflowError::Other(anyhow::anyhow!(
            "run_id of execution {} is immutable once assigned",
            current.id
        )));
    }
    Ok(true)
}

/// Stores executions in memory only.
#[derive(Debug, Default)]
pub struct MemoryExecutionStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    last_id: ExecutionId,
    records: BTreeMap<ExecutionId, Execution>,
}

impl MemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ExecutionStore for MemoryExecutionStore {
    fn insert(&self, new: NewExecution) -> Result<Execution> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.last_id += 1;
        let exec = Execution::create(inner.last_id, new, Utc::now());
        inner.records.insert(exec.id, exec.clone());
        debug!(execution_id = exec.id, "stored new execution (memory)");
        Ok(exec)
    }

    fn load(&self, id: ExecutionId) -> Result<Option<Execution>> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(inner.records.get(&id).cloned())
    }

    fn compare_and_swap(&self, expected_version: u64, mut next: Execution) -> Result<CasOutcome> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let current = inner
            .records
            .get(&next.id)
            .ok_or(WesflowError::ExecutionNotFound(next.id))?;

        if !check_write(current, expected_version, &next)? {
            return Ok(CasOutcome::Conflict(current.clone()));
        }

        next.version = expected_version + 1;
        inner.records.insert(next.id, next.clone());
        Ok(CasOutcome::Applied(next))
    }

    fn list(&self) -> Result<Vec<Execution>> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(inner.records.values().cloned().collect())
    }
}

/// Stores one JSON document per execution under `<root>/<id>.json`.
///
/// Writes go to a temporary file first and are renamed into place, so a
/// crash never leaves a half-written record behind. Every read-check-write
/// holds `<root>/store.lock`, which serialises writers across threads and
/// across processes sharing the directory.
#[derive(Debug)]
pub struct FileExecutionStore {
    root: PathBuf,
}

impl FileExecutionStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("creating execution store at {:?}", root))?;
        info!(root = ?root, "opened file execution store");
        Ok(Self { root })
    }

    fn lock(&self) -> Result<FileLock> {
        Ok(FileLock::acquire(&self.root.join(LOCK_FILE))?)
    }

    fn record_path(&self, id: ExecutionId) -> PathBuf {
        self.root.join(format!("{id}.json"))
    }

    fn read_record(&self, path: &Path) -> Result<Execution> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("reading execution record {:?}", path))?;
        Ok(serde_json::from_str(&contents)?)
    }

    fn write_record(&self, exec: &Execution) -> Result<()> {
        let path = self.record_path(exec.id);
        let tmp = path.with_extension("json.tmp");

        let file =
            File::create(&tmp).with_context(|| format!("creating temp record {:?}", tmp))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, exec)?;
        writer.flush()?;
        drop(writer);

        fs::rename(&tmp, &path)
            .with_context(|| format!("moving record into place at {:?}", path))?;
        Ok(())
    }

    fn record_ids(&self) -> Result<Vec<ExecutionId>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.root)
            .with_context(|| format!("listing execution store {:?}", self.root))?
        {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<ExecutionId>().ok())
            {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }
}

impl ExecutionStore for FileExecutionStore {
    fn insert(&self, new: NewExecution) -> Result<Execution> {
        let _guard = self.lock()?;
        let id = self.record_ids()?.last().copied().unwrap_or(0) + 1;
        let exec = Execution::create(id, new, Utc::now());
        self.write_record(&exec)?;
        debug!(execution_id = id, "stored new execution (file)");
        Ok(exec)
    }

    fn load(&self, id: ExecutionId) -> Result<Option<Execution>> {
        let _guard = self.lock()?;
        let path = self.record_path(id);
        if !path.exists() {
            return Ok(None);
        }
        self.read_record(&path).map(Some)
    }

    fn compare_and_swap(&self, expected_version: u64, mut next: Execution) -> Result<CasOutcome> {
        let _guard = self.lock()?;
        let path = self.record_path(next.id);
        if !path.exists() {
            return Err(WesflowError::ExecutionNotFound(next.id));
        }
        let current = self.read_record(&path)?;

        if !check_write(&current, expected_version, &next)? {
            return Ok(CasOutcome::Conflict(current));
        }

        next.version = expected_version + 1;
        self.write_record(&next)?;
        Ok(CasOutcome::Applied(next))
    }

    fn list(&self) -> Result<Vec<Execution>> {
        let _guard = self.lock()?;
        self.record_ids()?
            .into_iter()
            .map(|id| self.read_record(&self.record_path(id)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::model::WorkflowMetadata;
    use crate::execution::state::ExecutionState;

    fn new_execution() -> NewExecution {
        NewExecution {
            name: "run".to_string(),
            owner: "jdoe".to_string(),
            samples: vec!["S1".to_string()],
            workflow: WorkflowMetadata {
                name: "wf".to_string(),
                version: "1.0".to_string(),
                url: "https://example.org/wf".to_string(),
                workflow_type: "NFL".to_string(),
                workflow_type_version: "DSL2".to_string(),
                engine: None,
                engine_version: None,
            },
            workflow_params: serde_json::Value::Null,
            engine_params: serde_json::Value::Null,
            tags: BTreeMap::new(),
        }
    }

    fn exercise_cas(store: &dyn ExecutionStore) {
        let exec = store.insert(new_execution()).unwrap();
        assert_eq!(exec.id, 1);
        assert_eq!(exec.version, 0);

        let mut prepared = exec.clone();
        prepared
            .transition(ExecutionState::Prepared, "prepared")
            .unwrap();
        let applied = match store.compare_and_swap(0, prepared).unwrap() {
            CasOutcome::Applied(e) => e,
            other => panic!("expected Applied, got {other:?}"),
        };
        assert_eq!(applied.version, 1);

        // A writer that read version 0 loses.
        let mut stale = exec.clone();
        stale
            .transition(ExecutionState::Canceling, "cancel")
            .unwrap();
        match store.compare_and_swap(0, stale).unwrap() {
            CasOutcome::Conflict(current) => {
                assert_eq!(current.state, ExecutionState::Prepared);
                assert_eq!(current.version, 1);
            }
            other => panic!("expected Conflict, got {other:?}"),
        }

        // Skipping states is refused outright.
        let mut skip = applied.clone();
        skip.state = ExecutionState::Completed;
        assert!(matches!(
            store.compare_and_swap(1, skip),
            Err(WesflowError::InvalidTransition { .. })
        ));

        let second = store.insert(new_execution()).unwrap();
        assert_eq!(second.id, 2);
        let ids: Vec<_> = store.list().unwrap().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn memory_store_compare_and_swap() {
        exercise_cas(&MemoryExecutionStore::new());
    }

    #[test]
    fn file_store_compare_and_swap() {
        let dir = tempfile::tempdir().unwrap();
        exercise_cas(&FileExecutionStore::open(dir.path().join("executions")).unwrap());
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("executions");

        let exec = {
            let store = FileExecutionStore::open(&root).unwrap();
            store.insert(new_execution()).unwrap()
        };

        let store = FileExecutionStore::open(&root).unwrap();
        assert_eq!(store.load(exec.id).unwrap(), Some(exec));
        assert_eq!(store.load(99).unwrap(), None);
        assert_eq!(store.insert(new_execution()).unwrap().id, 2);
    }

    #[test]
    fn stores_sharing_a_directory_never_hand_out_the_same_id() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("executions");
        FileExecutionStore::open(&root).unwrap();

        let inserters: Vec<_> = (0..4)
            .map(|_| {
                let root = root.clone();
                std::thread::spawn(move || {
                    let store = FileExecutionStore::open(&root).unwrap();
                    (0..5)
                        .map(|_| store.insert(new_execution()).unwrap().id)
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut ids: Vec<_> = inserters
            .into_iter()
            .flat_map(|t| t.join().unwrap())
            .collect();
        ids.sort_unstable();

        assert_eq!(ids, (1..=20).collect::<Vec<_>>());
    }

    #[test]
    fn only_one_of_two_stores_wins_a_write() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("executions");
        let a = FileExecutionStore::open(&root).unwrap();
        let b = FileExecutionStore::open(&root).unwrap();
        let exec = a.insert(new_execution()).unwrap();

        let mut prepared = exec.clone();
        prepared.transition(ExecutionState::Prepared, "prepared").unwrap();
        let mut canceling = exec.clone();
        canceling.transition(ExecutionState::Canceling, "cancel").unwrap();

        assert!(matches!(
            a.compare_and_swap(0, prepared).unwrap(),
            CasOutcome::Applied(_)
        ));
        assert!(matches!(
            b.compare_and_swap(0, canceling).unwrap(),
            CasOutcome::Conflict(current) if current.state == ExecutionState::Prepared
        ));
    }

    #[test]
    fn run_id_cannot_be_rewritten() {
        let store = MemoryExecutionStore::new();
        let mut exec = store.insert(new_execution()).unwrap();
        exec.transition(ExecutionState::Prepared, "p").unwrap();
        let CasOutcome::Applied(mut exec) = store.compare_and_swap(0, exec).unwrap() else {
            panic!("expected Applied");
        };
        exec.mark_submitted("run-1").unwrap();
        let CasOutcome::Applied(mut exec) = store.compare_and_swap(1, exec).unwrap() else {
            panic!("expected Applied");
        };

        exec.run_id = Some("run-2".to_string());
        assert!(store.compare_and_swap(2, exec).is_err());
    }
}
