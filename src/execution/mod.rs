// src/execution/mod.rs

//! Execution records and their lifecycle.
//!
//! - [`state`] holds the run state machine (states + allowed transitions).
//! - [`model`] defines the execution entity, its history, and snapshots.
//! - [`store`] persists records with compare-and-set writes.

pub mod model;
pub mod state;
pub mod store;

pub use model::{
    Execution, NewExecution, RunDirectory, StateSnapshot, Transition, WorkflowMetadata,
};
pub use state::{ExecutionState, TransitionGraph, transition_graph};
pub use store::{CasOutcome, ExecutionStore, FileExecutionStore, MemoryExecutionStore};
