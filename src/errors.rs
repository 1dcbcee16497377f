// src/errors.rs

//! Crate-wide error aliases and helpers.

use thiserror::Error;

use crate::client::ClientError;
use crate::execution::ExecutionState;
use crate::types::ExecutionId;

#[derive(Error, Debug)]
pub enum WesflowError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Execution not found: {0}")]
    ExecutionNotFound(ExecutionId),

    #[error("Invalid state transition for execution {id}: {from} -> {to}")]
    InvalidTransition {
        id: ExecutionId,
        from: ExecutionState,
        to: ExecutionState,
    },

    #[error("Execution {id} cannot be canceled from state {state}")]
    NotCancelable {
        id: ExecutionId,
        state: ExecutionState,
    },

    #[error("Execution {0} kept changing underneath the update; giving up")]
    Conflict(ExecutionId),

    #[error("Execution client error: {0}")]
    Client(#[from] ClientError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, WesflowError>;
