// src/config/model.rs

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::engine::{PipelineTimings, RetryPolicies, RuntimeOptions};
use crate::types::StorageMode;

/// Top-level configuration as read from a TOML file.
///
/// ```toml
/// [service]
/// base_url = "http://localhost:1122/"
/// request_timeout = "30s"
///
/// [scheduler]
/// workers = 4
/// submission_delay = "30s"
/// status_poll_interval = "10s"
///
/// [storage]
/// mode = "file"
/// state_dir = ".wesflow"
///
/// [retry]
/// transient_retries = 5
/// permanent_retries = 2
/// delay = "1s"
///
/// [retry.cancellation]
/// delay = "2s"
/// ```
///
/// All sections are optional and have reasonable defaults. Durations stay
/// strings here; [`ConfigFile`] holds the parsed values.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawConfigFile {
    #[serde(default)]
    pub service: RawServiceSection,

    #[serde(default)]
    pub scheduler: RawSchedulerSection,

    #[serde(default)]
    pub storage: RawStorageSection,

    #[serde(default)]
    pub retry: RawRetrySection,
}

/// `[service]` section: where the execution service lives.
#[derive(Debug, Clone, Deserialize)]
pub struct RawServiceSection {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Per-request timeout, e.g. `"30s"`.
    #[serde(default = "default_request_timeout")]
    pub request_timeout: String,
}

fn default_base_url() -> String {
    "http://localhost:1122/".to_string()
}

fn default_request_timeout() -> String {
    "30s".to_string()
}

impl Default for RawServiceSection {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout: default_request_timeout(),
        }
    }
}

/// `[scheduler]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct RawSchedulerSection {
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Delay between preparation and submission.
    #[serde(default = "default_submission_delay")]
    pub submission_delay: String,

    #[serde(default = "default_status_poll_interval")]
    pub status_poll_interval: String,

    /// Longest a worker sleeps when nothing is due.
    #[serde(default = "default_idle_wait")]
    pub idle_wait: String,
}

fn default_workers() -> usize {
    4
}

fn default_submission_delay() -> String {
    "30s".to_string()
}

fn default_status_poll_interval() -> String {
    "10s".to_string()
}

fn default_idle_wait() -> String {
    "1s".to_string()
}

impl Default for RawSchedulerSection {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            submission_delay: default_submission_delay(),
            status_poll_interval: default_status_poll_interval(),
            idle_wait: default_idle_wait(),
        }
    }
}

/// `[storage]` section.
///
/// `run_dir_root` and `outputs_dir` default to `runs/` and `outputs/` under
/// `state_dir`.
#[derive(Debug, Clone, Deserialize)]
pub struct RawStorageSection {
    #[serde(default)]
    pub mode: StorageMode,

    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    #[serde(default)]
    pub run_dir_root: Option<PathBuf>,

    #[serde(default)]
    pub outputs_dir: Option<PathBuf>,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".wesflow")
}

impl Default for RawStorageSection {
    fn default() -> Self {
        Self {
            mode: StorageMode::default(),
            state_dir: default_state_dir(),
            run_dir_root: None,
            outputs_dir: None,
        }
    }
}

/// `[retry]` section plus `[retry.<job kind>]` override tables.
#[derive(Debug, Clone, Deserialize)]
pub struct RawRetrySection {
    #[serde(default = "default_transient_retries")]
    pub transient_retries: u32,

    #[serde(default = "default_permanent_retries")]
    pub permanent_retries: u32,

    #[serde(default = "default_retry_delay")]
    pub delay: String,

    /// Keyed by job kind (`preparation`, `submission`, `status_poll`,
    /// `completion`, `cancellation`, `cleanup`).
    #[serde(flatten)]
    pub overrides: BTreeMap<String, RawRetryOverride>,
}

fn default_transient_retries() -> u32 {
    5
}

fn default_permanent_retries() -> u32 {
    2
}

fn default_retry_delay() -> String {
    "1s".to_string()
}

impl Default for RawRetrySection {
    fn default() -> Self {
        Self {
            transient_retries: default_transient_retries(),
            permanent_retries: default_permanent_retries(),
            delay: default_retry_delay(),
            overrides: BTreeMap::new(),
        }
    }
}

/// `[retry.<kind>]`: any key left out falls back to `[retry]`.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawRetryOverride {
    #[serde(default)]
    pub transient_retries: Option<u32>,
    #[serde(default)]
    pub permanent_retries: Option<u32>,
    #[serde(default)]
    pub delay: Option<String>,
}

/// Validated configuration used by the rest of the application.
///
/// Built via `TryFrom<RawConfigFile>` so that holding a `ConfigFile` always
/// implies the config has been validated.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub service: ServiceSettings,
    pub scheduler: SchedulerSettings,
    pub storage: StorageSettings,
    pub retry: RetryPolicies,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSettings {
    pub base_url: String,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerSettings {
    pub workers: usize,
    pub submission_delay: Duration,
    pub status_poll_interval: Duration,
    pub idle_wait: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageSettings {
    pub mode: StorageMode,
    pub state_dir: PathBuf,
    pub run_dir_root: PathBuf,
    pub outputs_dir: PathBuf,
}

impl StorageSettings {
    pub fn executions_dir(&self) -> PathBuf {
        self.state_dir.join("executions")
    }

    pub fn queue_snapshot(&self) -> PathBuf {
        self.state_dir.join("queue.json")
    }
}

impl ConfigFile {
    pub fn pipeline_timings(&self) -> PipelineTimings {
        PipelineTimings {
            submission_delay: self.scheduler.submission_delay,
            status_poll_interval: self.scheduler.status_poll_interval,
        }
    }

    pub fn runtime_options(&self, exit_when_idle: bool) -> RuntimeOptions {
        RuntimeOptions {
            workers: self.scheduler.workers,
            idle_wait: self.scheduler.idle_wait,
            exit_when_idle,
        }
    }
}
