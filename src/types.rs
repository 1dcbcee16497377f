use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Identifier of an execution record, assigned by the store on insert.
pub type ExecutionId = u64;

/// Identifier of a queued job, assigned by the job queue.
pub type JobId = u64;

/// Where execution records and the job queue live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    /// One JSON file per execution plus a queue snapshot under `state_dir`.
    #[default]
    File,
    /// Everything in memory (lost on restart).
    Memory,
}

impl FromStr for StorageMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "file" => Ok(StorageMode::File),
            "memory" => Ok(StorageMode::Memory),
            other => Err(format!(
                "invalid storage mode: {other} (expected \"file\" or \"memory\")"
            )),
        }
    }
}

/// Parse a duration string such as `"250ms"`, `"30s"`, `"5m"` or `"1h"`.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".to_string());
    }

    // Find the boundary between digits and suffix.
    let idx = s
        .chars()
        .position(|c| !c.is_ascii_digit())
        .ok_or_else(|| "duration missing unit suffix".to_string())?;

    let (num_part, unit_part) = s.split_at(idx);
    let value: u64 = num_part
        .parse()
        .map_err(|e| format!("invalid duration number '{}': {}", num_part, e))?;
    let unit = unit_part.trim().to_lowercase();

    match unit.as_str() {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 60 * 60)),
        _ => Err(format!(
            "unsupported duration unit '{}'; expected ms, s, m, or h",
            unit
        )),
    }
}
