// src/config/validate.rs

use std::time::Duration;

use reqwest::Url;

use crate::config::model::{
    ConfigFile, RawConfigFile, RawRetrySection, RawStorageSection, SchedulerSettings,
    ServiceSettings, StorageSettings,
};
use crate::engine::{JobKind, RetryPolicies, RetryPolicy};
use crate::errors::{Result, WesflowError};
use crate::types::parse_duration;

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = crate::errors::WesflowError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        Ok(ConfigFile {
            service: validate_service(&raw)?,
            scheduler: validate_scheduler(&raw)?,
            storage: resolve_storage(raw.storage),
            retry: validate_retry(&raw.retry)?,
        })
    }
}

fn duration_field(section: &str, key: &str, value: &str) -> Result<Duration> {
    parse_duration(value)
        .map_err(|e| WesflowError::ConfigError(format!("[{section}].{key}: {e}")))
}

fn validate_service(cfg: &RawConfigFile) -> Result<ServiceSettings> {
    let base_url = cfg.service.base_url.trim();
    let url = Url::parse(base_url).map_err(|e| {
        WesflowError::ConfigError(format!(
            "[service].base_url must be an absolute URL (got {base_url:?}): {e}"
        ))
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(WesflowError::ConfigError(format!(
            "[service].base_url must use http or https (got {})",
            url.scheme()
        )));
    }

    let request_timeout =
        duration_field("service", "request_timeout", &cfg.service.request_timeout)?;
    if request_timeout.is_zero() {
        return Err(WesflowError::ConfigError(
            "[service].request_timeout must be greater than zero".to_string(),
        ));
    }

    Ok(ServiceSettings {
        base_url: base_url.to_string(),
        request_timeout,
    })
}

fn validate_scheduler(cfg: &RawConfigFile) -> Result<SchedulerSettings> {
    let s = &cfg.scheduler;
    if s.workers == 0 {
        return Err(WesflowError::ConfigError(
            "[scheduler].workers must be >= 1 (got 0)".to_string(),
        ));
    }

    let status_poll_interval =
        duration_field("scheduler", "status_poll_interval", &s.status_poll_interval)?;
    if status_poll_interval.is_zero() {
        return Err(WesflowError::ConfigError(
            "[scheduler].status_poll_interval must be greater than zero".to_string(),
        ));
    }

    Ok(SchedulerSettings {
        workers: s.workers,
        submission_delay: duration_field("scheduler", "submission_delay", &s.submission_delay)?,
        status_poll_interval,
        idle_wait: duration_field("scheduler", "idle_wait", &s.idle_wait)?,
    })
}

fn resolve_storage(raw: RawStorageSection) -> StorageSettings {
    let run_dir_root = raw
        .run_dir_root
        .unwrap_or_else(|| raw.state_dir.join("runs"));
    let outputs_dir = raw
        .outputs_dir
        .unwrap_or_else(|| raw.state_dir.join("outputs"));

    StorageSettings {
        mode: raw.mode,
        state_dir: raw.state_dir,
        run_dir_root,
        outputs_dir,
    }
}

fn validate_retry(raw: &RawRetrySection) -> Result<RetryPolicies> {
    let default = RetryPolicy {
        transient_retries: raw.transient_retries,
        permanent_retries: raw.permanent_retries,
        delay: duration_field("retry", "delay", &raw.delay)?,
    };

    let mut policies = RetryPolicies::new(default);
    for (key, over) in &raw.overrides {
        let kind: JobKind = key
            .parse()
            .map_err(|e| WesflowError::ConfigError(format!("[retry.{key}]: {e}")))?;

        let delay = match &over.delay {
            Some(d) => duration_field(&format!("retry.{key}"), "delay", d)?,
            None => default.delay,
        };
        policies = policies.with_override(
            kind,
            RetryPolicy {
                transient_retries: over.transient_retries.unwrap_or(default.transient_retries),
                permanent_retries: over.permanent_retries.unwrap_or(default.permanent_retries),
                delay,
            },
        );
    }

    Ok(policies)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StorageMode;

    fn parse(toml_src: &str) -> Result<ConfigFile> {
        let raw: RawConfigFile = toml::from_str(toml_src)?;
        ConfigFile::try_from(raw)
    }

    fn config_error(toml_src: &str) -> String {
        match parse(toml_src) {
            Err(WesflowError::ConfigError(msg)) => msg,
            other => panic!("expected ConfigError, got {other:?}"),
        }
    }

    #[test]
    fn empty_file_uses_defaults() {
        let cfg = parse("").unwrap();
        assert_eq!(cfg.service.base_url, "http://localhost:1122/");
        assert_eq!(cfg.service.request_timeout, Duration::from_secs(30));
        assert_eq!(cfg.scheduler.workers, 4);
        assert_eq!(cfg.scheduler.submission_delay, Duration::from_secs(30));
        assert_eq!(cfg.storage.mode, StorageMode::File);
        assert_eq!(cfg.storage.run_dir_root, std::path::PathBuf::from(".wesflow/runs"));
        assert_eq!(*cfg.retry.default_policy(), RetryPolicy::default());
    }

    #[test]
    fn retry_overrides_inherit_missing_keys() {
        let cfg = parse(
            r#"
            [retry]
            transient_retries = 3
            delay = "500ms"

            [retry.cancellation]
            delay = "2s"

            [retry.status-poll]
            transient_retries = 10
            "#,
        )
        .unwrap();

        let cancel = cfg.retry.for_kind(JobKind::Cancellation);
        assert_eq!(cancel.transient_retries, 3);
        assert_eq!(cancel.permanent_retries, 2);
        assert_eq!(cancel.delay, Duration::from_secs(2));

        let poll = cfg.retry.for_kind(JobKind::StatusPoll);
        assert_eq!(poll.transient_retries, 10);
        assert_eq!(poll.delay, Duration::from_millis(500));

        assert_eq!(cfg.retry.for_kind(JobKind::Cleanup).transient_retries, 3);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(config_error("[scheduler]\nworkers = 0").contains("workers"));
        assert!(
            config_error("[scheduler]\nstatus_poll_interval = \"0s\"")
                .contains("status_poll_interval")
        );
        assert!(config_error("[service]\nbase_url = \"localhost\"").contains("absolute URL"));
        assert!(config_error("[service]\nbase_url = \"ftp://host/\"").contains("http"));
        assert!(config_error("[retry]\ndelay = \"soon\"").contains("[retry].delay"));
        assert!(config_error("[retry.reaper]\ndelay = \"1s\"").contains("unknown job kind"));
    }

    #[test]
    fn explicit_storage_paths_win() {
        let cfg = parse(
            r#"
            [storage]
            mode = "memory"
            state_dir = "/var/lib/wesflow"
            outputs_dir = "/srv/outputs"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.storage.mode, StorageMode::Memory);
        assert_eq!(
            cfg.storage.run_dir_root,
            std::path::PathBuf::from("/var/lib/wesflow/runs")
        );
        assert_eq!(cfg.storage.outputs_dir, std::path::PathBuf::from("/srv/outputs"));
        assert_eq!(
            cfg.storage.queue_snapshot(),
            std::path::PathBuf::from("/var/lib/wesflow/queue.json")
        );
    }
}
