// src/engine/retry.rs

//! Retry decisions for failed jobs.
//!
//! The policy is a plain value: given the job kind, the failure class and the
//! attempt that just failed, it answers "retry after this delay" or "give up".
//! Jobs never decide this themselves.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::client::ErrorClass;
use crate::engine::job::JobKind;

/// Ceilings and delay for one job kind.
///
/// `transient_retries = 5` means up to 5 retries after the first attempt,
/// so 6 attempts in total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub transient_retries: u32,
    pub permanent_retries: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            transient_retries: 5,
            permanent_retries: 2,
            delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

impl RetryPolicy {
    /// `attempt` is the 1-based number of the attempt that just failed.
    /// A failure with no class (local failure) is never retried.
    pub fn decide(&self, class: Option<ErrorClass>, attempt: u32) -> RetryDecision {
        let ceiling = match class {
            Some(ErrorClass::Transient) => self.transient_retries,
            Some(ErrorClass::Permanent) => self.permanent_retries,
            None => return RetryDecision::GiveUp,
        };

        if attempt <= ceiling {
            RetryDecision::RetryAfter(self.delay)
        } else {
            RetryDecision::GiveUp
        }
    }
}

/// Default policy plus per-kind overrides from `[retry.<kind>]`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryPolicies {
    default: RetryPolicy,
    overrides: BTreeMap<JobKind, RetryPolicy>,
}

impl RetryPolicies {
    pub fn new(default: RetryPolicy) -> Self {
        Self {
            default,
            overrides: BTreeMap::new(),
        }
    }

    pub fn with_override(mut self, kind: JobKind, policy: RetryPolicy) -> Self {
        self.overrides.insert(kind, policy);
        self
    }

    pub fn default_policy(&self) -> &RetryPolicy {
        &self.default
    }

    pub fn for_kind(&self, kind: JobKind) -> &RetryPolicy {
        self.overrides.get(&kind).unwrap_or(&self.default)
    }

    pub fn overrides(&self) -> impl Iterator<Item = (JobKind, &RetryPolicy)> + '_ {
        self.overrides.iter().map(|(k, p)| (*k, p))
    }

    pub fn decide(&self, kind: JobKind, class: Option<ErrorClass>, attempt: u32) -> RetryDecision {
        self.for_kind(kind).decide(class, attempt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attempts_until_give_up(policy: &RetryPolicy, class: Option<ErrorClass>) -> u32 {
        let mut attempt = 1;
        while let RetryDecision::RetryAfter(_) = policy.decide(class, attempt) {
            attempt += 1;
        }
        attempt
    }

    #[test]
    fn default_ceilings() {
        let policy = RetryPolicy::default();
        assert_eq!(attempts_until_give_up(&policy, Some(ErrorClass::Transient)), 6);
        assert_eq!(attempts_until_give_up(&policy, Some(ErrorClass::Permanent)), 3);
        assert_eq!(attempts_until_give_up(&policy, None), 1);
    }

    #[test]
    fn zero_permanent_retries_gives_up_immediately() {
        let policy = RetryPolicy {
            permanent_retries: 0,
            ..RetryPolicy::default()
        };
        assert_eq!(
            policy.decide(Some(ErrorClass::Permanent), 1),
            RetryDecision::GiveUp
        );
    }

    #[test]
    fn overrides_apply_per_kind() {
        let policies = RetryPolicies::default().with_override(
            JobKind::Cancellation,
            RetryPolicy {
                transient_retries: 1,
                permanent_retries: 0,
                delay: Duration::from_millis(5),
            },
        );

        assert_eq!(
            policies.decide(JobKind::Cancellation, Some(ErrorClass::Transient), 1),
            RetryDecision::RetryAfter(Duration::from_millis(5))
        );
        assert_eq!(
            policies.decide(JobKind::Cancellation, Some(ErrorClass::Transient), 2),
            RetryDecision::GiveUp
        );
        assert_eq!(
            policies.decide(JobKind::Submission, Some(ErrorClass::Transient), 2),
            RetryDecision::RetryAfter(Duration::from_secs(1))
        );
    }
}
