// src/engine/mod.rs

//! Job engine for wesflow.
//!
//! This module ties together:
//! - jobs as plain data ([`job`]) and the durable queue holding them ([`queue`])
//! - the retry policy consulted on failures ([`retry`])
//! - the pipeline steps that advance one execution ([`steps`])
//! - the stepping scheduler ([`scheduler`]) and the worker pool that drives
//!   it from tokio tasks ([`runtime`])

pub mod job;
pub mod queue;
pub mod retry;
pub mod runtime;
pub mod scheduler;
pub mod steps;

pub use job::{Job, JobKind, NextJob};
pub use queue::JobQueue;
pub use retry::{RetryDecision, RetryPolicies, RetryPolicy};
pub use runtime::{RuntimeOptions, WorkerPool};
pub use scheduler::{JobOutcome, Scheduler, StepReport};
pub use steps::{JobFailure, Pipeline, PipelineTimings};
