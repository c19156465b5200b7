//! Cron scheduling service for robun.
//!
//! This crate provides:
//! - **types**: `CronSchedule`, `CronPayload`, `CronJob`, `CronStore` — the job model and its JSON persistence
//! - **service**: `CronService` — the async timer loop that fires due jobs

pub mod service;
pub mod types;

pub use service::{CronService, CronServiceStatus, OnJobFn};
pub use types::{
    compute_next_run_from, CronJob, CronJobState, CronPayload, CronSchedule, CronStore, JobStatus,
    PayloadKind, ScheduleKind,
};
