//! Greedy observation scheduler for Nightfall.
//!
//! This crate decides which observation job runs now:
//! - Jobs carry time windows, priorities and completion policies
//! - Sky constraints are answered by an external [`ConstraintEvaluator`]
//! - Remaining capture time is estimated from a captured-frames ledger
//! - A forward simulation produces the night's [`JobSchedule`]
//! - Aborted and failed jobs are retried according to the session's [`RetryPolicy`]

mod config;
mod constraints;
mod error;
mod greedy;
mod job;
mod state;

pub use config::{MAX_HORIZON_HOURS, MAX_RETRY_DELAY_SECONDS, RetryPolicy, SchedulerConfig};
pub use constraints::{ConstraintEvaluator, Interval, WindowConstraints};
pub use error::SchedulerError;
pub use greedy::{GreedyScheduler, JobSchedule, SchedulerEvent, StopReason};
pub use job::{
    CaptureEntry, CapturedFramesCount, CompletionCondition, EstimatedTime, JobConstraints, JobId,
    RemainingWork, SchedulerJob,
};
pub use state::{JobEvent, JobState};
