//! Error types for the scheduler.

use thiserror::Error;

use crate::{JobEvent, JobId, JobState};

/// Errors that can occur in scheduler operations.
///
/// Scheduling passes themselves never fail; these are returned by the
/// host-facing actions and configuration checks.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    /// The job state does not accept this event.
    #[error("invalid transition: {event:?} not allowed from {from:?}")]
    InvalidTransition { from: JobState, event: JobEvent },

    /// Job not found.
    #[error("job not found: {0}")]
    JobNotFound(JobId),

    /// Another job is already running.
    #[error("job already running: {0}")]
    AlreadyRunning(String),

    /// Invalid scheduler configuration.
    #[error("invalid scheduler configuration: {0}")]
    InvalidConfig(String),
}
