//! Job lifecycle states and the transition table.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::SchedulerError;

/// Current lifecycle state of a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for its window or constraints to open.
    #[default]
    Idle,
    /// Being evaluated during a scheduling pass.
    Evaluation,
    /// Has a slot in the current schedule.
    Scheduled,
    /// Currently capturing.
    Running,
    /// Nothing left to capture (final for the session).
    Complete,
    /// Stopped by the user or the system.
    Aborted,
    /// Stopped by an execution failure.
    Error,
    /// Can never run in its window (final for the session).
    Invalid,
    /// Interrupted by a higher-priority job.
    Suspended,
}

/// Events that drive job state changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobEvent {
    Evaluate,
    Schedule,
    Park,
    Start,
    Complete,
    Abort,
    Fail,
    Suspend,
    Invalidate,
    Reset,
}

impl JobState {
    /// Apply an event, returning the next state.
    ///
    /// This is the only place job states change. Pairs missing from the
    /// table are rejected with [`SchedulerError::InvalidTransition`].
    pub fn apply(self, event: JobEvent) -> Result<JobState, SchedulerError> {
        use JobEvent as E;
        use JobState as S;

        let next = match (self, event) {
            (_, E::Reset) => S::Idle,
            (S::Idle | S::Scheduled | S::Suspended | S::Aborted | S::Error, E::Evaluate) => {
                S::Evaluation
            }
            (S::Evaluation, E::Schedule) => S::Scheduled,
            (S::Evaluation, E::Park) => S::Idle,
            (S::Scheduled | S::Evaluation, E::Start) => S::Running,
            (S::Evaluation | S::Scheduled | S::Running, E::Complete) => S::Complete,
            (S::Running | S::Scheduled, E::Abort) => S::Aborted,
            (S::Running, E::Fail) => S::Error,
            (S::Running, E::Suspend) => S::Suspended,
            (
                S::Idle | S::Evaluation | S::Scheduled | S::Aborted | S::Error | S::Suspended,
                E::Invalidate,
            ) => S::Invalid,
            (from, event) => return Err(SchedulerError::InvalidTransition { from, event }),
        };
        Ok(next)
    }

    /// Final for the current session.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Complete | JobState::Invalid)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Idle => "idle",
            JobState::Evaluation => "evaluation",
            JobState::Scheduled => "scheduled",
            JobState::Running => "running",
            JobState::Complete => "complete",
            JobState::Aborted => "aborted",
            JobState::Error => "error",
            JobState::Invalid => "invalid",
            JobState::Suspended => "suspended",
        };
        f.write_str(s)
    }
}
