//! Constraint evaluation boundary.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::SchedulerJob;

/// Answers sky and site constraint questions for the scheduler.
///
/// Altitude, moon separation, twilight and artificial horizons all live
/// behind this trait; the scheduler only samples it.
pub trait ConstraintEvaluator {
    /// Whether every constraint of `job` holds at `time`.
    fn is_constraint_satisfied(&self, job: &SchedulerJob, time: DateTime<Utc>) -> bool;

    /// End of the contiguous feasible interval containing `time`.
    ///
    /// `None` means the constraints never close. At an infeasible `time`
    /// the window has already closed and `time` itself is returned.
    fn feasible_window_end(&self, job: &SchedulerJob, time: DateTime<Utc>)
    -> Option<DateTime<Utc>>;

    /// Current weather. Never predicted ahead of `now`.
    fn is_weather_safe(&self, _now: DateTime<Utc>) -> bool {
        true
    }
}

/// Half-open time interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Interval {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, time: DateTime<Utc>) -> bool {
        self.start <= time && time < self.end
    }
}

/// Evaluator backed by precomputed feasibility intervals per job name.
///
/// Jobs without an entry are unconstrained. A job with an empty interval
/// list is never feasible.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConstraints {
    windows: BTreeMap<String, Vec<Interval>>,
    unsafe_weather: Vec<Interval>,
}

impl WindowConstraints {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a feasible interval for the named job.
    pub fn with_window(mut self, job: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.windows
            .entry(job.to_string())
            .or_default()
            .push(Interval::new(start, end));
        self
    }

    /// Mark the named job as never feasible.
    pub fn never_feasible(mut self, job: &str) -> Self {
        self.windows.insert(job.to_string(), Vec::new());
        self
    }

    /// Add a period of unsafe weather.
    pub fn with_unsafe_weather(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.unsafe_weather.push(Interval::new(start, end));
        self
    }

    fn intervals(&self, job: &SchedulerJob) -> Option<&[Interval]> {
        self.windows.get(&job.name).map(Vec::as_slice)
    }
}

impl ConstraintEvaluator for WindowConstraints {
    fn is_constraint_satisfied(&self, job: &SchedulerJob, time: DateTime<Utc>) -> bool {
        match self.intervals(job) {
            Some(intervals) => intervals.iter().any(|i| i.contains(time)),
            None => true,
        }
    }

    fn feasible_window_end(
        &self,
        job: &SchedulerJob,
        time: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let intervals = self.intervals(job)?;

        let Some(current) = intervals.iter().find(|i| i.contains(time)) else {
            return Some(time);
        };

        // Follow touching intervals so the end is the end of the contiguous run
        let mut end = current.end;
        while let Some(next) = intervals
            .iter()
            .filter(|i| i.contains(end))
            .map(|i| i.end)
            .max()
        {
            end = next;
        }
        Some(end)
    }

    fn is_weather_safe(&self, now: DateTime<Utc>) -> bool {
        !self.unsafe_weather.iter().any(|i| i.contains(now))
    }
}
