//! Observation job model.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::JobState;

/// Frames already captured, keyed by capture signature.
pub type CapturedFramesCount = HashMap<String, u16>;

/// Host-assigned job identifier, increasing in creation order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One line of a capture sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureEntry {
    /// Ledger key for frames produced by this entry.
    pub signature: String,
    /// Frames per sequence iteration.
    pub count: u16,
    /// Exposure length in seconds.
    pub exposure_secs: f64,
    /// Delay between frames in seconds.
    #[serde(default)]
    pub delay_secs: f64,
}

impl CaptureEntry {
    pub fn new(signature: impl Into<String>, count: u16, exposure_secs: f64) -> Self {
        Self {
            signature: signature.into(),
            count,
            exposure_secs,
            delay_secs: 0.0,
        }
    }

    fn frame_secs(&self) -> f64 {
        self.exposure_secs + self.delay_secs
    }
}

/// When a job is considered finished.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CompletionCondition {
    /// Capture the sequence once.
    #[default]
    Sequence,
    /// Capture the sequence `count` times.
    Repeat { count: u16 },
    /// Keep capturing until stopped by constraints.
    Loop,
    /// Keep capturing until a wall-clock time.
    At { at: DateTime<Utc> },
}

/// Scheduling constraints of a job.
///
/// Only the window bounds and the weather flag are read by the scheduler
/// itself; everything else is interpreted by the constraint evaluator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConstraints {
    /// Earliest start time.
    pub start_after: Option<DateTime<Utc>>,
    /// End of the imaging window.
    pub window_end: Option<DateTime<Utc>>,
    /// Minimum target altitude in degrees.
    pub min_altitude: Option<f64>,
    /// Minimum separation from the moon in degrees.
    pub min_moon_separation: Option<f64>,
    pub enforce_weather: bool,
    pub enforce_twilight: bool,
    /// Named artificial horizon profile.
    pub artificial_horizon: Option<String>,
}

/// Remaining capture time of a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimatedTime {
    /// Known remaining duration.
    Known(#[serde(with = "duration_secs")] Duration),
    /// Open-ended; progress must be queried while running.
    #[default]
    Unknown,
}

impl EstimatedTime {
    pub fn known(&self) -> Option<Duration> {
        match self {
            EstimatedTime::Known(d) => Some(*d),
            EstimatedTime::Unknown => None,
        }
    }
}

/// Outcome of estimating a job's remaining work against the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemainingWork {
    /// Still something to capture.
    Pending {
        estimate: EstimatedTime,
        completed_iterations: u16,
    },
    /// Every required frame is in the ledger.
    Finished { completed_iterations: u16 },
    /// The sequence can never be captured.
    Unusable(&'static str),
}

/// An observation job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerJob {
    #[serde(default)]
    pub id: JobId,
    pub name: String,
    /// Owning schedule group, if any.
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub constraints: JobConstraints,
    /// Higher runs first.
    #[serde(default)]
    pub priority: i32,
    /// Lookahead during which a not-yet-feasible job counts as runnable.
    #[serde(default = "default_lead_time", with = "duration_secs")]
    pub lead_time: Duration,
    /// Preferred on ties with equal priority and start.
    #[serde(default)]
    pub greedy: bool,
    /// Estimate as if nothing had been captured.
    #[serde(default)]
    pub ignore_job_progress: bool,
    #[serde(default)]
    pub completion: CompletionCondition,
    pub sequence: Vec<CaptureEntry>,

    #[serde(default)]
    pub state: JobState,
    #[serde(default)]
    pub startup_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub estimated_start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub estimated_stop_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub estimated_time: EstimatedTime,
    #[serde(default)]
    pub completed_iterations: u16,

    #[serde(default)]
    pub aborted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub errored_at: Option<DateTime<Utc>>,
    /// Reason for the last state change or stop.
    #[serde(default)]
    pub last_reason: Option<String>,
}

fn default_lead_time() -> Duration {
    Duration::minutes(5)
}

impl SchedulerJob {
    /// Create an idle job running its sequence once.
    pub fn new(id: JobId, name: impl Into<String>, sequence: Vec<CaptureEntry>) -> Self {
        Self {
            id,
            name: name.into(),
            group: None,
            constraints: JobConstraints::default(),
            priority: 0,
            lead_time: default_lead_time(),
            greedy: false,
            ignore_job_progress: false,
            completion: CompletionCondition::Sequence,
            sequence,
            state: JobState::Idle,
            startup_time: None,
            estimated_start_time: None,
            estimated_stop_time: None,
            estimated_time: EstimatedTime::Unknown,
            completed_iterations: 0,
            aborted_at: None,
            errored_at: None,
            last_reason: None,
        }
    }

    /// Number of sequence iterations required, or `None` if open-ended.
    pub fn required_iterations(&self) -> Option<u16> {
        match self.completion {
            CompletionCondition::Sequence => Some(1),
            CompletionCondition::Repeat { count } => Some(count),
            CompletionCondition::Loop | CompletionCondition::At { .. } => None,
        }
    }

    /// Completion time for `At` jobs.
    pub fn completion_time(&self) -> Option<DateTime<Utc>> {
        match self.completion {
            CompletionCondition::At { at } => Some(at),
            _ => None,
        }
    }

    /// Estimate the remaining work from the captured-frames ledger.
    ///
    /// Frames of a signature shared by several entries are credited to
    /// entries in sequence order.
    pub fn remaining_work(&self, captured: &CapturedFramesCount) -> RemainingWork {
        if self.sequence.is_empty() {
            return RemainingWork::Unusable("empty capture sequence");
        }
        if self
            .sequence
            .iter()
            .any(|e| {
                !e.exposure_secs.is_finite()
                    || e.exposure_secs <= 0.0
                    || !e.delay_secs.is_finite()
                    || e.delay_secs < 0.0
            })
        {
            return RemainingWork::Unusable("capture entry with invalid exposure or delay");
        }
        if self.sequence.iter().all(|e| e.count == 0) {
            return RemainingWork::Unusable("capture sequence has no frames");
        }

        let mut available: HashMap<&str, u32> = HashMap::new();
        if !self.ignore_job_progress {
            for entry in &self.sequence {
                let frames = captured.get(&entry.signature).copied().unwrap_or(0);
                available.insert(entry.signature.as_str(), u32::from(frames));
            }
        }

        let iterations = match self.required_iterations() {
            Some(0) => return RemainingWork::Unusable("repeat count is zero"),
            Some(n) => Some(u32::from(n)),
            None => None,
        };

        // Open-ended jobs can absorb every captured frame
        let per_entry_required = |entry: &CaptureEntry| -> u32 {
            match iterations {
                Some(n) => u32::from(entry.count) * n,
                None => u32::MAX,
            }
        };

        let mut remaining_secs = 0.0;
        let mut remaining_frames = 0u64;
        let mut completed = u32::MAX;
        for entry in &self.sequence {
            let credit = available.get_mut(entry.signature.as_str());
            let required = per_entry_required(entry);
            let taken = match credit {
                Some(frames) => {
                    let taken = (*frames).min(required);
                    *frames -= taken;
                    taken
                }
                None => 0,
            };
            if entry.count > 0 {
                completed = completed.min(taken / u32::from(entry.count));
            }
            if iterations.is_some() {
                let left = required - taken;
                remaining_frames += u64::from(left);
                remaining_secs += f64::from(left) * entry.frame_secs();
            }
        }
        let completed_iterations = completed.min(u32::from(u16::MAX)) as u16;

        if iterations.is_none() {
            return RemainingWork::Pending {
                estimate: EstimatedTime::Unknown,
                completed_iterations,
            };
        }

        if remaining_frames == 0 {
            RemainingWork::Finished {
                completed_iterations,
            }
        } else {
            let millis = (remaining_secs * 1000.0).round();
            // The float cast saturates, so range-check before converting
            let estimate = if millis < i64::MAX as f64 {
                Duration::try_milliseconds(millis as i64)
            } else {
                None
            };
            match estimate {
                Some(estimate) => RemainingWork::Pending {
                    estimate: EstimatedTime::Known(estimate),
                    completed_iterations,
                },
                None => RemainingWork::Unusable("estimated duration out of range"),
            }
        }
    }
}

/// Serde helper storing a [`Duration`] as whole seconds.
pub(crate) mod duration_secs {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(duration.num_seconds())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = i64::deserialize(deserializer)?;
        Duration::try_seconds(secs)
            .ok_or_else(|| serde::de::Error::custom(format!("{secs}s is out of range")))
    }
}
