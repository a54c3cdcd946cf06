//! The `night` command: a simulated session driving the scheduler.
//!
//! Each tick the host checks the running job, runs a scheduling pass and
//! starts the selected job once its startup time arrives. Jobs capture
//! instantly at their estimated stop; frames of interrupted jobs are not
//! credited.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use miette::Result;
use tracing::info;

use nightfall_scheduler::{CapturedFramesCount, JobId, SchedulerJob};

use crate::plan::PlanFile;

/// What happened to a job during the night.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NightAction {
    Started,
    Completed,
    Stopped(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NightEntry {
    pub time: DateTime<Utc>,
    pub job: String,
    pub action: NightAction,
}

impl fmt::Display for NightEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let time = self.time.format("%Y-%m-%d %H:%M");
        match &self.action {
            NightAction::Started => write!(f, "{time} start    {}", self.job),
            NightAction::Completed => write!(f, "{time} complete {}", self.job),
            NightAction::Stopped(reason) => write!(f, "{time} stop     {} ({reason})", self.job),
        }
    }
}

/// Record the frames of a completed job in the ledger.
fn credit_frames(captured: &mut CapturedFramesCount, job: &SchedulerJob) {
    let iterations = job.required_iterations().unwrap_or(1);
    let mut required: HashMap<&str, u16> = HashMap::new();
    for entry in &job.sequence {
        let total = required.entry(entry.signature.as_str()).or_default();
        *total = total.saturating_add(entry.count.saturating_mul(iterations));
    }
    for (signature, frames) in required {
        let slot = captured.entry(signature.to_string()).or_default();
        *slot = (*slot).max(frames);
    }
}

fn job_name(jobs: &[SchedulerJob], id: JobId) -> String {
    jobs.iter()
        .find(|j| j.id == id)
        .map(|j| j.name.clone())
        .unwrap_or_else(|| id.to_string())
}

/// Simulate the night from `start` for `hours`, ticking every `tick_seconds`.
pub fn simulate(
    file: PlanFile,
    start: DateTime<Utc>,
    hours: u32,
    tick_seconds: u32,
) -> Result<Vec<NightEntry>> {
    let mut scheduler = file.scheduler()?;
    let PlanFile {
        mut jobs,
        mut captured,
        constraints,
        ..
    } = file;

    let tick = Duration::seconds(i64::from(tick_seconds.max(1)));
    let end = start + Duration::hours(i64::from(hours));
    let mut log = Vec::new();
    // Running job and when its sequence is done, if known
    let mut running: Option<(JobId, Option<DateTime<Utc>>)> = None;
    let mut now = start;

    while now < end {
        if let Some((id, finish_at)) = running {
            if finish_at.is_some_and(|at| at <= now) {
                if let Some(job) = jobs.iter().find(|j| j.id == id) {
                    credit_frames(&mut captured, job);
                }
                scheduler
                    .complete_job(&mut jobs, id)
                    .map_err(|e| miette::miette!("{}", e))?;
                log.push(NightEntry {
                    time: now,
                    job: job_name(&jobs, id),
                    action: NightAction::Completed,
                });
                running = None;
            } else if !scheduler.check_job(&jobs, now, id, &constraints) {
                let reason = scheduler
                    .last_check_reason()
                    .unwrap_or("stopped")
                    .to_string();
                scheduler
                    .abort_job(&mut jobs, id, now, &reason)
                    .map_err(|e| miette::miette!("{}", e))?;
                log.push(NightEntry {
                    time: now,
                    job: job_name(&jobs, id),
                    action: NightAction::Stopped(reason),
                });
                running = None;
            }
        }

        scheduler.schedule_jobs(&mut jobs, now, &captured, &constraints);

        let selected = scheduler.scheduled_job().filter(|_| running.is_none());
        if let Some(id) = selected {
            let due = jobs
                .iter()
                .find(|j| j.id == id)
                .and_then(|j| j.startup_time)
                .is_some_and(|at| at <= now);
            if due {
                scheduler
                    .start_job(&mut jobs, id, now)
                    .map_err(|e| miette::miette!("{}", e))?;
                let finish_at = jobs
                    .iter()
                    .find(|j| j.id == id)
                    .and_then(|j| j.estimated_time.known())
                    .and_then(|d| now.checked_add_signed(d));
                log.push(NightEntry {
                    time: now,
                    job: job_name(&jobs, id),
                    action: NightAction::Started,
                });
                running = Some((id, finish_at));
            }
        }

        now = now + tick;
    }

    Ok(log)
}

pub async fn run(
    path: &Path,
    now: Option<DateTime<Utc>>,
    hours: u32,
    tick_seconds: u32,
) -> Result<()> {
    let file = PlanFile::load(path).await?;
    let start = file.now(now);
    info!(file = %path.display(), start = %start, hours, tick_seconds, "simulating night");

    let log = simulate(file, start, hours, tick_seconds)?;
    if log.is_empty() {
        println!("nothing ran");
    }
    for entry in &log {
        println!("{entry}");
    }
    Ok(())
}
