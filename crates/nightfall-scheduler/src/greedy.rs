//! Greedy scheduler implementation.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

use crate::{
    CapturedFramesCount, ConstraintEvaluator, EstimatedTime, JobEvent, JobId, JobState,
    RemainingWork, SchedulerConfig, SchedulerError, SchedulerJob,
};

/// Capacity of the scheduler notification channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Why a simulated schedule segment ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StopReason {
    Completed,
    ConstraintViolated,
    EndOfWindow,
    CompletionTime,
    Interrupted { by: String },
    SimulationHorizon,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Completed => f.write_str("job completed"),
            StopReason::ConstraintViolated => f.write_str("constraints no longer satisfied"),
            StopReason::EndOfWindow => f.write_str("imaging window ended"),
            StopReason::CompletionTime => f.write_str("completion time reached"),
            StopReason::Interrupted { by } => write!(f, "interrupted by {by}"),
            StopReason::SimulationHorizon => f.write_str("end of simulation"),
        }
    }
}

/// One segment of the simulated schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSchedule {
    pub job: JobId,
    pub job_name: String,
    pub start: DateTime<Utc>,
    pub stop: DateTime<Utc>,
    pub stop_reason: StopReason,
}

/// Notifications published by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    /// A job changed state.
    StateChanged {
        job: JobId,
        name: String,
        from: JobState,
        to: JobState,
        reason: String,
    },
    /// A scheduling pass finished.
    ScheduleComputed {
        selected: Option<JobId>,
        segments: usize,
    },
}

/// The greedy scheduler.
///
/// Holds the session's retry policy and the result of the last pass. Jobs
/// are owned by the host and passed in on every call.
pub struct GreedyScheduler {
    config: SchedulerConfig,
    scheduled_job: Option<JobId>,
    schedule: Vec<JobSchedule>,
    last_check_reason: Option<String>,
    events_tx: broadcast::Sender<SchedulerEvent>,
}

impl Default for GreedyScheduler {
    fn default() -> Self {
        Self::with_config(SchedulerConfig::default())
    }
}

impl GreedyScheduler {
    /// Create a scheduler after validating its configuration.
    pub fn new(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        config.validate()?;
        Ok(Self::with_config(config))
    }

    fn with_config(config: SchedulerConfig) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            scheduled_job: None,
            schedule: Vec::new(),
            last_check_reason: None,
            events_tx,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    fn horizon_end(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_add_signed(self.config.horizon())
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Set the whole retry policy at once.
    pub fn set_params(
        &mut self,
        reschedule_aborts_immediate: bool,
        reschedule_aborts_queue: bool,
        reschedule_errors: bool,
        abort_delay_seconds: u64,
        error_delay_seconds: u64,
    ) {
        self.config.retry.reschedule_aborts_immediate = reschedule_aborts_immediate;
        self.config.retry.reschedule_aborts_queue = reschedule_aborts_queue;
        self.config.retry.reschedule_errors = reschedule_errors;
        self.config.retry.abort_delay_seconds = abort_delay_seconds;
        self.config.retry.error_delay_seconds = error_delay_seconds;
    }

    pub fn set_reschedule_aborts_immediate(&mut self, value: bool) {
        self.config.retry.reschedule_aborts_immediate = value;
    }

    pub fn set_reschedule_aborts_queue(&mut self, value: bool) {
        self.config.retry.reschedule_aborts_queue = value;
    }

    pub fn set_reschedule_errors(&mut self, value: bool) {
        self.config.retry.reschedule_errors = value;
    }

    pub fn set_abort_delay_seconds(&mut self, value: u64) {
        self.config.retry.abort_delay_seconds = value;
    }

    pub fn set_error_delay_seconds(&mut self, value: u64) {
        self.config.retry.error_delay_seconds = value;
    }

    /// Job chosen by the last scheduling pass.
    pub fn scheduled_job(&self) -> Option<JobId> {
        self.scheduled_job
    }

    /// Schedule produced by the last scheduling pass.
    pub fn schedule(&self) -> &[JobSchedule] {
        &self.schedule
    }

    /// Why the last [`check_job`](Self::check_job) call said to stop.
    pub fn last_check_reason(&self) -> Option<&str> {
        self.last_check_reason.as_deref()
    }

    /// Subscribe to scheduler notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events_tx.subscribe()
    }

    /// Human-readable summary of the last schedule, one segment per line.
    pub fn schedule_summary(&self) -> String {
        if self.schedule.is_empty() {
            return "no jobs scheduled".to_string();
        }
        self.schedule
            .iter()
            .map(|s| {
                format!(
                    "{} {}: {} -> {} ({})",
                    s.job,
                    s.job_name,
                    s.start.format("%Y-%m-%d %H:%M"),
                    s.stop.format("%Y-%m-%d %H:%M"),
                    s.stop_reason
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Run a scheduling pass.
    ///
    /// Re-evaluates every job at `now`, selects the next job and simulates
    /// forward to the horizon. Returns job ids ordered by estimated start,
    /// with unscheduled jobs last.
    #[tracing::instrument(skip_all, fields(jobs = jobs.len(), now = %now))]
    pub fn schedule_jobs(
        &mut self,
        jobs: &mut [SchedulerJob],
        now: DateTime<Utc>,
        captured: &CapturedFramesCount,
        evaluator: &dyn ConstraintEvaluator,
    ) -> Vec<JobId> {
        self.scheduled_job = None;
        self.schedule.clear();

        let running = self.normalize_running(jobs, now);
        self.prepare_jobs_for_evaluation(jobs, now, captured, evaluator);

        let pool: Vec<usize> = jobs
            .iter()
            .enumerate()
            .filter(|(_, j)| matches!(j.state, JobState::Evaluation | JobState::Running))
            .map(|(i, _)| i)
            .collect();
        let horizon_end = self.horizon_end(now);

        let selected = self.select_next_job(jobs, &pool, now, horizon_end, running, evaluator);
        let schedule = self.simulate(jobs, &pool, now, horizon_end, running, evaluator);

        for job in jobs.iter_mut() {
            let first = schedule.iter().find(|s| s.job == job.id);
            job.estimated_start_time = first.map(|s| s.start);
            job.estimated_stop_time = first.map(|s| s.stop);
        }
        self.unset_evaluation(jobs, &schedule);

        match selected {
            Some((idx, start)) => {
                let job = &mut jobs[idx];
                if job.state != JobState::Running {
                    job.startup_time = Some(start);
                }
                info!(job = %job.name, id = %job.id, start = %start, priority = job.priority, "selected next job");
                self.scheduled_job = Some(job.id);
            }
            None => debug!("no runnable job"),
        }

        let mut order: Vec<&SchedulerJob> = jobs.iter().collect();
        order.sort_by(|a, b| {
            match (a.estimated_start_time, b.estimated_start_time) {
                (Some(x), Some(y)) => x.cmp(&y),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            }
            .then_with(|| rank(a, b))
        });
        let ordered = order.iter().map(|j| j.id).collect();

        debug!(segments = schedule.len(), "schedule computed");
        self.broadcast(SchedulerEvent::ScheduleComputed {
            selected: self.scheduled_job,
            segments: schedule.len(),
        });
        self.schedule = schedule;
        ordered
    }

    /// Check whether the running job `current` should keep running.
    ///
    /// Returns false when it lost its constraints, its window or completion
    /// time passed, the weather turned for a weather-enforcing job, or a job
    /// of strictly higher priority became runnable.
    pub fn check_job(
        &mut self,
        jobs: &[SchedulerJob],
        now: DateTime<Utc>,
        current: JobId,
        evaluator: &dyn ConstraintEvaluator,
    ) -> bool {
        match self.stop_reason_for(jobs, now, current, evaluator) {
            None => {
                self.last_check_reason = None;
                true
            }
            Some(reason) => {
                info!(id = %current, reason = %reason, "running job should stop");
                self.last_check_reason = Some(reason);
                false
            }
        }
    }

    fn stop_reason_for(
        &self,
        jobs: &[SchedulerJob],
        now: DateTime<Utc>,
        current: JobId,
        evaluator: &dyn ConstraintEvaluator,
    ) -> Option<String> {
        let Some(job) = jobs.iter().find(|j| j.id == current) else {
            return Some(format!("job not found: {current}"));
        };
        if job.state != JobState::Running {
            return Some(format!("job is {}, not running", job.state));
        }
        if job.constraints.window_end.is_some_and(|end| end <= now) {
            return Some(StopReason::EndOfWindow.to_string());
        }
        if job.completion_time().is_some_and(|at| at <= now) {
            return Some(StopReason::CompletionTime.to_string());
        }
        if !evaluator.is_constraint_satisfied(job, now) {
            return Some(StopReason::ConstraintViolated.to_string());
        }
        let weather_safe = evaluator.is_weather_safe(now);
        if job.constraints.enforce_weather && !weather_safe {
            return Some("weather is unsafe".to_string());
        }

        let horizon_end = self.horizon_end(now);
        jobs.iter()
            .filter(|other| other.id != job.id && other.priority > job.priority)
            .filter(|other| !other.state.is_terminal() && other.state != JobState::Running)
            .filter(|other| self.is_retry_eligible(other, now))
            .filter(|other| !other.constraints.enforce_weather || weather_safe)
            .find(|other| {
                self.find_next_start(other, now, horizon_end, evaluator)
                    .is_some_and(|start| start <= now + other.lead_time)
            })
            .map(|other| StopReason::Interrupted { by: other.name.clone() }.to_string())
    }

    /// Mark a job as running.
    pub fn start_job(
        &self,
        jobs: &mut [SchedulerJob],
        id: JobId,
        now: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        if let Some(running) = jobs
            .iter()
            .find(|j| j.state == JobState::Running && j.id != id)
        {
            return Err(SchedulerError::AlreadyRunning(running.name.clone()));
        }
        let job = find_job_mut(jobs, id)?;
        self.transition(job, JobEvent::Start, "started")?;
        job.startup_time = Some(now);
        Ok(())
    }

    /// Mark a job as finished.
    pub fn complete_job(&self, jobs: &mut [SchedulerJob], id: JobId) -> Result<(), SchedulerError> {
        let job = find_job_mut(jobs, id)?;
        self.transition(job, JobEvent::Complete, "completed")?;
        job.estimated_time = EstimatedTime::Known(Duration::zero());
        Ok(())
    }

    /// Abort a job; it becomes eligible again according to the retry policy.
    pub fn abort_job(
        &self,
        jobs: &mut [SchedulerJob],
        id: JobId,
        now: DateTime<Utc>,
        reason: &str,
    ) -> Result<(), SchedulerError> {
        let job = find_job_mut(jobs, id)?;
        self.transition(job, JobEvent::Abort, reason)?;
        job.aborted_at = Some(now);
        Ok(())
    }

    /// Record an execution failure for a running job.
    pub fn fail_job(
        &self,
        jobs: &mut [SchedulerJob],
        id: JobId,
        now: DateTime<Utc>,
        reason: &str,
    ) -> Result<(), SchedulerError> {
        let job = find_job_mut(jobs, id)?;
        self.transition(job, JobEvent::Fail, reason)?;
        job.errored_at = Some(now);
        warn!(job = %job.name, reason, "job failed");
        Ok(())
    }

    /// Suspend a running job in favour of a higher-priority one.
    pub fn suspend_job(
        &self,
        jobs: &mut [SchedulerJob],
        id: JobId,
        reason: &str,
    ) -> Result<(), SchedulerError> {
        let job = find_job_mut(jobs, id)?;
        self.transition(job, JobEvent::Suspend, reason)
    }

    /// Start a new session: every job returns to idle.
    pub fn reset_jobs(&mut self, jobs: &mut [SchedulerJob]) {
        for job in jobs.iter_mut() {
            self.advance(job, JobEvent::Reset, "session reset");
            job.startup_time = None;
            job.estimated_start_time = None;
            job.estimated_stop_time = None;
            job.estimated_time = EstimatedTime::Unknown;
            job.completed_iterations = 0;
            job.aborted_at = None;
            job.errored_at = None;
        }
        self.scheduled_job = None;
        self.schedule.clear();
        self.last_check_reason = None;
        info!(jobs = jobs.len(), "scheduler session reset");
    }

    /// Keep the first running job, abort any others.
    fn normalize_running(&self, jobs: &mut [SchedulerJob], now: DateTime<Utc>) -> Option<usize> {
        let mut running = None;
        for (idx, job) in jobs.iter_mut().enumerate() {
            if job.state != JobState::Running {
                continue;
            }
            if running.is_none() {
                running = Some(idx);
            } else {
                warn!(job = %job.name, "more than one running job, aborting extra");
                self.advance(job, JobEvent::Abort, "another job is already running");
                job.aborted_at = Some(now);
            }
        }
        running
    }

    /// Admit jobs into evaluation and re-estimate their remaining work.
    fn prepare_jobs_for_evaluation(
        &self,
        jobs: &mut [SchedulerJob],
        now: DateTime<Utc>,
        captured: &CapturedFramesCount,
        evaluator: &dyn ConstraintEvaluator,
    ) {
        let horizon_end = self.horizon_end(now);
        for job in jobs.iter_mut() {
            match job.state {
                JobState::Complete | JobState::Invalid => continue,
                JobState::Running => {
                    // The host owns running jobs; only refresh the estimate
                    match job.remaining_work(captured) {
                        RemainingWork::Pending {
                            estimate,
                            completed_iterations,
                        } => {
                            job.estimated_time = estimate;
                            job.completed_iterations = completed_iterations;
                        }
                        RemainingWork::Finished {
                            completed_iterations,
                        } => {
                            job.estimated_time = EstimatedTime::Known(Duration::zero());
                            job.completed_iterations = completed_iterations;
                        }
                        RemainingWork::Unusable(_) => {}
                    }
                    continue;
                }
                JobState::Aborted | JobState::Error if !self.is_retry_eligible(job, now) => {
                    trace!(job = %job.name, state = %job.state, "not eligible for retry yet");
                    continue;
                }
                _ => {}
            }

            if job.state != JobState::Evaluation {
                self.advance(job, JobEvent::Evaluate, "evaluating");
            }
            self.evaluate_job(job, now, horizon_end, captured, evaluator);
        }
    }

    fn evaluate_job(
        &self,
        job: &mut SchedulerJob,
        now: DateTime<Utc>,
        horizon_end: DateTime<Utc>,
        captured: &CapturedFramesCount,
        evaluator: &dyn ConstraintEvaluator,
    ) {
        match job.remaining_work(captured) {
            RemainingWork::Unusable(reason) => {
                self.advance(job, JobEvent::Invalidate, reason);
                return;
            }
            RemainingWork::Finished {
                completed_iterations,
            } => {
                job.completed_iterations = completed_iterations;
                job.estimated_time = EstimatedTime::Known(Duration::zero());
                self.advance(job, JobEvent::Complete, "all frames captured");
                return;
            }
            RemainingWork::Pending {
                estimate,
                completed_iterations,
            } => {
                job.estimated_time = estimate;
                job.completed_iterations = completed_iterations;
            }
        }

        if job.completion_time().is_some_and(|at| at <= now) {
            self.advance(job, JobEvent::Complete, "completion time reached");
            return;
        }

        let constraints = &job.constraints;
        if constraints.window_end.is_some_and(|end| end <= now) {
            self.advance(job, JobEvent::Invalidate, "imaging window has ended");
            return;
        }
        if let (Some(start), Some(end)) = (constraints.start_after, constraints.window_end) {
            if start >= end {
                self.advance(job, JobEvent::Invalidate, "start time is after window end");
                return;
            }
        }

        match self.find_next_start(job, now, horizon_end, evaluator) {
            Some(start) => {
                debug!(job = %job.name, start = %start, estimate = ?job.estimated_time, "job feasible");
            }
            None if job
                .constraints
                .window_end
                .is_some_and(|end| end <= horizon_end) =>
            {
                self.advance(
                    job,
                    JobEvent::Invalidate,
                    "constraints never satisfied before window end",
                );
            }
            None => {
                debug!(job = %job.name, "no feasible start within horizon");
            }
        }
    }

    /// Choose the job to run at `now`.
    fn select_next_job(
        &self,
        jobs: &[SchedulerJob],
        pool: &[usize],
        now: DateTime<Utc>,
        horizon_end: DateTime<Utc>,
        running: Option<usize>,
        evaluator: &dyn ConstraintEvaluator,
    ) -> Option<(usize, DateTime<Utc>)> {
        self.pick(jobs, pool, now, now, horizon_end, running, evaluator)
    }

    /// Pick the best job at simulated time `at`.
    ///
    /// Jobs feasible within their lead time are ranked by priority, start,
    /// greedy flag and id; a runnable `sticky` job only yields to strictly
    /// higher priority. Without a runnable job the earliest future start wins.
    #[allow(clippy::too_many_arguments)]
    fn pick(
        &self,
        jobs: &[SchedulerJob],
        pool: &[usize],
        at: DateTime<Utc>,
        now: DateTime<Utc>,
        horizon_end: DateTime<Utc>,
        sticky: Option<usize>,
        evaluator: &dyn ConstraintEvaluator,
    ) -> Option<(usize, DateTime<Utc>)> {
        let weather_blocked = |job: &SchedulerJob| {
            at == now && job.constraints.enforce_weather && !evaluator.is_weather_safe(now)
        };
        let starts: Vec<(usize, DateTime<Utc>)> = pool
            .iter()
            .filter_map(|&idx| {
                let job = &jobs[idx];
                let from = if weather_blocked(job) {
                    now.checked_add_signed(self.config.resolution())
                        .unwrap_or(horizon_end)
                } else {
                    at
                };
                self.find_next_start(job, from, horizon_end, evaluator)
                    .map(|start| (idx, start))
            })
            .collect();

        let runnable = |&(idx, start): &(usize, DateTime<Utc>)| {
            !weather_blocked(&jobs[idx])
                && at
                    .checked_add_signed(jobs[idx].lead_time)
                    .is_none_or(|limit| start <= limit)
        };
        let by_rank = |a: &(usize, DateTime<Utc>), b: &(usize, DateTime<Utc>)| {
            jobs[b.0]
                .priority
                .cmp(&jobs[a.0].priority)
                .then(a.1.cmp(&b.1))
                .then_with(|| rank(&jobs[a.0], &jobs[b.0]))
        };

        let best = starts
            .iter()
            .filter(|c| runnable(*c))
            .min_by(|a, b| by_rank(*a, *b));
        if let Some(best) = best {
            let kept = sticky
                .and_then(|idx| starts.iter().find(|(i, _)| *i == idx))
                .filter(|c| runnable(*c))
                .filter(|(idx, _)| jobs[best.0].priority <= jobs[*idx].priority);
            return Some(*kept.unwrap_or(best));
        }

        starts
            .into_iter()
            .min_by(|a, b| a.1.cmp(&b.1).then_with(|| by_rank(a, b)))
    }

    /// Walk forward from `now` to `end`, producing schedule segments.
    fn simulate(
        &self,
        jobs: &[SchedulerJob],
        pool: &[usize],
        now: DateTime<Utc>,
        end: DateTime<Utc>,
        running: Option<usize>,
        evaluator: &dyn ConstraintEvaluator,
    ) -> Vec<JobSchedule> {
        let resolution = self.config.resolution();
        let mut remaining: HashMap<usize, Option<Duration>> = pool
            .iter()
            .map(|&idx| (idx, jobs[idx].estimated_time.known()))
            .collect();
        let mut active = pool.to_vec();
        let mut schedule = Vec::new();
        let mut at = now;
        let mut sticky = running;

        while at < end && schedule.len() < self.config.max_segments {
            let Some((idx, start)) = self.pick(jobs, &active, at, now, end, sticky, evaluator)
            else {
                break;
            };
            let job = &jobs[idx];

            let mut stop = (end, StopReason::SimulationHorizon);
            let mut consider = |time: DateTime<Utc>, reason: StopReason| {
                if time < stop.0 {
                    stop = (time, reason);
                }
            };
            // Finishing past the representable range is beyond the horizon
            if let Some(finish) = remaining
                .get(&idx)
                .copied()
                .flatten()
                .and_then(|left| start.checked_add_signed(left))
            {
                consider(finish, StopReason::Completed);
            }
            if let Some(window) = evaluator.feasible_window_end(job, start) {
                consider(window, StopReason::ConstraintViolated);
            }
            if let Some(window_end) = job.constraints.window_end {
                consider(window_end, StopReason::EndOfWindow);
            }
            if let Some(completion) = job.completion_time() {
                consider(completion, StopReason::CompletionTime);
            }
            for &other in &active {
                let candidate = &jobs[other];
                if other == idx || candidate.priority <= job.priority {
                    continue;
                }
                let Some(from) = start.checked_add_signed(resolution) else {
                    break;
                };
                if let Some(other_start) = self.find_next_start(candidate, from, end, evaluator) {
                    consider(
                        other_start,
                        StopReason::Interrupted {
                            by: candidate.name.clone(),
                        },
                    );
                }
            }

            let (mut stop_time, reason) = stop;
            if stop_time <= start {
                stop_time = start.checked_add_signed(resolution).unwrap_or(end);
            }

            let finished = match reason {
                StopReason::Completed | StopReason::EndOfWindow | StopReason::CompletionTime => {
                    true
                }
                _ => match remaining.get_mut(&idx) {
                    Some(Some(left)) => {
                        *left = *left - (stop_time - start);
                        *left <= Duration::zero()
                    }
                    _ => false,
                },
            };
            if finished {
                active.retain(|&i| i != idx);
            }

            trace!(job = %job.name, start = %start, stop = %stop_time, reason = %reason, "simulated segment");
            schedule.push(JobSchedule {
                job: job.id,
                job_name: job.name.clone(),
                start,
                stop: stop_time,
                stop_reason: reason,
            });
            sticky = Some(idx);
            at = stop_time;
        }

        schedule
    }

    /// Move evaluated jobs to scheduled or back to idle.
    fn unset_evaluation(&self, jobs: &mut [SchedulerJob], schedule: &[JobSchedule]) {
        for job in jobs.iter_mut() {
            if job.state != JobState::Evaluation {
                continue;
            }
            if schedule.iter().any(|s| s.job == job.id) {
                self.advance(job, JobEvent::Schedule, "scheduled");
            } else {
                self.advance(job, JobEvent::Park, "no feasible slot within horizon");
            }
        }
    }

    /// Earliest sampled time in `[from, until)` at which the job may run.
    fn find_next_start(
        &self,
        job: &SchedulerJob,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
        evaluator: &dyn ConstraintEvaluator,
    ) -> Option<DateTime<Utc>> {
        let mut time = match job.constraints.start_after {
            Some(start) if start > from => start,
            _ => from,
        };
        let end = match job.constraints.window_end {
            Some(window_end) => window_end.min(until),
            None => until,
        };
        let step = self.config.resolution();
        while time < end {
            if evaluator.is_constraint_satisfied(job, time) {
                return Some(time);
            }
            time = time.checked_add_signed(step)?;
        }
        None
    }

    fn is_retry_eligible(&self, job: &SchedulerJob, now: DateTime<Utc>) -> bool {
        let policy = &self.config.retry;
        match job.state {
            JobState::Aborted => {
                if policy.reschedule_aborts_immediate {
                    true
                } else if policy.reschedule_aborts_queue {
                    job.aborted_at
                        .is_none_or(|at| now - at >= policy.abort_delay())
                } else {
                    false
                }
            }
            JobState::Error => {
                policy.reschedule_errors
                    && job
                        .errored_at
                        .is_none_or(|at| now - at >= policy.error_delay())
            }
            JobState::Running | JobState::Complete | JobState::Invalid => false,
            JobState::Idle | JobState::Evaluation | JobState::Scheduled | JobState::Suspended => {
                true
            }
        }
    }

    /// Apply an event to a job and publish the change.
    fn transition(
        &self,
        job: &mut SchedulerJob,
        event: JobEvent,
        reason: &str,
    ) -> Result<(), SchedulerError> {
        let from = job.state;
        let to = from.apply(event)?;
        job.state = to;
        job.last_reason = Some(reason.to_string());
        if from == to {
            return Ok(());
        }

        if matches!(
            event,
            JobEvent::Evaluate | JobEvent::Schedule | JobEvent::Park
        ) {
            debug!(job = %job.name, from = %from, to = %to, reason, "job state changed");
        } else {
            info!(job = %job.name, from = %from, to = %to, reason, "job state changed");
        }
        self.broadcast(SchedulerEvent::StateChanged {
            job: job.id,
            name: job.name.clone(),
            from,
            to,
            reason: reason.to_string(),
        });
        Ok(())
    }

    /// Transition used inside a pass, where a rejected event is only logged.
    fn advance(&self, job: &mut SchedulerJob, event: JobEvent, reason: &str) {
        if let Err(e) = self.transition(job, event, reason) {
            warn!(job = %job.name, error = %e, "ignoring rejected transition");
        }
    }

    fn broadcast(&self, event: SchedulerEvent) {
        if self.events_tx.send(event).is_err() {
            trace!("no subscribers for scheduler event");
        }
    }
}

/// Tie-break after priority and start: greedy first, then creation order.
fn rank(a: &SchedulerJob, b: &SchedulerJob) -> Ordering {
    b.greedy.cmp(&a.greedy).then(a.id.cmp(&b.id))
}

fn find_job_mut(jobs: &mut [SchedulerJob], id: JobId) -> Result<&mut SchedulerJob, SchedulerError> {
    jobs.iter_mut()
        .find(|j| j.id == id)
        .ok_or(SchedulerError::JobNotFound(id))
}
