//! Plan files and the `plan` command.

use std::path::Path;

use chrono::{DateTime, Utc};
use miette::Result;
use serde::{Deserialize, Serialize};
use tracing::info;

use nightfall_scheduler::{
    CapturedFramesCount, GreedyScheduler, JobId, JobSchedule, JobState, SchedulerConfig,
    SchedulerJob, WindowConstraints,
};

/// Jobs, precomputed constraint windows and the frame ledger for one night.
#[derive(Debug, Clone, Deserialize)]
pub struct PlanFile {
    /// Evaluation time; the command line and then the clock take over if absent.
    #[serde(default)]
    pub now: Option<DateTime<Utc>>,
    #[serde(default)]
    pub config: SchedulerConfig,
    pub jobs: Vec<SchedulerJob>,
    #[serde(default)]
    pub constraints: WindowConstraints,
    #[serde(default)]
    pub captured: CapturedFramesCount,
}

impl PlanFile {
    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| miette::miette!("failed to read plan file {}: {}", path.display(), e))?;
        Self::parse(&content)
            .map_err(|e| miette::miette!("invalid plan file {}: {}", path.display(), e))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let mut plan: PlanFile =
            serde_json::from_str(content).map_err(|e| miette::miette!("{}", e))?;
        // Ids follow file order
        for (idx, job) in plan.jobs.iter_mut().enumerate() {
            job.id = JobId(idx as u64 + 1);
        }
        Ok(plan)
    }

    /// Resolve the evaluation time.
    pub fn now(&self, cli: Option<DateTime<Utc>>) -> DateTime<Utc> {
        cli.or(self.now).unwrap_or_else(Utc::now)
    }

    pub fn scheduler(&self) -> Result<GreedyScheduler> {
        GreedyScheduler::new(self.config.clone()).map_err(|e| miette::miette!("{}", e))
    }
}

/// Per-job outcome of a scheduling pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobReport {
    pub id: JobId,
    pub name: String,
    pub state: JobState,
    pub priority: i32,
    pub estimated_start_time: Option<DateTime<Utc>>,
    pub estimated_stop_time: Option<DateTime<Utc>>,
    pub last_reason: Option<String>,
}

impl From<&SchedulerJob> for JobReport {
    fn from(job: &SchedulerJob) -> Self {
        Self {
            id: job.id,
            name: job.name.clone(),
            state: job.state,
            priority: job.priority,
            estimated_start_time: job.estimated_start_time,
            estimated_stop_time: job.estimated_stop_time,
            last_reason: job.last_reason.clone(),
        }
    }
}

/// Result of the `plan` command.
#[derive(Debug, Clone, Serialize)]
pub struct PlanReport {
    pub now: DateTime<Utc>,
    pub selected: Option<JobId>,
    pub jobs: Vec<JobReport>,
    pub schedule: Vec<JobSchedule>,
    #[serde(skip)]
    pub summary: String,
}

impl PlanReport {
    fn render(&self) -> String {
        let mut out = format!("schedule at {}\n{}\n", self.now.to_rfc3339(), self.summary);
        for job in &self.jobs {
            let reason = job.last_reason.as_deref().unwrap_or("-");
            out.push_str(&format!(
                "\n{} {} [{}] priority {}: {}",
                job.id, job.name, job.state, job.priority, reason
            ));
        }
        out
    }
}

/// Run one scheduling pass over the plan.
pub fn plan(mut file: PlanFile, now: DateTime<Utc>) -> Result<PlanReport> {
    let mut scheduler = file.scheduler()?;
    let order = scheduler.schedule_jobs(&mut file.jobs, now, &file.captured, &file.constraints);

    let jobs = order
        .iter()
        .filter_map(|id| file.jobs.iter().find(|j| j.id == *id))
        .map(JobReport::from)
        .collect();

    Ok(PlanReport {
        now,
        selected: scheduler.scheduled_job(),
        jobs,
        schedule: scheduler.schedule().to_vec(),
        summary: scheduler.schedule_summary(),
    })
}

pub async fn run(path: &Path, now: Option<DateTime<Utc>>, json: bool) -> Result<()> {
    let file = PlanFile::load(path).await?;
    let now = file.now(now);
    info!(file = %path.display(), jobs = file.jobs.len(), now = %now, "planning");

    let report = plan(file, now)?;
    if json {
        let out = serde_json::to_string_pretty(&report)
            .map_err(|e| miette::miette!("failed to serialize report: {}", e))?;
        println!("{out}");
    } else {
        println!("{}", report.render());
    }
    Ok(())
}
