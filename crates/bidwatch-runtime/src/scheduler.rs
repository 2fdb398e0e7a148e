//! Scheduling layer on top of `tokio-cron-scheduler`: named jobs with
//! cron or fixed-interval triggers, per-job coalescing, pause/resume,
//! misfire recovery, and a bounded execution history.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use bidwatch_core::{AlertEvent, ErrorEvent, JobOutcome, JobRecord};
use chrono::{DateTime, Duration, Utc};
use cron::Schedule;
use thiserror::Error;
use tokio::fs;
use tokio::sync::{mpsc, Mutex};
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};
use tracing::{info, warn};

use crate::monitor::Monitor;

pub const FULL_CRAWL_JOB: &str = "full-crawl";
pub const INCREMENTAL_CRAWL_JOB: &str = "incremental-crawl";
pub const REPORT_JOB: &str = "report";

/// A missed trigger older than this is dropped instead of replayed.
const MISFIRE_GRACE_MINS: i64 = 5;

const HISTORY_HARD_CAP: usize = 1000;
const HISTORY_TRIM_TO: usize = 500;

const NEXT_FIRE_FILE: &str = "jobs.json";

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("scheduler backend error: {0}")]
    Backend(#[from] JobSchedulerError),
    #[error("invalid cron expression `{0}`")]
    BadCron(String),
    #[error("unknown job `{0}`")]
    UnknownJob(String),
    #[error("job `{0}` already registered")]
    DuplicateJob(String),
}

#[derive(Debug, Clone)]
pub enum JobTrigger {
    /// Six-field cron expression with seconds.
    Cron(String),
    Every(StdDuration),
}

impl std::fmt::Display for JobTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobTrigger::Cron(expr) => write!(f, "cron {expr}"),
            JobTrigger::Every(d) => write!(f, "every {}s", d.as_secs()),
        }
    }
}

pub type JobFuture = Pin<Box<dyn Future<Output = Result<(), String>> + Send>>;
pub type JobCallback = Arc<dyn Fn() -> JobFuture + Send + Sync>;

fn compute_next_fire(trigger: &JobTrigger, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match trigger {
        JobTrigger::Cron(expr) => Schedule::from_str(expr).ok()?.after(&now).next(),
        JobTrigger::Every(d) => Some(now + Duration::from_std(*d).ok()?),
    }
}

fn missed_within_grace(scheduled: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    scheduled <= now && now - scheduled < Duration::minutes(MISFIRE_GRACE_MINS)
}

pub(crate) fn trim_history(history: &mut Vec<JobRecord>) {
    if history.len() > HISTORY_HARD_CAP {
        let excess = history.len() - HISTORY_TRIM_TO;
        history.drain(..excess);
    }
}

/// Everything one trigger firing needs, shared between the backend's
/// callback and manual fires.
struct FireContext {
    name: String,
    trigger: JobTrigger,
    callback: JobCallback,
    running: AtomicBool,
    paused: AtomicBool,
    events: mpsc::UnboundedSender<JobRecord>,
    state_path: PathBuf,
    /// Serializes the read-modify-write of the next-fire file across jobs
    /// completing on different tasks.
    persist_lock: Arc<Mutex<()>>,
}

/// Run one firing to completion. Coalesces with a still-running previous
/// instance and honors the pause flag; callback panics are contained by the
/// spawned task boundary.
async fn fire(ctx: Arc<FireContext>) -> JobOutcome {
    let fired_at = Utc::now();
    let outcome = if ctx.paused.load(Ordering::SeqCst) {
        JobOutcome::Skipped {
            reason: "paused".to_string(),
        }
    } else if ctx.running.swap(true, Ordering::SeqCst) {
        JobOutcome::Skipped {
            reason: "previous instance still running".to_string(),
        }
    } else {
        let result = tokio::spawn((ctx.callback)()).await;
        ctx.running.store(false, Ordering::SeqCst);
        match result {
            Ok(Ok(())) => JobOutcome::Success,
            Ok(Err(error)) => JobOutcome::Failed { error },
            Err(join_err) => JobOutcome::Failed {
                error: format!("job callback panicked: {join_err}"),
            },
        }
    };

    {
        let _guard = ctx.persist_lock.lock().await;
        write_next_fire(
            &ctx.state_path,
            &ctx.name,
            compute_next_fire(&ctx.trigger, Utc::now()),
        )
        .await;
    }

    let record = JobRecord {
        job: ctx.name.clone(),
        fired_at,
        finished_at: Utc::now(),
        outcome: outcome.clone(),
    };
    if ctx.events.send(record).is_err() {
        warn!(job = %ctx.name, "job event channel closed");
    }
    outcome
}

async fn read_next_fires(path: &Path) -> HashMap<String, DateTime<Utc>> {
    match fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
        Err(_) => HashMap::new(),
    }
}

/// Best-effort persistence of the next expected fire time; the scheduler
/// keeps working if the write fails.
async fn write_next_fire(path: &Path, name: &str, next: Option<DateTime<Utc>>) {
    let mut map = read_next_fires(path).await;
    match next {
        Some(t) => {
            map.insert(name.to_string(), t);
        }
        None => {
            map.remove(name);
        }
    }
    let bytes = match serde_json::to_vec_pretty(&map) {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(error = %err, "next-fire state serialization failed");
            return;
        }
    };
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent).await;
    }
    if let Err(err) = fs::write(path, bytes).await {
        warn!(error = %err, path = %path.display(), "next-fire state write failed");
    }
}

#[derive(Debug, Clone)]
pub struct JobStatus {
    pub name: String,
    pub trigger: String,
    pub paused: bool,
    pub running: bool,
}

struct JobEntry {
    ctx: Arc<FireContext>,
    sched_id: uuid::Uuid,
}

pub struct BidScheduler {
    sched: JobScheduler,
    jobs: Mutex<HashMap<String, JobEntry>>,
    events: mpsc::UnboundedSender<JobRecord>,
    history: Arc<Mutex<Vec<JobRecord>>>,
    state_path: PathBuf,
    persist_lock: Arc<Mutex<()>>,
}

impl BidScheduler {
    pub async fn new(store_dir: &Path, monitor: Arc<Monitor>) -> Result<Self, SchedulerError> {
        let sched = JobScheduler::new().await?;
        let (events, rx) = mpsc::unbounded_channel();
        let history = Arc::new(Mutex::new(Vec::new()));
        tokio::spawn(record_events(rx, Arc::clone(&history), monitor));
        Ok(Self {
            sched,
            jobs: Mutex::new(HashMap::new()),
            events,
            history,
            state_path: store_dir.join(NEXT_FIRE_FILE),
            persist_lock: Arc::new(Mutex::new(())),
        })
    }

    pub async fn add_job(
        &self,
        name: &str,
        trigger: JobTrigger,
        callback: JobCallback,
    ) -> Result<(), SchedulerError> {
        let mut jobs = self.jobs.lock().await;
        if jobs.contains_key(name) {
            return Err(SchedulerError::DuplicateJob(name.to_string()));
        }
        if let JobTrigger::Cron(expr) = &trigger {
            if Schedule::from_str(expr).is_err() {
                return Err(SchedulerError::BadCron(expr.clone()));
            }
        }

        let ctx = Arc::new(FireContext {
            name: name.to_string(),
            trigger: trigger.clone(),
            callback,
            running: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            events: self.events.clone(),
            state_path: self.state_path.clone(),
            persist_lock: Arc::clone(&self.persist_lock),
        });

        let fire_ctx = Arc::clone(&ctx);
        let job = match &trigger {
            JobTrigger::Cron(expr) => Job::new_async(expr.as_str(), move |_uuid, _l| {
                let ctx = Arc::clone(&fire_ctx);
                Box::pin(async move {
                    fire(ctx).await;
                })
            })?,
            JobTrigger::Every(every) => Job::new_repeated_async(*every, move |_uuid, _l| {
                let ctx = Arc::clone(&fire_ctx);
                Box::pin(async move {
                    fire(ctx).await;
                })
            })?,
        };
        let sched_id = self.sched.add(job).await?;

        info!(job = name, trigger = %trigger, "job registered");
        jobs.insert(name.to_string(), JobEntry { ctx, sched_id });
        Ok(())
    }

    pub async fn remove_job(&self, name: &str) -> Result<(), SchedulerError> {
        let entry = self
            .jobs
            .lock()
            .await
            .remove(name)
            .ok_or_else(|| SchedulerError::UnknownJob(name.to_string()))?;
        self.sched.remove(&entry.sched_id).await?;
        {
            let _guard = self.persist_lock.lock().await;
            write_next_fire(&self.state_path, name, None).await;
        }
        info!(job = name, "job removed");
        Ok(())
    }

    pub async fn pause_job(&self, name: &str) -> Result<(), SchedulerError> {
        self.set_paused(name, true).await
    }

    pub async fn resume_job(&self, name: &str) -> Result<(), SchedulerError> {
        self.set_paused(name, false).await
    }

    async fn set_paused(&self, name: &str, paused: bool) -> Result<(), SchedulerError> {
        let jobs = self.jobs.lock().await;
        let entry = jobs
            .get(name)
            .ok_or_else(|| SchedulerError::UnknownJob(name.to_string()))?;
        entry.ctx.paused.store(paused, Ordering::SeqCst);
        info!(job = name, paused, "job pause flag changed");
        Ok(())
    }

    pub async fn list_jobs(&self) -> Vec<JobStatus> {
        let jobs = self.jobs.lock().await;
        let mut statuses: Vec<JobStatus> = jobs
            .values()
            .map(|entry| JobStatus {
                name: entry.ctx.name.clone(),
                trigger: entry.ctx.trigger.to_string(),
                paused: entry.ctx.paused.load(Ordering::SeqCst),
                running: entry.ctx.running.load(Ordering::SeqCst),
            })
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// Most recent execution records, newest first.
    pub async fn job_history(&self, limit: usize) -> Vec<JobRecord> {
        let history = self.history.lock().await;
        history.iter().rev().take(limit).cloned().collect()
    }

    /// Trigger one firing by hand, with the same coalescing and pause
    /// semantics as a scheduled firing.
    pub async fn fire_job(&self, name: &str) -> Result<JobOutcome, SchedulerError> {
        let ctx = {
            let jobs = self.jobs.lock().await;
            let entry = jobs
                .get(name)
                .ok_or_else(|| SchedulerError::UnknownJob(name.to_string()))?;
            Arc::clone(&entry.ctx)
        };
        Ok(fire(ctx).await)
    }

    /// Replay misfired jobs inside the grace window, then start the trigger
    /// backend.
    pub async fn start(&self) -> Result<(), SchedulerError> {
        let now = Utc::now();
        let persisted = read_next_fires(&self.state_path).await;
        {
            let jobs = self.jobs.lock().await;
            for (name, entry) in jobs.iter() {
                if let Some(&scheduled) = persisted.get(name) {
                    if missed_within_grace(scheduled, now) {
                        info!(job = name, %scheduled, "replaying misfired job");
                        let ctx = Arc::clone(&entry.ctx);
                        tokio::spawn(async move {
                            fire(ctx).await;
                        });
                    }
                }
            }
        }
        self.sched.start().await?;
        info!("scheduler started");
        Ok(())
    }
}

async fn record_events(
    mut rx: mpsc::UnboundedReceiver<JobRecord>,
    history: Arc<Mutex<Vec<JobRecord>>>,
    monitor: Arc<Monitor>,
) {
    while let Some(record) = rx.recv().await {
        {
            let mut history = history.lock().await;
            history.push(record.clone());
            trim_history(&mut history);
        }
        if let JobOutcome::Failed { error } = &record.outcome {
            monitor
                .record_error(ErrorEvent::new(
                    "scheduler",
                    format!("job {} failed: {error}", record.job),
                ))
                .await;
            if record.job == FULL_CRAWL_JOB {
                monitor
                    .record_alert(AlertEvent::new(
                        "pipeline-failure",
                        format!("full crawl failed: {error}"),
                    ))
                    .await;
            }
        }
    }
}
