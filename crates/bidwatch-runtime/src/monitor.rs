//! Run health aggregation: rolling in-memory windows over sessions, errors,
//! and alerts, durable JSONL logging, health classification, and report
//! artifacts.

use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;

use bidwatch_core::{AlertEvent, CrawlSession, ErrorEvent, SessionStatus};
use bidwatch_state::{OpsLog, StateError};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Sessions and events older than this fall out of the in-memory window.
/// Durable JSONL logs keep the full history.
const MEMORY_WINDOW_HOURS: i64 = 24;

const RECENT_EVENT_LIMIT: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub state: HealthState,
    pub message: String,
    /// Completed / finished ratio over the last hour, when any run finished.
    pub success_rate: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpiderBreakdown {
    pub runs: u32,
    pub successes: u32,
    pub failures: u32,
    pub items: u32,
    pub avg_items_per_run: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorReport {
    pub generated_at: DateTime<Utc>,
    pub window_hours: i64,
    pub runs: u32,
    pub completed: u32,
    pub failed: u32,
    pub timed_out: u32,
    pub total_items: u32,
    pub new_items: u32,
    pub per_spider: BTreeMap<String, SpiderBreakdown>,
    pub recent_errors: Vec<ErrorEvent>,
    pub recent_alerts: Vec<AlertEvent>,
}

#[derive(Default)]
struct MonitorInner {
    sessions: VecDeque<CrawlSession>,
    errors: VecDeque<ErrorEvent>,
    alerts: VecDeque<AlertEvent>,
}

impl MonitorInner {
    fn prune(&mut self, now: DateTime<Utc>) {
        let horizon = now - Duration::hours(MEMORY_WINDOW_HOURS);
        while self
            .sessions
            .front()
            .map_or(false, |s| s.started_at < horizon)
        {
            self.sessions.pop_front();
        }
        while self.errors.front().map_or(false, |e| e.at < horizon) {
            self.errors.pop_front();
        }
        while self.alerts.front().map_or(false, |a| a.at < horizon) {
            self.alerts.pop_front();
        }
    }
}

pub struct Monitor {
    inner: Mutex<MonitorInner>,
    ops: OpsLog,
}

impl Monitor {
    pub fn new(ops: OpsLog) -> Self {
        Self {
            inner: Mutex::new(MonitorInner::default()),
            ops,
        }
    }

    pub async fn record_session(&self, session: &CrawlSession) {
        {
            let mut inner = self.inner.lock().await;
            inner.sessions.push_back(session.clone());
            inner.prune(Utc::now());
        }
        if let Err(err) = self.ops.append_session(session).await {
            warn!(error = %err, "session log append failed");
        }
    }

    pub async fn record_error(&self, event: ErrorEvent) {
        warn!(category = %event.category, message = %event.message, "error recorded");
        if let Err(err) = self.ops.append_error(&event).await {
            warn!(error = %err, "error log append failed");
        }
        let mut inner = self.inner.lock().await;
        inner.errors.push_back(event);
        inner.prune(Utc::now());
    }

    pub async fn record_alert(&self, event: AlertEvent) {
        warn!(category = %event.category, message = %event.message, "alert raised");
        if let Err(err) = self.ops.append_alert(&event).await {
            warn!(error = %err, "alert log append failed");
        }
        let mut inner = self.inner.lock().await;
        inner.alerts.push_back(event);
        inner.prune(Utc::now());
    }

    /// Classify the last hour of finished runs.
    pub async fn health_status(&self) -> HealthStatus {
        let now = Utc::now();
        let horizon = now - Duration::hours(1);
        let inner = self.inner.lock().await;

        let recent: Vec<&CrawlSession> = inner
            .sessions
            .iter()
            .filter(|s| s.started_at >= horizon && s.status.is_terminal())
            .collect();

        if recent.is_empty() {
            return HealthStatus {
                state: HealthState::Warning,
                message: "no crawl runs finished in the last hour".to_string(),
                success_rate: None,
            };
        }

        let completed = recent
            .iter()
            .filter(|s| s.status == SessionStatus::Completed)
            .count();
        let rate = completed as f64 / recent.len() as f64;
        let failed = recent.len() - completed;

        if failed as f64 / recent.len() as f64 > 0.5 {
            HealthStatus {
                state: HealthState::Error,
                message: format!(
                    "{failed} of {} runs failed in the last hour",
                    recent.len()
                ),
                success_rate: Some(rate),
            }
        } else {
            HealthStatus {
                state: HealthState::Healthy,
                message: format!("{completed} of {} runs completed", recent.len()),
                success_rate: Some(rate),
            }
        }
    }

    /// Aggregate the given window and persist the result as a timestamped
    /// report artifact.
    pub async fn report(&self, hours: i64) -> Result<(MonitorReport, PathBuf), StateError> {
        let now = Utc::now();
        let horizon = now - Duration::hours(hours);
        let report = {
            let inner = self.inner.lock().await;

            let mut report = MonitorReport {
                generated_at: now,
                window_hours: hours,
                runs: 0,
                completed: 0,
                failed: 0,
                timed_out: 0,
                total_items: 0,
                new_items: 0,
                per_spider: BTreeMap::new(),
                recent_errors: inner
                    .errors
                    .iter()
                    .rev()
                    .take(RECENT_EVENT_LIMIT)
                    .cloned()
                    .collect(),
                recent_alerts: inner
                    .alerts
                    .iter()
                    .rev()
                    .take(RECENT_EVENT_LIMIT)
                    .cloned()
                    .collect(),
            };

            for session in inner.sessions.iter().filter(|s| s.started_at >= horizon) {
                report.runs += 1;
                match session.status {
                    SessionStatus::Completed => report.completed += 1,
                    SessionStatus::Failed => report.failed += 1,
                    SessionStatus::TimedOut => report.timed_out += 1,
                    SessionStatus::Running => {}
                }
                report.total_items += session.counters.total_items;
                report.new_items += session.counters.new_items;

                let breakdown = report.per_spider.entry(session.spider.clone()).or_default();
                breakdown.runs += 1;
                if session.status == SessionStatus::Completed {
                    breakdown.successes += 1;
                } else if session.status.is_terminal() {
                    breakdown.failures += 1;
                }
                breakdown.items += session.counters.total_items;
            }
            for breakdown in report.per_spider.values_mut() {
                if breakdown.runs > 0 {
                    breakdown.avg_items_per_run =
                        breakdown.items as f64 / breakdown.runs as f64;
                }
            }
            report
        };

        let path = self.ops.write_report(&report).await?;
        info!(path = %path.display(), runs = report.runs, "monitor report written");
        Ok((report, path))
    }
}
