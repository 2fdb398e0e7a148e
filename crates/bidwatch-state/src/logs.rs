//! Append-only JSONL logs for operational events and normalized records,
//! one file per day per category, plus timestamped monitor reports.

use std::path::{Path, PathBuf};

use bidwatch_core::{AlertEvent, CrawlSession, ErrorEvent, NormalizedRecord};
use chrono::{NaiveDate, Utc};
use serde::Serialize;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::StateError;

const LOGS_DIR: &str = "logs";
const REPORTS_DIR: &str = "reports";
const RECORDS_DIR: &str = "records";

async fn append_line<T: Serialize>(path: &Path, value: &T) -> Result<(), StateError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let mut line = serde_json::to_string(value)?;
    line.push('\n');
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    Ok(())
}

async fn read_lines<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>, StateError> {
    let text = match fs::read_to_string(path).await {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    let mut values = Vec::new();
    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        values.push(serde_json::from_str(line)?);
    }
    Ok(values)
}

/// Operational log sink: sessions, errors, alerts, and monitor reports.
pub struct OpsLog {
    dir: PathBuf,
}

impl OpsLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn daily_path(&self, category: &str, date: NaiveDate) -> PathBuf {
        self.dir
            .join(LOGS_DIR)
            .join(format!("{category}-{}.jsonl", date.format("%Y-%m-%d")))
    }

    pub async fn append_session(&self, session: &CrawlSession) -> Result<(), StateError> {
        append_line(
            &self.daily_path("sessions", Utc::now().date_naive()),
            session,
        )
        .await
    }

    pub async fn append_error(&self, event: &ErrorEvent) -> Result<(), StateError> {
        append_line(&self.daily_path("errors", event.at.date_naive()), event).await
    }

    pub async fn append_alert(&self, event: &AlertEvent) -> Result<(), StateError> {
        append_line(&self.daily_path("alerts", event.at.date_naive()), event).await
    }

    pub async fn errors_on(&self, date: NaiveDate) -> Result<Vec<ErrorEvent>, StateError> {
        read_lines(&self.daily_path("errors", date)).await
    }

    pub async fn alerts_on(&self, date: NaiveDate) -> Result<Vec<AlertEvent>, StateError> {
        read_lines(&self.daily_path("alerts", date)).await
    }

    /// Write a monitor report as a standalone timestamped JSON file and
    /// return its path.
    pub async fn write_report<T: Serialize>(&self, report: &T) -> Result<PathBuf, StateError> {
        let dir = self.dir.join(REPORTS_DIR);
        fs::create_dir_all(&dir).await?;
        let path = dir.join(format!(
            "report-{}.json",
            Utc::now().format("%Y%m%d_%H%M%S")
        ));
        fs::write(&path, serde_json::to_vec_pretty(report)?).await?;
        debug!(path = %path.display(), "monitor report written");
        Ok(path)
    }
}

/// Destination for accepted normalized records, one JSONL file per day.
pub struct RecordSink {
    dir: PathBuf,
}

impl RecordSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn daily_path(&self, date: NaiveDate) -> PathBuf {
        self.dir
            .join(RECORDS_DIR)
            .join(format!("records-{}.jsonl", date.format("%Y-%m-%d")))
    }

    pub async fn append(&self, record: &NormalizedRecord) -> Result<(), StateError> {
        append_line(&self.daily_path(Utc::now().date_naive()), record).await
    }

    pub async fn records_on(&self, date: NaiveDate) -> Result<Vec<NormalizedRecord>, StateError> {
        read_lines(&self.daily_path(date)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bidwatch_core::{RecordStatus, RunCounters};
    use tempfile::tempdir;
    use uuid::Uuid;

    fn sample_record(title: &str) -> NormalizedRecord {
        NormalizedRecord {
            id: Uuid::new_v4(),
            title: title.to_string(),
            project_number: None,
            platform: "ccgp".into(),
            url: format!("http://www.ccgp.gov.cn/{title}"),
            category: None,
            budget: Some(100.0),
            province: Some("北京市".into()),
            city: None,
            published_at: None,
            deadline_at: None,
            contact_name: None,
            contact_phone: None,
            contact_email: None,
            content: "正文".into(),
            content_hash: "abc".into(),
            status: RecordStatus::Published,
        }
    }

    #[tokio::test]
    async fn errors_and_alerts_land_in_daily_files() {
        let dir = tempdir().unwrap();
        let ops = OpsLog::new(dir.path());
        let event = ErrorEvent::new("fetch", "403 from listing page");
        ops.append_error(&event).await.unwrap();
        ops.append_error(&ErrorEvent::new("parse", "missing selector"))
            .await
            .unwrap();
        ops.append_alert(&AlertEvent::new("failure-rate", "ccgp above threshold"))
            .await
            .unwrap();

        let today = Utc::now().date_naive();
        let errors = ops.errors_on(today).await.unwrap();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].category, "fetch");
        let alerts = ops.alerts_on(today).await.unwrap();
        assert_eq!(alerts.len(), 1);

        assert!(ops
            .errors_on(today - chrono::Duration::days(1))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn reports_get_unique_timestamped_paths() {
        let dir = tempdir().unwrap();
        let ops = OpsLog::new(dir.path());
        let path = ops
            .write_report(&serde_json::json!({"runs": 3, "failed": 1}))
            .await
            .unwrap();
        assert!(path.exists());
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("report-"));
        assert!(name.ends_with(".json"));
    }

    #[tokio::test]
    async fn record_sink_appends_and_reads_back() {
        let dir = tempdir().unwrap();
        let sink = RecordSink::new(dir.path());
        sink.append(&sample_record("a")).await.unwrap();
        sink.append(&sample_record("b")).await.unwrap();

        let today = Utc::now().date_naive();
        let records = sink.records_on(today).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].title, "b");
    }

    #[tokio::test]
    async fn session_log_records_counters() {
        let dir = tempdir().unwrap();
        let ops = OpsLog::new(dir.path());
        let session = CrawlSession {
            id: Uuid::new_v4(),
            spider: "zfcg".into(),
            crawl_type: bidwatch_core::CrawlType::Incremental,
            started_at: Utc::now(),
            finished_at: Some(Utc::now()),
            counters: RunCounters {
                total_items: 4,
                new_items: 4,
                updated_items: 0,
                failed_items: 0,
            },
            status: bidwatch_core::SessionStatus::Completed,
            error: None,
        };
        ops.append_session(&session).await.unwrap();
        let path = dir
            .path()
            .join("logs")
            .join(format!("sessions-{}.jsonl", Utc::now().format("%Y-%m-%d")));
        let text = std::fs::read_to_string(path).unwrap();
        assert!(text.contains("\"total_items\":4"));
    }
}
