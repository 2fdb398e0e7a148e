//! Core domain model for the bidwatch ingestion pipeline.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "bidwatch-core";

/// Unstructured scrape output produced by one spider for one announcement.
///
/// Fragments are immutable: a spider run creates them and the normalization
/// pipeline consumes them exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawFragment {
    pub title: String,
    /// Free-form amount string as scraped, e.g. "预算金额：100万元".
    pub amount_text: Option<String>,
    /// Free-form date string as scraped, e.g. "2026-03-01" or "2026年3月1日".
    pub date_text: Option<String>,
    /// Free-form deadline string, when the listing carries one.
    pub deadline_text: Option<String>,
    /// Free-form region string, e.g. "广东 广州".
    pub region_text: Option<String>,
    /// HTML or plain-text body of the announcement.
    pub body: String,
    pub url: String,
    /// Source platform name, e.g. "ccgp".
    pub platform: String,
    /// Spider that produced this fragment.
    pub spider: String,
    pub scraped_at: DateTime<Utc>,
}

/// Canonical tender/bid record emitted by the normalization pipeline.
///
/// Budget is in a fixed unit (万元). Timestamps are naive local datetimes as
/// published by the source portal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub id: Uuid,
    pub title: String,
    pub project_number: Option<String>,
    pub platform: String,
    pub url: String,
    pub category: Option<String>,
    /// Normalized budget in 万元.
    pub budget: Option<f64>,
    pub province: Option<String>,
    pub city: Option<String>,
    pub published_at: Option<NaiveDateTime>,
    pub deadline_at: Option<NaiveDateTime>,
    pub contact_name: Option<String>,
    pub contact_phone: Option<String>,
    pub contact_email: Option<String>,
    pub content: String,
    /// sha256 hex of the cleaned content.
    pub content_hash: String,
    pub status: RecordStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Published,
    Closed,
}

/// One row per distinct URL in the incremental state store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlStateEntry {
    pub url: String,
    pub content_hash: String,
    pub spider: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub crawl_count: u32,
    /// True once the URL has been re-crawled with a changed content hash.
    pub updated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlType {
    Full,
    Incremental,
}

impl std::fmt::Display for CrawlType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CrawlType::Full => write!(f, "full"),
            CrawlType::Incremental => write!(f, "incremental"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Completed,
    Failed,
    TimedOut,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, SessionStatus::Running)
    }
}

/// Item counters for one spider run. This is also the structured output an
/// isolated spider process emits as its final stdout line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    pub total_items: u32,
    pub new_items: u32,
    pub updated_items: u32,
    pub failed_items: u32,
}

impl RunCounters {
    pub fn merge(&mut self, other: RunCounters) {
        self.total_items += other.total_items;
        self.new_items += other.new_items;
        self.updated_items += other.updated_items;
        self.failed_items += other.failed_items;
    }
}

/// One row per manager invocation of one spider. Append-only history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlSession {
    pub id: Uuid,
    pub spider: String,
    pub crawl_type: CrawlType,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub counters: RunCounters,
    pub status: SessionStatus,
    /// Captured stderr or exception text for failed/timed-out runs.
    pub error: Option<String>,
}

impl CrawlSession {
    pub fn duration_secs(&self) -> Option<f64> {
        self.finished_at
            .map(|end| (end - self.started_at).num_milliseconds() as f64 / 1000.0)
    }
}

/// Timestamped diagnostic record written once and aggregated by the monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub at: DateTime<Utc>,
    pub category: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub detail: BTreeMap<String, String>,
}

impl ErrorEvent {
    pub fn new(category: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            category: category.into(),
            message: message.into(),
            detail: BTreeMap::new(),
        }
    }
}

/// Operator-facing signal raised when failure thresholds are crossed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub at: DateTime<Utc>,
    pub category: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub detail: BTreeMap<String, String>,
}

impl AlertEvent {
    pub fn new(category: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            category: category.into(),
            message: message.into(),
            detail: BTreeMap::new(),
        }
    }
}

/// How a spider reaches its source platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    /// Plain HTTP fetch of server-rendered pages.
    Static,
    /// Pages rendered by an external headless-browser service.
    Dynamic,
    /// Sources that require a login session.
    Authenticated,
}

/// Registry entry describing one known spider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpiderSpec {
    pub name: String,
    pub description: String,
    pub transport_mode: TransportMode,
    pub enabled: bool,
    /// Lower runs first in `run_all`.
    pub priority: i32,
}

/// Parameters handed to one spider run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlParams {
    pub crawl_type: CrawlType,
    pub max_pages: u32,
    /// Free-form key/value arguments passed through to the spider.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

impl CrawlParams {
    pub fn new(crawl_type: CrawlType, max_pages: u32) -> Self {
        Self {
            crawl_type,
            max_pages,
            extra: BTreeMap::new(),
        }
    }
}

/// Why the deduplication engine rejected a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DuplicateReason {
    #[serde(rename = "URL repeat")]
    UrlRepeat,
    #[serde(rename = "content repeat")]
    HashRepeat,
    #[serde(rename = "title+budget")]
    TitleAndBudget,
    #[serde(rename = "title only")]
    TitleOnly,
}

impl std::fmt::Display for DuplicateReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DuplicateReason::UrlRepeat => write!(f, "URL repeat"),
            DuplicateReason::HashRepeat => write!(f, "content repeat"),
            DuplicateReason::TitleAndBudget => write!(f, "title+budget"),
            DuplicateReason::TitleOnly => write!(f, "title only"),
        }
    }
}

/// Outcome of one scheduled job firing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum JobOutcome {
    Success,
    Failed { error: String },
    /// Trigger fired while a previous instance was still running, or the job
    /// was paused; the firing was dropped, not queued.
    Skipped { reason: String },
}

/// One entry in the scheduler's bounded execution history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job: String,
    pub fired_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(flatten)]
    pub outcome: JobOutcome,
}
