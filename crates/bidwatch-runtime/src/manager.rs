//! Crawler manager: spider registry, isolated-process run execution with a
//! hard timeout, session bracketing, and batch-level failure alerting.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bidwatch_core::{
    AlertEvent, CrawlParams, CrawlSession, CrawlType, RunCounters, SessionStatus, SpiderSpec,
    TransportMode,
};
use bidwatch_state::{SpiderStatistics, StateError, StateStore};
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::config::BidwatchConfig;
use crate::monitor::Monitor;

/// A batch with more failed spiders than this raises an alert outright.
const BATCH_FAILURE_COUNT_ALERT: usize = 5;
/// A batch with a failure ratio above this raises an alert.
const BATCH_FAILURE_RATIO_ALERT: f64 = 0.5;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("unknown spider `{0}`")]
    UnknownSpider(String),
    #[error("spider `{0}` is disabled")]
    SpiderDisabled(String),
    #[error(transparent)]
    State(#[from] StateError),
    #[error("spider launch failed: {0}")]
    Launch(String),
}

/// Terminal result of one isolated spider process.
#[derive(Debug, Clone, PartialEq)]
pub enum LaunchOutcome {
    Completed(RunCounters),
    Failed {
        exit_code: Option<i32>,
        stderr: String,
    },
    TimedOut,
}

/// Seam between run orchestration and process execution, so tests can
/// script outcomes without spawning anything.
#[async_trait]
pub trait SpiderLauncher: Send + Sync {
    async fn launch(
        &self,
        spider: &str,
        params: &CrawlParams,
        timeout: Duration,
    ) -> Result<LaunchOutcome, ManagerError>;
}

/// Default launcher: spawns the bidwatch binary's `spider` subcommand as an
/// isolated OS process and parses the final stdout line as [`RunCounters`].
pub struct ProcessLauncher {
    /// Argv prefix; the `spider` subcommand and its flags are appended.
    command: Vec<String>,
}

impl ProcessLauncher {
    pub fn new(command: Vec<String>) -> Result<Self, ManagerError> {
        if command.is_empty() {
            return Err(ManagerError::Launch("empty spider command".to_string()));
        }
        Ok(Self { command })
    }

    pub fn from_config(config: &BidwatchConfig) -> Result<Self, ManagerError> {
        let command = match &config.spider_command {
            Some(command) => command.clone(),
            None => {
                let exe = std::env::current_exe()
                    .map_err(|e| ManagerError::Launch(format!("resolving executable: {e}")))?;
                vec![exe.display().to_string()]
            }
        };
        Self::new(command)
    }
}

fn parse_counters(stdout: &str) -> Option<RunCounters> {
    stdout
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .and_then(|line| serde_json::from_str(line.trim()).ok())
}

#[async_trait]
impl SpiderLauncher for ProcessLauncher {
    async fn launch(
        &self,
        spider: &str,
        params: &CrawlParams,
        timeout: Duration,
    ) -> Result<LaunchOutcome, ManagerError> {
        let mut command = Command::new(&self.command[0]);
        command
            .args(&self.command[1..])
            .arg("spider")
            .arg(spider)
            .arg("--crawl-type")
            .arg(params.crawl_type.to_string())
            .arg("--max-pages")
            .arg(params.max_pages.to_string());
        for (key, value) in &params.extra {
            command.arg("--extra").arg(format!("{key}={value}"));
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command
            .spawn()
            .map_err(|e| ManagerError::Launch(format!("spawning {spider}: {e}")))?;

        // Dropping the wait future on timeout kills the child.
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => {
                result.map_err(|e| ManagerError::Launch(format!("waiting for {spider}: {e}")))?
            }
            Err(_) => {
                warn!(spider, timeout_secs = timeout.as_secs(), "spider process timed out");
                return Ok(LaunchOutcome::TimedOut);
            }
        };

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if !output.status.success() {
            return Ok(LaunchOutcome::Failed {
                exit_code: output.status.code(),
                stderr,
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        match parse_counters(&stdout) {
            Some(counters) => Ok(LaunchOutcome::Completed(counters)),
            None => Ok(LaunchOutcome::Failed {
                exit_code: output.status.code(),
                stderr: format!("no counters line on stdout; stderr: {stderr}"),
            }),
        }
    }
}

/// Closed registry of known spiders. Mirrors the constructor table in the
/// spider crate.
pub struct SpiderRegistry {
    specs: BTreeMap<String, SpiderSpec>,
}

impl SpiderRegistry {
    pub fn with_defaults() -> Self {
        let mut specs = BTreeMap::new();
        for spec in [
            SpiderSpec {
                name: "ccgp".to_string(),
                description: "中国政府采购网 中央公告".to_string(),
                transport_mode: TransportMode::Static,
                enabled: true,
                priority: 10,
            },
            SpiderSpec {
                name: "zfcg".to_string(),
                description: "浙江政府采购 公告列表".to_string(),
                transport_mode: TransportMode::Static,
                enabled: true,
                priority: 20,
            },
            SpiderSpec {
                name: "hbggzy".to_string(),
                description: "湖北公共资源交易 (渲染服务)".to_string(),
                transport_mode: TransportMode::Dynamic,
                enabled: true,
                priority: 30,
            },
            SpiderSpec {
                name: "gdzb".to_string(),
                description: "广东机电设备招标 会员区 (需登录凭证)".to_string(),
                transport_mode: TransportMode::Authenticated,
                enabled: false,
                priority: 40,
            },
        ] {
            specs.insert(spec.name.clone(), spec);
        }
        Self { specs }
    }

    pub fn get(&self, name: &str) -> Option<&SpiderSpec> {
        self.specs.get(name)
    }

    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> Result<(), ManagerError> {
        match self.specs.get_mut(name) {
            Some(spec) => {
                spec.enabled = enabled;
                Ok(())
            }
            None => Err(ManagerError::UnknownSpider(name.to_string())),
        }
    }

    /// Enabled specs in ascending priority order.
    pub fn enabled_by_priority(&self) -> Vec<SpiderSpec> {
        let mut enabled: Vec<SpiderSpec> =
            self.specs.values().filter(|s| s.enabled).cloned().collect();
        enabled.sort_by_key(|s| s.priority);
        enabled
    }

    pub fn all(&self) -> Vec<SpiderSpec> {
        let mut all: Vec<SpiderSpec> = self.specs.values().cloned().collect();
        all.sort_by_key(|s| s.priority);
        all
    }
}

/// Registry entry plus historical statistics, as returned by `status`.
#[derive(Debug, Clone)]
pub struct SpiderStatus {
    pub spec: SpiderSpec,
    pub statistics: SpiderStatistics,
    pub recent_sessions: Vec<CrawlSession>,
}

/// One entry of a `run_all` batch result.
#[derive(Debug)]
pub struct BatchEntry {
    pub spider: String,
    pub result: Result<CrawlSession, ManagerError>,
}

impl BatchEntry {
    pub fn is_failure(&self) -> bool {
        match &self.result {
            Ok(session) => session.status != SessionStatus::Completed,
            Err(_) => true,
        }
    }
}

pub struct CrawlerManager {
    registry: Mutex<SpiderRegistry>,
    /// Held for the duration of every crawl. Spider subprocesses rewrite the
    /// shared state snapshot wholesale, so the daily full batch and the
    /// interval incremental batch must not overlap.
    run_lock: Mutex<()>,
    store: Arc<StateStore>,
    monitor: Arc<Monitor>,
    launcher: Box<dyn SpiderLauncher>,
    config: BidwatchConfig,
}

impl CrawlerManager {
    pub fn new(
        store: Arc<StateStore>,
        monitor: Arc<Monitor>,
        launcher: Box<dyn SpiderLauncher>,
        config: BidwatchConfig,
    ) -> Self {
        Self {
            registry: Mutex::new(SpiderRegistry::with_defaults()),
            run_lock: Mutex::new(()),
            store,
            monitor,
            launcher,
            config,
        }
    }

    pub async fn enable(&self, name: &str) -> Result<(), ManagerError> {
        self.registry.lock().await.set_enabled(name, true)
    }

    pub async fn disable(&self, name: &str) -> Result<(), ManagerError> {
        self.registry.lock().await.set_enabled(name, false)
    }

    pub async fn list(&self) -> Vec<SpiderSpec> {
        self.registry.lock().await.all()
    }

    pub async fn status(&self, name: &str) -> Result<SpiderStatus, ManagerError> {
        let spec = {
            let registry = self.registry.lock().await;
            registry
                .get(name)
                .cloned()
                .ok_or_else(|| ManagerError::UnknownSpider(name.to_string()))?
        };
        let statistics = self.store.statistics(name).await?;
        let recent_sessions = self.store.recent_sessions(Some(name), 10).await?;
        Ok(SpiderStatus {
            spec,
            statistics,
            recent_sessions,
        })
    }

    /// Execute one spider as an isolated process, bracketed by a session.
    /// The session is always closed, whatever the process does.
    pub async fn run_spider(
        &self,
        name: &str,
        crawl_type: CrawlType,
        max_pages: u32,
        extra: BTreeMap<String, String>,
    ) -> Result<CrawlSession, ManagerError> {
        let _guard = self.run_lock.lock().await;
        self.run_spider_locked(name, crawl_type, max_pages, extra)
            .await
    }

    async fn run_spider_locked(
        &self,
        name: &str,
        crawl_type: CrawlType,
        max_pages: u32,
        extra: BTreeMap<String, String>,
    ) -> Result<CrawlSession, ManagerError> {
        {
            let registry = self.registry.lock().await;
            let spec = registry
                .get(name)
                .ok_or_else(|| ManagerError::UnknownSpider(name.to_string()))?;
            if !spec.enabled {
                return Err(ManagerError::SpiderDisabled(name.to_string()));
            }
        }

        let mut params = CrawlParams::new(crawl_type, max_pages);
        params.extra = extra;
        let timeout = self.config.timeout_for(crawl_type);

        let session_id = self.store.start_session(name, crawl_type).await?;
        info!(spider = name, %crawl_type, max_pages, "run started");

        let launch = self.launcher.launch(name, &params, timeout).await;
        let (counters, status, error_text) = match launch {
            Ok(LaunchOutcome::Completed(counters)) => {
                (counters, SessionStatus::Completed, None)
            }
            Ok(LaunchOutcome::Failed { exit_code, stderr }) => (
                RunCounters::default(),
                SessionStatus::Failed,
                Some(format!("exit code {exit_code:?}: {stderr}")),
            ),
            Ok(LaunchOutcome::TimedOut) => (
                RunCounters::default(),
                SessionStatus::TimedOut,
                Some(format!("killed after {}s", timeout.as_secs())),
            ),
            Err(err) => (
                RunCounters::default(),
                SessionStatus::Failed,
                Some(err.to_string()),
            ),
        };

        let session = self
            .store
            .end_session(session_id, counters, status, error_text)
            .await?;
        self.monitor.record_session(&session).await;

        match session.status {
            SessionStatus::Completed => info!(
                spider = name,
                total = session.counters.total_items,
                new = session.counters.new_items,
                "run completed"
            ),
            _ => error!(
                spider = name,
                status = ?session.status,
                error = session.error.as_deref().unwrap_or(""),
                "run did not complete"
            ),
        }
        Ok(session)
    }

    /// Run every enabled spider sequentially in ascending priority order.
    /// Sequential on purpose: per-target rate limits apply across spiders
    /// sharing infrastructure.
    pub async fn run_all(&self, crawl_type: CrawlType, max_pages: u32) -> Vec<BatchEntry> {
        let _guard = self.run_lock.lock().await;
        let enabled = self.registry.lock().await.enabled_by_priority();
        let mut batch = Vec::with_capacity(enabled.len());
        for spec in enabled {
            let result = self
                .run_spider_locked(&spec.name, crawl_type, max_pages, BTreeMap::new())
                .await;
            batch.push(BatchEntry {
                spider: spec.name,
                result,
            });
        }

        let failed = batch.iter().filter(|e| e.is_failure()).count();
        if !batch.is_empty()
            && (failed >= BATCH_FAILURE_COUNT_ALERT
                || failed as f64 / batch.len() as f64 > BATCH_FAILURE_RATIO_ALERT)
        {
            let mut alert = AlertEvent::new(
                "batch-failure",
                format!("{failed} of {} spiders failed in {crawl_type} batch", batch.len()),
            );
            for entry in batch.iter().filter(|e| e.is_failure()) {
                let detail = match &entry.result {
                    Ok(session) => format!("{:?}", session.status),
                    Err(err) => err.to_string(),
                };
                alert.detail.insert(entry.spider.clone(), detail);
            }
            self.monitor.record_alert(alert).await;
        }
        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bidwatch_state::OpsLog;
    use std::collections::VecDeque;
    use tempfile::tempdir;

    struct ScriptedLauncher {
        outcomes: Mutex<VecDeque<LaunchOutcome>>,
    }

    impl ScriptedLauncher {
        fn new(outcomes: Vec<LaunchOutcome>) -> Box<Self> {
            Box::new(Self {
                outcomes: Mutex::new(outcomes.into()),
            })
        }
    }

    #[async_trait]
    impl SpiderLauncher for ScriptedLauncher {
        async fn launch(
            &self,
            _spider: &str,
            _params: &CrawlParams,
            _timeout: Duration,
        ) -> Result<LaunchOutcome, ManagerError> {
            Ok(self
                .outcomes
                .lock()
                .await
                .pop_front()
                .unwrap_or(LaunchOutcome::TimedOut))
        }
    }

    fn manager_with(
        dir: &std::path::Path,
        launcher: Box<dyn SpiderLauncher>,
    ) -> (CrawlerManager, Arc<Monitor>) {
        let store = Arc::new(StateStore::new(dir));
        let monitor = Arc::new(Monitor::new(OpsLog::new(dir)));
        let manager = CrawlerManager::new(
            store,
            Arc::clone(&monitor),
            launcher,
            BidwatchConfig::default(),
        );
        (manager, monitor)
    }

    #[tokio::test]
    async fn completed_process_closes_a_completed_session() {
        let dir = tempdir().unwrap();
        let counters = RunCounters {
            total_items: 9,
            new_items: 6,
            updated_items: 2,
            failed_items: 1,
        };
        let (manager, _) = manager_with(
            dir.path(),
            ScriptedLauncher::new(vec![LaunchOutcome::Completed(counters)]),
        );

        let session = manager
            .run_spider("ccgp", CrawlType::Incremental, 2, BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.counters, counters);
        assert!(session.finished_at.is_some());
    }

    #[tokio::test]
    async fn unknown_and_disabled_spiders_are_rejected_before_launch() {
        let dir = tempdir().unwrap();
        let (manager, _) = manager_with(dir.path(), ScriptedLauncher::new(vec![]));

        let err = manager
            .run_spider("nonexistent", CrawlType::Full, 1, BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::UnknownSpider(_)));

        // gdzb ships disabled; no session may be opened for it.
        let err = manager
            .run_spider("gdzb", CrawlType::Full, 1, BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::SpiderDisabled(_)));
        assert!(manager.status("gdzb").await.unwrap().recent_sessions.is_empty());

        manager.enable("gdzb").await.unwrap();
        assert!(manager.status("gdzb").await.unwrap().spec.enabled);
    }

    #[tokio::test]
    async fn timed_out_process_records_a_timed_out_session() {
        let dir = tempdir().unwrap();
        let (manager, _) = manager_with(
            dir.path(),
            ScriptedLauncher::new(vec![LaunchOutcome::TimedOut]),
        );

        let session = manager
            .run_spider("ccgp", CrawlType::Full, 5, BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(session.status, SessionStatus::TimedOut);
        assert!(session.error.as_deref().unwrap().contains("3600"));
    }

    #[tokio::test]
    async fn failed_process_captures_stderr_on_the_session() {
        let dir = tempdir().unwrap();
        let (manager, _) = manager_with(
            dir.path(),
            ScriptedLauncher::new(vec![LaunchOutcome::Failed {
                exit_code: Some(2),
                stderr: "selector mismatch".to_string(),
            }]),
        );

        let session = manager
            .run_spider("zfcg", CrawlType::Incremental, 1, BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(session.status, SessionStatus::Failed);
        assert!(session.error.as_deref().unwrap().contains("selector mismatch"));
    }

    #[tokio::test]
    async fn majority_batch_failure_raises_an_alert() {
        let dir = tempdir().unwrap();
        // Three enabled spiders by default; two failures is a >50% ratio.
        let (manager, monitor) = manager_with(
            dir.path(),
            ScriptedLauncher::new(vec![
                LaunchOutcome::Completed(RunCounters::default()),
                LaunchOutcome::TimedOut,
                LaunchOutcome::Failed {
                    exit_code: Some(1),
                    stderr: "boom".to_string(),
                },
            ]),
        );

        let batch = manager.run_all(CrawlType::Incremental, 1).await;
        assert_eq!(batch.len(), 3);
        assert_eq!(batch.iter().filter(|e| e.is_failure()).count(), 2);

        let (report, _) = monitor.report(1).await.unwrap();
        assert_eq!(report.recent_alerts.len(), 1);
        assert_eq!(report.recent_alerts[0].category, "batch-failure");
        assert_eq!(report.recent_alerts[0].detail.len(), 2);
    }

    #[tokio::test]
    async fn fully_successful_batch_raises_no_alert() {
        let dir = tempdir().unwrap();
        let (manager, monitor) = manager_with(
            dir.path(),
            ScriptedLauncher::new(vec![
                LaunchOutcome::Completed(RunCounters::default()),
                LaunchOutcome::Completed(RunCounters::default()),
                LaunchOutcome::Completed(RunCounters::default()),
            ]),
        );

        let batch = manager.run_all(CrawlType::Full, 3).await;
        assert!(batch.iter().all(|e| !e.is_failure()));
        let (report, _) = monitor.report(1).await.unwrap();
        assert!(report.recent_alerts.is_empty());
    }

    #[tokio::test]
    async fn concurrent_batches_never_interleave_spider_runs() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct TrackingLauncher {
            active: Arc<AtomicUsize>,
            peak: Arc<AtomicUsize>,
        }

        #[async_trait]
        impl SpiderLauncher for TrackingLauncher {
            async fn launch(
                &self,
                _spider: &str,
                _params: &CrawlParams,
                _timeout: Duration,
            ) -> Result<LaunchOutcome, ManagerError> {
                let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                self.active.fetch_sub(1, Ordering::SeqCst);
                Ok(LaunchOutcome::Completed(RunCounters::default()))
            }
        }

        let dir = tempdir().unwrap();
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (manager, _) = manager_with(
            dir.path(),
            Box::new(TrackingLauncher {
                active: Arc::clone(&active),
                peak: Arc::clone(&peak),
            }),
        );
        let manager = Arc::new(manager);

        // A full batch overlapping an incremental batch, as the scheduler
        // can produce around 02:00.
        let full = Arc::clone(&manager);
        let incremental = Arc::clone(&manager);
        let (a, b) = tokio::join!(
            tokio::spawn(async move { full.run_all(CrawlType::Full, 1).await }),
            tokio::spawn(async move { incremental.run_all(CrawlType::Incremental, 1).await }),
        );
        assert_eq!(a.unwrap().len(), 3);
        assert_eq!(b.unwrap().len(), 3);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn run_all_walks_enabled_spiders_in_priority_order() {
        let dir = tempdir().unwrap();
        let (manager, _) = manager_with(
            dir.path(),
            ScriptedLauncher::new(vec![
                LaunchOutcome::Completed(RunCounters::default()),
                LaunchOutcome::Completed(RunCounters::default()),
                LaunchOutcome::Completed(RunCounters::default()),
            ]),
        );
        let batch = manager.run_all(CrawlType::Incremental, 1).await;
        let order: Vec<&str> = batch.iter().map(|e| e.spider.as_str()).collect();
        assert_eq!(order, vec!["ccgp", "zfcg", "hbggzy"]);
    }

    #[test]
    fn registry_mirrors_the_spider_constructor_table() {
        let registry = SpiderRegistry::with_defaults();
        for name in bidwatch_spiders::known_spider_names() {
            assert!(registry.get(name).is_some(), "missing registry entry {name}");
        }
        assert_eq!(registry.all().len(), bidwatch_spiders::known_spider_names().len());
    }

    #[test]
    fn counters_parse_from_the_final_stdout_line() {
        let stdout = "fetching page 1\nfetching page 2\n{\"total_items\":4,\"new_items\":3,\"updated_items\":1,\"failed_items\":0}\n";
        let counters = parse_counters(stdout).unwrap();
        assert_eq!(counters.total_items, 4);
        assert_eq!(counters.new_items, 3);

        assert!(parse_counters("no json here").is_none());
        assert!(parse_counters("").is_none());
    }
}
