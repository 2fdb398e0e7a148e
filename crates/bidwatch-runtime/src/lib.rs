//! Runtime orchestration: configuration, the crawler manager, the
//! scheduling layer, and run-health monitoring.

pub mod config;
pub mod manager;
pub mod monitor;
pub mod scheduler;

use std::sync::Arc;
use std::time::Duration;

use bidwatch_core::CrawlType;

pub use config::BidwatchConfig;
pub use manager::{
    BatchEntry, CrawlerManager, LaunchOutcome, ManagerError, ProcessLauncher, SpiderLauncher,
    SpiderRegistry, SpiderStatus,
};
pub use monitor::{HealthState, HealthStatus, Monitor, MonitorReport};
pub use scheduler::{
    BidScheduler, JobCallback, JobTrigger, SchedulerError, FULL_CRAWL_JOB, INCREMENTAL_CRAWL_JOB,
    REPORT_JOB,
};

pub const CRATE_NAME: &str = "bidwatch-runtime";

/// Listing-page depth for scheduled full crawls.
pub const DEFAULT_FULL_PAGES: u32 = 10;
/// Listing-page depth for scheduled incremental crawls.
pub const DEFAULT_INCREMENTAL_PAGES: u32 = 2;

/// Register the standing job set: a daily full crawl, a fixed-interval
/// incremental crawl, and an hourly monitor report.
pub async fn install_default_jobs(
    scheduler: &BidScheduler,
    manager: Arc<CrawlerManager>,
    monitor: Arc<Monitor>,
    config: &BidwatchConfig,
) -> Result<(), SchedulerError> {
    let full_manager = Arc::clone(&manager);
    scheduler
        .add_job(
            FULL_CRAWL_JOB,
            JobTrigger::Cron(config.full_cron.clone()),
            Arc::new(move || {
                let manager = Arc::clone(&full_manager);
                Box::pin(async move {
                    run_batch(&manager, CrawlType::Full, DEFAULT_FULL_PAGES).await
                })
            }),
        )
        .await?;

    let incr_manager = manager;
    scheduler
        .add_job(
            INCREMENTAL_CRAWL_JOB,
            JobTrigger::Every(Duration::from_secs(config.incremental_every_mins * 60)),
            Arc::new(move || {
                let manager = Arc::clone(&incr_manager);
                Box::pin(async move {
                    run_batch(&manager, CrawlType::Incremental, DEFAULT_INCREMENTAL_PAGES).await
                })
            }),
        )
        .await?;

    scheduler
        .add_job(
            REPORT_JOB,
            JobTrigger::Cron(config.report_cron.clone()),
            Arc::new(move || {
                let monitor = Arc::clone(&monitor);
                Box::pin(async move {
                    monitor
                        .report(24)
                        .await
                        .map(|_| ())
                        .map_err(|e| e.to_string())
                })
            }),
        )
        .await?;

    Ok(())
}

/// A batch counts as a job failure only when every spider in it failed;
/// partial failures already surface through sessions and batch alerts.
async fn run_batch(
    manager: &CrawlerManager,
    crawl_type: CrawlType,
    max_pages: u32,
) -> Result<(), String> {
    let batch = manager.run_all(crawl_type, max_pages).await;
    let failed = batch.iter().filter(|e| e.is_failure()).count();
    if !batch.is_empty() && failed == batch.len() {
        Err(format!("all {} spiders failed", batch.len()))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bidwatch_core::{CrawlParams, RunCounters};
    use bidwatch_state::{OpsLog, StateStore};
    use tempfile::tempdir;

    struct AlwaysCompletes;

    #[async_trait]
    impl SpiderLauncher for AlwaysCompletes {
        async fn launch(
            &self,
            _spider: &str,
            _params: &CrawlParams,
            _timeout: Duration,
        ) -> Result<LaunchOutcome, ManagerError> {
            Ok(LaunchOutcome::Completed(RunCounters::default()))
        }
    }

    #[tokio::test]
    async fn default_job_set_registers_and_fires() {
        let dir = tempdir().unwrap();
        let monitor = Arc::new(Monitor::new(OpsLog::new(dir.path())));
        let manager = Arc::new(CrawlerManager::new(
            Arc::new(StateStore::new(dir.path())),
            Arc::clone(&monitor),
            Box::new(AlwaysCompletes),
            BidwatchConfig::default(),
        ));
        let scheduler = BidScheduler::new(dir.path(), Arc::clone(&monitor))
            .await
            .unwrap();

        install_default_jobs(
            &scheduler,
            manager,
            Arc::clone(&monitor),
            &BidwatchConfig::default(),
        )
        .await
        .unwrap();

        let names: Vec<String> = scheduler
            .list_jobs()
            .await
            .into_iter()
            .map(|j| j.name)
            .collect();
        assert_eq!(
            names,
            vec![
                FULL_CRAWL_JOB.to_string(),
                INCREMENTAL_CRAWL_JOB.to_string(),
                REPORT_JOB.to_string(),
            ]
        );

        let outcome = scheduler.fire_job(INCREMENTAL_CRAWL_JOB).await.unwrap();
        assert_eq!(outcome, bidwatch_core::JobOutcome::Success);
    }
}
