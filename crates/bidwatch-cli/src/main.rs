use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use bidwatch_core::{
    CrawlParams, CrawlType, DuplicateReason, RawFragment, RunCounters, SessionStatus,
};
use bidwatch_fetch::Fetcher;
use bidwatch_pipeline::IngestPipeline;
use bidwatch_runtime::{
    install_default_jobs, BidScheduler, BidwatchConfig, CrawlerManager, Monitor, ProcessLauncher,
};
use bidwatch_state::{MarkOutcome, OpsLog, RecordSink, StateStore};
use clap::{Parser, Subcommand};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "bidwatch")]
#[command(about = "Procurement announcement ingestion pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one spider through the manager (isolated process, session
    /// bracketing, monitoring).
    Run {
        spider: String,
        #[arg(long)]
        full: bool,
        #[arg(long)]
        max_pages: Option<u32>,
        /// Extra key=value arguments passed to the spider.
        #[arg(long = "extra")]
        extra: Vec<String>,
    },
    /// Run every enabled spider sequentially in priority order.
    RunAll {
        #[arg(long)]
        full: bool,
        #[arg(long)]
        max_pages: Option<u32>,
    },
    /// Internal isolated-run entry point: executes one spider in-process
    /// and prints the final counters JSON line on stdout.
    Spider {
        name: String,
        #[arg(long, default_value = "incremental")]
        crawl_type: String,
        #[arg(long, default_value_t = 2)]
        max_pages: u32,
        #[arg(long = "extra")]
        extra: Vec<String>,
    },
    /// Start the scheduler with the default job set and wait.
    Schedule,
    /// Registry entry plus historical statistics for one spider, or a
    /// summary for all of them.
    Status { spider: Option<String> },
    /// List the spider registry.
    List,
    /// Generate and persist a monitor report.
    Report {
        #[arg(long, default_value_t = 24)]
        hours: i64,
    },
    /// One-line health classification of the last hour.
    Health,
}

fn parse_crawl_type(raw: &str) -> Result<CrawlType> {
    match raw {
        "full" => Ok(CrawlType::Full),
        "incremental" => Ok(CrawlType::Incremental),
        other => bail!("unknown crawl type `{other}` (expected full|incremental)"),
    }
}

fn parse_extra(pairs: &[String]) -> Result<BTreeMap<String, String>> {
    let mut extra = BTreeMap::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("extra argument `{pair}` is not key=value"))?;
        extra.insert(key.to_string(), value.to_string());
    }
    Ok(extra)
}

fn crawl_defaults(full: bool, max_pages: Option<u32>) -> (CrawlType, u32) {
    if full {
        (CrawlType::Full, max_pages.unwrap_or(10))
    } else {
        (CrawlType::Incremental, max_pages.unwrap_or(2))
    }
}

struct Runtime {
    monitor: Arc<Monitor>,
    manager: Arc<CrawlerManager>,
    config: BidwatchConfig,
}

fn build_runtime() -> Result<Runtime> {
    let config = BidwatchConfig::from_env();
    let store = Arc::new(StateStore::new(&config.store_dir));
    let monitor = Arc::new(Monitor::new(OpsLog::new(&config.store_dir)));
    let launcher = ProcessLauncher::from_config(&config)?;
    let manager = Arc::new(CrawlerManager::new(
        store,
        Arc::clone(&monitor),
        Box::new(launcher),
        config.clone(),
    ));
    Ok(Runtime {
        monitor,
        manager,
        config,
    })
}

fn print_session(session: &bidwatch_core::CrawlSession) {
    println!(
        "{} [{}] {:?}: total={} new={} updated={} failed={}{}",
        session.spider,
        session.crawl_type,
        session.status,
        session.counters.total_items,
        session.counters.new_items,
        session.counters.updated_items,
        session.counters.failed_items,
        session
            .error
            .as_deref()
            .map(|e| format!(" ({e})"))
            .unwrap_or_default(),
    );
}

/// Staleness-filter a harvest, run it through the pipeline, and persist what
/// survives. URLs the store already knows are re-visits: they bypass the
/// URL-repeat check so changed content lands as an update, while unchanged
/// content falls to the hash check and only refreshes `last_seen`.
async fn ingest_fragments(
    store: &StateStore,
    sink: &RecordSink,
    spider: &str,
    crawl_type: CrawlType,
    max_age_days: i64,
    harvested: Vec<RawFragment>,
    failed_items: u32,
) -> Result<RunCounters> {
    let mut fragments = Vec::with_capacity(harvested.len());
    let mut revisits = HashSet::new();
    for fragment in harvested {
        if store.is_url_seen(&fragment.url).await? {
            // Incremental runs only re-process URLs past the staleness
            // horizon; full runs re-visit everything.
            if crawl_type == CrawlType::Incremental
                && !store.is_stale(&fragment.url, max_age_days).await?
            {
                continue;
            }
            revisits.insert(fragment.url.clone());
        }
        fragments.push(fragment);
    }

    let mut pipeline = IngestPipeline::default();
    let seed_urls: Vec<String> = store
        .seen_urls()
        .await?
        .into_iter()
        .filter(|url| !revisits.contains(url))
        .collect();
    pipeline.seed(seed_urls, store.seen_hashes().await?);
    let report = pipeline.process(&fragments);

    let mut counters = RunCounters {
        total_items: report.total() as u32,
        new_items: 0,
        updated_items: 0,
        failed_items,
    };
    for record in &report.accepted {
        match store
            .mark_crawled(&record.url, &record.content_hash, spider)
            .await?
        {
            MarkOutcome::Inserted => counters.new_items += 1,
            MarkOutcome::Updated => counters.updated_items += 1,
        }
        sink.append(record).await?;
    }
    // An unchanged re-visit still counts as a visit, or the URL would stay
    // stale and be refetched on every incremental run.
    for rejected in &report.rejected {
        if rejected.reason == DuplicateReason::HashRepeat
            && revisits.contains(&rejected.record.url)
        {
            store.touch(&rejected.record.url).await?;
        }
    }
    store.flush().await?;

    info!(
        spider,
        accepted = report.accepted.len(),
        rejected = report.rejected.len(),
        "spider run finished"
    );
    Ok(counters)
}

/// The isolated spider process: crawl, normalize, dedup, persist, and emit
/// the counters contract on stdout.
async fn run_spider_process(
    name: &str,
    crawl_type: CrawlType,
    max_pages: u32,
    extra: BTreeMap<String, String>,
) -> Result<()> {
    let config = BidwatchConfig::from_env();
    let store = StateStore::new(&config.store_dir);
    store.warm().await?;

    let fetcher = Fetcher::new(config.fetch_config())?;
    let spider = bidwatch_spiders::spider_for(name, config.render_endpoint.as_deref())
        .with_context(|| format!("unknown spider `{name}`"))?;

    let mut params = CrawlParams::new(crawl_type, max_pages);
    params.extra = extra;

    let harvest = spider
        .crawl(&fetcher, &params)
        .await
        .with_context(|| format!("crawling {name}"))?;

    let sink = RecordSink::new(&config.store_dir);
    let counters = ingest_fragments(
        &store,
        &sink,
        name,
        crawl_type,
        config.max_age_days,
        harvest.fragments,
        harvest.failed_items,
    )
    .await?;

    // Final stdout line is the structured contract the manager parses.
    println!("{}", serde_json::to_string(&counters)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            spider,
            full,
            max_pages,
            extra,
        } => {
            let (crawl_type, pages) = crawl_defaults(full, max_pages);
            let runtime = build_runtime()?;
            let session = runtime
                .manager
                .run_spider(&spider, crawl_type, pages, parse_extra(&extra)?)
                .await?;
            print_session(&session);
            if session.status != SessionStatus::Completed {
                std::process::exit(1);
            }
        }
        Commands::RunAll { full, max_pages } => {
            let (crawl_type, pages) = crawl_defaults(full, max_pages);
            let runtime = build_runtime()?;
            let batch = runtime.manager.run_all(crawl_type, pages).await;
            for entry in &batch {
                match &entry.result {
                    Ok(session) => print_session(session),
                    Err(err) => println!("{}: {err}", entry.spider),
                }
            }
            if batch.iter().any(|e| e.is_failure()) {
                std::process::exit(1);
            }
        }
        Commands::Spider {
            name,
            crawl_type,
            max_pages,
            extra,
        } => {
            let crawl_type = parse_crawl_type(&crawl_type)?;
            run_spider_process(&name, crawl_type, max_pages, parse_extra(&extra)?).await?;
        }
        Commands::Schedule => {
            let runtime = build_runtime()?;
            let scheduler =
                BidScheduler::new(&runtime.config.store_dir, Arc::clone(&runtime.monitor)).await?;
            install_default_jobs(
                &scheduler,
                Arc::clone(&runtime.manager),
                Arc::clone(&runtime.monitor),
                &runtime.config,
            )
            .await?;
            scheduler.start().await?;
            println!(
                "scheduler running (full: {}, incremental: every {}m, report: {})",
                runtime.config.full_cron,
                runtime.config.incremental_every_mins,
                runtime.config.report_cron
            );
            tokio::signal::ctrl_c().await?;
            println!("shutting down");
        }
        Commands::Status { spider } => {
            let runtime = build_runtime()?;
            let names: Vec<String> = match spider {
                Some(name) => vec![name],
                None => runtime
                    .manager
                    .list()
                    .await
                    .into_iter()
                    .map(|s| s.name)
                    .collect(),
            };
            for name in names {
                let status = runtime.manager.status(&name).await?;
                let stats = &status.statistics;
                println!(
                    "{} [{}] runs={} completed={} failed={} timed_out={} items={} new={} last_run={}",
                    status.spec.name,
                    if status.spec.enabled { "enabled" } else { "disabled" },
                    stats.runs,
                    stats.completed,
                    stats.failed,
                    stats.timed_out,
                    stats.total_items,
                    stats.new_items,
                    stats
                        .last_run
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "never".to_string()),
                );
            }
        }
        Commands::List => {
            let runtime = build_runtime()?;
            for spec in runtime.manager.list().await {
                println!(
                    "{:<10} p{:<3} {:<13} {} {}",
                    spec.name,
                    spec.priority,
                    format!("{:?}", spec.transport_mode).to_lowercase(),
                    if spec.enabled { "enabled " } else { "disabled" },
                    spec.description,
                );
            }
        }
        Commands::Report { hours } => {
            let runtime = build_runtime()?;
            let (report, path) = runtime.monitor.report(hours).await?;
            println!(
                "report for last {}h: runs={} completed={} failed={} timed_out={} items={}",
                report.window_hours,
                report.runs,
                report.completed,
                report.failed,
                report.timed_out,
                report.total_items,
            );
            println!("written to {}", path.display());
        }
        Commands::Health => {
            let runtime = build_runtime()?;
            let health = runtime.monitor.health_status().await;
            println!(
                "{:?}: {}{}",
                health.state,
                health.message,
                health
                    .success_rate
                    .map(|r| format!(" (success rate {:.0}%)", r * 100.0))
                    .unwrap_or_default(),
            );
        }
    }
    Ok(())
}
