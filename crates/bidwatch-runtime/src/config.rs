//! Environment-driven runtime configuration. Every operational knob can be
//! overridden without a code change; unset variables fall back to the
//! defaults below.

use std::path::PathBuf;
use std::time::Duration;

use bidwatch_fetch::{BackoffPolicy, FetchConfig};

pub const DEFAULT_FULL_CRON: &str = "0 0 2 * * *";
pub const DEFAULT_REPORT_CRON: &str = "0 0 * * * *";

#[derive(Debug, Clone)]
pub struct BidwatchConfig {
    /// Root directory for the durable store, logs, reports, and records.
    pub store_dir: PathBuf,
    pub delay_min_ms: u64,
    pub delay_max_ms: u64,
    /// Comma-separated proxy URLs; empty means direct connections.
    pub proxies: Vec<String>,
    /// Hard wall-clock budget for one full-crawl spider process.
    pub run_timeout: Duration,
    /// Hard wall-clock budget for one incremental-crawl spider process.
    pub incremental_timeout: Duration,
    pub max_retries: usize,
    pub full_cron: String,
    pub incremental_every_mins: u64,
    pub report_cron: String,
    /// Extra browser identity appended to the built-in rotation pool.
    pub extra_user_agent: Option<String>,
    /// Render-service endpoint for dynamic-transport spiders.
    pub render_endpoint: Option<String>,
    /// Staleness horizon for incremental re-crawl decisions.
    pub max_age_days: i64,
    /// Override for the isolated spider process command line,
    /// whitespace-split. Defaults to re-invoking the current executable.
    pub spider_command: Option<Vec<String>>,
}

impl Default for BidwatchConfig {
    fn default() -> Self {
        Self {
            store_dir: PathBuf::from("./data"),
            delay_min_ms: 500,
            delay_max_ms: 2000,
            proxies: Vec::new(),
            run_timeout: Duration::from_secs(3600),
            incremental_timeout: Duration::from_secs(900),
            max_retries: 3,
            full_cron: DEFAULT_FULL_CRON.to_string(),
            incremental_every_mins: 30,
            report_cron: DEFAULT_REPORT_CRON.to_string(),
            extra_user_agent: None,
            render_endpoint: None,
            max_age_days: 7,
            spider_command: None,
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env_string(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

pub fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl BidwatchConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            store_dir: env_string("BIDWATCH_STORE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.store_dir),
            delay_min_ms: env_parse("BIDWATCH_DELAY_MIN_MS", defaults.delay_min_ms),
            delay_max_ms: env_parse("BIDWATCH_DELAY_MAX_MS", defaults.delay_max_ms),
            proxies: env_string("BIDWATCH_PROXIES")
                .map(|v| parse_list(&v))
                .unwrap_or_default(),
            run_timeout: Duration::from_secs(env_parse(
                "BIDWATCH_RUN_TIMEOUT_SECS",
                defaults.run_timeout.as_secs(),
            )),
            incremental_timeout: Duration::from_secs(env_parse(
                "BIDWATCH_INCREMENTAL_TIMEOUT_SECS",
                defaults.incremental_timeout.as_secs(),
            )),
            max_retries: env_parse("BIDWATCH_MAX_RETRIES", defaults.max_retries),
            full_cron: env_string("BIDWATCH_FULL_CRON").unwrap_or(defaults.full_cron),
            incremental_every_mins: env_parse(
                "BIDWATCH_INCREMENTAL_EVERY_MINS",
                defaults.incremental_every_mins,
            ),
            report_cron: env_string("BIDWATCH_REPORT_CRON").unwrap_or(defaults.report_cron),
            extra_user_agent: env_string("BIDWATCH_USER_AGENT"),
            render_endpoint: env_string("BIDWATCH_RENDER_ENDPOINT"),
            max_age_days: env_parse("BIDWATCH_MAX_AGE_DAYS", defaults.max_age_days),
            spider_command: env_string("BIDWATCH_SPIDER_COMMAND").map(|v| {
                v.split_whitespace().map(str::to_string).collect()
            }),
        }
    }

    /// Middleware-chain configuration derived from the runtime knobs.
    pub fn fetch_config(&self) -> FetchConfig {
        FetchConfig {
            delay_min: Duration::from_millis(self.delay_min_ms),
            delay_max: Duration::from_millis(self.delay_max_ms.max(self.delay_min_ms)),
            proxies: self.proxies.clone(),
            extra_identities: self.extra_user_agent.iter().cloned().collect(),
            backoff: BackoffPolicy {
                max_retries: self.max_retries,
                ..BackoffPolicy::default()
            },
            ..FetchConfig::default()
        }
    }

    pub fn timeout_for(&self, crawl_type: bidwatch_core::CrawlType) -> Duration {
        match crawl_type {
            bidwatch_core::CrawlType::Full => self.run_timeout,
            bidwatch_core::CrawlType::Incremental => self.incremental_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bidwatch_core::CrawlType;

    #[test]
    fn defaults_match_operational_contract() {
        let config = BidwatchConfig::default();
        assert_eq!(config.run_timeout, Duration::from_secs(3600));
        assert_eq!(config.incremental_timeout, Duration::from_secs(900));
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.max_age_days, 7);
        assert_eq!(config.timeout_for(CrawlType::Full), config.run_timeout);
        assert_eq!(
            config.timeout_for(CrawlType::Incremental),
            config.incremental_timeout
        );
    }

    #[test]
    fn proxy_list_parsing_skips_blanks() {
        assert_eq!(
            parse_list("http://a:8080, ,http://b:8080,"),
            vec!["http://a:8080".to_string(), "http://b:8080".to_string()]
        );
        assert!(parse_list("").is_empty());
    }

    #[test]
    fn fetch_config_carries_the_knobs_through() {
        let config = BidwatchConfig {
            delay_min_ms: 100,
            delay_max_ms: 50,
            extra_user_agent: Some("bidwatch-probe/1.0".into()),
            ..BidwatchConfig::default()
        };
        let fetch = config.fetch_config();
        // A window inverted by misconfiguration is clamped, not rejected.
        assert_eq!(fetch.delay_min, Duration::from_millis(100));
        assert_eq!(fetch.delay_max, Duration::from_millis(100));
        assert_eq!(fetch.extra_identities, vec!["bidwatch-probe/1.0".to_string()]);
        assert_eq!(fetch.backoff.max_retries, 3);
    }
}
