//! Anti-bot middleware chain: identity rotation, rate shaping, proxy
//! rotation, header completion, and retry policy for outbound fetches.
//!
//! Every spider fetch goes through [`Fetcher`], which makes requests look
//! like diverse, human-paced browser traffic and absorbs transient block
//! responses. Exhausting the retry budget yields a [`FetchError`] that the
//! caller counts as a failed item; it never aborts a run.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Context;
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, CONNECTION, REFERER, USER_AGENT};
use reqwest::StatusCode;
use thiserror::Error;
use tracing::{debug, info_span, warn};

pub const CRATE_NAME: &str = "bidwatch-fetch";

/// Fixed pool of browser signature strings used for per-request identity
/// rotation.
const IDENTITY_POOL: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36 Edg/122.0.2365.92",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.3 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:124.0) Gecko/20100101 Firefox/124.0",
];

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub timeout: Duration,
    /// Randomized pre-request delay window.
    pub delay_min: Duration,
    pub delay_max: Duration,
    /// Linear growth step for the inter-item delay within one run.
    pub item_delay_step: Duration,
    /// Round-robin proxy pool; empty means direct connections.
    pub proxies: Vec<String>,
    /// Extra identities appended to the built-in pool.
    pub extra_identities: Vec<String>,
    pub backoff: BackoffPolicy,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            delay_min: Duration::from_millis(500),
            delay_max: Duration::from_millis(2000),
            item_delay_step: Duration::from_millis(200),
            proxies: Vec::new(),
            extra_identities: Vec::new(),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Block responses worth retrying: anti-bot denial, throttling, and
/// temporary unavailability.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    match status {
        StatusCode::FORBIDDEN
        | StatusCode::TOO_MANY_REQUESTS
        | StatusCode::SERVICE_UNAVAILABLE => RetryDisposition::Retryable,
        _ => RetryDisposition::NonRetryable,
    }
}

pub fn classify_transport_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub status: StatusCode,
    pub final_url: String,
    pub body: String,
}

/// Fill in standard browser headers the caller left unset. Caller-supplied
/// values always win. Accept-Encoding is negotiated by the client itself so
/// that response decompression stays automatic.
pub fn complete_headers(
    mut headers: HeaderMap,
    identity: &str,
    referer: Option<&str>,
) -> HeaderMap {
    if !headers.contains_key(USER_AGENT) {
        if let Ok(value) = HeaderValue::from_str(identity) {
            headers.insert(USER_AGENT, value);
        }
    }
    if !headers.contains_key(ACCEPT) {
        headers.insert(
            ACCEPT,
            HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            ),
        );
    }
    if !headers.contains_key(ACCEPT_LANGUAGE) {
        headers.insert(
            ACCEPT_LANGUAGE,
            HeaderValue::from_static("zh-CN,zh;q=0.9,en;q=0.6"),
        );
    }
    if !headers.contains_key(CONNECTION) {
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    }
    if !headers.contains_key(REFERER) {
        if let Some(referer) = referer {
            if let Ok(value) = HeaderValue::from_str(referer) {
                headers.insert(REFERER, value);
            }
        }
    }
    headers
}

/// Inter-item delay grows linearly with the item index within a run to
/// avoid burst patterns.
pub fn item_delay(step: Duration, item_index: usize) -> Duration {
    step.saturating_mul(item_index.min(u32::MAX as usize) as u32)
}

pub struct Fetcher {
    /// One client per proxy; a single direct client when the pool is empty.
    clients: Vec<reqwest::Client>,
    proxy_cursor: AtomicUsize,
    identities: Vec<String>,
    config: FetchConfig,
}

impl Fetcher {
    pub fn new(config: FetchConfig) -> anyhow::Result<Self> {
        let mut clients = Vec::new();
        if config.proxies.is_empty() {
            clients.push(build_client(&config, None)?);
        } else {
            for proxy in &config.proxies {
                clients.push(build_client(&config, Some(proxy))?);
            }
        }

        let mut identities: Vec<String> =
            IDENTITY_POOL.iter().map(|s| s.to_string()).collect();
        identities.extend(config.extra_identities.iter().cloned());

        Ok(Self {
            clients,
            proxy_cursor: AtomicUsize::new(0),
            identities,
            config,
        })
    }

    pub fn get(&self, url: impl Into<String>) -> FetchRequest<'_> {
        FetchRequest {
            fetcher: self,
            url: url.into(),
            headers: HeaderMap::new(),
            referer: None,
            no_retry: false,
        }
    }

    /// Cooperative pause applied before each request: a random delay inside
    /// the configured window.
    pub async fn pace(&self) {
        let min = self.config.delay_min.as_millis() as u64;
        let max = self.config.delay_max.as_millis() as u64;
        if max == 0 {
            return;
        }
        let wait = if max > min {
            rand::rng().random_range(min..=max)
        } else {
            min
        };
        tokio::time::sleep(Duration::from_millis(wait)).await;
    }

    /// Cooperative pause between items, growing with the item index.
    pub async fn pace_item(&self, item_index: usize) {
        let wait = item_delay(self.config.item_delay_step, item_index);
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }

    fn pick_identity(&self) -> &str {
        let idx = rand::rng().random_range(0..self.identities.len());
        &self.identities[idx]
    }

    fn next_client(&self) -> &reqwest::Client {
        let idx = self.proxy_cursor.fetch_add(1, Ordering::Relaxed) % self.clients.len();
        &self.clients[idx]
    }

    async fn execute(&self, request: &FetchRequest<'_>) -> Result<FetchedPage, FetchError> {
        let span = info_span!("fetch", url = %request.url, no_retry = request.no_retry);
        let _guard = span.enter();

        let attempts = if request.no_retry {
            0
        } else {
            self.config.backoff.max_retries
        };
        let mut last_transport_error: Option<reqwest::Error> = None;

        for attempt in 0..=attempts {
            self.pace().await;

            let identity = self.pick_identity().to_string();
            let headers =
                complete_headers(request.headers.clone(), &identity, request.referer.as_deref());
            let client = self.next_client();

            match client.get(&request.url).headers(headers).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.text().await?;
                        return Ok(FetchedPage {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < attempts
                    {
                        let backoff = self.config.backoff.delay_for_attempt(attempt);
                        let jitter =
                            Duration::from_millis(rand::rng().random_range(0..500));
                        warn!(%status, attempt, "blocked response, backing off");
                        tokio::time::sleep(backoff + jitter).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_transport_error(&err) == RetryDisposition::Retryable
                        && attempt < attempts
                    {
                        let backoff = self.config.backoff.delay_for_attempt(attempt);
                        let jitter =
                            Duration::from_millis(rand::rng().random_range(0..500));
                        debug!(error = %err, attempt, "transport error, backing off");
                        last_transport_error = Some(err);
                        tokio::time::sleep(backoff + jitter).await;
                        continue;
                    }
                    return Err(FetchError::Transport(err));
                }
            }
        }

        // The loop only falls through after a retryable transport error.
        Err(match last_transport_error {
            Some(err) => FetchError::Transport(err),
            None => FetchError::HttpStatus {
                status: 599,
                url: request.url.clone(),
            },
        })
    }
}

fn build_client(config: &FetchConfig, proxy: Option<&str>) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .gzip(true)
        .brotli(true)
        .timeout(config.timeout);
    if let Some(proxy) = proxy {
        let proxy = reqwest::Proxy::all(proxy)
            .with_context(|| format!("invalid proxy url {proxy}"))?;
        builder = builder.proxy(proxy);
    }
    builder.build().context("building http client")
}

pub struct FetchRequest<'a> {
    fetcher: &'a Fetcher,
    url: String,
    headers: HeaderMap,
    referer: Option<String>,
    no_retry: bool,
}

impl FetchRequest<'_> {
    pub fn header(mut self, name: reqwest::header::HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn referer(mut self, referer: impl Into<String>) -> Self {
        self.referer = Some(referer.into());
        self
    }

    /// Mark the request as not worth retrying; it is passed through once,
    /// whatever the outcome.
    pub fn no_retry(mut self) -> Self {
        self.no_retry = true;
        self
    }

    pub async fn send(self) -> Result<FetchedPage, FetchError> {
        self.fetcher.execute(&self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn block_statuses_are_retryable() {
        assert_eq!(
            classify_status(StatusCode::FORBIDDEN),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
        assert_eq!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn header_completion_does_not_override_caller_values() {
        let mut caller = HeaderMap::new();
        caller.insert(USER_AGENT, HeaderValue::from_static("custom-agent/1.0"));
        caller.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let completed = complete_headers(caller, IDENTITY_POOL[0], Some("https://example.cn/"));
        assert_eq!(completed.get(USER_AGENT).unwrap(), "custom-agent/1.0");
        assert_eq!(completed.get(ACCEPT).unwrap(), "application/json");
        assert_eq!(completed.get(REFERER).unwrap(), "https://example.cn/");
        assert!(completed.contains_key(ACCEPT_LANGUAGE));
        assert!(completed.contains_key(CONNECTION));
    }

    #[test]
    fn header_completion_skips_referer_when_unknown() {
        let completed = complete_headers(HeaderMap::new(), IDENTITY_POOL[0], None);
        assert!(!completed.contains_key(REFERER));
        assert!(completed.contains_key(USER_AGENT));
    }

    #[test]
    fn item_delay_grows_linearly() {
        let step = Duration::from_millis(200);
        assert_eq!(item_delay(step, 0), Duration::ZERO);
        assert_eq!(item_delay(step, 1), Duration::from_millis(200));
        assert_eq!(item_delay(step, 5), Duration::from_millis(1000));
    }

    #[test]
    fn proxy_pool_builds_one_client_per_proxy() {
        let fetcher = Fetcher::new(FetchConfig {
            proxies: vec![
                "http://127.0.0.1:8081".into(),
                "http://127.0.0.1:8082".into(),
                "http://127.0.0.1:8083".into(),
            ],
            ..Default::default()
        })
        .unwrap();
        assert_eq!(fetcher.clients.len(), 3);

        // Round-robin assignment walks the pool in order.
        let first = fetcher.proxy_cursor.fetch_add(0, Ordering::Relaxed);
        let _ = fetcher.next_client();
        let _ = fetcher.next_client();
        assert_eq!(
            fetcher.proxy_cursor.fetch_add(0, Ordering::Relaxed),
            first + 2
        );
    }

    #[test]
    fn empty_proxy_pool_is_a_noop() {
        let fetcher = Fetcher::new(FetchConfig::default()).unwrap();
        assert_eq!(fetcher.clients.len(), 1);
    }

    #[test]
    fn identity_pool_includes_extras() {
        let fetcher = Fetcher::new(FetchConfig {
            extra_identities: vec!["bidwatch-test/0.1".into()],
            ..Default::default()
        })
        .unwrap();
        assert_eq!(fetcher.identities.len(), IDENTITY_POOL.len() + 1);
        for _ in 0..32 {
            let identity = fetcher.pick_identity();
            assert!(!identity.is_empty());
        }
    }
}
