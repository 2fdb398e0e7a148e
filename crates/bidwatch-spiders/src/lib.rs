//! Spider contracts and per-platform implementations.
//!
//! A spider is the unit of crawl logic for one source platform and one
//! transport mode. Parsing is kept separate from fetching so that listing
//! HTML captured from a portal can be fed to the parse functions directly
//! in tests.

use async_trait::async_trait;
use bidwatch_core::{CrawlParams, RawFragment, TransportMode};
use bidwatch_fetch::{FetchError, Fetcher};
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;

mod ccgp;
mod gdzb;
mod render;
mod zfcg;

pub use ccgp::CcgpSpider;
pub use gdzb::GdzbSpider;
pub use render::RenderSpider;
pub use zfcg::ZfcgSpider;

pub const CRATE_NAME: &str = "bidwatch-spiders";

#[derive(Debug, Error)]
pub enum SpiderError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("invalid selector: {0}")]
    Selector(String),
    #[error("no render endpoint configured for dynamic spider {0}")]
    MissingRenderEndpoint(String),
    #[error("missing credential `{0}` in extra run arguments")]
    MissingCredential(String),
    #[error("{0}")]
    Message(String),
}

/// Everything one spider run produced: the raw fragments plus the number of
/// items that failed to fetch after retries.
#[derive(Debug, Default)]
pub struct CrawlHarvest {
    pub fragments: Vec<RawFragment>,
    pub failed_items: u32,
}

#[async_trait]
pub trait Spider: Send + Sync {
    fn name(&self) -> &'static str;
    fn platform(&self) -> &'static str;
    fn transport_mode(&self) -> TransportMode;

    /// Crawl up to `params.max_pages` listing pages, fetching through the
    /// anti-bot middleware chain. Item-level fetch failures are counted in
    /// the harvest, never raised.
    async fn crawl(
        &self,
        fetcher: &Fetcher,
        params: &CrawlParams,
    ) -> Result<CrawlHarvest, SpiderError>;
}

/// Closed constructor table for the known spiders. The manager's registry
/// mirrors these names; adding a platform means adding a variant here.
pub fn spider_for(name: &str, render_endpoint: Option<&str>) -> Option<Box<dyn Spider>> {
    match name {
        "ccgp" => Some(Box::new(CcgpSpider::new())),
        "zfcg" => Some(Box::new(ZfcgSpider::new())),
        "hbggzy" => Some(Box::new(RenderSpider::hbggzy(
            render_endpoint.map(str::to_string),
        ))),
        "gdzb" => Some(Box::new(GdzbSpider::new())),
        _ => None,
    }
}

pub fn known_spider_names() -> &'static [&'static str] {
    &["ccgp", "zfcg", "hbggzy", "gdzb"]
}

pub(crate) fn parse_selector(selector: &str) -> Result<Selector, SpiderError> {
    Selector::parse(selector).map_err(|e| SpiderError::Selector(e.to_string()))
}

pub(crate) fn element_text(element: ElementRef<'_>) -> String {
    element.text().collect::<String>().trim().to_string()
}

pub(crate) fn select_first_text(
    document: &Html,
    selector: &str,
) -> Result<Option<String>, SpiderError> {
    let sel = parse_selector(selector)?;
    Ok(document
        .select(&sel)
        .next()
        .map(element_text)
        .filter(|t| !t.is_empty()))
}

/// Resolve a possibly relative href against the page it appeared on.
pub(crate) fn absolute_url(page_url: &str, href: &str) -> String {
    if href.starts_with("http://") || href.starts_with("https://") {
        return href.to_string();
    }
    match reqwest::Url::parse(page_url).and_then(|base| base.join(href)) {
        Ok(url) => url.to_string(),
        Err(_) => href.to_string(),
    }
}
