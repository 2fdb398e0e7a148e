//! Authenticated spider for the 广东省机电设备招标中心 member portal.
//!
//! The portal serves listings only to logged-in sessions. Session
//! establishment is an operator concern; the run is handed a session cookie
//! through the extra run arguments (`cookie=...`).

use async_trait::async_trait;
use bidwatch_core::{CrawlParams, CrawlType, RawFragment, TransportMode};
use bidwatch_fetch::Fetcher;
use chrono::Utc;
use reqwest::header::{HeaderValue, COOKIE};
use scraper::Html;
use tracing::warn;

use crate::{absolute_url, element_text, parse_selector, CrawlHarvest, Spider, SpiderError};

const LISTING_BASE: &str = "https://www.gdebidding.com/member/notice";

pub struct GdzbSpider;

impl GdzbSpider {
    pub fn new() -> Self {
        Self
    }
}

impl Default for GdzbSpider {
    fn default() -> Self {
        Self::new()
    }
}

pub fn parse_listing(
    html: &str,
    page_url: &str,
    spider: &str,
    platform: &str,
) -> Result<Vec<RawFragment>, SpiderError> {
    let document = Html::parse_document(html);
    let row_sel = parse_selector("div.bid-list li")?;
    let link_sel = parse_selector("a")?;
    let date_sel = parse_selector("em")?;

    let mut fragments = Vec::new();
    for row in document.select(&row_sel) {
        let Some(link) = row.select(&link_sel).next() else {
            continue;
        };
        let title = element_text(link);
        let Some(href) = link.value().attr("href") else {
            continue;
        };
        if title.is_empty() {
            continue;
        }
        fragments.push(RawFragment {
            title,
            amount_text: None,
            date_text: row
                .select(&date_sel)
                .next()
                .map(element_text)
                .filter(|t| !t.is_empty()),
            deadline_text: None,
            region_text: Some("广东".to_string()),
            body: element_text(row),
            url: absolute_url(page_url, href),
            platform: platform.to_string(),
            spider: spider.to_string(),
            scraped_at: Utc::now(),
        });
    }
    Ok(fragments)
}

#[async_trait]
impl Spider for GdzbSpider {
    fn name(&self) -> &'static str {
        "gdzb"
    }

    fn platform(&self) -> &'static str {
        "gdzb"
    }

    fn transport_mode(&self) -> TransportMode {
        TransportMode::Authenticated
    }

    async fn crawl(
        &self,
        fetcher: &Fetcher,
        params: &CrawlParams,
    ) -> Result<CrawlHarvest, SpiderError> {
        let cookie = params
            .extra
            .get("cookie")
            .ok_or_else(|| SpiderError::MissingCredential("cookie".to_string()))?;
        let cookie = HeaderValue::from_str(cookie)
            .map_err(|_| SpiderError::MissingCredential("cookie".to_string()))?;

        let pages = match params.crawl_type {
            CrawlType::Full => params.max_pages.max(1),
            CrawlType::Incremental => params.max_pages.clamp(1, 2),
        };

        let mut harvest = CrawlHarvest::default();
        for page in 0..pages {
            let page_url = format!("{LISTING_BASE}?page={}", page + 1);
            fetcher.pace_item(page as usize).await;
            let result = fetcher
                .get(&page_url)
                .header(COOKIE, cookie.clone())
                .send()
                .await;
            match result {
                Ok(listing) => {
                    let fragments =
                        parse_listing(&listing.body, &page_url, self.name(), self.platform())?;
                    harvest.fragments.extend(fragments);
                }
                Err(err) => {
                    warn!(url = %page_url, error = %err, "authenticated fetch failed");
                    harvest.failed_items += 1;
                }
            }
        }
        Ok(harvest)
    }
}
