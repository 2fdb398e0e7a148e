//! Spider for the 浙江政府采购 portal (zfcg.czt.zj.gov.cn).
//!
//! Unlike ccgp, the listing table already carries budget, region, and a
//! summary paragraph, so no per-item detail fetch is needed.

use async_trait::async_trait;
use bidwatch_core::{CrawlParams, CrawlType, RawFragment, TransportMode};
use bidwatch_fetch::Fetcher;
use chrono::Utc;
use scraper::Html;
use tracing::warn;

use crate::{absolute_url, element_text, parse_selector, CrawlHarvest, Spider, SpiderError};

const LISTING_BASE: &str = "http://zfcg.czt.zj.gov.cn/portal/category";

pub struct ZfcgSpider;

impl ZfcgSpider {
    pub fn new() -> Self {
        Self
    }

    fn listing_url(page: u32) -> String {
        format!("{LISTING_BASE}?pageNo={}", page + 1)
    }
}

impl Default for ZfcgSpider {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a listing page table into raw fragments.
pub fn parse_listing(
    html: &str,
    page_url: &str,
    spider: &str,
    platform: &str,
) -> Result<Vec<RawFragment>, SpiderError> {
    let document = Html::parse_document(html);
    let row_sel = parse_selector("table.notice-list tr")?;
    let link_sel = parse_selector("td.title a")?;
    let region_sel = parse_selector("td.region")?;
    let budget_sel = parse_selector("td.budget")?;
    let date_sel = parse_selector("td.date")?;
    let summary_sel = parse_selector("td.title p.summary")?;

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

        let region_text = row
            .select(&region_sel)
            .next()
            .map(element_text)
            .filter(|t| !t.is_empty());
        let amount_text = row
            .select(&budget_sel)
            .next()
            .map(element_text)
            .filter(|t| !t.is_empty());
        let date_text = row
            .select(&date_sel)
            .next()
            .map(element_text)
            .filter(|t| !t.is_empty());
        let body = row
            .select(&summary_sel)
            .next()
            .map(element_text)
            .unwrap_or_else(|| title.clone());

        fragments.push(RawFragment {
            title,
            amount_text,
            date_text,
            deadline_text: None,
            region_text,
            body,
            url: absolute_url(page_url, href),
            platform: platform.to_string(),
            spider: spider.to_string(),
            scraped_at: Utc::now(),
        });
    }
    Ok(fragments)
}

#[async_trait]
impl Spider for ZfcgSpider {
    fn name(&self) -> &'static str {
        "zfcg"
    }

    fn platform(&self) -> &'static str {
        "zfcg-zj"
    }

    fn transport_mode(&self) -> TransportMode {
        TransportMode::Static
    }

    async fn crawl(
        &self,
        fetcher: &Fetcher,
        params: &CrawlParams,
    ) -> Result<CrawlHarvest, SpiderError> {
        let pages = match params.crawl_type {
            CrawlType::Full => params.max_pages.max(1),
            CrawlType::Incremental => params.max_pages.clamp(1, 2),
        };

        let mut harvest = CrawlHarvest::default();
        for page in 0..pages {
            let page_url = Self::listing_url(page);
            fetcher.pace_item(page as usize).await;
            match fetcher.get(&page_url).send().await {
                Ok(listing) => {
                    let fragments =
                        parse_listing(&listing.body, &page_url, self.name(), self.platform())?;
                    harvest.fragments.extend(fragments);
                }
                Err(err) => {
                    warn!(url = %page_url, error = %err, "listing page fetch failed");
                    harvest.failed_items += 1;
                }
            }
        }
        Ok(harvest)
    }
}
