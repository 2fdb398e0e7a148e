//! Spider for 中国政府采购网 (ccgp.gov.cn) central announcement listings.

use async_trait::async_trait;
use bidwatch_core::{CrawlParams, CrawlType, RawFragment, TransportMode};
use bidwatch_fetch::Fetcher;
use chrono::Utc;
use scraper::Html;
use tracing::{debug, warn};

use crate::{
    absolute_url, element_text, parse_selector, select_first_text, CrawlHarvest, Spider,
    SpiderError,
};

const LISTING_BASE: &str = "http://www.ccgp.gov.cn/cggg/zygg/";

/// One row of a listing page before the detail fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingItem {
    pub title: String,
    pub url: String,
    pub date_text: Option<String>,
    pub region_text: Option<String>,
}

pub struct CcgpSpider;

impl CcgpSpider {
    pub fn new() -> Self {
        Self
    }

    fn listing_url(page: u32) -> String {
        if page == 0 {
            format!("{LISTING_BASE}index.htm")
        } else {
            format!("{LISTING_BASE}index_{page}.htm")
        }
    }
}

impl Default for CcgpSpider {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse one listing page into its announcement rows.
///
/// Each row is `<li><a href>title</a><span>date | buyer | region</span></li>`
/// under the result list.
pub fn parse_listing(html: &str, page_url: &str) -> Result<Vec<ListingItem>, SpiderError> {
    let document = Html::parse_document(html);
    let row_sel = parse_selector("ul.vT-srch-result-list-bid > li")?;
    let link_sel = parse_selector("a")?;
    let meta_sel = parse_selector("span")?;

    let mut items = Vec::new();
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

        let meta = row.select(&meta_sel).next().map(element_text);
        let (date_text, region_text) = match meta.as_deref() {
            Some(meta) => {
                let parts: Vec<&str> = meta.split('|').map(str::trim).collect();
                let date = parts.first().map(|s| s.to_string()).filter(|s| !s.is_empty());
                let region = parts
                    .iter()
                    .rev()
                    .find(|p| !p.contains('：') && !p.is_empty() && Some(**p) != date.as_deref())
                    .map(|s| s.to_string());
                (date, region)
            }
            None => (None, None),
        };

        items.push(ListingItem {
            title,
            url: absolute_url(page_url, href),
            date_text,
            region_text,
        });
    }
    Ok(items)
}

/// Extract the announcement body text from a detail page.
pub fn parse_detail(html: &str) -> Result<Option<String>, SpiderError> {
    let document = Html::parse_document(html);
    select_first_text(&document, "div.vF_detail_content")
}

#[async_trait]
impl Spider for CcgpSpider {
    fn name(&self) -> &'static str {
        "ccgp"
    }

    fn platform(&self) -> &'static str {
        "ccgp"
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
        let mut item_index = 0usize;

        for page in 0..pages {
            let page_url = Self::listing_url(page);
            let listing = match fetcher.get(&page_url).send().await {
                Ok(page) => page,
                Err(err) => {
                    warn!(url = %page_url, error = %err, "listing page fetch failed");
                    harvest.failed_items += 1;
                    continue;
                }
            };

            let items = parse_listing(&listing.body, &page_url)?;
            debug!(page, items = items.len(), "parsed ccgp listing page");

            for item in items {
                fetcher.pace_item(item_index).await;
                item_index += 1;

                let body = match fetcher.get(&item.url).referer(&page_url).send().await {
                    Ok(detail) => match parse_detail(&detail.body)? {
                        Some(text) => text,
                        None => detail.body,
                    },
                    Err(err) => {
                        warn!(url = %item.url, error = %err, "detail fetch failed");
                        harvest.failed_items += 1;
                        continue;
                    }
                };

                harvest.fragments.push(RawFragment {
                    title: item.title,
                    amount_text: None,
                    date_text: item.date_text,
                    deadline_text: None,
                    region_text: item.region_text,
                    body,
                    url: item.url,
                    platform: self.platform().to_string(),
                    spider: self.name().to_string(),
                    scraped_at: Utc::now(),
                });
            }
        }

        Ok(harvest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING_FIXTURE: &str = r#"
    <html><body>
    <ul class="vT-srch-result-list-bid">
      <li>
        <a href="./202603/t20260301_101.htm">某机房建设项目公开招标公告</a>
        <span>2026.03.01 09:00:00 | 采购人：某单位 | 广东</span>
      </li>
      <li>
        <a href="http://www.ccgp.gov.cn/cggg/zygg/202603/t20260301_102.htm">办公设备采购项目</a>
        <span>2026.03.01 10:30:00 | 采购人：另一单位 | 北京</span>
      </li>
      <li><a href="./broken.htm"></a></li>
    </ul>
    </body></html>
    "#;

    #[test]
    fn listing_rows_parse_into_items() {
        let items =
            parse_listing(LISTING_FIXTURE, "http://www.ccgp.gov.cn/cggg/zygg/index.htm").unwrap();
        assert_eq!(items.len(), 2);

        assert_eq!(items[0].title, "某机房建设项目公开招标公告");
        assert_eq!(
            items[0].url,
            "http://www.ccgp.gov.cn/cggg/zygg/202603/t20260301_101.htm"
        );
        assert_eq!(items[0].date_text.as_deref(), Some("2026.03.01 09:00:00"));
        assert_eq!(items[0].region_text.as_deref(), Some("广东"));

        assert_eq!(items[1].region_text.as_deref(), Some("北京"));
    }

    #[test]
    fn rows_without_titles_are_skipped() {
        let items =
            parse_listing(LISTING_FIXTURE, "http://www.ccgp.gov.cn/cggg/zygg/index.htm").unwrap();
        assert!(items.iter().all(|i| !i.title.is_empty()));
    }

    #[test]
    fn detail_body_comes_from_content_div() {
        let html = r#"
        <html><body>
          <div class="vF_detail_content">
            项目编号：ZB-2026-001
            预算金额：100万元
            联系人：张工 13812345678
          </div>
        </body></html>
        "#;
        let body = parse_detail(html).unwrap().unwrap();
        assert!(body.contains("预算金额：100万元"));
        assert!(body.contains("13812345678"));
    }

    #[test]
    fn detail_without_content_div_yields_none() {
        assert!(parse_detail("<html><body><p>x</p></body></html>")
            .unwrap()
            .is_none());
    }

    #[test]
    fn listing_urls_paginate() {
        assert_eq!(
            CcgpSpider::listing_url(0),
            "http://www.ccgp.gov.cn/cggg/zygg/index.htm"
        );
        assert_eq!(
            CcgpSpider::listing_url(3),
            "http://www.ccgp.gov.cn/cggg/zygg/index_3.htm"
        );
    }
}
