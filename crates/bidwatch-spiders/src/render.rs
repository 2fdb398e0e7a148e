//! Dynamic-transport spider that fetches JS-heavy portals through an
//! external headless-browser render service. Rendering itself stays outside
//! this crate; the spider only talks to the collaborator's HTTP endpoint,
//! which returns the fully rendered HTML.

use async_trait::async_trait;
use bidwatch_core::{CrawlParams, CrawlType, RawFragment, TransportMode};
use bidwatch_fetch::Fetcher;
use chrono::Utc;
use scraper::Html;
use tracing::warn;

use crate::{absolute_url, element_text, parse_selector, CrawlHarvest, Spider, SpiderError};

pub struct RenderSpider {
    name: &'static str,
    platform: &'static str,
    listing_base: &'static str,
    endpoint: Option<String>,
}

impl RenderSpider {
    /// 湖北公共资源交易 portal, rendered client-side.
    pub fn hbggzy(endpoint: Option<String>) -> Self {
        Self {
            name: "hbggzy",
            platform: "hbggzy",
            listing_base: "https://www.hbggzyfwpt.cn/jyxx/list",
            endpoint,
        }
    }

    fn render_url(&self, page: u32) -> Result<String, SpiderError> {
        let endpoint = self
            .endpoint
            .as_deref()
            .ok_or_else(|| SpiderError::MissingRenderEndpoint(self.name.to_string()))?;
        let target = format!("{}?page={}", self.listing_base, page + 1);
        let url = reqwest::Url::parse_with_params(endpoint, &[("url", target.as_str())])
            .map_err(|e| SpiderError::Message(format!("bad render endpoint: {e}")))?;
        Ok(url.to_string())
    }
}

/// Parse the rendered listing markup into fragments.
pub fn parse_rendered_listing(
    html: &str,
    page_url: &str,
    spider: &str,
    platform: &str,
) -> Result<Vec<RawFragment>, SpiderError> {
    let document = Html::parse_document(html);
    let row_sel = parse_selector("div.jyxx-item")?;
    let link_sel = parse_selector("a.item-title")?;
    let date_sel = parse_selector("span.item-date")?;

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
        let date_text = row
            .select(&date_sel)
            .next()
            .map(element_text)
            .filter(|t| !t.is_empty());

        fragments.push(RawFragment {
            title: title.clone(),
            amount_text: None,
            date_text,
            deadline_text: None,
            region_text: Some("湖北".to_string()),
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
impl Spider for RenderSpider {
    fn name(&self) -> &'static str {
        self.name
    }

    fn platform(&self) -> &'static str {
        self.platform
    }

    fn transport_mode(&self) -> TransportMode {
        TransportMode::Dynamic
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
            let render_url = self.render_url(page)?;
            fetcher.pace_item(page as usize).await;
            match fetcher.get(&render_url).send().await {
                Ok(rendered) => {
                    let fragments = parse_rendered_listing(
                        &rendered.body,
                        self.listing_base,
                        self.name,
                        self.platform,
                    )?;
                    harvest.fragments.extend(fragments);
                }
                Err(err) => {
                    warn!(url = %render_url, error = %err, "render fetch failed");
                    harvest.failed_items += 1;
                }
            }
        }
        Ok(harvest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bidwatch_fetch::{FetchConfig, Fetcher};

    #[test]
    fn missing_endpoint_is_a_typed_error() {
        let spider = RenderSpider::hbggzy(None);
        let err = spider.render_url(0).unwrap_err();
        assert!(matches!(err, SpiderError::MissingRenderEndpoint(_)));
    }

    #[test]
    fn render_url_wraps_the_target_page() {
        let spider = RenderSpider::hbggzy(Some("http://localhost:3000/content".to_string()));
        let url = spider.render_url(1).unwrap();
        assert!(url.starts_with("http://localhost:3000/content?url="));
        assert!(url.contains("page%3D2"));
    }

    #[test]
    fn rendered_listing_parses() {
        let html = r#"
        <div class="jyxx-item">
          <a class="item-title" href="/jyxx/detail/991">某医院医疗设备采购公告</a>
          <span class="item-date">2026年3月2日</span>
        </div>
        "#;
        let fragments = parse_rendered_listing(
            html,
            "https://www.hbggzyfwpt.cn/jyxx/list",
            "hbggzy",
            "hbggzy",
        )
        .unwrap();
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].title, "某医院医疗设备采购公告");
        assert_eq!(fragments[0].date_text.as_deref(), Some("2026年3月2日"));
        assert_eq!(
            fragments[0].url,
            "https://www.hbggzyfwpt.cn/jyxx/detail/991"
        );
    }

    #[tokio::test]
    async fn crawl_without_endpoint_fails_fast() {
        let spider = RenderSpider::hbggzy(None);
        let fetcher = Fetcher::new(FetchConfig::default()).unwrap();
        let params = CrawlParams::new(CrawlType::Incremental, 1);
        let err = spider.crawl(&fetcher, &params).await.unwrap_err();
        assert!(matches!(err, SpiderError::MissingRenderEndpoint(_)));
    }
}
