//! Inactive-village feed: paginated HTML listing `(x|y)` coordinates.

use async_trait::async_trait;
use farmhand_protocol::Coord;
use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;
use std::time::Duration;

static COORD_CELL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)<small[^>]*class="[^"]*text-muted[^"]*"[^>]*>\s*\(\s*(-?\d+)\s*\|\s*(-?\d+)\s*\)\s*</small>"#,
    )
    .expect("Invalid regex")
});

const USER_AGENT: &str = concat!("farmhand/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("inactive feed url is not configured")]
    MissingUrl,
    #[error("invalid inactive feed url {0:?}")]
    InvalidUrl(String),
    #[error("inactive feed request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("inactive feed returned HTTP {status} for {url}")]
    Status { status: u16, url: String },
}

/// A source of candidate coordinates.
#[async_trait]
pub trait CoordFeed: Send + Sync {
    /// Up to `limit` distinct coordinates, in feed order.
    async fn fetch(&self, limit: usize) -> Result<Vec<Coord>, FeedError>;
}

/// Coordinates found in one page of the feed.
pub fn parse_coords(html: &str) -> Vec<Coord> {
    COORD_CELL
        .captures_iter(html)
        .filter_map(|c| Some(Coord::new(c[1].parse().ok()?, c[2].parse().ok()?)))
        .collect()
}

#[derive(Debug, Clone)]
pub struct InactiveFeed {
    http: reqwest::Client,
    url: reqwest::Url,
    max_pages: u32,
}

impl InactiveFeed {
    pub fn new(url: &str, max_pages: u32) -> Result<Self, FeedError> {
        let url = url.trim();
        if url.is_empty() {
            return Err(FeedError::MissingUrl);
        }
        let url = reqwest::Url::parse(url).map_err(|_| FeedError::InvalidUrl(url.to_string()))?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(25))
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self {
            http,
            url,
            max_pages: max_pages.max(1),
        })
    }

    /// Page 1 is the configured url as is; later pages set `page=N`.
    pub fn page_url(&self, page: u32) -> reqwest::Url {
        let mut url = self.url.clone();
        if page <= 1 {
            return url;
        }
        let kept: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(k, _)| k != "page")
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        url.query_pairs_mut()
            .clear()
            .extend_pairs(kept)
            .append_pair("page", &page.to_string());
        url
    }

    async fn get_text(&self, url: reqwest::Url) -> Result<String, FeedError> {
        let res = self
            .http
            .get(url.as_str())
            .header(reqwest::header::ACCEPT, "text/html,application/xhtml+xml;q=0.9,*/*;q=0.8")
            .send()
            .await?;
        let status = res.status();
        if !status.is_success() {
            return Err(FeedError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        Ok(res.text().await?)
    }
}

#[async_trait]
impl CoordFeed for InactiveFeed {
    async fn fetch(&self, limit: usize) -> Result<Vec<Coord>, FeedError> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for page in 1..=self.max_pages {
            tracing::info!(page, "downloading inactive feed page");
            let html = self.get_text(self.page_url(page)).await?;
            let coords = parse_coords(&html);
            if coords.is_empty() {
                break;
            }
            let mut fresh = 0;
            for c in coords {
                if !seen.insert(c) {
                    continue;
                }
                out.push(c);
                fresh += 1;
                if out.len() >= limit {
                    return Ok(out);
                }
            }
            if fresh == 0 {
                break;
            }
        }
        Ok(out)
    }
}
