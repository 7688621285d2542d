//! Web fetching for ingestion.
//!
//! Fetches a page's HTML and any directly referenced embedded binary
//! assets (images, media, PDFs); the pipeline materializes the result
//! into a run-scoped temp directory and ingests the files as local
//! items carrying their original URIs.

use async_trait::async_trait;
use url::Url;

use crate::models::IngestError;

/// Maximum embedded assets downloaded per page.
const MAX_ASSETS_PER_PAGE: usize = 16;

/// Asset content types worth ingesting as standalone items.
const ASSET_CONTENT_PREFIXES: [&str; 3] = ["image/", "audio/", "video/"];

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub url: String,
    pub html: String,
}

#[derive(Debug, Clone)]
pub struct FetchedAsset {
    pub url: String,
    pub bytes: Vec<u8>,
    pub mime: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct WebFetchResult {
    pub pages: Vec<FetchedPage>,
    pub assets: Vec<FetchedAsset>,
}

/// Page fetcher seam; a headless-browser client plugs in here when
/// JavaScript rendering is needed.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<WebFetchResult, IngestError>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Plain HTTP fetcher
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Fetcher over plain HTTP: page HTML plus embedded assets discovered
/// from `img`/`source`/`embed` references.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(user_agent: Option<&str>) -> Result<Self, IngestError> {
        let mut builder = reqwest::Client::builder().timeout(std::time::Duration::from_secs(30));
        if let Some(user_agent) = user_agent {
            builder = builder.user_agent(user_agent.to_string());
        }
        let client = builder
            .build()
            .map_err(|e| IngestError::Fetch(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<WebFetchResult, IngestError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| IngestError::Fetch(format!("{url}: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(IngestError::Fetch(format!("{url}: HTTP {status}")));
        }
        let final_url = response.url().to_string();
        let html = response
            .text()
            .await
            .map_err(|e| IngestError::Fetch(format!("{url}: {e}")))?;

        let asset_urls = discover_asset_urls(&html, &final_url);
        let mut assets = Vec::new();
        for asset_url in asset_urls.into_iter().take(MAX_ASSETS_PER_PAGE) {
            match self.fetch_asset(&asset_url).await {
                Ok(Some(asset)) => assets.push(asset),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(url = %asset_url, error = %e, "embedded asset fetch failed");
                }
            }
        }

        Ok(WebFetchResult {
            pages: vec![FetchedPage {
                url: final_url,
                html,
            }],
            assets,
        })
    }
}

impl HttpFetcher {
    /// Download one asset; returns None for content types that are not
    /// ingestable on their own.
    async fn fetch_asset(&self, url: &str) -> Result<Option<FetchedAsset>, IngestError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| IngestError::Fetch(e.to_string()))?;
        if !response.status().is_success() {
            return Err(IngestError::Fetch(format!("HTTP {}", response.status())));
        }

        let mime = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string());

        if !is_ingestable_asset(mime.as_deref()) {
            return Ok(None);
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| IngestError::Fetch(e.to_string()))?
            .to_vec();

        Ok(Some(FetchedAsset {
            url: url.to_string(),
            bytes,
            mime,
        }))
    }
}

fn is_ingestable_asset(mime: Option<&str>) -> bool {
    let Some(mime) = mime else { return false };
    ASSET_CONTENT_PREFIXES
        .iter()
        .any(|prefix| mime.starts_with(prefix))
        || mime == "application/pdf"
}

/// Find embedded asset references in the HTML, resolved against the
/// page URL, deduplicated, in document order.
pub fn discover_asset_urls(html: &str, base_url: &str) -> Vec<String> {
    let Ok(base) = Url::parse(base_url) else {
        return Vec::new();
    };

    let document = scraper::Html::parse_document(html);
    let selector = match scraper::Selector::parse("img[src], source[src], embed[src]") {
        Ok(selector) => selector,
        Err(_) => return Vec::new(),
    };

    let mut seen = std::collections::HashSet::new();
    let mut urls = Vec::new();
    for element in document.select(&selector) {
        let Some(src) = element.value().attr("src") else {
            continue;
        };
        let src = src.trim();
        if src.is_empty() || src.starts_with("data:") {
            continue;
        }
        if let Ok(resolved) = base.join(src) {
            let resolved = resolved.to_string();
            if seen.insert(resolved.clone()) {
                urls.push(resolved);
            }
        }
    }
    urls
}
