//! Feed fetch unit
//!
//! The [`Fetcher`] trait is the per-URL operation that workers run. The
//! production implementation, [`HttpFetcher`], issues a conditional GET and
//! parses RSS 2.0 with the `rss` crate.
//!
//! - Custom headers and cookies from [`SourceSettings`]
//! - `If-None-Match` / `If-Modified-Since` from the header cache
//! - `304 Not Modified` is a success with no items
//! - Bodies larger than `max_body_bytes` are rejected
//! - Rate limiting with governor

pub mod filters;
pub mod seen;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use reqwest::{
    header::{
        HeaderMap, HeaderName, HeaderValue, ACCEPT, COOKIE, ETAG, IF_MODIFIED_SINCE,
        IF_NONE_MATCH, LAST_MODIFIED,
    },
    Client, StatusCode,
};
use std::num::NonZeroU32;

use crate::cache::HeaderEntry;
use crate::config::FetcherConfig;
use crate::models::{FeedItem, SourceSettings};
use crate::utils::error::FetchError;
use crate::utils::parse_feed_url;

pub use filters::passes_filters;
pub use seen::SeenItems;

/// Everything one fetch needs
#[derive(Debug, Clone, Default)]
pub struct FetchRequest {
    pub url: String,
    pub settings: Option<SourceSettings>,
    /// Last conditional-fetch headers seen for the URL
    pub cached: Option<HeaderEntry>,
}

/// Result of a successful fetch
#[derive(Debug, Clone, Default)]
pub struct FetchResponse {
    /// Conditional-fetch headers returned by the server
    pub headers: HeaderEntry,
    pub items: Vec<FeedItem>,
    pub not_modified: bool,
}

/// Fetches and parses one feed URL
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError>;
}

/// HTTP fetcher backed by reqwest
pub struct HttpFetcher {
    client: Client,

    /// Rate limiter to control request frequency
    rate_limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,

    max_body_bytes: usize,
}

impl HttpFetcher {
    /// Create a fetcher from configuration
    ///
    /// # Errors
    ///
    /// Returns `FetchError::Http` if the HTTP client cannot be created
    pub fn new(config: &FetcherConfig) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .user_agent(config.user_agent.clone())
            .gzip(true)
            .build()?;

        let rate = NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN);
        let rate_limiter = RateLimiter::direct(Quota::per_second(rate));

        Ok(Self {
            client,
            rate_limiter,
            max_body_bytes: config.max_body_bytes,
        })
    }

    fn build_headers(request: &FetchRequest) -> Result<HeaderMap, FetchError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static(
                "application/rss+xml, application/xml;q=0.9, text/xml;q=0.8, */*;q=0.5",
            ),
        );

        if let Some(cached) = &request.cached {
            if let Some(etag) = cached.etag.as_deref() {
                if let Ok(value) = HeaderValue::from_str(etag) {
                    headers.insert(IF_NONE_MATCH, value);
                }
            }
            if let Some(modified) = cached.last_modified.as_deref() {
                if let Ok(value) = HeaderValue::from_str(modified) {
                    headers.insert(IF_MODIFIED_SINCE, value);
                }
            }
        }

        if let Some(settings) = &request.settings {
            for (name, value) in &settings.headers {
                let name = HeaderName::from_bytes(name.as_bytes())
                    .map_err(|_| FetchError::InvalidHeader(name.clone()))?;
                let value = HeaderValue::from_str(value)
                    .map_err(|_| FetchError::InvalidHeader(name.to_string()))?;
                headers.insert(name, value);
            }
            if let Some(cookies) = settings.cookie_header() {
                let value = HeaderValue::from_str(&cookies)
                    .map_err(|_| FetchError::InvalidHeader(COOKIE.to_string()))?;
                headers.insert(COOKIE, value);
            }
        }

        Ok(headers)
    }
}

impl HttpFetcher {
    /// Read the body chunk by chunk, giving up past `max_body_bytes`
    async fn read_body(&self, mut response: reqwest::Response) -> Result<Vec<u8>, FetchError> {
        let limit = self.max_body_bytes;
        if response
            .content_length()
            .is_some_and(|len| len > limit as u64)
        {
            return Err(FetchError::BodyTooLarge(limit));
        }

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout
            } else {
                FetchError::Http(e)
            }
        })? {
            if body.len() + chunk.len() > limit {
                return Err(FetchError::BodyTooLarge(limit));
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }
}

fn header_string(headers: &HeaderMap, name: HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError> {
        let url = parse_feed_url(&request.url)?;
        let headers = Self::build_headers(request)?;

        self.rate_limiter.until_ready().await;

        let response = self
            .client
            .get(url)
            .headers(headers)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    FetchError::Timeout
                } else {
                    FetchError::Http(e)
                }
            })?;

        let status = response.status();
        let observed = HeaderEntry {
            etag: header_string(response.headers(), ETAG),
            last_modified: header_string(response.headers(), LAST_MODIFIED),
        };

        if status == StatusCode::NOT_MODIFIED {
            return Ok(FetchResponse {
                headers: request.cached.clone().unwrap_or(observed),
                items: Vec::new(),
                not_modified: true,
            });
        }

        if !status.is_success() {
            return Err(FetchError::BadStatus(status.as_u16()));
        }

        let body = self.read_body(response).await?;
        let items = parse_feed(&body)?;

        Ok(FetchResponse {
            headers: observed,
            items,
            not_modified: false,
        })
    }
}

/// Parse an RSS 2.0 document into items
pub fn parse_feed(body: &[u8]) -> Result<Vec<FeedItem>, FetchError> {
    let channel =
        rss::Channel::read_from(body).map_err(|e| FetchError::Parse(e.to_string()))?;
    Ok(parse_channel(&channel))
}

/// Convert an already-parsed channel into items
pub fn parse_channel(channel: &rss::Channel) -> Vec<FeedItem> {
    channel
        .items()
        .iter()
        .map(|item| {
            let title = item.title().unwrap_or_default().to_string();
            let published = item
                .pub_date()
                .and_then(|d| DateTime::parse_from_rfc2822(d).ok())
                .map(|dt| dt.with_timezone(&Utc));

            FeedItem {
                id: FeedItem::derive_id(
                    item.guid().map(|g| g.value()),
                    item.link(),
                    &title,
                    item.description(),
                ),
                title,
                description: item.description().map(String::from),
                link: item.link().map(String::from),
                published,
            }
        })
        .collect()
}
