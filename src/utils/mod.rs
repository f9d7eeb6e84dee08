//! Common utilities and helper functions
//!
//! This module provides shared utilities used across the application.

pub mod error;

use url::Url;

/// Above this many entries a link listing is replaced with a short notice
pub const MAX_LISTED_LINKS: usize = 25;

/// Validate that a feed URL is absolute http(s)
pub fn parse_feed_url(raw: &str) -> Result<Url, error::FetchError> {
    let parsed = Url::parse(raw).map_err(|e| error::FetchError::InvalidUrl(format!("{raw}: {e}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(error::FetchError::InvalidUrl(format!(
            "{raw}: unsupported scheme '{other}'"
        ))),
    }
}

/// Render a list of links for a log line, collapsing long lists
pub fn summarize_links<'a>(links: impl IntoIterator<Item = &'a str>) -> String {
    let links: Vec<&str> = links.into_iter().collect();
    if links.len() > MAX_LISTED_LINKS {
        return format!("Greater than {MAX_LISTED_LINKS} links, skipping log");
    }
    links.join("\n")
}

/// Truncate text to a maximum length
pub fn truncate_text(text: &str, max_len: usize) -> String {
    if text.chars().count() <= max_len {
        text.to_string()
    } else {
        let truncated: String = text.chars().take(max_len.saturating_sub(3)).collect();
        format!("{truncated}...")
    }
}

/// Round to two decimal places
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
