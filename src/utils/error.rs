//! Error types for fetch units
//!
//! A `FetchError` never leaves the worker that produced it: it is rendered
//! into the reason string of a `failed` report.

use thiserror::Error;

/// Errors that can occur while fetching one feed URL
#[derive(Error, Debug)]
pub enum FetchError {
    /// HTTP request error
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-success response
    #[error("Bad status code ({0})")]
    BadStatus(u16),

    /// Request timeout
    #[error("Connection timed out")]
    Timeout,

    /// Invalid URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Custom header could not be encoded
    #[error("Invalid header '{0}'")]
    InvalidHeader(String),

    /// Body larger than the configured limit
    #[error("Response body exceeds {0} bytes")]
    BodyTooLarge(usize),

    /// Body is not a readable feed
    #[error("Invalid feed: {0}")]
    Parse(String),
}

impl FetchError {
    /// Check if this error is likely to clear up by itself
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Http(_) | Self::Timeout => true,
            Self::BadStatus(code) => *code >= 500 || *code == 429,
            Self::InvalidUrl(_)
            | Self::InvalidHeader(_)
            | Self::BodyTooLarge(_)
            | Self::Parse(_) => false,
        }
    }
}
