//! HTTP image fetcher
//!
//! One GET per job with a bounded number of retries. Network problems are
//! never errors at this level: every attempt ends in a [`FetchOutcome`].

use bytes::{Bytes, BytesMut};
use imgdl_common::{ImgdlError, Result};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::Client;
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::config::FetchConfig;

/// Response header carrying crawler usage directives
pub const ROBOTS_HEADER: &str = "x-robots-tag";

/// Result of fetching one URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Success { bytes: Bytes },
    Failure(FetchFailure),
}

impl FetchOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Why a fetch produced no usable body
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchFailure {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out")]
    Timeout,

    #[error("HTTP status {0}")]
    Status(u16),

    #[error("empty response body")]
    EmptyBody,

    #[error("usage disallowed by X-Robots-Tag")]
    Disallowed,

    #[error("response body exceeds {0} bytes")]
    TooLarge(u64),
}

impl From<reqwest::Error> for FetchFailure {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if let Some(status) = err.status() {
            Self::Status(status.as_u16())
        } else {
            Self::Transport(error_chain(&err))
        }
    }
}

/// reqwest's top-level message hides the interesting part (DNS, TLS, ...)
fn error_chain(err: &dyn std::error::Error) -> String {
    let mut reason = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        reason.push_str(": ");
        reason.push_str(&inner.to_string());
        source = inner.source();
    }
    reason
}

/// HTTP client with retry and header policy
#[derive(Debug, Clone)]
pub struct Fetcher {
    client: Client,
    max_retries: u32,
    retry_delay: Duration,
    max_body_bytes: u64,
    disallowed: HashSet<String>,
}

impl Fetcher {
    /// Build a fetcher; the client is shared by every worker
    pub fn new(config: &FetchConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout())
            .user_agent(config.user_agent.as_str())
            .build()
            .map_err(|e| ImgdlError::config(format!("cannot build HTTP client: {e}")))?;

        Ok(Self {
            client,
            max_retries: config.max_retries,
            retry_delay: config.retry_delay(),
            max_body_bytes: config.max_body_bytes,
            disallowed: config
                .disallowed_directives
                .iter()
                .map(|d| d.trim().to_lowercase())
                .filter(|d| !d.is_empty())
                .collect(),
        })
    }

    /// Fetch `url`, trying at most `max_retries + 1` times.
    ///
    /// The first attempt that returns a non-empty success body wins. A
    /// response disallowed by its `X-Robots-Tag` or over the body cap is
    /// final.
    pub async fn fetch(&self, url: &str) -> FetchOutcome {
        let attempts = self.max_retries.saturating_add(1);
        let mut last_failure = FetchFailure::Transport("no attempt made".to_string());

        for attempt in 1..=attempts {
            match self.attempt(url).await {
                Ok((bytes, headers)) => {
                    if self.is_disallowed(&headers) {
                        debug!(url, "Response disallowed by {}", ROBOTS_HEADER);
                        return FetchOutcome::Failure(FetchFailure::Disallowed);
                    }
                    return FetchOutcome::Success { bytes };
                },
                Err(failure @ FetchFailure::TooLarge(_)) => {
                    debug!(url, error = %failure, "Response body over the cap");
                    return FetchOutcome::Failure(failure);
                },
                Err(failure) => {
                    debug!(url, attempt, attempts, error = %failure, "Fetch attempt failed");
                    last_failure = failure;
                    if attempt < attempts && !self.retry_delay.is_zero() {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                },
            }
        }

        FetchOutcome::Failure(last_failure)
    }

    async fn attempt(&self, url: &str) -> std::result::Result<(Bytes, HeaderMap), FetchFailure> {
        let mut response = self.client.get(url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchFailure::Status(status.as_u16()));
        }

        let cap = self.max_body_bytes;
        if response.content_length().is_some_and(|len| len > cap) {
            return Err(FetchFailure::TooLarge(cap));
        }

        let headers = response.headers().clone();
        // Content-Length may be absent or wrong; count what actually arrives
        let mut body = BytesMut::new();
        while let Some(chunk) = response.chunk().await? {
            if body.len() as u64 + chunk.len() as u64 > cap {
                return Err(FetchFailure::TooLarge(cap));
            }
            body.extend_from_slice(&chunk);
        }
        if body.is_empty() {
            return Err(FetchFailure::EmptyBody);
        }
        Ok((body.freeze(), headers))
    }

    fn is_disallowed(&self, headers: &HeaderMap) -> bool {
        if self.disallowed.is_empty() {
            return false;
        }
        headers
            .get_all(ROBOTS_HEADER)
            .iter()
            .flat_map(robots_directives)
            .any(|directive| self.disallowed.contains(&directive))
    }
}

/// Directives of one `X-Robots-Tag` value, lowercased.
///
/// An optional user-agent prefix (`googlebot: noindex`) is dropped.
pub fn robots_directives(value: &HeaderValue) -> Vec<String> {
    let raw = String::from_utf8_lossy(value.as_bytes());
    let directives = raw.split_once(':').map_or(raw.as_ref(), |(_, rest)| rest);
    directives
        .split(',')
        .map(|d| d.trim().to_lowercase())
        .filter(|d| !d.is_empty())
        .collect()
}
