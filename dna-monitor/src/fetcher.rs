use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::parser::FeedParser;
use crate::rate_limiter::{host_key, HostRateLimiter};
use crate::traits::{FeedSource, PageSource};
use crate::types::{CandidateItem, ExtractionError, FetchConfig, FetchError, Result};

enum DownloadError {
    Status(StatusCode),
    Transport(reqwest::Error),
    TooLarge { size_mb: u64 },
    Unsupported(String),
}

impl DownloadError {
    /// Failures that say something about the host's health, as opposed to
    /// the particular document.
    fn is_host_fault(&self) -> bool {
        match self {
            DownloadError::Status(status) => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            DownloadError::Transport(_) => true,
            DownloadError::TooLarge { .. } | DownloadError::Unsupported(_) => false,
        }
    }
}

fn describe_status(status: StatusCode) -> String {
    format!(
        "HTTP {}: {}",
        status.as_u16(),
        status.canonical_reason().unwrap_or("Unknown")
    )
}

/// HTTP client for feeds and item pages. Every request goes through the
/// shared per-host limiter.
pub struct Fetcher {
    client: Client,
    config: FetchConfig,
    limiter: Arc<HostRateLimiter>,
}

impl Fetcher {
    pub fn new(config: FetchConfig, limiter: Arc<HostRateLimiter>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(config.timeout_seconds))
            .gzip(true)
            .deflate(true)
            .brotli(true)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()?;

        Ok(Self {
            client,
            config,
            limiter,
        })
    }

    pub fn limiter(&self) -> &Arc<HostRateLimiter> {
        &self.limiter
    }

    async fn download(
        &self,
        url: &str,
        max_size_mb: usize,
        require_html: bool,
    ) -> std::result::Result<String, DownloadError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(DownloadError::Transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::Status(status));
        }

        if require_html {
            let content_type = response
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok());
            check_content_type(content_type)?;
        }
        check_size(response.content_length(), max_size_mb)?;

        response.text().await.map_err(DownloadError::Transport)
    }
}

/// Pages must be markup; a missing header is given the benefit of the doubt.
fn check_content_type(content_type: Option<&str>) -> std::result::Result<(), DownloadError> {
    match content_type.map(str::to_ascii_lowercase) {
        Some(kind) if !kind.contains("html") && !kind.contains("xml") => {
            Err(DownloadError::Unsupported(kind))
        }
        _ => Ok(()),
    }
}

fn check_size(content_length: Option<u64>, max_size_mb: usize) -> std::result::Result<(), DownloadError> {
    match content_length.map(|len| len / (1024 * 1024)) {
        Some(size_mb) if size_mb > max_size_mb as u64 => Err(DownloadError::TooLarge { size_mb }),
        _ => Ok(()),
    }
}

fn feed_error(error: DownloadError, timeout: Duration) -> FetchError {
    match error {
        DownloadError::Status(status) => FetchError::Network(describe_status(status)),
        DownloadError::Transport(e) if e.is_timeout() => FetchError::Timeout(timeout),
        DownloadError::Transport(e) => FetchError::Network(e.to_string()),
        DownloadError::TooLarge { size_mb } => FetchError::Network(format!("Feed too large: {}MB", size_mb)),
        DownloadError::Unsupported(kind) => FetchError::Parse(kind),
    }
}

fn page_error(error: DownloadError, timeout: Duration) -> ExtractionError {
    match error {
        DownloadError::Status(status) => ExtractionError::Network(describe_status(status)),
        DownloadError::Transport(e) if e.is_timeout() => ExtractionError::Timeout(timeout),
        DownloadError::Transport(e) => ExtractionError::Network(e.to_string()),
        DownloadError::TooLarge { size_mb } => {
            ExtractionError::UnsupportedContent(format!("page too large: {}MB", size_mb))
        }
        DownloadError::Unsupported(kind) => ExtractionError::UnsupportedContent(kind),
    }
}

#[async_trait]
impl FeedSource for Fetcher {
    async fn fetch(&self, source_id: &str, feed_url: &str) -> std::result::Result<Vec<CandidateItem>, FetchError> {
        let timeout = Duration::from_secs(self.config.timeout_seconds);
        let deadline = Instant::now() + timeout;
        let host = host_key(feed_url);

        let permit = self
            .limiter
            .acquire_until(&host, deadline)
            .await
            .map_err(|e| {
                info!("Feed {} skipped while its host backs off: {}", feed_url, e);
                FetchError::RateLimited(e)
            })?;

        let started = Instant::now();
        let body = match tokio::time::timeout_at(
            deadline,
            self.download(feed_url, self.config.max_feed_size_mb, false),
        )
        .await
        {
            Err(_) => {
                permit.failure();
                return Err(FetchError::Timeout(timeout));
            }
            Ok(Err(e)) => {
                if e.is_host_fault() {
                    permit.failure();
                } else {
                    permit.success();
                }
                return Err(feed_error(e, timeout));
            }
            Ok(Ok(body)) => {
                permit.success();
                body
            }
        };

        let feed = FeedParser::parse(&body);
        if feed.malformed > 0 || feed.syntax_error.is_some() {
            warn!(
                "Feed {} partially malformed: {} entries dropped, syntax error: {:?}",
                feed_url, feed.malformed, feed.syntax_error
            );
        }
        let items = feed.into_candidates(source_id)?;
        info!(
            "Fetched feed {} ({} bytes, {} items) in {:?}",
            feed_url,
            body.len(),
            items.len(),
            started.elapsed()
        );
        Ok(items)
    }
}

#[async_trait]
impl PageSource for Fetcher {
    async fn fetch_page(&self, url: &str) -> std::result::Result<String, ExtractionError> {
        let host = host_key(url);
        let permit = self.limiter.acquire(&host).await;

        match self.download(url, self.config.max_page_size_mb, true).await {
            Ok(body) => {
                permit.success();
                debug!("Fetched page {} ({} bytes)", url, body.len());
                Ok(body)
            }
            Err(e) => {
                if e.is_host_fault() {
                    permit.failure();
                } else {
                    permit.success();
                }
                Err(page_error(e, Duration::from_secs(self.config.timeout_seconds)))
            }
        }
    }
}
