use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use interfaces::{
    CycleOutcome, CycleResult, ExtractionProfile, Measurements, ProfileStatus, SeenRecord,
    SourceRecord, Store, StoreError, TitlePattern, TitleProfile,
};

/// One entry of a fetched feed, in feed order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateItem {
    pub source_id: String,
    pub item_id: String,
    pub title: String,
    pub link: String,
    pub published_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub user_agent: String,
    pub timeout_seconds: u64,
    pub max_feed_size_mb: usize,
    pub max_page_size_mb: usize,
    pub max_redirects: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            user_agent: "Mozilla/5.0 (compatible; DnaMonitor/1.0)".to_string(),
            timeout_seconds: 15,
            max_feed_size_mb: 10,
            max_page_size_mb: 10,
            max_redirects: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Minimum spacing between two permits for the same host.
    pub min_interval: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(1),
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub worker_count: usize,
    pub queue_capacity: usize,
    pub extraction_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_count: 10,
            queue_capacity: 100,
            extraction_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Spacing between cycle starts. An overrunning cycle is followed
    /// immediately by the next one.
    pub cycle_interval: Duration,
    pub batch_size: usize,
    pub max_consecutive_failures: u32,
    /// Bounds the fetch, limiter waits and pool handoffs of one source.
    pub source_deadline: Duration,
    /// Seen-item retention; `None` keeps everything.
    pub retention: Option<chrono::Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            cycle_interval: Duration::from_secs(60),
            batch_size: 20,
            max_consecutive_failures: 5,
            source_deadline: Duration::from_secs(60),
            retention: None,
        }
    }
}

/// Content-region and measurement heuristics.
#[derive(Debug, Clone)]
pub struct ExtractionConfig {
    pub content_candidates: Vec<String>,
    pub excluded_tags: Vec<String>,
    pub min_region_text_len: usize,
    pub depth_weight: f64,
    pub min_image_width: u32,
    pub min_image_height: u32,
    pub max_tags: usize,
    /// Pages nesting elements deeper than this are refused
    pub max_nesting_depth: usize,
    /// Pages with more DOM nodes than this are refused
    pub max_nodes: usize,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            content_candidates: ["article", "main", "[role=main]", "section", "div"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            excluded_tags: ["script", "style", "noscript", "template", "svg", "head"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            min_region_text_len: 200,
            depth_weight: 0.5,
            min_image_width: 200,
            min_image_height: 100,
            max_tags: 10,
            max_nesting_depth: 512,
            max_nodes: 200_000,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MonitorConfig {
    pub fetch: FetchConfig,
    pub rate_limit: RateLimitConfig,
    pub pool: PoolConfig,
    pub scheduler: SchedulerConfig,
    pub extraction: ExtractionConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("Feed fetch timed out after {0:?}")]
    Timeout(Duration),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Feed parse error: {0}")]
    Parse(String),

    /// The host is backing off past this poll's deadline. Says nothing about
    /// the feed itself.
    #[error("{0}")]
    RateLimited(RateLimitExceeded),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExtractionError {
    #[error("Extraction timed out after {0:?}")]
    Timeout(Duration),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Unsupported content: {0}")]
    UnsupportedContent(String),
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Seen-item ledger unavailable: {0}")]
    Unavailable(#[from] StoreError),
}

/// The next permit for `host` would start after the caller's deadline.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Rate limit for {host} not available for another {wait:?}")]
pub struct RateLimitExceeded {
    pub host: String,
    pub wait: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Invalid selector '{selector}': {reason}")]
    InvalidSelector { selector: String, reason: String },

    #[error("Source not found: {id}")]
    SourceNotFound { id: String },

    #[error("Source already registered for {feed_url}")]
    DuplicateSource { feed_url: String },

    #[error("General error: {0}")]
    General(String),
}

pub type Result<T> = std::result::Result<T, MonitorError>;
