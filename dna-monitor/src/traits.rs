use async_trait::async_trait;

use crate::types::{CandidateItem, ExtractionError, FetchError};

/// Retrieves and parses one syndication feed.
#[async_trait]
pub trait FeedSource: Send + Sync {
    /// Items in feed order. Malformed entries are dropped individually;
    /// only a feed with nothing usable is an error.
    async fn fetch(&self, source_id: &str, feed_url: &str) -> Result<Vec<CandidateItem>, FetchError>;
}

/// Retrieves the HTML body of an item's page.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(&self, url: &str) -> Result<String, ExtractionError>;
}
