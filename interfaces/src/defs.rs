use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::StoreError;

/// A syndication feed the monitor polls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub id: String,
    pub feed_url: String,
    pub domain: String,
    pub niche: Option<String>,
    pub active: bool,
    pub last_success_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeenRecord {
    pub source_id: String,
    pub item_id: String,
    pub seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileStatus {
    Complete,
    Partial,
    Failed,
}

impl ProfileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProfileStatus::Complete => "complete",
            ProfileStatus::Partial => "partial",
            ProfileStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ProfileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProfileStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "complete" => Ok(ProfileStatus::Complete),
            "partial" => Ok(ProfileStatus::Partial),
            "failed" => Ok(ProfileStatus::Failed),
            other => Err(StoreError::Corrupt(format!("unknown profile status '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TitlePattern {
    NumberFirst,
    Question,
    Authority,
    Superlative,
    Generic,
}

impl TitlePattern {
    pub fn as_str(&self) -> &'static str {
        match self {
            TitlePattern::NumberFirst => "number_first",
            TitlePattern::Question => "question",
            TitlePattern::Authority => "authority",
            TitlePattern::Superlative => "superlative",
            TitlePattern::Generic => "generic",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TitleProfile {
    pub length: usize,
    pub has_number: bool,
    pub has_question: bool,
    pub has_superlative: bool,
    pub pattern: TitlePattern,
}

/// Structural measurements of one page. `image_count` is `None` when no
/// content region could be identified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurements {
    pub word_count: u32,
    pub image_count: Option<u32>,
    pub has_structured_data: bool,
    pub schema_types: Vec<String>,
    pub heading_sequence: Vec<u8>,
    pub title: TitleProfile,
    pub meta_description_length: Option<usize>,
    pub internal_links: u32,
    pub external_links: u32,
    pub video_count: u32,
    pub mobile_optimized: bool,
    pub image_format: Option<String>,
    pub uses_webp: bool,
    pub author: Option<String>,
    pub category: Option<String>,
    pub tags: Vec<String>,
}

impl Measurements {
    pub fn heading_count(&self, level: u8) -> usize {
        self.heading_sequence.iter().filter(|l| **l == level).count()
    }
}

/// The terminal record for one dispatched item. Measurements are absent
/// exactly when the status is `Failed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionProfile {
    pub source_id: String,
    pub item_id: String,
    pub link: String,
    pub title: String,
    pub domain: String,
    pub niche: Option<String>,
    pub cycle_sequence: u64,
    pub published_at: Option<DateTime<Utc>>,
    pub extracted_at: DateTime<Utc>,
    pub status: ProfileStatus,
    pub failure_reason: Option<String>,
    pub measurements: Option<Measurements>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CycleOutcome {
    Completed,
    LedgerUnavailable { reason: String },
}

impl CycleOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleOutcome::Completed => "completed",
            CycleOutcome::LedgerUnavailable { .. } => "ledger_unavailable",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleResult {
    pub sequence: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources_polled: usize,
    pub sources_failed: usize,
    pub sources_deactivated: usize,
    pub items_found: usize,
    pub items_new: usize,
    pub items_failed: usize,
    pub outcome: CycleOutcome,
}

// Every method is a single round trip; implementations must be safe to call
// from many tasks at once.
#[async_trait]
pub trait Store: Send + Sync {
    async fn load_sources(&self) -> Result<Vec<SourceRecord>, StoreError>;
    async fn upsert_source(&self, source: &SourceRecord) -> Result<(), StoreError>;

    async fn load_seen_records(&self, source_id: &str) -> Result<Vec<SeenRecord>, StoreError>;
    async fn persist_seen(&self, record: &SeenRecord) -> Result<(), StoreError>;
    /// Removes seen records older than the cutoff, returning how many went.
    async fn prune_seen(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Upsert keyed by (source id, item id).
    async fn persist_profile(&self, profile: &ExtractionProfile) -> Result<(), StoreError>;
    async fn load_profiles(&self, since: DateTime<Utc>) -> Result<Vec<ExtractionProfile>, StoreError>;

    async fn persist_cycle(&self, cycle: &CycleResult) -> Result<(), StoreError>;
    async fn last_cycle_sequence(&self) -> Result<Option<u64>, StoreError>;
}
