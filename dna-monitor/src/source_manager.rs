use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{error, info, warn};
use url::Url;
use uuid::Uuid;

use crate::types::{MonitorError, Result, SourceRecord, Store};

/// Health after recording one fetch outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceHealth {
    Active,
    Degraded { failures: u32 },
    /// This failure crossed the threshold; the source is now inactive.
    Deactivated,
    /// Already inactive before this outcome was recorded.
    Inactive,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealthSummary {
    pub active: usize,
    pub degraded: usize,
    pub inactive: usize,
}

/// Owns the source list and every per-source failure counter. All counter
/// updates go through this type.
///
/// A record whose latest state has not reached the store yet is dirty. Reloads
/// keep the in-memory value for dirty records, and every refresh retries
/// writing them first.
pub struct SourceManager {
    store: Arc<dyn Store>,
    max_consecutive_failures: u32,
    sources: Mutex<HashMap<String, SourceRecord>>,
    dirty: Mutex<HashSet<String>>,
}

impl SourceManager {
    pub fn new(store: Arc<dyn Store>, max_consecutive_failures: u32) -> Self {
        Self {
            store,
            max_consecutive_failures: max_consecutive_failures.max(1),
            sources: Mutex::new(HashMap::new()),
            dirty: Mutex::new(HashSet::new()),
        }
    }

    /// Reloads the source list and returns the active sources in
    /// registration order. A failed load keeps serving the last known list.
    pub async fn refresh(&self) -> Vec<SourceRecord> {
        self.flush_dirty().await;

        match self.store.load_sources().await {
            Ok(loaded) => {
                let mut sources = self.lock();
                let dirty = self.dirty_lock();
                let unsaved: Vec<SourceRecord> = dirty
                    .iter()
                    .filter_map(|id| sources.get(id).cloned())
                    .collect();
                sources.clear();
                sources.extend(loaded.into_iter().map(|s| (s.id.clone(), s)));
                sources.extend(unsaved.into_iter().map(|s| (s.id.clone(), s)));
            }
            Err(e) => warn!("Could not reload sources, using cached list: {}", e),
        }

        let mut active: Vec<SourceRecord> = self.lock().values().filter(|s| s.active).cloned().collect();
        active.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        active
    }

    pub async fn record_success(&self, source_id: &str) -> Result<SourceHealth> {
        let (record, health) = {
            let mut sources = self.lock();
            let source = sources
                .get_mut(source_id)
                .ok_or_else(|| MonitorError::SourceNotFound { id: source_id.to_string() })?;

            if !source.active {
                return Ok(SourceHealth::Inactive);
            }
            if source.consecutive_failures > 0 {
                info!(
                    "Source {} recovered after {} failures",
                    source.feed_url, source.consecutive_failures
                );
            }
            source.consecutive_failures = 0;
            source.last_error = None;
            source.last_success_at = Some(Utc::now());
            self.dirty_lock().insert(source.id.clone());
            (source.clone(), SourceHealth::Active)
        };

        self.persist(&record).await;
        Ok(health)
    }

    pub async fn record_failure(&self, source_id: &str, error: &str) -> Result<SourceHealth> {
        let (record, health) = {
            let mut sources = self.lock();
            let source = sources
                .get_mut(source_id)
                .ok_or_else(|| MonitorError::SourceNotFound { id: source_id.to_string() })?;

            if !source.active {
                return Ok(SourceHealth::Inactive);
            }
            source.consecutive_failures += 1;
            source.last_error = Some(error.to_string());

            let health = if source.consecutive_failures >= self.max_consecutive_failures {
                source.active = false;
                error!(
                    "Deactivating source {} after {} consecutive failures: {}",
                    source.feed_url, source.consecutive_failures, error
                );
                SourceHealth::Deactivated
            } else {
                warn!(
                    "Source {} failed ({}/{}): {}",
                    source.feed_url, source.consecutive_failures, self.max_consecutive_failures, error
                );
                SourceHealth::Degraded {
                    failures: source.consecutive_failures,
                }
            };
            self.dirty_lock().insert(source.id.clone());
            (source.clone(), health)
        };

        self.persist(&record).await;
        Ok(health)
    }

    pub async fn register(&self, feed_url: &str, domain: Option<&str>, niche: Option<&str>) -> Result<SourceRecord> {
        let url = validate_feed_url(feed_url)?;

        self.refresh().await;
        if self.lock().values().any(|s| s.feed_url == url.as_str()) {
            return Err(MonitorError::DuplicateSource {
                feed_url: url.to_string(),
            });
        }

        let domain = match domain {
            Some(d) => d.to_string(),
            None => url
                .host_str()
                .map(|h| h.trim_start_matches("www.").to_string())
                .unwrap_or_default(),
        };

        let record = SourceRecord {
            id: Uuid::new_v4().to_string(),
            feed_url: url.to_string(),
            domain,
            niche: niche.map(str::to_string),
            active: true,
            last_success_at: None,
            consecutive_failures: 0,
            last_error: None,
            created_at: Utc::now(),
        };

        self.store.upsert_source(&record).await?;
        self.lock().insert(record.id.clone(), record.clone());
        info!("Registered source {} ({}) with ID {}", record.feed_url, record.domain, record.id);
        Ok(record)
    }

    /// Manual recovery for a source the failure threshold switched off.
    pub async fn reactivate(&self, source_id: &str) -> Result<SourceRecord> {
        self.refresh().await;
        let record = {
            let mut sources = self.lock();
            let source = sources
                .get_mut(source_id)
                .ok_or_else(|| MonitorError::SourceNotFound { id: source_id.to_string() })?;
            source.active = true;
            source.consecutive_failures = 0;
            source.last_error = None;
            source.clone()
        };

        self.store.upsert_source(&record).await?;
        self.dirty_lock().remove(&record.id);
        info!("Reactivated source {}", record.feed_url);
        Ok(record)
    }

    /// Every known source, active or not.
    pub async fn list(&self) -> Result<Vec<SourceRecord>> {
        let mut sources = self.store.load_sources().await?;
        sources.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(sources)
    }

    pub fn get(&self, source_id: &str) -> Option<SourceRecord> {
        self.lock().get(source_id).cloned()
    }

    pub fn health_summary(&self) -> HealthSummary {
        let sources = self.lock();
        let mut summary = HealthSummary::default();
        for source in sources.values() {
            if !source.active {
                summary.inactive += 1;
            } else if source.consecutive_failures > 0 {
                summary.degraded += 1;
            } else {
                summary.active += 1;
            }
        }
        summary
    }

    // A failed write leaves the record dirty for the next refresh to retry.
    async fn persist(&self, record: &SourceRecord) -> bool {
        match self.store.upsert_source(record).await {
            Ok(()) => {
                self.dirty_lock().remove(&record.id);
                true
            }
            Err(e) => {
                error!("Failed to persist state of source {}: {}", record.id, e);
                false
            }
        }
    }

    async fn flush_dirty(&self) {
        let pending: Vec<SourceRecord> = {
            let sources = self.lock();
            let dirty = self.dirty_lock();
            dirty.iter().filter_map(|id| sources.get(id).cloned()).collect()
        };
        for record in pending {
            if self.persist(&record).await {
                info!("Saved pending state of source {}", record.feed_url);
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, SourceRecord>> {
        self.sources.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn dirty_lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.dirty.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub fn validate_feed_url(feed_url: &str) -> Result<Url> {
    let url = Url::parse(feed_url.trim())?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(MonitorError::General(format!(
            "Feed URL must be http or https: {}",
            feed_url
        )));
    }
    if url.host_str().is_none() {
        return Err(MonitorError::General(format!("Feed URL has no host: {}", feed_url)));
    }
    Ok(url)
}
