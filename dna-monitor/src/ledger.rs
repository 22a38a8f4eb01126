use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};

use crate::types::{LedgerError, SeenRecord, Store};

type SeenSet = HashMap<String, DateTime<Utc>>;

// `None` until the source has been warm-started from storage.
type SourceSlot = Arc<AsyncMutex<Option<SeenSet>>>;

/// Durable record of which items have already been dispatched, per source.
///
/// Each source has its own lock, so check-and-set on one source never waits
/// on storage traffic for another.
pub struct SeenLedger {
    store: Arc<dyn Store>,
    sources: Mutex<HashMap<String, SourceSlot>>,
}

impl SeenLedger {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            sources: Mutex::new(HashMap::new()),
        }
    }

    pub async fn is_seen(&self, source_id: &str, item_id: &str) -> Result<bool, LedgerError> {
        let slot = self.slot(source_id);
        let mut guard = slot.lock().await;
        let seen = self.loaded(&mut guard, source_id).await?;
        Ok(seen.contains_key(item_id))
    }

    /// Atomic check-and-set. Returns `true` only for the first caller for a
    /// given (source, item), and only once the record is durable. A failed
    /// write leaves the item unseen.
    pub async fn mark_seen(&self, source_id: &str, item_id: &str) -> Result<bool, LedgerError> {
        let slot = self.slot(source_id);
        let mut guard = slot.lock().await;
        let seen = self.loaded(&mut guard, source_id).await?;

        if seen.contains_key(item_id) {
            return Ok(false);
        }

        let record = SeenRecord {
            source_id: source_id.to_string(),
            item_id: item_id.to_string(),
            seen_at: Utc::now(),
        };
        self.store.persist_seen(&record).await?;
        seen.insert(record.item_id, record.seen_at);
        Ok(true)
    }

    /// Drops entries older than `max_age` from memory and storage.
    pub async fn prune(&self, max_age: chrono::Duration) -> Result<u64, LedgerError> {
        let cutoff = Utc::now() - max_age;
        let removed = self.store.prune_seen(cutoff).await?;

        let slots: Vec<SourceSlot> = self.lock_sources().values().cloned().collect();
        for slot in slots {
            if let Some(seen) = slot.lock().await.as_mut() {
                seen.retain(|_, seen_at| *seen_at >= cutoff);
            }
        }

        if removed > 0 {
            info!("Pruned {} seen items older than {}", removed, cutoff);
        }
        Ok(removed)
    }

    pub fn tracked_sources(&self) -> usize {
        self.lock_sources().len()
    }

    fn slot(&self, source_id: &str) -> SourceSlot {
        self.lock_sources()
            .entry(source_id.to_string())
            .or_default()
            .clone()
    }

    async fn loaded<'a>(
        &self,
        guard: &'a mut Option<SeenSet>,
        source_id: &str,
    ) -> Result<&'a mut SeenSet, LedgerError> {
        if guard.is_none() {
            let records = self.store.load_seen_records(source_id).await?;
            debug!("Warm-started {} seen items for source {}", records.len(), source_id);
            *guard = Some(
                records
                    .into_iter()
                    .map(|r| (r.item_id, r.seen_at))
                    .collect(),
            );
        }
        Ok(guard.get_or_insert_with(HashMap::new))
    }

    fn lock_sources(&self) -> std::sync::MutexGuard<'_, HashMap<String, SourceSlot>> {
        self.sources.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
