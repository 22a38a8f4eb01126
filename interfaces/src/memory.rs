use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::defs::{CycleResult, ExtractionProfile, SeenRecord, SourceRecord, Store};
use crate::StoreError;

#[derive(Default)]
struct Tables {
    sources: Vec<SourceRecord>,
    seen: HashMap<(String, String), DateTime<Utc>>,
    profiles: HashMap<(String, String), ExtractionProfile>,
    cycles: BTreeMap<u64, CycleResult>,
}

/// Process-local [`Store`]. Reads and writes can be made to fail on demand,
/// which is how callers exercise their storage-outage paths.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sources(sources: Vec<SourceRecord>) -> Self {
        let store = Self::default();
        store.lock().sources = sources;
        store
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn sources(&self) -> Vec<SourceRecord> {
        self.lock().sources.clone()
    }

    pub fn profiles(&self) -> Vec<ExtractionProfile> {
        self.lock().profiles.values().cloned().collect()
    }

    pub fn cycles(&self) -> Vec<CycleResult> {
        self.lock().cycles.values().cloned().collect()
    }

    pub fn seen_count(&self) -> usize {
        self.lock().seen.len()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_read(&self) -> Result<(), StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("reads disabled".to_string()));
        }
        Ok(())
    }

    fn check_write(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("writes disabled".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn load_sources(&self) -> Result<Vec<SourceRecord>, StoreError> {
        self.check_read()?;
        Ok(self.lock().sources.clone())
    }

    async fn upsert_source(&self, source: &SourceRecord) -> Result<(), StoreError> {
        self.check_write()?;
        let mut tables = self.lock();
        match tables.sources.iter_mut().find(|s| s.id == source.id) {
            Some(existing) => *existing = source.clone(),
            None => tables.sources.push(source.clone()),
        }
        Ok(())
    }

    async fn load_seen_records(&self, source_id: &str) -> Result<Vec<SeenRecord>, StoreError> {
        self.check_read()?;
        Ok(self
            .lock()
            .seen
            .iter()
            .filter(|((source, _), _)| source == source_id)
            .map(|((source, item), seen_at)| SeenRecord {
                source_id: source.clone(),
                item_id: item.clone(),
                seen_at: *seen_at,
            })
            .collect())
    }

    async fn persist_seen(&self, record: &SeenRecord) -> Result<(), StoreError> {
        self.check_write()?;
        self.lock()
            .seen
            .entry((record.source_id.clone(), record.item_id.clone()))
            .or_insert(record.seen_at);
        Ok(())
    }

    async fn prune_seen(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        self.check_write()?;
        let mut tables = self.lock();
        let before = tables.seen.len();
        tables.seen.retain(|_, seen_at| *seen_at >= older_than);
        Ok((before - tables.seen.len()) as u64)
    }

    async fn persist_profile(&self, profile: &ExtractionProfile) -> Result<(), StoreError> {
        self.check_write()?;
        self.lock().profiles.insert(
            (profile.source_id.clone(), profile.item_id.clone()),
            profile.clone(),
        );
        Ok(())
    }

    async fn load_profiles(&self, since: DateTime<Utc>) -> Result<Vec<ExtractionProfile>, StoreError> {
        self.check_read()?;
        let mut profiles: Vec<ExtractionProfile> = self
            .lock()
            .profiles
            .values()
            .filter(|p| p.extracted_at >= since)
            .cloned()
            .collect();
        profiles.sort_by_key(|p| p.extracted_at);
        Ok(profiles)
    }

    async fn persist_cycle(&self, cycle: &CycleResult) -> Result<(), StoreError> {
        self.check_write()?;
        self.lock().cycles.insert(cycle.sequence, cycle.clone());
        Ok(())
    }

    async fn last_cycle_sequence(&self) -> Result<Option<u64>, StoreError> {
        self.check_read()?;
        Ok(self.lock().cycles.keys().next_back().copied())
    }
}
