use chrono::{Duration, Utc};
use interfaces::{
    CycleOutcome, CycleResult, ExtractionProfile, MemoryStore, ProfileStatus, SeenRecord,
    SourceRecord, SqliteStore, Store,
};

fn source(id: &str) -> SourceRecord {
    SourceRecord {
        id: id.to_string(),
        feed_url: format!("https://{}.example.com/feed.xml", id),
        domain: format!("{}.example.com", id),
        niche: Some("science".to_string()),
        active: true,
        last_success_at: None,
        consecutive_failures: 0,
        last_error: None,
        created_at: Utc::now(),
    }
}

fn failed_profile(source_id: &str, item_id: &str, cycle_sequence: u64) -> ExtractionProfile {
    ExtractionProfile {
        source_id: source_id.to_string(),
        item_id: item_id.to_string(),
        link: format!("https://example.com/{}", item_id),
        title: "Title".to_string(),
        domain: "example.com".to_string(),
        niche: None,
        cycle_sequence,
        published_at: None,
        extracted_at: Utc::now(),
        status: ProfileStatus::Failed,
        failure_reason: Some("HTTP 500".to_string()),
        measurements: None,
    }
}

fn cycle(sequence: u64) -> CycleResult {
    CycleResult {
        sequence,
        started_at: Utc::now(),
        finished_at: Utc::now(),
        sources_polled: 2,
        sources_failed: 1,
        sources_deactivated: 0,
        items_found: 4,
        items_new: 3,
        items_failed: 0,
        outcome: CycleOutcome::LedgerUnavailable { reason: "disk".to_string() },
    }
}

async fn exercise(store: &dyn Store) -> anyhow::Result<()> {
    let mut a = source("a");
    store.upsert_source(&a).await?;
    store.upsert_source(&source("b")).await?;

    a.consecutive_failures = 3;
    a.last_error = Some("timeout".to_string());
    store.upsert_source(&a).await?;

    let sources = store.load_sources().await?;
    assert_eq!(sources.len(), 2);
    let loaded = sources.iter().find(|s| s.id == "a").unwrap();
    assert_eq!(loaded.consecutive_failures, 3);
    assert_eq!(loaded.last_error.as_deref(), Some("timeout"));

    let old = SeenRecord {
        source_id: "a".to_string(),
        item_id: "old".to_string(),
        seen_at: Utc::now() - Duration::days(30),
    };
    let fresh = SeenRecord {
        source_id: "a".to_string(),
        item_id: "fresh".to_string(),
        seen_at: Utc::now(),
    };
    store.persist_seen(&old).await?;
    store.persist_seen(&fresh).await?;
    store.persist_seen(&fresh).await?;
    assert_eq!(store.load_seen_records("a").await?.len(), 2);
    assert!(store.load_seen_records("b").await?.is_empty());

    let pruned = store.prune_seen(Utc::now() - Duration::days(7)).await?;
    assert_eq!(pruned, 1);
    let remaining = store.load_seen_records("a").await?;
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].item_id, "fresh");

    // Re-emitting a profile replaces it.
    store.persist_profile(&failed_profile("a", "x", 1)).await?;
    store.persist_profile(&failed_profile("a", "x", 2)).await?;
    let profiles = store.load_profiles(Utc::now() - Duration::hours(1)).await?;
    assert_eq!(profiles.len(), 1);
    assert_eq!(profiles[0].cycle_sequence, 2);
    assert_eq!(profiles[0].status, ProfileStatus::Failed);
    assert!(profiles[0].measurements.is_none());

    assert_eq!(store.last_cycle_sequence().await?, None);
    store.persist_cycle(&cycle(1)).await?;
    store.persist_cycle(&cycle(2)).await?;
    assert_eq!(store.last_cycle_sequence().await?, Some(2));

    Ok(())
}

#[tokio::test]
async fn test_sqlite_store_contract() -> anyhow::Result<()> {
    let store = SqliteStore::in_memory().await?;
    exercise(&store).await
}

#[tokio::test]
async fn test_memory_store_contract() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    exercise(&store).await
}

#[tokio::test]
async fn test_memory_store_failure_injection() {
    let store = MemoryStore::new();
    store.set_fail_writes(true);
    let record = SeenRecord {
        source_id: "a".to_string(),
        item_id: "1".to_string(),
        seen_at: Utc::now(),
    };
    assert!(store.persist_seen(&record).await.is_err());
    assert_eq!(store.seen_count(), 0);

    store.set_fail_writes(false);
    store.set_fail_reads(true);
    assert!(store.load_sources().await.is_err());
}
