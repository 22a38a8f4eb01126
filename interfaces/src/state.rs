use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;

use crate::defs::{
    CycleResult, ExtractionProfile, ProfileStatus, SeenRecord, SourceRecord, Store,
};
use crate::StoreError;

/// SQLite-backed [`Store`]. Schema lives in `migrations/` and is applied on
/// connect.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

        // An in-memory database exists per connection, so it must never be
        // spread over more than one.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    pub async fn in_memory() -> Result<Self, StoreError> {
        Self::connect("sqlite::memory:").await
    }
}

fn source_from_row(row: &SqliteRow) -> Result<SourceRecord, sqlx::Error> {
    Ok(SourceRecord {
        id: row.try_get("id")?,
        feed_url: row.try_get("feed_url")?,
        domain: row.try_get("domain")?,
        niche: row.try_get("niche")?,
        active: row.try_get("active")?,
        last_success_at: row.try_get("last_success_at")?,
        consecutive_failures: row.try_get::<i64, _>("consecutive_failures")? as u32,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
    })
}

fn profile_from_row(row: &SqliteRow) -> Result<ExtractionProfile, StoreError> {
    let status: String = row.try_get("status")?;
    let measurements: Option<String> = row.try_get("measurements")?;

    Ok(ExtractionProfile {
        source_id: row.try_get("source_id")?,
        item_id: row.try_get("item_id")?,
        link: row.try_get("link")?,
        title: row.try_get("title")?,
        domain: row.try_get("domain")?,
        niche: row.try_get("niche")?,
        cycle_sequence: row.try_get::<i64, _>("cycle_sequence")? as u64,
        published_at: row.try_get("published_at")?,
        extracted_at: row.try_get("extracted_at")?,
        status: ProfileStatus::from_str(&status)?,
        failure_reason: row.try_get("failure_reason")?,
        measurements: measurements
            .map(|json| serde_json::from_str(&json))
            .transpose()?,
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn load_sources(&self) -> Result<Vec<SourceRecord>, StoreError> {
        let rows = sqlx::query("SELECT * FROM sources ORDER BY created_at, id")
            .fetch_all(&self.pool)
            .await?;
        let sources = rows.iter().map(source_from_row).collect::<Result<Vec<_>, _>>()?;
        Ok(sources)
    }

    async fn upsert_source(&self, source: &SourceRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sources
                (id, feed_url, domain, niche, active, last_success_at, consecutive_failures, last_error, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT (id) DO UPDATE SET
                feed_url = excluded.feed_url,
                domain = excluded.domain,
                niche = excluded.niche,
                active = excluded.active,
                last_success_at = excluded.last_success_at,
                consecutive_failures = excluded.consecutive_failures,
                last_error = excluded.last_error
            "#,
        )
        .bind(&source.id)
        .bind(&source.feed_url)
        .bind(&source.domain)
        .bind(&source.niche)
        .bind(source.active)
        .bind(source.last_success_at)
        .bind(source.consecutive_failures as i64)
        .bind(&source.last_error)
        .bind(source.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_seen_records(&self, source_id: &str) -> Result<Vec<SeenRecord>, StoreError> {
        let rows = sqlx::query("SELECT source_id, item_id, seen_at FROM seen_items WHERE source_id = ?1")
            .bind(source_id)
            .fetch_all(&self.pool)
            .await?;

        let records = rows
            .into_iter()
            .map(|row| {
                Ok(SeenRecord {
                    source_id: row.try_get("source_id")?,
                    item_id: row.try_get("item_id")?,
                    seen_at: row.try_get("seen_at")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()?;
        Ok(records)
    }

    async fn persist_seen(&self, record: &SeenRecord) -> Result<(), StoreError> {
        sqlx::query("INSERT OR IGNORE INTO seen_items (source_id, item_id, seen_at) VALUES (?1, ?2, ?3)")
            .bind(&record.source_id)
            .bind(&record.item_id)
            .bind(record.seen_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn prune_seen(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM seen_items WHERE seen_at < ?1")
            .bind(older_than)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn persist_profile(&self, profile: &ExtractionProfile) -> Result<(), StoreError> {
        let measurements = profile
            .measurements
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO profiles
                (source_id, item_id, link, title, domain, niche, cycle_sequence, published_at,
                 extracted_at, status, failure_reason, measurements)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
        )
        .bind(&profile.source_id)
        .bind(&profile.item_id)
        .bind(&profile.link)
        .bind(&profile.title)
        .bind(&profile.domain)
        .bind(&profile.niche)
        .bind(profile.cycle_sequence as i64)
        .bind(profile.published_at)
        .bind(profile.extracted_at)
        .bind(profile.status.as_str())
        .bind(&profile.failure_reason)
        .bind(measurements)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_profiles(&self, since: DateTime<Utc>) -> Result<Vec<ExtractionProfile>, StoreError> {
        let rows = sqlx::query("SELECT * FROM profiles WHERE extracted_at >= ?1 ORDER BY extracted_at")
            .bind(since)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(profile_from_row).collect()
    }

    async fn persist_cycle(&self, cycle: &CycleResult) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO cycles
                (sequence, started_at, finished_at, sources_polled, sources_failed, sources_deactivated,
                 items_found, items_new, items_failed, outcome)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )
        .bind(cycle.sequence as i64)
        .bind(cycle.started_at)
        .bind(cycle.finished_at)
        .bind(cycle.sources_polled as i64)
        .bind(cycle.sources_failed as i64)
        .bind(cycle.sources_deactivated as i64)
        .bind(cycle.items_found as i64)
        .bind(cycle.items_new as i64)
        .bind(cycle.items_failed as i64)
        .bind(serde_json::to_string(&cycle.outcome)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn last_cycle_sequence(&self) -> Result<Option<u64>, StoreError> {
        let last: Option<i64> = sqlx::query_scalar("SELECT MAX(sequence) FROM cycles")
            .fetch_one(&self.pool)
            .await?;
        Ok(last.map(|s| s as u64))
    }
}

