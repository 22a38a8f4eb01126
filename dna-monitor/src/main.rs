use anyhow::Context;
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use dna_monitor::aggregators::{summarize_by_niche, NicheScorer, PatternAggregator};
use dna_monitor::{
    AggregationSink, DnaExtractor, ExtractionPool, FanoutSink, Fetcher, HostRateLimiter,
    MonitorConfig, MonitorScheduler, SeenLedger, SourceManager, StoreSink,
};
use interfaces::{SqliteStore, Store};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Polls syndication feeds and extracts structural profiles of new articles.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// SQLite database holding sources, seen items, profiles and cycles
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite://dna-monitor.db")]
    database_url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the monitoring loop
    Run(RunArgs),
    /// Register a feed
    AddSource {
        #[arg(long)]
        feed: String,
        /// Owning domain; derived from the feed address when omitted
        #[arg(long)]
        domain: Option<String>,
        #[arg(long)]
        niche: Option<String>,
    },
    /// Re-enable a source switched off after repeated failures
    Reactivate { source_id: String },
    /// List sources with their health
    Sources,
    /// Forget seen items older than the given age
    Prune {
        #[arg(long)]
        older_than_days: i64,
    },
    /// Score niches and summarize structural patterns from stored profiles
    Report {
        #[arg(long, default_value_t = 24)]
        hours: i64,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    #[arg(long, default_value_t = 60)]
    cycle_interval_seconds: u64,

    #[arg(long, default_value_t = 20)]
    batch_size: usize,

    #[arg(long, default_value_t = 10)]
    worker_count: usize,

    #[arg(long, default_value_t = 100)]
    queue_capacity: usize,

    #[arg(long, default_value_t = 5)]
    max_consecutive_failures: u32,

    #[arg(long, default_value_t = 15)]
    fetch_timeout_seconds: u64,

    #[arg(long, default_value_t = 30)]
    extraction_timeout_seconds: u64,

    /// Keep seen items for this many days; unlimited when omitted
    #[arg(long)]
    retention_days: Option<i64>,

    /// Stop after this many cycles
    #[arg(long)]
    cycles: Option<u64>,
}

impl RunArgs {
    fn into_config(self) -> (MonitorConfig, Option<u64>) {
        let mut config = MonitorConfig::default();
        config.scheduler.cycle_interval = Duration::from_secs(self.cycle_interval_seconds);
        config.scheduler.batch_size = self.batch_size;
        config.scheduler.max_consecutive_failures = self.max_consecutive_failures;
        config.scheduler.retention = self.retention_days.map(chrono::Duration::days);
        config.pool.worker_count = self.worker_count;
        config.pool.queue_capacity = self.queue_capacity;
        config.pool.extraction_timeout = Duration::from_secs(self.extraction_timeout_seconds);
        config.fetch.timeout_seconds = self.fetch_timeout_seconds;
        (config, self.cycles)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let store = Arc::new(
        SqliteStore::connect(&cli.database_url)
            .await
            .with_context(|| format!("opening database {}", cli.database_url))?,
    );

    match cli.command {
        Command::Run(args) => {
            let (config, cycles) = args.into_config();
            run(store, config, cycles).await?;
        }
        Command::AddSource { feed, domain, niche } => {
            let manager = source_manager(store);
            let source = manager.register(&feed, domain.as_deref(), niche.as_deref()).await?;
            println!("{}\t{}\t{}", source.id, source.domain, source.feed_url);
        }
        Command::Reactivate { source_id } => {
            let manager = source_manager(store);
            let source = manager.reactivate(&source_id).await?;
            println!("Reactivated {} ({})", source.id, source.feed_url);
        }
        Command::Sources => {
            let manager = source_manager(store);
            for source in manager.list().await? {
                let state = if !source.active {
                    "inactive"
                } else if source.consecutive_failures > 0 {
                    "degraded"
                } else {
                    "active"
                };
                println!(
                    "{}\t{}\t{}\t{}\tfailures={}\t{}",
                    source.id,
                    state,
                    source.niche.as_deref().unwrap_or("-"),
                    source.feed_url,
                    source.consecutive_failures,
                    source.last_error.as_deref().unwrap_or("")
                );
            }
        }
        Command::Prune { older_than_days } => {
            let ledger = SeenLedger::new(store);
            let removed = ledger.prune(chrono::Duration::days(older_than_days)).await?;
            println!("Removed {} seen items", removed);
        }
        Command::Report { hours } => report(store.as_ref(), hours).await?,
    }

    Ok(())
}

fn source_manager(store: Arc<SqliteStore>) -> SourceManager {
    SourceManager::new(store, MonitorConfig::default().scheduler.max_consecutive_failures)
}

async fn run(store: Arc<SqliteStore>, config: MonitorConfig, cycles: Option<u64>) -> anyhow::Result<()> {
    let store: Arc<dyn Store> = store;

    let limiter = Arc::new(HostRateLimiter::new(config.rate_limit.clone()));
    let fetcher = Arc::new(Fetcher::new(config.fetch.clone(), limiter)?);
    let extractor = Arc::new(DnaExtractor::new(config.extraction.clone())?);

    let store_sink = Arc::new(StoreSink::new(store.clone()));
    let patterns = Arc::new(PatternAggregator::new());
    let sink: Arc<dyn AggregationSink> = Arc::new(
        FanoutSink::default()
            .with(store_sink.clone())
            .with(patterns.clone()),
    );

    let pool = Arc::new(ExtractionPool::start(
        config.pool.clone(),
        fetcher.clone(),
        extractor,
        sink.clone(),
    ));
    let sources = Arc::new(SourceManager::new(
        store.clone(),
        config.scheduler.max_consecutive_failures,
    ));
    let ledger = Arc::new(SeenLedger::new(store.clone()));

    let scheduler = MonitorScheduler::new(
        config.scheduler.clone(),
        sources.clone(),
        fetcher,
        ledger,
        pool.clone(),
        sink,
        store,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received; finishing the current cycle");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => error!("Failed to listen for interrupt: {}", e),
        }
    });

    scheduler.run(cycles, shutdown_rx).await;

    pool.shutdown().await;
    store_sink.close().await;

    let health = sources.health_summary();
    info!(
        "Sources: {} active, {} degraded, {} inactive",
        health.active, health.degraded, health.inactive
    );
    for summary in patterns.summaries() {
        info!(
            "Niche {}: {} profiles ({} complete, {} partial, {} failed), median words {:?}",
            summary.niche,
            summary.profiles,
            summary.complete,
            summary.partial,
            summary.failed,
            summary.word_count.map(|d| d.median)
        );
    }
    Ok(())
}

async fn report(store: &dyn Store, hours: i64) -> anyhow::Result<()> {
    let now = Utc::now();
    let window = chrono::Duration::hours(hours);
    let profiles = store.load_profiles(now - window).await?;
    if profiles.is_empty() {
        warn!("No profiles extracted in the last {} hours", hours);
        return Ok(());
    }

    println!("Niche velocity (last {}h)", hours);
    for (rank, score) in NicheScorer::new(window).score(&profiles, now).iter().enumerate() {
        println!(
            "  #{} {}: {:.1} [{}] items={} domains={} volume={:.1} speed={:.1} pattern={:.1}",
            rank + 1,
            score.niche,
            score.velocity_score,
            score.recommendation,
            score.items,
            score.domains,
            score.volume_score,
            score.speed_score,
            score.pattern_score
        );
    }

    println!("Structural patterns");
    for summary in summarize_by_niche(&profiles) {
        let words = summary
            .word_count
            .map(|d| format!("median {:.0}, IQR {:.0}..{:.0}", d.median, d.q1, d.q3))
            .unwrap_or_else(|| "n/a".to_string());
        let images = summary
            .image_count
            .map(|d| format!("{:.1}", d.median))
            .unwrap_or_else(|| "n/a".to_string());
        println!(
            "  {}: {} profiles, words {}, images {}, structured data {:.0}%, patterns {:?}, schema {:?}",
            summary.niche,
            summary.profiles,
            words,
            images,
            summary.structured_data_share * 100.0,
            summary.title_patterns,
            summary.top_schema_types
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_defaults() {
        let cli = Cli::parse_from(["dna-monitor", "--database-url", "sqlite::memory:", "run"]);
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        let (config, cycles) = args.into_config();
        assert_eq!(config.scheduler.cycle_interval, Duration::from_secs(60));
        assert_eq!(config.scheduler.batch_size, 20);
        assert_eq!(config.pool.worker_count, 10);
        assert_eq!(config.scheduler.max_consecutive_failures, 5);
        assert!(config.scheduler.retention.is_none());
        assert_eq!(cycles, None);
    }

    #[test]
    fn test_run_overrides() {
        let cli = Cli::parse_from([
            "dna-monitor",
            "run",
            "--cycle-interval-seconds",
            "5",
            "--batch-size",
            "3",
            "--worker-count",
            "2",
            "--max-consecutive-failures",
            "7",
            "--retention-days",
            "30",
            "--cycles",
            "1",
        ]);
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        let (config, cycles) = args.into_config();
        assert_eq!(config.scheduler.cycle_interval, Duration::from_secs(5));
        assert_eq!(config.scheduler.batch_size, 3);
        assert_eq!(config.pool.worker_count, 2);
        assert_eq!(config.scheduler.max_consecutive_failures, 7);
        assert_eq!(config.scheduler.retention, Some(chrono::Duration::days(30)));
        assert_eq!(cycles, Some(1));
    }

    #[test]
    fn test_add_source_arguments() {
        let cli = Cli::parse_from([
            "dna-monitor",
            "add-source",
            "--feed",
            "https://example.com/feed.xml",
            "--niche",
            "science",
        ]);
        match cli.command {
            Command::AddSource { feed, domain, niche } => {
                assert_eq!(feed, "https://example.com/feed.xml");
                assert_eq!(domain, None);
                assert_eq!(niche.as_deref(), Some("science"));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
