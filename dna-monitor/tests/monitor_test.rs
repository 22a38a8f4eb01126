use async_trait::async_trait;
use dna_monitor::{
    AggregationSink, CandidateItem, ChannelSink, CycleOutcome, CycleResult, DnaExtractor,
    ExtractionConfig, ExtractionError, ExtractionJob, ExtractionPool, ExtractionProfile,
    FanoutSink, FeedSource, FetchError, MonitorScheduler, PageSource, PoolConfig, ProfileStatus,
    RateLimitExceeded, SchedulerConfig, SeenLedger, SinkEvent, SourceManager, StoreSink,
    SubmitError,
};
use interfaces::{MemoryStore, Store};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::time::Instant;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("dna_monitor=debug")
        .with_test_writer()
        .try_init();
}

fn article(words: usize) -> String {
    format!(
        "<html><head><title>Page</title></head><body><article><h1>Heading</h1><p>{}</p></article></body></html>",
        "word ".repeat(words)
    )
}

/// Serves canned feeds by URL and records every fetch.
#[derive(Default)]
struct FakeFeeds {
    items: Mutex<HashMap<String, Result<Vec<String>, FetchError>>>,
    calls: Mutex<Vec<String>>,
    delay: Option<Duration>,
}

impl FakeFeeds {
    fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    fn set_items(&self, feed_url: &str, ids: &[&str]) {
        let ids = ids.iter().map(|id| id.to_string()).collect();
        self.items.lock().unwrap().insert(feed_url.to_string(), Ok(ids));
    }

    fn set_error(&self, feed_url: &str, error: FetchError) {
        self.items.lock().unwrap().insert(feed_url.to_string(), Err(error));
    }

    fn calls_for(&self, feed_url: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == feed_url).count()
    }
}

#[async_trait]
impl FeedSource for FakeFeeds {
    async fn fetch(&self, source_id: &str, feed_url: &str) -> Result<Vec<CandidateItem>, FetchError> {
        self.calls.lock().unwrap().push(feed_url.to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let response = self
            .items
            .lock()
            .unwrap()
            .get(feed_url)
            .cloned()
            .unwrap_or_else(|| Ok(Vec::new()));
        response.map(|ids| {
            ids.into_iter()
                .map(|id| CandidateItem {
                    source_id: source_id.to_string(),
                    title: format!("Story {}", id),
                    link: format!("https://news.example.com/{}", id),
                    item_id: id,
                    published_at: None,
                })
                .collect()
        })
    }
}

/// Serves an article for every page unless an error or a body is registered
/// for it. When gated, each fetch waits for a permit.
#[derive(Default)]
struct FakePages {
    errors: Mutex<HashMap<String, ExtractionError>>,
    bodies: Mutex<HashMap<String, String>>,
    fetched: Mutex<Vec<String>>,
    gate: Option<Arc<Semaphore>>,
}

impl FakePages {
    fn gated(gate: Arc<Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::default()
        }
    }

    fn fail(&self, url: &str, error: ExtractionError) {
        self.errors.lock().unwrap().insert(url.to_string(), error);
    }

    fn serve(&self, url: &str, html: String) {
        self.bodies.lock().unwrap().insert(url.to_string(), html);
    }

    fn fetch_count(&self, url: &str) -> usize {
        self.fetched.lock().unwrap().iter().filter(|u| *u == url).count()
    }
}

#[async_trait]
impl PageSource for FakePages {
    async fn fetch_page(&self, url: &str) -> Result<String, ExtractionError> {
        self.fetched.lock().unwrap().push(url.to_string());
        if let Some(gate) = &self.gate {
            let _permit = gate
                .acquire()
                .await
                .map_err(|e| ExtractionError::Network(e.to_string()))?;
        }
        if let Some(error) = self.errors.lock().unwrap().get(url) {
            return Err(error.clone());
        }
        if let Some(html) = self.bodies.lock().unwrap().get(url) {
            return Ok(html.clone());
        }
        Ok(article(300))
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    sources: Arc<SourceManager>,
    feeds: Arc<FakeFeeds>,
    pages: Arc<FakePages>,
    pool: Arc<ExtractionPool>,
    scheduler: MonitorScheduler,
    events: mpsc::UnboundedReceiver<SinkEvent>,
}

impl Harness {
    fn new(store: Arc<MemoryStore>, scheduler: SchedulerConfig) -> Self {
        Self::build(store, scheduler, PoolConfig::default(), FakeFeeds::default(), FakePages::default())
    }

    fn build(
        store: Arc<MemoryStore>,
        config: SchedulerConfig,
        pool_config: PoolConfig,
        feeds: FakeFeeds,
        pages: FakePages,
    ) -> Self {
        init_tracing();
        let feeds = Arc::new(feeds);
        let pages = Arc::new(pages);
        let (channel, events) = ChannelSink::new();
        let sink: Arc<dyn AggregationSink> = Arc::new(channel);
        let extractor = Arc::new(DnaExtractor::new(ExtractionConfig::default()).unwrap());
        let pool = Arc::new(ExtractionPool::start(pool_config, pages.clone(), extractor, sink.clone()));
        let sources = Arc::new(SourceManager::new(store.clone(), config.max_consecutive_failures));
        let ledger = Arc::new(SeenLedger::new(store.clone()));
        let scheduler = MonitorScheduler::new(
            config,
            sources.clone(),
            feeds.clone(),
            ledger,
            pool.clone(),
            sink,
            store.clone(),
        );
        Self {
            store,
            sources,
            feeds,
            pages,
            pool,
            scheduler,
            events,
        }
    }

    async fn add_source(&self, feed_url: &str) -> String {
        self.sources
            .register(feed_url, None, Some("news"))
            .await
            .unwrap()
            .id
    }

    /// Drains the pool, then returns everything emitted so far.
    async fn finish(&mut self) -> (Vec<ExtractionProfile>, Vec<CycleResult>) {
        self.pool.shutdown().await;
        let mut profiles = Vec::new();
        let mut cycles = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            match event {
                SinkEvent::Profile(p) => profiles.push(p),
                SinkEvent::Cycle(c) => cycles.push(c),
            }
        }
        profiles.sort_by(|a, b| a.item_id.cmp(&b.item_id));
        (profiles, cycles)
    }
}

fn item_ids(profiles: &[ExtractionProfile]) -> Vec<&str> {
    profiles.iter().map(|p| p.item_id.as_str()).collect()
}

const FEED_A: &str = "https://a.example.com/feed.xml";
const FEED_B: &str = "https://b.example.com/feed.xml";

#[tokio::test]
async fn test_only_new_items_are_extracted() {
    let mut harness = Harness::new(Arc::new(MemoryStore::new()), SchedulerConfig::default());
    harness.add_source(FEED_A).await;

    harness.feeds.set_items(FEED_A, &["A", "B", "C"]);
    let first = harness.scheduler.next_cycle().await;
    assert_eq!(first.sequence, 1);
    assert_eq!(first.items_found, 3);
    assert_eq!(first.items_new, 3);

    harness.feeds.set_items(FEED_A, &["B", "C", "D"]);
    let second = harness.scheduler.next_cycle().await;
    assert_eq!(second.sequence, 2);
    assert_eq!(second.items_found, 3);
    assert_eq!(second.items_new, 1);
    assert_eq!(second.outcome, CycleOutcome::Completed);

    let (profiles, cycles) = harness.finish().await;
    assert_eq!(item_ids(&profiles), vec!["A", "B", "C", "D"]);
    assert!(profiles.iter().all(|p| p.status == ProfileStatus::Complete));
    assert!(profiles.iter().all(|p| p.domain == "a.example.com"));
    assert!(profiles.iter().all(|p| p.niche.as_deref() == Some("news")));
    let d = &profiles[3];
    assert_eq!(d.cycle_sequence, 2);
    assert_eq!(d.measurements.as_ref().unwrap().word_count, 301);

    assert_eq!(cycles.iter().map(|c| c.sequence).collect::<Vec<_>>(), vec![1, 2]);
    assert_eq!(harness.store.seen_count(), 4);
}

#[tokio::test]
async fn test_source_deactivated_after_consecutive_failures() {
    let mut harness = Harness::new(Arc::new(MemoryStore::new()), SchedulerConfig::default());
    let id = harness.add_source(FEED_A).await;
    harness.add_source(FEED_B).await;
    harness
        .feeds
        .set_error(FEED_A, FetchError::Network("connection refused".to_string()));
    harness.feeds.set_items(FEED_B, &["1"]);

    for cycle in 1..=5 {
        let result = harness.scheduler.next_cycle().await;
        assert_eq!(result.sources_polled, 2);
        assert_eq!(result.sources_failed, 1);
        assert_eq!(result.sources_deactivated, usize::from(cycle == 5));
    }

    let sixth = harness.scheduler.next_cycle().await;
    assert_eq!(sixth.sources_polled, 1);
    assert_eq!(sixth.sources_failed, 0);
    assert_eq!(harness.feeds.calls_for(FEED_A), 5);
    assert_eq!(harness.feeds.calls_for(FEED_B), 6);

    let record = harness.sources.get(&id).unwrap();
    assert!(!record.active);
    assert_eq!(record.consecutive_failures, 5);
    assert_eq!(record.last_error.as_deref(), Some("Network error: connection refused"));

    let (profiles, _) = harness.finish().await;
    assert_eq!(item_ids(&profiles), vec!["1"]);
}

#[tokio::test]
async fn test_rate_limited_source_is_not_deactivated() {
    let mut harness = Harness::new(Arc::new(MemoryStore::new()), SchedulerConfig::default());
    let id = harness.add_source(FEED_A).await;
    harness.feeds.set_error(
        FEED_A,
        FetchError::RateLimited(RateLimitExceeded {
            host: "a.example.com".to_string(),
            wait: Duration::from_secs(30),
        }),
    );

    for _ in 0..6 {
        let result = harness.scheduler.next_cycle().await;
        assert_eq!(result.sources_polled, 1);
        assert_eq!(result.sources_failed, 0);
        assert_eq!(result.sources_deactivated, 0);
    }
    assert_eq!(harness.feeds.calls_for(FEED_A), 6);

    let record = harness.sources.get(&id).unwrap();
    assert!(record.active);
    assert_eq!(record.consecutive_failures, 0);
    assert!(record.last_error.is_none());

    harness.feeds.set_items(FEED_A, &["1"]);
    assert_eq!(harness.scheduler.next_cycle().await.items_new, 1);
    let (profiles, _) = harness.finish().await;
    assert_eq!(item_ids(&profiles), vec!["1"]);
}

#[tokio::test]
async fn test_failed_page_yields_one_failed_profile() {
    let mut harness = Harness::new(Arc::new(MemoryStore::new()), SchedulerConfig::default());
    harness.add_source(FEED_A).await;
    harness.feeds.set_items(FEED_A, &["broken", "fine"]);
    harness.pages.fail(
        "https://news.example.com/broken",
        ExtractionError::Network("HTTP 500: Internal Server Error".to_string()),
    );

    harness.scheduler.next_cycle().await;
    let again = harness.scheduler.next_cycle().await;
    assert_eq!(again.items_new, 0);

    let (profiles, _) = harness.finish().await;
    assert_eq!(item_ids(&profiles), vec!["broken", "fine"]);

    let broken = &profiles[0];
    assert_eq!(broken.status, ProfileStatus::Failed);
    assert!(broken.measurements.is_none());
    assert!(broken.failure_reason.as_deref().unwrap().contains("HTTP 500"));
    assert_eq!(harness.pages.fetch_count("https://news.example.com/broken"), 1);

    assert_eq!(profiles[1].status, ProfileStatus::Complete);
}

#[tokio::test]
async fn test_pathologically_nested_page_yields_failed_profile() {
    let mut harness = Harness::new(Arc::new(MemoryStore::new()), SchedulerConfig::default());
    harness.add_source(FEED_A).await;
    harness.feeds.set_items(FEED_A, &["deep"]);
    harness.pages.serve(
        "https://news.example.com/deep",
        format!(
            "<html><body>{}<p>bottom</p>{}</body></html>",
            "<div>".repeat(20_000),
            "</div>".repeat(20_000)
        ),
    );

    harness.scheduler.next_cycle().await;

    let (profiles, _) = harness.finish().await;
    assert_eq!(profiles.len(), 1);
    assert_eq!(profiles[0].status, ProfileStatus::Failed);
    assert!(profiles[0]
        .failure_reason
        .as_deref()
        .unwrap()
        .contains("nests deeper"));
}

#[tokio::test]
async fn test_ledger_outage_stops_the_cycle() {
    let store = Arc::new(MemoryStore::new());
    let config = SchedulerConfig {
        batch_size: 1,
        ..SchedulerConfig::default()
    };
    let mut harness = Harness::new(store.clone(), config);
    harness.add_source(FEED_A).await;
    harness.add_source(FEED_B).await;
    harness.feeds.set_items(FEED_A, &["A"]);
    harness.feeds.set_items(FEED_B, &["B"]);

    store.set_fail_writes(true);
    let result = harness.scheduler.next_cycle().await;
    assert!(matches!(result.outcome, CycleOutcome::LedgerUnavailable { .. }));
    assert_eq!(result.sources_polled, 1);
    assert_eq!(result.items_new, 0);
    assert_eq!(harness.feeds.calls_for(FEED_A) + harness.feeds.calls_for(FEED_B), 1);

    store.set_fail_writes(false);
    let recovered = harness.scheduler.next_cycle().await;
    assert_eq!(recovered.outcome, CycleOutcome::Completed);
    assert_eq!(recovered.items_new, 2);

    let (profiles, cycles) = harness.finish().await;
    assert_eq!(item_ids(&profiles), vec!["A", "B"]);
    assert_eq!(cycles[0].outcome.as_str(), "ledger_unavailable");
}

#[tokio::test]
async fn test_restart_continues_sequence_and_remembers_items() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());

    {
        let mut harness = Harness::new(store.clone(), SchedulerConfig::default());
        harness.add_source(FEED_A).await;
        harness.feeds.set_items(FEED_A, &["A", "B"]);
        for _ in 0..2 {
            let cycle = harness.scheduler.next_cycle().await;
            store.persist_cycle(&cycle).await.unwrap();
        }
        harness.finish().await;
    }

    let mut restarted = Harness::new(store.clone(), SchedulerConfig::default());
    restarted.feeds.set_items(FEED_A, &["A", "B", "C"]);
    let cycle = restarted.scheduler.next_cycle().await;
    assert_eq!(cycle.sequence, 3);
    assert_eq!(cycle.items_new, 1);

    let (profiles, _) = restarted.finish().await;
    assert_eq!(item_ids(&profiles), vec!["C"]);
}

#[tokio::test]
async fn test_store_sink_persists_profiles_and_cycles() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let (channel, _events) = ChannelSink::new();
    let store_sink = Arc::new(StoreSink::new(store.clone()));
    let sink: Arc<dyn AggregationSink> = Arc::new(
        FanoutSink::default()
            .with(store_sink.clone())
            .with(Arc::new(channel)),
    );

    let pages = Arc::new(FakePages::default());
    let feeds = Arc::new(FakeFeeds::default());
    let extractor = Arc::new(DnaExtractor::new(ExtractionConfig::default()).unwrap());
    let pool = Arc::new(ExtractionPool::start(PoolConfig::default(), pages, extractor, sink.clone()));
    let sources = Arc::new(SourceManager::new(store.clone(), 5));
    sources.register(FEED_A, None, None).await.unwrap();
    feeds.set_items(FEED_A, &["A", "B"]);

    let scheduler = MonitorScheduler::new(
        SchedulerConfig::default(),
        sources,
        feeds,
        Arc::new(SeenLedger::new(store.clone())),
        pool.clone(),
        sink,
        store.clone(),
    );
    scheduler.next_cycle().await;

    pool.shutdown().await;
    store_sink.close().await;
    assert_eq!(store.profiles().len(), 2);
    assert_eq!(store.cycles().len(), 1);
    assert_eq!(store.last_cycle_sequence().await.unwrap(), Some(1));
}

fn job(id: &str) -> ExtractionJob {
    ExtractionJob {
        item: CandidateItem {
            source_id: "s".to_string(),
            item_id: id.to_string(),
            title: format!("Story {}", id),
            link: format!("https://news.example.com/{}", id),
            published_at: None,
        },
        domain: "news.example.com".to_string(),
        niche: None,
        cycle_sequence: 1,
    }
}

#[tokio::test(start_paused = true)]
async fn test_full_queue_refuses_after_deadline() {
    init_tracing();
    let gate = Arc::new(Semaphore::new(0));
    let (channel, mut events) = ChannelSink::new();
    let pool = ExtractionPool::start(
        PoolConfig {
            worker_count: 1,
            queue_capacity: 1,
            extraction_timeout: Duration::from_secs(3600),
        },
        Arc::new(FakePages::gated(gate.clone())),
        Arc::new(DnaExtractor::new(ExtractionConfig::default()).unwrap()),
        Arc::new(channel),
    );

    let deadline = Instant::now() + Duration::from_secs(1);
    pool.submit_until(job("1"), deadline).await.unwrap();
    pool.submit_until(job("2"), deadline).await.unwrap();

    let refused = pool.submit_until(job("3"), deadline).await;
    assert!(matches!(refused, Err(SubmitError::Timeout(_))));
    assert_eq!(refused.unwrap_err().into_job().item.item_id, "3");
    assert!(Instant::now() >= deadline);

    gate.add_permits(10);
    pool.shutdown().await;

    let mut drained = Vec::new();
    while let Ok(SinkEvent::Profile(p)) = events.try_recv() {
        drained.push(p.item_id);
    }
    drained.sort();
    assert_eq!(drained, vec!["1", "2"]);

    let closed = pool.submit(job("4")).await;
    assert!(matches!(closed, Err(SubmitError::Closed(_))));
}

#[tokio::test(start_paused = true)]
async fn test_handoff_timeout_emits_failed_profiles() {
    let gate = Arc::new(Semaphore::new(0));
    let config = SchedulerConfig {
        source_deadline: Duration::from_secs(5),
        ..SchedulerConfig::default()
    };
    let pool_config = PoolConfig {
        worker_count: 1,
        queue_capacity: 1,
        extraction_timeout: Duration::from_secs(3600),
    };
    let mut harness = Harness::build(
        Arc::new(MemoryStore::new()),
        config,
        pool_config,
        FakeFeeds::default(),
        FakePages::gated(gate.clone()),
    );
    harness.add_source(FEED_A).await;
    harness.feeds.set_items(FEED_A, &["1", "2", "3", "4", "5"]);

    let result = harness.scheduler.next_cycle().await;
    assert_eq!(result.items_new, 5);
    assert_eq!(result.items_failed, 3);

    gate.add_permits(10);
    let (profiles, _) = harness.finish().await;
    assert_eq!(profiles.len(), 5);
    let failed: Vec<&str> = profiles
        .iter()
        .filter(|p| p.status == ProfileStatus::Failed)
        .map(|p| p.item_id.as_str())
        .collect();
    assert_eq!(failed, vec!["3", "4", "5"]);
    assert!(profiles
        .iter()
        .filter(|p| p.status == ProfileStatus::Failed)
        .all(|p| p.measurements.is_none() && p.failure_reason.is_some()));

    // Refused items stay seen.
    let again = harness.scheduler.next_cycle().await;
    assert_eq!(again.items_new, 0);
}

fn assert_between(elapsed: Duration, seconds: u64) {
    assert!(elapsed >= Duration::from_secs(seconds), "{:?}", elapsed);
    assert!(elapsed < Duration::from_secs(seconds + 1), "{:?}", elapsed);
}

#[tokio::test(start_paused = true)]
async fn test_run_spaces_cycles_by_interval() {
    let mut harness = Harness::new(Arc::new(MemoryStore::new()), SchedulerConfig::default());
    harness.add_source(FEED_A).await;

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let started = Instant::now();
    let cycles = harness.scheduler.run(Some(3), shutdown_rx).await;
    assert_eq!(cycles, 3);
    assert_between(started.elapsed(), 120);

    let (_, results) = harness.finish().await;
    assert_eq!(results.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_overrunning_cycle_starts_next_immediately() {
    let config = SchedulerConfig {
        cycle_interval: Duration::from_secs(60),
        source_deadline: Duration::from_secs(300),
        ..SchedulerConfig::default()
    };
    let harness = Harness::build(
        Arc::new(MemoryStore::new()),
        config,
        PoolConfig::default(),
        FakeFeeds::with_delay(Duration::from_secs(90)),
        FakePages::default(),
    );
    harness.add_source(FEED_A).await;

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let started = Instant::now();
    let cycles = harness.scheduler.run(Some(2), shutdown_rx).await;
    assert_eq!(cycles, 2);
    assert_between(started.elapsed(), 180);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_between_cycles() {
    let harness = Harness::new(Arc::new(MemoryStore::new()), SchedulerConfig::default());
    harness.add_source(FEED_A).await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(150)).await;
        let _ = shutdown_tx.send(true);
    });

    let cycles = harness.scheduler.run(None, shutdown_rx).await;
    assert_eq!(cycles, 3);
}
