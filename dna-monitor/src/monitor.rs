use chrono::Utc;
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::ledger::SeenLedger;
use crate::pool::{ExtractionJob, ExtractionPool};
use crate::sink::AggregationSink;
use crate::source_manager::{SourceHealth, SourceManager};
use crate::traits::FeedSource;
use crate::types::{
    CycleOutcome, CycleResult, FetchError, LedgerError, SchedulerConfig, SourceRecord, Store,
};

/// What polling one source contributed to its cycle.
#[derive(Debug, Default)]
struct SourcePoll {
    failed: bool,
    deactivated: bool,
    found: usize,
    new: usize,
    handoff_failures: usize,
    ledger_error: Option<String>,
}

/// Drives polling cycles: fetch every active source in fixed-size batches,
/// keep only unseen items and hand them to the extraction pool.
pub struct MonitorScheduler {
    config: SchedulerConfig,
    sources: Arc<SourceManager>,
    feeds: Arc<dyn FeedSource>,
    ledger: Arc<SeenLedger>,
    pool: Arc<ExtractionPool>,
    sink: Arc<dyn AggregationSink>,
    store: Arc<dyn Store>,
    last_sequence: AsyncMutex<Option<u64>>,
}

impl MonitorScheduler {
    pub fn new(
        config: SchedulerConfig,
        sources: Arc<SourceManager>,
        feeds: Arc<dyn FeedSource>,
        ledger: Arc<SeenLedger>,
        pool: Arc<ExtractionPool>,
        sink: Arc<dyn AggregationSink>,
        store: Arc<dyn Store>,
    ) -> Self {
        Self {
            config,
            sources,
            feeds,
            ledger,
            pool,
            sink,
            store,
            last_sequence: AsyncMutex::new(None),
        }
    }

    /// Runs cycles until `max_cycles` have completed or `shutdown` turns
    /// true. A cycle in flight when shutdown arrives is finished first.
    /// Returns the number of cycles run.
    pub async fn run(&self, max_cycles: Option<u64>, mut shutdown: watch::Receiver<bool>) -> u64 {
        let mut cycles = 0u64;
        info!(
            "Monitor starting: interval {:?}, batch size {}, failure threshold {}",
            self.config.cycle_interval, self.config.batch_size, self.config.max_consecutive_failures
        );

        loop {
            if *shutdown.borrow() {
                info!("Shutdown requested; not starting another cycle");
                break;
            }

            let started = Instant::now();
            self.next_cycle().await;
            cycles += 1;

            if max_cycles.is_some_and(|max| cycles >= max) {
                break;
            }

            let next_start = started + self.config.cycle_interval;
            if Instant::now() >= next_start {
                warn!(
                    "Cycle overran the {:?} interval by {:?}; starting the next one now",
                    self.config.cycle_interval,
                    Instant::now() - next_start
                );
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep_until(next_start) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        info!("Shutdown channel closed; stopping");
                        break;
                    }
                }
            }
        }

        info!("Monitor stopped after {} cycles", cycles);
        cycles
    }

    /// Refreshes the source list, runs one cycle under the next sequence
    /// number and emits its summary.
    pub async fn next_cycle(&self) -> CycleResult {
        let sequence = self.allocate_sequence().await;
        let sources = self.sources.refresh().await;
        let result = self.run_cycle(sequence, &sources).await;

        self.sink.emit_cycle(result.clone());

        if let Some(retention) = self.config.retention {
            if let Err(e) = self.ledger.prune(retention).await {
                warn!("Seen-item pruning failed: {}", e);
            }
        }
        result
    }

    /// One pass over `sources`. Batches run one after another; the sources
    /// of a batch are polled concurrently. A ledger outage ends the cycle
    /// once the current batch has finished.
    pub async fn run_cycle(&self, sequence: u64, sources: &[SourceRecord]) -> CycleResult {
        let started_at = Utc::now();
        let mut result = CycleResult {
            sequence,
            started_at,
            finished_at: started_at,
            sources_polled: 0,
            sources_failed: 0,
            sources_deactivated: 0,
            items_found: 0,
            items_new: 0,
            items_failed: 0,
            outcome: CycleOutcome::Completed,
        };

        for batch in sources.chunks(self.config.batch_size.max(1)) {
            let polls = join_all(batch.iter().map(|source| self.poll_source(source, sequence))).await;

            for poll in polls {
                result.sources_polled += 1;
                result.sources_failed += poll.failed as usize;
                result.sources_deactivated += poll.deactivated as usize;
                result.items_found += poll.found;
                result.items_new += poll.new;
                result.items_failed += poll.handoff_failures;
                if let Some(reason) = poll.ledger_error {
                    if result.outcome == CycleOutcome::Completed {
                        result.outcome = CycleOutcome::LedgerUnavailable { reason };
                    }
                }
            }

            if result.outcome != CycleOutcome::Completed {
                error!(
                    "Cycle {} ended early, seen-item ledger unavailable; {} of {} sources polled",
                    sequence,
                    result.sources_polled,
                    sources.len()
                );
                break;
            }
        }

        result.finished_at = Utc::now();
        info!(
            "Cycle {} {}: {} sources polled ({} failed, {} deactivated), {} items found, {} new, {} handoffs failed",
            result.sequence,
            result.outcome.as_str(),
            result.sources_polled,
            result.sources_failed,
            result.sources_deactivated,
            result.items_found,
            result.items_new,
            result.items_failed
        );
        result
    }

    #[instrument(skip_all, fields(source = %source.id, cycle = sequence))]
    async fn poll_source(&self, source: &SourceRecord, sequence: u64) -> SourcePoll {
        let mut poll = SourcePoll::default();
        let deadline = Instant::now() + self.config.source_deadline;

        let fetched = match tokio::time::timeout_at(deadline, self.feeds.fetch(&source.id, &source.feed_url)).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout(self.config.source_deadline)),
        };

        let items = match fetched {
            Ok(items) => {
                if let Err(e) = self.sources.record_success(&source.id).await {
                    warn!("Could not record success for {}: {}", source.id, e);
                }
                items
            }
            Err(FetchError::RateLimited(e)) => {
                info!("Source {} not polled this cycle: {}", source.feed_url, e);
                return poll;
            }
            Err(e) => {
                poll.failed = true;
                match self.sources.record_failure(&source.id, &e.to_string()).await {
                    Ok(SourceHealth::Deactivated) => poll.deactivated = true,
                    Ok(_) => {}
                    Err(err) => warn!("Could not record failure for {}: {}", source.id, err),
                }
                return poll;
            }
        };

        poll.found = items.len();
        for item in items {
            match self.ledger.mark_seen(&source.id, &item.item_id).await {
                Ok(false) => continue,
                Ok(true) => {}
                Err(LedgerError::Unavailable(e)) => {
                    error!("Ledger unavailable while polling {}: {}", source.feed_url, e);
                    poll.ledger_error = Some(e.to_string());
                    break;
                }
            }
            poll.new += 1;

            let job = ExtractionJob {
                item,
                domain: source.domain.clone(),
                niche: source.niche.clone(),
                cycle_sequence: sequence,
            };
            if let Err(e) = self.pool.submit_until(job, deadline).await {
                // The item is already marked seen, so this is its only
                // terminal record.
                warn!("Handoff to extraction failed: {}", e);
                let reason = e.to_string();
                self.sink.emit_profile(e.into_job().failed_profile(reason));
                poll.handoff_failures += 1;
            }
        }

        debug!("{} items found, {} new", poll.found, poll.new);
        poll
    }

    async fn allocate_sequence(&self) -> u64 {
        let mut last = self.last_sequence.lock().await;
        let previous = match *last {
            Some(previous) => previous,
            None => match self.store.last_cycle_sequence().await {
                Ok(previous) => previous.unwrap_or(0),
                Err(e) => {
                    warn!("Could not read last cycle sequence, starting from 0: {}", e);
                    0
                }
            },
        };
        *last = Some(previous + 1);
        previous + 1
    }
}

