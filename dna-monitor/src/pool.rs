use chrono::Utc;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::extractor::DnaExtractor;
use crate::sink::AggregationSink;
use crate::traits::PageSource;
use crate::types::{CandidateItem, ExtractionError, ExtractionProfile, PoolConfig, ProfileStatus};

/// A newly seen item on its way to extraction.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionJob {
    pub item: CandidateItem,
    pub domain: String,
    pub niche: Option<String>,
    pub cycle_sequence: u64,
}

impl ExtractionJob {
    fn profile(&self, status: ProfileStatus) -> ExtractionProfile {
        ExtractionProfile {
            source_id: self.item.source_id.clone(),
            item_id: self.item.item_id.clone(),
            link: self.item.link.clone(),
            title: self.item.title.clone(),
            domain: self.domain.clone(),
            niche: self.niche.clone(),
            cycle_sequence: self.cycle_sequence,
            published_at: self.item.published_at,
            extracted_at: Utc::now(),
            status,
            failure_reason: None,
            measurements: None,
        }
    }

    /// Terminal record for an item that will never be measured.
    pub fn failed_profile(&self, reason: impl Into<String>) -> ExtractionProfile {
        ExtractionProfile {
            failure_reason: Some(reason.into()),
            ..self.profile(ProfileStatus::Failed)
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("extraction pool is shut down")]
    Closed(ExtractionJob),

    #[error("extraction queue stayed full until the deadline")]
    Timeout(ExtractionJob),
}

impl SubmitError {
    pub fn into_job(self) -> ExtractionJob {
        match self {
            SubmitError::Closed(job) | SubmitError::Timeout(job) => job,
        }
    }
}

/// Fixed set of workers behind a bounded queue. Every accepted job produces
/// exactly one profile on the sink.
pub struct ExtractionPool {
    sender: Mutex<Option<mpsc::Sender<ExtractionJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

struct Worker {
    id: usize,
    pages: Arc<dyn PageSource>,
    extractor: Arc<DnaExtractor>,
    sink: Arc<dyn AggregationSink>,
    timeout: Duration,
}

impl ExtractionPool {
    pub fn start(
        config: PoolConfig,
        pages: Arc<dyn PageSource>,
        extractor: Arc<DnaExtractor>,
        sink: Arc<dyn AggregationSink>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let receiver = Arc::new(AsyncMutex::new(receiver));

        let workers = (0..config.worker_count.max(1))
            .map(|id| {
                let worker = Worker {
                    id,
                    pages: pages.clone(),
                    extractor: extractor.clone(),
                    sink: sink.clone(),
                    timeout: config.extraction_timeout,
                };
                let receiver = receiver.clone();
                tokio::spawn(async move { worker.run(receiver).await })
            })
            .collect();

        info!(
            "Extraction pool started: {} workers, queue capacity {}",
            config.worker_count, config.queue_capacity
        );

        Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        }
    }

    /// Waits for queue space.
    pub async fn submit(&self, job: ExtractionJob) -> Result<(), SubmitError> {
        let Some(sender) = self.sender() else {
            return Err(SubmitError::Closed(job));
        };
        sender.send(job).await.map_err(|e| SubmitError::Closed(e.0))
    }

    /// Waits for queue space until `deadline`; the job comes back on refusal.
    pub async fn submit_until(&self, job: ExtractionJob, deadline: Instant) -> Result<(), SubmitError> {
        let Some(sender) = self.sender() else {
            return Err(SubmitError::Closed(job));
        };
        let reserved = tokio::time::timeout_at(deadline, sender.reserve()).await;
        match reserved {
            Ok(Ok(permit)) => {
                permit.send(job);
                Ok(())
            }
            Ok(Err(_)) => Err(SubmitError::Closed(job)),
            Err(_) => Err(SubmitError::Timeout(job)),
        }
    }

    pub fn queued(&self) -> usize {
        self.sender()
            .map(|s| s.max_capacity() - s.capacity())
            .unwrap_or(0)
    }

    /// Stops accepting work, lets the workers finish everything queued and
    /// waits for them to exit.
    pub async fn shutdown(&self) {
        drop(lock(&self.sender).take());
        let workers: Vec<JoinHandle<()>> = lock(&self.workers).drain(..).collect();
        for worker in workers {
            if let Err(e) = worker.await {
                warn!("Extraction worker ended abnormally: {}", e);
            }
        }
        info!("Extraction pool drained");
    }

    fn sender(&self) -> Option<mpsc::Sender<ExtractionJob>> {
        lock(&self.sender).clone()
    }
}

impl Worker {
    async fn run(self, receiver: Arc<AsyncMutex<mpsc::Receiver<ExtractionJob>>>) {
        loop {
            let job = receiver.lock().await.recv().await;
            let Some(job) = job else {
                break;
            };
            let profile = self.process(&job).await;
            self.sink.emit_profile(profile);
        }
        debug!("Extraction worker {} exiting", self.id);
    }

    #[instrument(skip_all, fields(worker = self.id, source = %job.item.source_id, item = %job.item.item_id))]
    async fn process(&self, job: &ExtractionJob) -> ExtractionProfile {
        let started = Instant::now();
        let outcome = tokio::time::timeout(self.timeout, self.fetch_and_measure(job)).await;

        let profile = match outcome {
            Ok(Ok(profile)) => profile,
            Ok(Err(e)) => {
                warn!("Extraction of {} failed: {}", job.item.link, e);
                job.failed_profile(e.to_string())
            }
            Err(_) => {
                warn!("Extraction of {} timed out after {:?}", job.item.link, self.timeout);
                job.failed_profile(ExtractionError::Timeout(self.timeout).to_string())
            }
        };

        debug!(
            "Extracted {} as {} in {:?}",
            job.item.link,
            profile.status,
            started.elapsed()
        );
        profile
    }

    async fn fetch_and_measure(&self, job: &ExtractionJob) -> Result<ExtractionProfile, ExtractionError> {
        let html = self.pages.fetch_page(&job.item.link).await?;

        // Parsing is CPU-bound and the parsed document is not Send.
        let extractor = self.extractor.clone();
        let link = job.item.link.clone();
        let title = job.item.title.clone();
        let analysis = tokio::task::spawn_blocking(move || extractor.analyze(&link, &title, &html))
            .await
            .map_err(|e| ExtractionError::UnsupportedContent(format!("extraction aborted: {}", e)))??;

        Ok(ExtractionProfile {
            measurements: Some(analysis.measurements),
            ..job.profile(analysis.status)
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
