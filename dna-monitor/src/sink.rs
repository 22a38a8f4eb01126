use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::types::{CycleResult, ExtractionProfile, Store};

/// Receiver of pipeline output. Emission never blocks the caller and is
/// at-least-once, so consumers must treat (source id, item id) as the key.
pub trait AggregationSink: Send + Sync {
    fn emit_profile(&self, profile: ExtractionProfile);
    fn emit_cycle(&self, cycle: CycleResult);
}

#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    Profile(ExtractionProfile),
    Cycle(CycleResult),
}

/// Hands events to an in-process consumer over an unbounded channel.
pub struct ChannelSink {
    sender: mpsc::UnboundedSender<SinkEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SinkEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    fn send(&self, event: SinkEvent) {
        if self.sender.send(event).is_err() {
            debug!("Sink consumer has gone away; dropping event");
        }
    }
}

impl AggregationSink for ChannelSink {
    fn emit_profile(&self, profile: ExtractionProfile) {
        self.send(SinkEvent::Profile(profile));
    }

    fn emit_cycle(&self, cycle: CycleResult) {
        self.send(SinkEvent::Cycle(cycle));
    }
}

/// Persists events on a background task. [`close`](Self::close) drains
/// everything already emitted before returning.
pub struct StoreSink {
    sender: Mutex<Option<mpsc::UnboundedSender<SinkEvent>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl StoreSink {
    pub fn new(store: Arc<dyn Store>) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<SinkEvent>();

        let writer = tokio::spawn(async move {
            let mut written = 0usize;
            while let Some(event) = receiver.recv().await {
                let result = match &event {
                    SinkEvent::Profile(profile) => store.persist_profile(profile).await,
                    SinkEvent::Cycle(cycle) => store.persist_cycle(cycle).await,
                };
                match result {
                    Ok(()) => written += 1,
                    Err(e) => match event {
                        SinkEvent::Profile(p) => error!(
                            "Failed to persist profile {}/{}: {}",
                            p.source_id, p.item_id, e
                        ),
                        SinkEvent::Cycle(c) => {
                            error!("Failed to persist cycle {}: {}", c.sequence, e)
                        }
                    },
                }
            }
            info!("Store sink drained ({} events written)", written);
        });

        Self {
            sender: Mutex::new(Some(sender)),
            writer: Mutex::new(Some(writer)),
        }
    }

    pub async fn close(&self) {
        drop(lock(&self.sender).take());
        let writer = lock(&self.writer).take();
        if let Some(writer) = writer {
            if let Err(e) = writer.await {
                error!("Store sink writer panicked: {}", e);
            }
        }
    }

    fn send(&self, event: SinkEvent) {
        match lock(&self.sender).as_ref() {
            Some(sender) => {
                if sender.send(event).is_err() {
                    warn!("Store sink writer stopped; dropping event");
                }
            }
            None => warn!("Store sink already closed; dropping event"),
        }
    }
}

impl AggregationSink for StoreSink {
    fn emit_profile(&self, profile: ExtractionProfile) {
        self.send(SinkEvent::Profile(profile));
    }

    fn emit_cycle(&self, cycle: CycleResult) {
        self.send(SinkEvent::Cycle(cycle));
    }
}

/// Delivers every event to each inner sink in order.
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn AggregationSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn AggregationSink>>) -> Self {
        Self { sinks }
    }

    pub fn with(mut self, sink: Arc<dyn AggregationSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl AggregationSink for FanoutSink {
    fn emit_profile(&self, profile: ExtractionProfile) {
        for sink in &self.sinks {
            sink.emit_profile(profile.clone());
        }
    }

    fn emit_cycle(&self, cycle: CycleResult) {
        for sink in &self.sinks {
            sink.emit_cycle(cycle.clone());
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CycleOutcome, ProfileStatus};
    use chrono::Utc;
    use interfaces::MemoryStore;

    fn profile(item: &str) -> ExtractionProfile {
        ExtractionProfile {
            source_id: "s".to_string(),
            item_id: item.to_string(),
            link: format!("https://example.com/{}", item),
            title: String::new(),
            domain: "example.com".to_string(),
            niche: None,
            cycle_sequence: 1,
            published_at: None,
            extracted_at: Utc::now(),
            status: ProfileStatus::Failed,
            failure_reason: Some("HTTP 500: Internal Server Error".to_string()),
            measurements: None,
        }
    }

    fn cycle() -> CycleResult {
        CycleResult {
            sequence: 7,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            sources_polled: 1,
            sources_failed: 0,
            sources_deactivated: 0,
            items_found: 2,
            items_new: 2,
            items_failed: 0,
            outcome: CycleOutcome::Completed,
        }
    }

    #[tokio::test]
    async fn test_store_sink_drains_on_close() {
        let store = Arc::new(MemoryStore::new());
        let sink = StoreSink::new(store.clone());
        for i in 0..50 {
            sink.emit_profile(profile(&i.to_string()));
        }
        sink.emit_cycle(cycle());
        sink.close().await;

        assert_eq!(store.profiles().len(), 50);
        assert_eq!(store.cycles().len(), 1);

        // Emitting after close is dropped, not a panic.
        sink.emit_profile(profile("late"));
        assert_eq!(store.profiles().len(), 50);
    }

    #[tokio::test]
    async fn test_fanout_reaches_every_sink() {
        let (first, mut first_rx) = ChannelSink::new();
        let (second, mut second_rx) = ChannelSink::new();
        let fanout = FanoutSink::new(vec![Arc::new(first)]).with(Arc::new(second));

        fanout.emit_profile(profile("a"));
        fanout.emit_cycle(cycle());

        for rx in [&mut first_rx, &mut second_rx] {
            assert!(matches!(rx.recv().await, Some(SinkEvent::Profile(p)) if p.item_id == "a"));
            assert!(matches!(rx.recv().await, Some(SinkEvent::Cycle(c)) if c.sequence == 7));
        }
    }
}
