pub mod types;
pub mod traits;
pub mod rate_limiter;
pub mod parser;
pub mod fetcher;
pub mod ledger;
pub mod extractor;
pub mod pool;
pub mod sink;
pub mod source_manager;
pub mod monitor;
pub mod aggregators;

pub use types::*;
pub use traits::{FeedSource, PageSource};
pub use rate_limiter::{HostPermit, HostRateLimiter};
pub use parser::FeedParser;
pub use fetcher::Fetcher;
pub use ledger::SeenLedger;
pub use extractor::DnaExtractor;
pub use pool::{ExtractionJob, ExtractionPool, SubmitError};
pub use sink::{AggregationSink, ChannelSink, FanoutSink, SinkEvent, StoreSink};
pub use source_manager::{HealthSummary, SourceHealth, SourceManager};
pub use monitor::MonitorScheduler;
pub use aggregators::{NicheScorer, PatternAggregator};
