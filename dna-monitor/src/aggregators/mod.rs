pub mod niche;
pub mod patterns;

pub use niche::{NicheScore, NicheScorer, Recommendation};
pub use patterns::{summarize_by_niche, Distribution, NichePatterns, PatternAggregator};
