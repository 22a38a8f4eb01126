use chrono::Timelike;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::sink::AggregationSink;
use crate::types::{CycleResult, ExtractionProfile, ProfileStatus};

pub const UNCATEGORIZED: &str = "uncategorized";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Distribution {
    pub min: f64,
    pub q1: f64,
    pub median: f64,
    pub q3: f64,
    pub max: f64,
}

impl Distribution {
    pub fn from_values(mut values: Vec<f64>) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        values.sort_by(|a, b| a.total_cmp(b));
        Some(Self {
            min: values[0],
            q1: quantile(&values, 0.25),
            median: quantile(&values, 0.5),
            q3: quantile(&values, 0.75),
            max: values[values.len() - 1],
        })
    }

    pub fn iqr(&self) -> f64 {
        self.q3 - self.q1
    }
}

// Linear interpolation between closest ranks; `sorted` must be non-empty.
fn quantile(sorted: &[f64], q: f64) -> f64 {
    let position = q * (sorted.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    sorted[lower] + (sorted[upper] - sorted[lower]) * (position - lower as f64)
}

/// Structural summary of one niche.
#[derive(Debug, Clone, PartialEq)]
pub struct NichePatterns {
    pub niche: String,
    pub profiles: usize,
    pub complete: usize,
    pub partial: usize,
    pub failed: usize,
    pub word_count: Option<Distribution>,
    pub image_count: Option<Distribution>,
    /// Share of measured profiles carrying structured data.
    pub structured_data_share: f64,
    pub top_schema_types: Vec<(String, usize)>,
    pub title_patterns: BTreeMap<String, usize>,
    pub publish_hours: [usize; 24],
}

impl NichePatterns {
    pub fn summarize(niche: &str, profiles: &[&ExtractionProfile]) -> Self {
        let mut summary = NichePatterns {
            niche: niche.to_string(),
            profiles: profiles.len(),
            complete: 0,
            partial: 0,
            failed: 0,
            word_count: None,
            image_count: None,
            structured_data_share: 0.0,
            top_schema_types: Vec::new(),
            title_patterns: BTreeMap::new(),
            publish_hours: [0; 24],
        };

        let mut words = Vec::new();
        let mut images = Vec::new();
        let mut structured = 0usize;
        let mut schema_counts: HashMap<&str, usize> = HashMap::new();

        for profile in profiles {
            match profile.status {
                ProfileStatus::Complete => summary.complete += 1,
                ProfileStatus::Partial => summary.partial += 1,
                ProfileStatus::Failed => summary.failed += 1,
            }
            if let Some(published) = profile.published_at {
                summary.publish_hours[published.hour() as usize] += 1;
            }

            let Some(m) = &profile.measurements else {
                continue;
            };
            words.push(m.word_count as f64);
            if let Some(count) = m.image_count {
                images.push(count as f64);
            }
            if m.has_structured_data {
                structured += 1;
            }
            for schema_type in &m.schema_types {
                *schema_counts.entry(schema_type.as_str()).or_default() += 1;
            }
            *summary
                .title_patterns
                .entry(m.title.pattern.as_str().to_string())
                .or_default() += 1;
        }

        let measured = words.len();
        if measured > 0 {
            summary.structured_data_share = structured as f64 / measured as f64;
        }
        summary.word_count = Distribution::from_values(words);
        summary.image_count = Distribution::from_values(images);

        let mut schema_counts: Vec<(String, usize)> = schema_counts
            .into_iter()
            .map(|(t, n)| (t.to_string(), n))
            .collect();
        schema_counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        schema_counts.truncate(5);
        summary.top_schema_types = schema_counts;

        summary
    }
}

/// Group profiles by niche and summarize each, ordered by niche name.
pub fn summarize_by_niche(profiles: &[ExtractionProfile]) -> Vec<NichePatterns> {
    let mut by_niche: BTreeMap<&str, Vec<&ExtractionProfile>> = BTreeMap::new();
    for profile in profiles {
        by_niche
            .entry(profile.niche.as_deref().unwrap_or(UNCATEGORIZED))
            .or_default()
            .push(profile);
    }
    by_niche
        .into_iter()
        .map(|(niche, profiles)| NichePatterns::summarize(niche, &profiles))
        .collect()
}

/// In-process sink that keeps the latest profile per (source, item), so
/// redelivered events replace rather than double count.
#[derive(Default)]
pub struct PatternAggregator {
    profiles: Mutex<HashMap<(String, String), ExtractionProfile>>,
    cycles: Mutex<Vec<CycleResult>>,
}

impl PatternAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        lock(&self.profiles).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn profiles(&self) -> Vec<ExtractionProfile> {
        lock(&self.profiles).values().cloned().collect()
    }

    pub fn cycles(&self) -> Vec<CycleResult> {
        lock(&self.cycles).clone()
    }

    pub fn summaries(&self) -> Vec<NichePatterns> {
        summarize_by_niche(&self.profiles())
    }
}

impl AggregationSink for PatternAggregator {
    fn emit_profile(&self, profile: ExtractionProfile) {
        let key = (profile.source_id.clone(), profile.item_id.clone());
        if lock(&self.profiles).insert(key, profile).is_some() {
            debug!("Replaced redelivered profile");
        }
    }

    fn emit_cycle(&self, cycle: CycleResult) {
        let mut cycles = lock(&self.cycles);
        match cycles.iter_mut().find(|c| c.sequence == cycle.sequence) {
            Some(existing) => *existing = cycle,
            None => cycles.push(cycle),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
