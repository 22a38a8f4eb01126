use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::fmt;

use crate::aggregators::patterns::UNCATEGORIZED;
use crate::types::{ExtractionProfile, ProfileStatus};

const VOLUME_WEIGHT: f64 = 0.20;
const SOCIAL_WEIGHT: f64 = 0.25;
const SPEED_WEIGHT: f64 = 0.15;
const PATTERN_WEIGHT: f64 = 0.40;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Recommendation {
    Hot,
    Warm,
    Moderate,
    Cold,
}

impl Recommendation {
    pub fn for_score(score: f64) -> Self {
        if score >= 80.0 {
            Recommendation::Hot
        } else if score >= 60.0 {
            Recommendation::Warm
        } else if score >= 40.0 {
            Recommendation::Moderate
        } else {
            Recommendation::Cold
        }
    }
}

impl fmt::Display for Recommendation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Recommendation::Hot => "HOT - prime target niche",
            Recommendation::Warm => "WARM - strong opportunity",
            Recommendation::Moderate => "MODERATE - consider testing",
            Recommendation::Cold => "COLD - not recommended",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NicheScore {
    pub niche: String,
    pub items: usize,
    pub domains: usize,
    pub volume_score: f64,
    /// No social signal is collected; always zero.
    pub social_score: f64,
    pub speed_score: f64,
    pub pattern_score: f64,
    pub velocity_score: f64,
    pub top_domains: Vec<(String, usize)>,
    pub recommendation: Recommendation,
}

/// Ranks niches by recent publishing velocity and how reliably their pages
/// yield a full profile.
#[derive(Debug, Clone)]
pub struct NicheScorer {
    window: Duration,
}

impl Default for NicheScorer {
    fn default() -> Self {
        Self {
            window: Duration::hours(24),
        }
    }
}

impl NicheScorer {
    pub fn new(window: Duration) -> Self {
        Self { window }
    }

    /// Scores every niche with at least one profile inside the window,
    /// highest first.
    pub fn score(&self, profiles: &[ExtractionProfile], now: DateTime<Utc>) -> Vec<NicheScore> {
        let cutoff = now - self.window;
        let mut by_niche: HashMap<&str, Vec<&ExtractionProfile>> = HashMap::new();
        for profile in profiles {
            if published(profile) > cutoff {
                by_niche
                    .entry(profile.niche.as_deref().unwrap_or(UNCATEGORIZED))
                    .or_default()
                    .push(profile);
            }
        }

        let mut scores: Vec<NicheScore> = by_niche
            .into_iter()
            .map(|(niche, profiles)| score_niche(niche, &profiles))
            .collect();
        scores.sort_by(|a, b| {
            b.velocity_score
                .total_cmp(&a.velocity_score)
                .then_with(|| a.niche.cmp(&b.niche))
        });
        scores
    }
}

fn published(profile: &ExtractionProfile) -> DateTime<Utc> {
    profile.published_at.unwrap_or(profile.extracted_at)
}

fn score_niche(niche: &str, profiles: &[&ExtractionProfile]) -> NicheScore {
    let count = profiles.len();

    let volume_score = (count as f64 / 2.0).min(100.0);
    let social_score = 0.0;

    let speed_score = if count >= 2 {
        let mut times: Vec<DateTime<Utc>> = profiles.iter().map(|p| published(p)).collect();
        times.sort();
        // Mean of consecutive gaps equals the overall span over the gap count.
        let span_hours = (times[count - 1] - times[0]).num_seconds() as f64 / 3600.0;
        let avg_interval = span_hours / (count - 1) as f64;
        (100.0 - avg_interval / 24.0 * 100.0).max(0.0)
    } else {
        0.0
    };

    let complete = profiles
        .iter()
        .filter(|p| p.status == ProfileStatus::Complete)
        .count();
    let pattern_score = if count > 0 {
        complete as f64 / count as f64 * 100.0
    } else {
        0.0
    };

    let velocity_score = volume_score * VOLUME_WEIGHT
        + social_score * SOCIAL_WEIGHT
        + speed_score * SPEED_WEIGHT
        + pattern_score * PATTERN_WEIGHT;

    let mut domain_counts: HashMap<&str, usize> = HashMap::new();
    for profile in profiles {
        *domain_counts.entry(profile.domain.as_str()).or_default() += 1;
    }
    let domains = domain_counts.len();
    let mut top_domains: Vec<(String, usize)> = domain_counts
        .into_iter()
        .map(|(d, n)| (d.to_string(), n))
        .collect();
    top_domains.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    top_domains.truncate(5);

    NicheScore {
        niche: niche.to_string(),
        items: count,
        domains,
        volume_score,
        social_score,
        speed_score,
        pattern_score,
        velocity_score,
        top_domains,
        recommendation: Recommendation::for_score(velocity_score),
    }
}
