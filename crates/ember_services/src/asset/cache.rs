//! Eviction ordering for cache pruning
//!
//! Candidates are ranked by a blend of staleness and size, both normalized to
//! `[0, 1]` against the largest candidate:
//!
//! `score = w * age / max_age + (1 - w) * bytes / max_bytes`
//!
//! where `w` is the configured recency weight. Highest score goes first; ties
//! fall back to key order so pruning is deterministic.

use std::time::Duration;

use serde::Serialize;

/// An evictable asset
#[derive(Debug, Clone)]
pub(crate) struct Candidate<'a> {
    pub key: &'a str,
    pub bytes: u64,
    pub age: Duration,
}

/// Order candidates for eviction
pub(crate) fn eviction_order<'a>(candidates: &[Candidate<'a>], recency_weight: f64) -> Vec<&'a str> {
    let weight = recency_weight.clamp(0.0, 1.0);
    let max_age = candidates.iter().map(|c| c.age).max().unwrap_or_default().as_secs_f64();
    let max_bytes = candidates.iter().map(|c| c.bytes).max().unwrap_or(0) as f64;

    let normalize = |value: f64, max: f64| if max > 0.0 { value / max } else { 0.0 };

    let mut scored: Vec<(f64, &'a str)> = candidates
        .iter()
        .map(|c| {
            let score = weight * normalize(c.age.as_secs_f64(), max_age)
                + (1.0 - weight) * normalize(c.bytes as f64, max_bytes);
            (score, c.key)
        })
        .collect();

    scored.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.cmp(b.1)));
    scored.into_iter().map(|(_, key)| key).collect()
}

/// Result of a prune pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PruneReport {
    /// Estimated bytes released
    pub bytes_freed: u64,
    /// Evicted keys in eviction order
    pub removed: Vec<String>,
    /// Estimated bytes still resident
    pub remaining_bytes: u64,
    /// Requested ceiling
    pub target_bytes: u64,
}

impl PruneReport {
    /// Whether usage ended at or below the target. False means only
    /// non-evictable assets remain above it.
    pub fn target_met(&self) -> bool {
        self.remaining_bytes <= self.target_bytes
    }
}
