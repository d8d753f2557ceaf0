//! The shared, module-independent pieces of the resonance algebra.
//!
//! Everything here is a total function over plain numbers: no store access,
//! no clock, no randomness. The per-module scorers choose the inputs.

use std::collections::BTreeMap;

use weft_strand::payload::ScaleQuality;

/// Mean pairwise agreement of per-scale quality across the scales in
/// `scale_set` that the payload actually reported. Agreement of a pair is
/// `1 - |a - b|` with inputs clamped to `[0, 1]`.
///
/// Fewer than two reported scales means self-similarity cannot be observed;
/// the neutral 0.5 is returned.
pub fn pairwise_agreement(quality: &ScaleQuality, scale_set: &[&str]) -> f64 {
    let values: Vec<f64> = scale_set
        .iter()
        .filter_map(|scale| quality.get(*scale))
        .map(|q| q.clamp(0.0, 1.0))
        .collect();

    if values.len() < 2 {
        return 0.5;
    }

    let mut total = 0.0;
    let mut pairs = 0usize;
    for i in 0..values.len() {
        for j in (i + 1)..values.len() {
            total += 1.0 - (values[i] - values[j]).abs();
            pairs += 1;
        }
    }
    (total / pairs as f64).clamp(0.0, 1.0)
}

/// Diversity of `own_bucket` against a cohort's taxonomy labels: the mean of
/// bucket rarity (`1 - p(own)`) and normalized Shannon entropy (`H / ln k`).
/// An empty cohort gives the neutral 0.5.
pub fn cohort_diversity(own_bucket: &str, cohort_buckets: &[String]) -> f64 {
    if cohort_buckets.is_empty() {
        return 0.5;
    }

    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for bucket in cohort_buckets {
        *counts.entry(bucket.as_str()).or_default() += 1;
    }
    let n = cohort_buckets.len() as f64;
    let own = counts.get(own_bucket).copied().unwrap_or(0) as f64;
    let rarity = 1.0 - own / n;

    let k = counts.len();
    let entropy_norm = if k <= 1 {
        0.0
    } else {
        let entropy: f64 = counts
            .values()
            .map(|&c| {
                let p = c as f64 / n;
                -p * p.ln()
            })
            .sum();
        entropy / (k as f64).ln()
    };

    (0.5 * rarity + 0.5 * entropy_norm).clamp(0.0, 1.0)
}

/// Rank-weighted mean of a history series, newest first: observation at rank
/// `r` weighs `1 / (r + 1)`, so recent observations dominate.
pub fn rank_weighted_mean(history_newest_first: &[f64]) -> Option<f64> {
    if history_newest_first.is_empty() {
        return None;
    }
    let mut weighted = 0.0;
    let mut weights = 0.0;
    for (rank, value) in history_newest_first.iter().enumerate() {
        let w = 1.0 / (rank as f64 + 1.0);
        weighted += w * value;
        weights += w;
    }
    Some(weighted / weights)
}

/// Meta-evolution: `clamp(1 + (current - historical) / historical, 0, 2)`.
/// A non-positive historical baseline cannot express a rate; 1.0 is returned.
pub fn improvement_rate(current: f64, historical: f64) -> f64 {
    if historical <= 0.0 {
        return 1.0;
    }
    (1.0 + (current - historical) / historical).clamp(0.0, 2.0)
}

/// Blend a base outcome factor with the downstream module's success rate at
/// `weight`: `base * ((1 - weight) + weight * downstream)`. A neutral
/// downstream of 1.0 leaves the base unchanged.
pub fn downstream_blend(base: f64, downstream: f64, weight: f64) -> f64 {
    let weight = weight.clamp(0.0, 1.0);
    base * ((1.0 - weight) + weight * downstream.max(0.0))
}
