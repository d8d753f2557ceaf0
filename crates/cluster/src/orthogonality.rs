//! Pairwise orthogonality check over view partitions.
//!
//! Two views are redundant when one's partition refines the other's: knowing
//! a strand's bucket under view A (almost) determines its bucket under view
//! B. Learning configs are validated against this on synthetic samples so a
//! module never burns LLM budget braiding the same grouping twice under two
//! names.

use std::collections::BTreeMap;

use weft_strand::{BucketVocabulary, Strand, StrandPayload, ViewId};

use crate::bucketer::bucket_for;

/// How strongly partition `a` determines partition `b`, in `[0, 1]`.
///
/// For each `a`-bucket, the share of its members that sit in the bucket's
/// dominant `b`-label; the result is the member-weighted mean. 1.0 means `a`
/// refines `b` exactly; values near `1 / |b-buckets|` mean independence.
/// Items either view could not bucket are skipped.
pub fn partition_refinement(a: &[Option<String>], b: &[Option<String>]) -> f64 {
    debug_assert_eq!(a.len(), b.len());

    let mut groups: BTreeMap<&str, BTreeMap<&str, usize>> = BTreeMap::new();
    let mut total = 0usize;
    for (a_label, b_label) in a.iter().zip(b) {
        let (Some(a_label), Some(b_label)) = (a_label, b_label) else {
            continue;
        };
        *groups
            .entry(a_label.as_str())
            .or_default()
            .entry(b_label.as_str())
            .or_default() += 1;
        total += 1;
    }

    if total == 0 {
        return 0.0;
    }

    let mut agreement = 0usize;
    for b_counts in groups.values() {
        agreement += b_counts.values().copied().max().unwrap_or(0);
    }
    agreement as f64 / total as f64
}

/// Verify every pair of views stays under the refinement threshold in both
/// directions on the given sample. Views that bucketed fewer than two
/// distinct labels in the sample are skipped (they carry no partition to
/// compare).
pub fn views_pairwise_orthogonal(
    sample: &[(Strand, StrandPayload)],
    views: &[ViewId],
    vocab: &BucketVocabulary,
    threshold: f64,
) -> bool {
    let labels: Vec<(ViewId, Vec<Option<String>>)> = views
        .iter()
        .map(|&view| {
            let column = sample
                .iter()
                .map(|(strand, payload)| bucket_for(view, strand, payload, vocab))
                .collect();
            (view, column)
        })
        .collect();

    let distinct = |column: &[Option<String>]| {
        column
            .iter()
            .flatten()
            .collect::<std::collections::BTreeSet<_>>()
            .len()
    };

    for i in 0..labels.len() {
        for j in (i + 1)..labels.len() {
            let (_, ref a) = labels[i];
            let (_, ref b) = labels[j];
            if distinct(a) < 2 || distinct(b) < 2 {
                continue;
            }
            if partition_refinement(a, b) > threshold || partition_refinement(b, a) > threshold {
                return false;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use weft_strand::{BucketVocabulary, Strand, StrandId, StrandKind, StrandPayload, ViewId};

    use super::{partition_refinement, views_pairwise_orthogonal};

    fn labels(values: &[&str]) -> Vec<Option<String>> {
        values.iter().map(|v| Some(v.to_string())).collect()
    }

    fn synthetic_patterns() -> Vec<(Strand, StrandPayload)> {
        // Pattern types and market caps vary independently of each other.
        let mut sample = Vec::new();
        let caps = [100_000.0, 700_000.0, 1_500_000.0, 3_000_000.0];
        for (i, pattern_type) in ["volume_spike", "breakout", "squeeze", "sweep"]
            .iter()
            .enumerate()
        {
            for (j, cap) in caps.iter().enumerate() {
                let at = Utc::now();
                let content = json!({
                    "pattern_type": pattern_type,
                    "market_cap_usd": cap
                });
                let strand = Strand::leaf(
                    StrandId::new_at(at),
                    StrandKind::Pattern,
                    at,
                    content.clone(),
                )
                .with_symbol(format!("SYM{i}{j}"))
                .with_timeframe("1m");
                let payload = StrandPayload::decode(&StrandKind::Pattern, &content).unwrap();
                sample.push((strand, payload));
            }
        }
        sample
    }

    #[test]
    fn independent_facet_views_pass_the_check() {
        let sample = synthetic_patterns();
        assert!(views_pairwise_orthogonal(
            &sample,
            &[ViewId::PatternType, ViewId::McapBucket],
            &BucketVocabulary::current(),
            0.6,
        ));
    }

    #[test]
    fn a_view_that_refines_another_fails_the_check() {
        // The composite signature determines the pattern type exactly.
        let sample = synthetic_patterns();
        assert!(!views_pairwise_orthogonal(
            &sample,
            &[ViewId::PatternSignature, ViewId::PatternType],
            &BucketVocabulary::current(),
            0.6,
        ));
    }

    #[test]
    fn identical_partitions_refine_completely() {
        let a = labels(&["x", "x", "y", "y"]);
        let b = labels(&["p", "p", "q", "q"]);
        assert_eq!(partition_refinement(&a, &b), 1.0);
    }

    #[test]
    fn independent_partitions_score_low() {
        // a splits 1/3 vs 2/4; b splits 1/2 vs 3/4: knowing a says little
        // about b.
        let a = labels(&["x", "y", "x", "y"]);
        let b = labels(&["p", "p", "q", "q"]);
        assert_eq!(partition_refinement(&a, &b), 0.5);
    }

    #[test]
    fn unbucketable_items_are_skipped() {
        let a = vec![Some("x".to_string()), None, Some("x".to_string())];
        let b = vec![Some("p".to_string()), Some("q".to_string()), Some("p".to_string())];
        assert_eq!(partition_refinement(&a, &b), 1.0);
    }
}
