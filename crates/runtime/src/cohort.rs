//! Cohort assembly: the store queries behind the resonance inputs.
//!
//! Determinism rule: a strand's cohort is everything of its kind created
//! strictly BEFORE it inside the recency window. Later arrivals never
//! change an already-computed score, so redelivering a queue item recomputes
//! bit-identical scores against an unchanged store.

use weft_resonance::{Cohort, ModuleScorer};
use weft_store::{StoreError, StrandStore, TimeWindow};
use weft_strand::{LearningConfig, Strand, StrandKind, StrandPayload};

/// The module one step downstream in the platform's causal chain; its
/// realized success feeds back into this kind's ρ.
pub(crate) fn downstream_kind(kind: &StrandKind) -> Option<StrandKind> {
    match kind {
        StrandKind::Pattern => Some(StrandKind::PredictionReview),
        StrandKind::PredictionReview => Some(StrandKind::ConditionalTradingPlan),
        StrandKind::ConditionalTradingPlan => Some(StrandKind::TradingDecision),
        StrandKind::TradingDecision => Some(StrandKind::ExecutionOutcome),
        _ => None,
    }
}

fn downstream_success(payload: &StrandPayload) -> Option<bool> {
    match payload {
        StrandPayload::PredictionReview(c) => Some(c.success),
        // A plan counts as successful once its realized profitability
        // clears the coin-flip line.
        StrandPayload::TradingPlan(c) => Some(c.profitability >= 0.5),
        StrandPayload::TradingDecision(c) => Some(c.approved),
        StrandPayload::ExecutionOutcome(c) => Some(c.success),
        StrandPayload::TradeOutcome(c) => Some(c.success),
        _ => None,
    }
}

pub(crate) fn assemble_cohort(
    store: &StrandStore,
    strand: &Strand,
    config: &LearningConfig,
    scorer: &dyn ModuleScorer,
) -> Result<Cohort, StoreError> {
    let mut cohort = Cohort::empty();

    // Peers: same kind and level, earlier than the subject, inside the
    // recency window.
    let window = TimeWindow {
        start: strand.created_at - config.recency_window(),
        end: strand.created_at,
    };
    let peers = store.scan(
        &strand.kind,
        window,
        strand.braid_level,
        strand.braid_level,
        0.0,
    )?;

    let own_bucket = StrandPayload::decode(&strand.kind, &strand.content)
        .ok()
        .and_then(|p| scorer.taxonomy_bucket(&p));

    // Newest first so the rank weights favor recent observations.
    let mut ordered: Vec<&Strand> = peers.iter().filter(|p| p.id < strand.id).collect();
    ordered.sort_by(|a, b| b.id.cmp(&a.id));

    for peer in ordered {
        let Ok(payload) = StrandPayload::decode(&peer.kind, &peer.content) else {
            continue;
        };
        let Some(bucket) = scorer.taxonomy_bucket(&payload) else {
            continue;
        };
        if Some(&bucket) == own_bucket.as_ref() {
            if let Some(accuracy) = scorer.current_accuracy(&payload) {
                cohort.bucket_history.push(accuracy);
            }
        }
        cohort.taxonomy.push(bucket);
    }

    // Downstream feedback: children of this strand in the next module.
    if let Some(child_kind) = downstream_kind(&strand.kind) {
        let children = store.scan(&child_kind, TimeWindow::all(), 1, u32::MAX, 0.0)?;
        for child in children {
            if !child.parent_ids.contains(&strand.id) {
                continue;
            }
            let Ok(payload) = StrandPayload::decode(&child.kind, &child.content) else {
                continue;
            };
            if let Some(success) = downstream_success(&payload) {
                cohort.downstream_total += 1;
                if success {
                    cohort.downstream_successes += 1;
                }
            }
        }
    }

    Ok(cohort)
}
