use chrono::{DateTime, Duration, TimeZone, Utc};

use weft_strand::{BucketVocabulary, ClusterKey, Strand, StrandPayload, ViewId};

/// Bucket label for one strand under one view, or `None` when the view does
/// not apply. Pure: the same strand, payload, and vocabulary always map to
/// the same label.
pub fn bucket_for(
    view: ViewId,
    strand: &Strand,
    payload: &StrandPayload,
    vocab: &BucketVocabulary,
) -> Option<String> {
    match view {
        ViewId::Asset => strand.symbol.clone(),
        ViewId::Timeframe => strand.timeframe.clone(),
        ViewId::Regime => strand.regime.clone(),
        ViewId::PatternSignature => match payload {
            StrandPayload::Pattern(c) => {
                let symbol = strand.symbol.as_deref()?;
                let timeframe = strand.timeframe.as_deref()?;
                Some(format!("{symbol}|{timeframe}|{}", c.pattern_type))
            }
            _ => None,
        },
        ViewId::PatternType => match payload {
            StrandPayload::Pattern(c) => Some(c.pattern_type.clone()),
            _ => None,
        },
        ViewId::Method => match payload {
            StrandPayload::PredictionReview(c) => Some(c.method.clone()),
            _ => None,
        },
        ViewId::PlanType => match payload {
            StrandPayload::TradingPlan(c) => Some(c.plan_type.clone()),
            _ => None,
        },
        ViewId::DecisionFactor => match payload {
            StrandPayload::TradingDecision(c) => Some(c.decision_factor.clone()),
            _ => None,
        },
        ViewId::ExecutionStrategy => match payload {
            StrandPayload::ExecutionOutcome(c) => Some(c.execution_strategy.clone()),
            _ => None,
        },
        ViewId::OutcomeBucket => match payload {
            StrandPayload::TradeOutcome(c) => {
                let result = if c.success { "win" } else { "loss" };
                let rr = if c.realized_rr < 1.0 {
                    "rr-lt-1"
                } else if c.realized_rr < 2.0 {
                    "rr-1-2"
                } else {
                    "rr-2-plus"
                };
                Some(format!("{result}|{rr}"))
            }
            _ => None,
        },
        ViewId::McapBucket => {
            let mcap = match payload {
                StrandPayload::Pattern(c) => c.market_cap_usd,
                StrandPayload::PositionClosed(c) => c.entry_context.market_cap_usd,
                _ => None,
            }?;
            Some(vocab.mcap_bucket(mcap).to_string())
        }
        ViewId::GroupSignature => match payload {
            StrandPayload::PredictionReview(c) => c.group_signature.clone(),
            _ => None,
        },
        ViewId::Scope => match payload {
            StrandPayload::Braid(c) if !c.recommended_scope.is_empty() => {
                Some(c.recommended_scope.clone())
            }
            _ => None,
        },
    }
}

/// Every cluster key a strand materializes under the given view set.
pub fn cluster_keys_for(
    strand: &Strand,
    payload: &StrandPayload,
    views: &[ViewId],
    vocab: &BucketVocabulary,
) -> Vec<ClusterKey> {
    views
        .iter()
        .filter_map(|&view| {
            bucket_for(view, strand, payload, vocab).map(|bucket| ClusterKey::new(view, bucket))
        })
        .collect()
}

/// Start of the recency-window grid cell containing `at`. Cluster identity
/// includes this, so a bucket that stays active across windows produces one
/// braid per window, not one ever.
pub fn window_start(at: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    let window_secs = window.num_seconds().max(1);
    let since_epoch = at.timestamp();
    let aligned = since_epoch.div_euclid(window_secs) * window_secs;
    Utc.timestamp_opt(aligned, 0).single().unwrap_or(at)
}
