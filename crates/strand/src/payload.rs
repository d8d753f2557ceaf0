//! Typed per-kind payloads.
//!
//! The store keeps `content` as raw JSON (the table is homogeneous and
//! append-mostly); the pipeline decodes into these records at its boundary.
//! A decode failure on a known kind is an input error the dispatcher parks;
//! unknown kinds decode to [`StrandPayload::Opaque`] and take the passive
//! path.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::kind::StrandKind;
use crate::learning::ViewId;

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("malformed {kind} content: {source}")]
    Malformed {
        kind: StrandKind,
        #[source]
        source: serde_json::Error,
    },
}

/// Quality of the emitter's behavior at named scales (timeframes, order
/// sizes, regimes). Keys are module-chosen scale names; values in `[0, 1]`.
pub type ScaleQuality = BTreeMap<String, f64>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternContent {
    pub pattern_type: String,
    #[serde(default)]
    pub success_rate: f64,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub sample_count: u64,
    #[serde(default)]
    pub scale_quality: ScaleQuality,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub market_cap_usd: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionReviewContent {
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_signature: Option<String>,
    pub success: bool,
    #[serde(default)]
    pub confidence: f64,
    /// Realized return of the prediction's target move, in percent.
    #[serde(default)]
    pub return_pct: f64,
    #[serde(default)]
    pub scale_quality: ScaleQuality,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingPlanContent {
    pub plan_type: String,
    #[serde(default)]
    pub profitability: f64,
    #[serde(default)]
    pub risk_adjusted_return: f64,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub scale_quality: ScaleQuality,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingDecisionContent {
    /// Dominant factor taxonomy bucket (e.g. `risk_budget`, `curator_signal`).
    pub decision_factor: String,
    pub approved: bool,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub scale_quality: ScaleQuality,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeOutcomeContent {
    pub strategy: String,
    pub success: bool,
    /// Realized reward/risk multiple.
    #[serde(default)]
    pub realized_rr: f64,
    #[serde(default)]
    pub scale_quality: ScaleQuality,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOutcomeContent {
    pub execution_strategy: String,
    pub success: bool,
    #[serde(default)]
    pub slippage_bps: f64,
    /// Fill quality in `[0, 1]` as reported by the trader module.
    #[serde(default)]
    pub fill_quality: f64,
    #[serde(default)]
    pub scale_quality: ScaleQuality,
}

/// The allocation levers active when a position was opened.
///
/// Buckets may be reported directly (`mcap_bucket`, ...) or derived from the
/// raw values through the bucket vocabulary when absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntryContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub curator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeframe: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcap_bucket: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vol_bucket: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age_bucket: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub market_cap_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_24h_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_age_days: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletedTrade {
    /// Realized reward/risk multiple for the closed trade.
    pub rr: f64,
    pub exit_timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionClosedContent {
    pub entry_context: EntryContext,
    pub completed_trades: Vec<CompletedTrade>,
}

/// Validated LLM synthesis plus the cluster provenance the braider records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BraidContent {
    pub summary: String,
    #[serde(default)]
    pub insights: Vec<String>,
    #[serde(default)]
    pub recommended_scope: String,
    pub confidence: f64,
    /// Kind of the parent strands this braid summarizes.
    pub source_kind: StrandKind,
    pub view: ViewId,
    pub bucket: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BraidFailedContent {
    /// Cluster identity the synthesis was attempted for.
    pub cluster: String,
    pub cause: String,
    pub attempts: u32,
}

/// Kind-dispatched decode of a strand's `content` field.
#[derive(Debug, Clone)]
pub enum StrandPayload {
    Pattern(PatternContent),
    PredictionReview(PredictionReviewContent),
    TradingPlan(TradingPlanContent),
    TradingDecision(TradingDecisionContent),
    TradeOutcome(TradeOutcomeContent),
    ExecutionOutcome(ExecutionOutcomeContent),
    PositionClosed(PositionClosedContent),
    Braid(BraidContent),
    BraidFailed(BraidFailedContent),
    /// Unknown kind: stored verbatim, never interpreted.
    Opaque(Value),
}

impl StrandPayload {
    pub fn decode(kind: &StrandKind, content: &Value) -> Result<Self, PayloadError> {
        fn parse<T: serde::de::DeserializeOwned>(
            kind: &StrandKind,
            content: &Value,
        ) -> Result<T, PayloadError> {
            serde_json::from_value(content.clone()).map_err(|source| PayloadError::Malformed {
                kind: kind.clone(),
                source,
            })
        }

        Ok(match kind {
            StrandKind::Pattern => StrandPayload::Pattern(parse(kind, content)?),
            StrandKind::PredictionReview => StrandPayload::PredictionReview(parse(kind, content)?),
            StrandKind::ConditionalTradingPlan => StrandPayload::TradingPlan(parse(kind, content)?),
            StrandKind::TradingDecision => StrandPayload::TradingDecision(parse(kind, content)?),
            StrandKind::TradeOutcome => StrandPayload::TradeOutcome(parse(kind, content)?),
            StrandKind::ExecutionOutcome => StrandPayload::ExecutionOutcome(parse(kind, content)?),
            StrandKind::PositionClosed => StrandPayload::PositionClosed(parse(kind, content)?),
            StrandKind::Braid => StrandPayload::Braid(parse(kind, content)?),
            StrandKind::BraidFailed => StrandPayload::BraidFailed(parse(kind, content)?),
            StrandKind::Other(_) => StrandPayload::Opaque(content.clone()),
        })
    }

    /// Per-scale quality map, for scorers computing fractal self-similarity.
    pub fn scale_quality(&self) -> Option<&ScaleQuality> {
        match self {
            StrandPayload::Pattern(c) => Some(&c.scale_quality),
            StrandPayload::PredictionReview(c) => Some(&c.scale_quality),
            StrandPayload::TradingPlan(c) => Some(&c.scale_quality),
            StrandPayload::TradingDecision(c) => Some(&c.scale_quality),
            StrandPayload::TradeOutcome(c) => Some(&c.scale_quality),
            StrandPayload::ExecutionOutcome(c) => Some(&c.scale_quality),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::kind::StrandKind;

    use super::StrandPayload;

    #[test]
    fn pattern_content_decodes_with_defaults() {
        let payload = StrandPayload::decode(
            &StrandKind::Pattern,
            &json!({"pattern_type": "volume_spike", "confidence": 0.8}),
        )
        .unwrap();

        match payload {
            StrandPayload::Pattern(c) => {
                assert_eq!(c.pattern_type, "volume_spike");
                assert_eq!(c.confidence, 0.8);
                assert_eq!(c.sample_count, 0);
            }
            other => panic!("expected pattern payload, got {other:?}"),
        }
    }

    #[test]
    fn known_kind_with_bad_shape_is_an_error() {
        let err = StrandPayload::decode(&StrandKind::PositionClosed, &json!({"nope": true}));
        assert!(err.is_err());
    }

    #[test]
    fn unknown_kind_decodes_opaque() {
        let payload = StrandPayload::decode(
            &StrandKind::Other("sentiment_pulse".into()),
            &json!({"anything": [1, 2, 3]}),
        )
        .unwrap();
        assert!(matches!(payload, StrandPayload::Opaque(_)));
    }

    #[test]
    fn entry_context_accepts_pre_bucketed_levers() {
        let payload = StrandPayload::decode(
            &StrandKind::PositionClosed,
            &json!({
                "entry_context": {
                    "curator": "A",
                    "chain": "base",
                    "mcap_bucket": "1m-2m",
                    "vol_bucket": "250k-500k",
                    "age_bucket": "3-7d"
                },
                "completed_trades": [
                    {"rr": 1.42, "exit_timestamp": "2026-07-25T00:00:00Z"}
                ]
            }),
        )
        .unwrap();

        match payload {
            StrandPayload::PositionClosed(c) => {
                assert_eq!(c.entry_context.mcap_bucket.as_deref(), Some("1m-2m"));
                assert_eq!(c.completed_trades.len(), 1);
            }
            other => panic!("expected position_closed payload, got {other:?}"),
        }
    }
}
