//! Per-module bindings of the resonance algebra.
//!
//! Each scorer names its scale set, its taxonomy, its realized-outcome
//! formula for ρ, and its selection weights. Missing payload inputs fall
//! back to the module's neutral values rather than erroring; a strand whose
//! payload failed to decode never reaches a scorer (the dispatcher parks it
//! first).

pub use crate::engine::ModuleScorer;
use crate::engine::{SelectionInputs, SelectionWeights};

use weft_strand::{ScorerId, StrandPayload};

// ── patterns ──────────────────────────────────────────────────────────────────

/// Pattern detector output: ρ = success_rate × confidence.
#[derive(Debug, Default)]
pub struct PatternScorer;

impl ModuleScorer for PatternScorer {
    fn id(&self) -> ScorerId {
        ScorerId::Pattern
    }

    fn scale_set(&self) -> &[&'static str] {
        &["1m", "5m", "15m", "1h", "4h"]
    }

    fn taxonomy_bucket(&self, payload: &StrandPayload) -> Option<String> {
        match payload {
            StrandPayload::Pattern(c) => Some(c.pattern_type.clone()),
            _ => None,
        }
    }

    fn rho_base(&self, payload: &StrandPayload) -> f64 {
        match payload {
            StrandPayload::Pattern(c) => {
                c.success_rate.clamp(0.0, 1.0) * c.confidence.clamp(0.0, 1.0)
            }
            _ => 1.0,
        }
    }

    fn current_accuracy(&self, payload: &StrandPayload) -> Option<f64> {
        match payload {
            StrandPayload::Pattern(c) => Some(c.success_rate.clamp(0.0, 1.0)),
            _ => None,
        }
    }

    fn selection_inputs(&self, payload: &StrandPayload) -> SelectionInputs {
        match payload {
            StrandPayload::Pattern(c) => SelectionInputs {
                accuracy: c.success_rate,
                precision: c.confidence,
                // Thin samples are cheap to emit and expensive to trust.
                cost: 1.0 / (1.0 + c.sample_count as f64),
            },
            _ => neutral_inputs(),
        }
    }

    fn selection_weights(&self) -> SelectionWeights {
        SelectionWeights {
            accuracy: 0.35,
            precision: 0.25,
            stability: 0.20,
            orthogonality: 0.20,
            cost: 0.10,
        }
    }
}

// ── prediction reviews ────────────────────────────────────────────────────────

/// Prediction engine reviews: ρ = success × (1 + 0.1·return_pct).
#[derive(Debug, Default)]
pub struct PredictionScorer;

impl ModuleScorer for PredictionScorer {
    fn id(&self) -> ScorerId {
        ScorerId::Prediction
    }

    fn rho_bounds(&self) -> (f64, f64) {
        (0.0, 3.0)
    }

    fn scale_set(&self) -> &[&'static str] {
        &["1m", "15m", "1h", "1d"]
    }

    fn taxonomy_bucket(&self, payload: &StrandPayload) -> Option<String> {
        match payload {
            StrandPayload::PredictionReview(c) => Some(c.method.clone()),
            _ => None,
        }
    }

    fn rho_base(&self, payload: &StrandPayload) -> f64 {
        match payload {
            StrandPayload::PredictionReview(c) => {
                let success = if c.success { 1.0 } else { 0.0 };
                success * (1.0 + 0.1 * c.return_pct)
            }
            _ => 1.0,
        }
    }

    fn current_accuracy(&self, payload: &StrandPayload) -> Option<f64> {
        match payload {
            StrandPayload::PredictionReview(c) => Some(if c.success { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    fn selection_inputs(&self, payload: &StrandPayload) -> SelectionInputs {
        match payload {
            StrandPayload::PredictionReview(c) => SelectionInputs {
                accuracy: if c.success { 1.0 } else { 0.0 },
                precision: c.confidence,
                cost: 0.05,
            },
            _ => neutral_inputs(),
        }
    }

    fn selection_weights(&self) -> SelectionWeights {
        SelectionWeights {
            accuracy: 0.40,
            precision: 0.30,
            stability: 0.15,
            orthogonality: 0.15,
            cost: 0.10,
        }
    }
}

// ── conditional trading plans ─────────────────────────────────────────────────

/// Planner output: ρ = profitability × risk_adjusted_return.
#[derive(Debug, Default)]
pub struct PlanScorer;

impl ModuleScorer for PlanScorer {
    fn id(&self) -> ScorerId {
        ScorerId::Plan
    }

    fn scale_set(&self) -> &[&'static str] {
        &["small", "medium", "large"]
    }

    fn taxonomy_bucket(&self, payload: &StrandPayload) -> Option<String> {
        match payload {
            StrandPayload::TradingPlan(c) => Some(c.plan_type.clone()),
            _ => None,
        }
    }

    fn rho_base(&self, payload: &StrandPayload) -> f64 {
        match payload {
            StrandPayload::TradingPlan(c) => {
                c.profitability.max(0.0) * c.risk_adjusted_return.max(0.0)
            }
            _ => 1.0,
        }
    }

    fn current_accuracy(&self, payload: &StrandPayload) -> Option<f64> {
        match payload {
            StrandPayload::TradingPlan(c) => Some(c.profitability.clamp(0.0, 1.0)),
            _ => None,
        }
    }

    fn selection_inputs(&self, payload: &StrandPayload) -> SelectionInputs {
        match payload {
            StrandPayload::TradingPlan(c) => SelectionInputs {
                accuracy: c.profitability,
                precision: c.risk_adjusted_return.clamp(0.0, 1.0),
                cost: 0.05,
            },
            _ => neutral_inputs(),
        }
    }

    fn selection_weights(&self) -> SelectionWeights {
        SelectionWeights {
            accuracy: 0.35,
            precision: 0.30,
            stability: 0.15,
            orthogonality: 0.20,
            cost: 0.10,
        }
    }
}

// ── trading decisions ─────────────────────────────────────────────────────────

/// Decision maker output: ρ weighs stated confidence, discounted for
/// rejections (a rejection's realized outcome is unobservable).
#[derive(Debug, Default)]
pub struct DecisionScorer;

impl ModuleScorer for DecisionScorer {
    fn id(&self) -> ScorerId {
        ScorerId::Decision
    }

    fn scale_set(&self) -> &[&'static str] {
        &["per_trade", "per_day", "per_book"]
    }

    fn taxonomy_bucket(&self, payload: &StrandPayload) -> Option<String> {
        match payload {
            StrandPayload::TradingDecision(c) => Some(c.decision_factor.clone()),
            _ => None,
        }
    }

    fn rho_base(&self, payload: &StrandPayload) -> f64 {
        match payload {
            StrandPayload::TradingDecision(c) => {
                let gate = if c.approved { 1.0 } else { 0.6 };
                c.confidence.clamp(0.0, 1.0) * gate
            }
            _ => 1.0,
        }
    }

    fn current_accuracy(&self, payload: &StrandPayload) -> Option<f64> {
        match payload {
            StrandPayload::TradingDecision(c) => Some(c.confidence.clamp(0.0, 1.0)),
            _ => None,
        }
    }

    fn selection_inputs(&self, payload: &StrandPayload) -> SelectionInputs {
        match payload {
            StrandPayload::TradingDecision(c) => SelectionInputs {
                accuracy: c.confidence,
                precision: if c.approved { 0.8 } else { 0.5 },
                cost: 0.02,
            },
            _ => neutral_inputs(),
        }
    }

    fn selection_weights(&self) -> SelectionWeights {
        SelectionWeights {
            accuracy: 0.30,
            precision: 0.25,
            stability: 0.20,
            orthogonality: 0.25,
            cost: 0.10,
        }
    }
}

// ── trade outcomes ────────────────────────────────────────────────────────────

/// Trader outcome records: ρ = success × (1 + 0.1·realized_rr).
#[derive(Debug, Default)]
pub struct TradeOutcomeScorer;

impl ModuleScorer for TradeOutcomeScorer {
    fn id(&self) -> ScorerId {
        ScorerId::TradeOutcome
    }

    fn rho_bounds(&self) -> (f64, f64) {
        (0.0, 3.0)
    }

    fn scale_set(&self) -> &[&'static str] {
        &["small", "medium", "large"]
    }

    fn taxonomy_bucket(&self, payload: &StrandPayload) -> Option<String> {
        match payload {
            StrandPayload::TradeOutcome(c) => Some(c.strategy.clone()),
            _ => None,
        }
    }

    fn rho_base(&self, payload: &StrandPayload) -> f64 {
        match payload {
            StrandPayload::TradeOutcome(c) => {
                let success = if c.success { 1.0 } else { 0.0 };
                success * (1.0 + 0.1 * c.realized_rr)
            }
            _ => 1.0,
        }
    }

    fn current_accuracy(&self, payload: &StrandPayload) -> Option<f64> {
        match payload {
            StrandPayload::TradeOutcome(c) => Some(if c.success { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    fn selection_inputs(&self, payload: &StrandPayload) -> SelectionInputs {
        match payload {
            StrandPayload::TradeOutcome(c) => SelectionInputs {
                accuracy: if c.success { 1.0 } else { 0.0 },
                precision: (c.realized_rr / 3.0).clamp(0.0, 1.0),
                cost: 0.02,
            },
            _ => neutral_inputs(),
        }
    }

    fn selection_weights(&self) -> SelectionWeights {
        SelectionWeights {
            accuracy: 0.40,
            precision: 0.25,
            stability: 0.15,
            orthogonality: 0.20,
            cost: 0.05,
        }
    }
}

// ── execution outcomes ────────────────────────────────────────────────────────

/// Execution reports: ρ = fill_quality discounted by slippage, gated on
/// success.
#[derive(Debug, Default)]
pub struct ExecutionScorer;

impl ModuleScorer for ExecutionScorer {
    fn id(&self) -> ScorerId {
        ScorerId::Execution
    }

    fn scale_set(&self) -> &[&'static str] {
        &["small_order", "medium_order", "large_order"]
    }

    fn taxonomy_bucket(&self, payload: &StrandPayload) -> Option<String> {
        match payload {
            StrandPayload::ExecutionOutcome(c) => Some(c.execution_strategy.clone()),
            _ => None,
        }
    }

    fn rho_base(&self, payload: &StrandPayload) -> f64 {
        match payload {
            StrandPayload::ExecutionOutcome(c) => {
                let gate = if c.success { 1.0 } else { 0.25 };
                let slip_penalty = (c.slippage_bps / 10_000.0).clamp(0.0, 1.0);
                c.fill_quality.clamp(0.0, 1.0) * (1.0 - slip_penalty) * gate
            }
            _ => 1.0,
        }
    }

    fn current_accuracy(&self, payload: &StrandPayload) -> Option<f64> {
        match payload {
            StrandPayload::ExecutionOutcome(c) => Some(c.fill_quality.clamp(0.0, 1.0)),
            _ => None,
        }
    }

    fn selection_inputs(&self, payload: &StrandPayload) -> SelectionInputs {
        match payload {
            StrandPayload::ExecutionOutcome(c) => SelectionInputs {
                accuracy: c.fill_quality,
                precision: if c.success { 0.9 } else { 0.2 },
                cost: 0.02,
            },
            _ => neutral_inputs(),
        }
    }

    fn selection_weights(&self) -> SelectionWeights {
        SelectionWeights {
            accuracy: 0.35,
            precision: 0.30,
            stability: 0.20,
            orthogonality: 0.15,
            cost: 0.05,
        }
    }
}

// ── passive ───────────────────────────────────────────────────────────────────

/// Fallback for unknown kinds: the engine short-circuits to neutral scores
/// before consulting any of these methods.
#[derive(Debug, Default)]
pub struct PassiveScorer;

impl ModuleScorer for PassiveScorer {
    fn id(&self) -> ScorerId {
        ScorerId::Passive
    }

    fn scale_set(&self) -> &[&'static str] {
        &[]
    }

    fn taxonomy_bucket(&self, _payload: &StrandPayload) -> Option<String> {
        None
    }

    fn rho_base(&self, _payload: &StrandPayload) -> f64 {
        1.0
    }

    fn current_accuracy(&self, _payload: &StrandPayload) -> Option<f64> {
        None
    }

    fn selection_inputs(&self, _payload: &StrandPayload) -> SelectionInputs {
        neutral_inputs()
    }

    fn selection_weights(&self) -> SelectionWeights {
        SelectionWeights {
            accuracy: 0.25,
            precision: 0.25,
            stability: 0.25,
            orthogonality: 0.25,
            cost: 0.0,
        }
    }
}

fn neutral_inputs() -> SelectionInputs {
    SelectionInputs {
        accuracy: 0.5,
        precision: 0.5,
        cost: 0.0,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use weft_strand::{StrandKind, StrandPayload};

    use super::{ModuleScorer, PredictionScorer, TradeOutcomeScorer};

    #[test]
    fn failed_prediction_has_zero_rho_base() {
        let payload = StrandPayload::decode(
            &StrandKind::PredictionReview,
            &json!({"method": "breakout", "success": false, "return_pct": 4.0}),
        )
        .unwrap();
        assert_eq!(PredictionScorer.rho_base(&payload), 0.0);
    }

    #[test]
    fn successful_prediction_scales_with_return() {
        let win = StrandPayload::decode(
            &StrandKind::PredictionReview,
            &json!({"method": "breakout", "success": true, "return_pct": 5.0}),
        )
        .unwrap();
        assert_eq!(PredictionScorer.rho_base(&win), 1.5);
    }

    #[test]
    fn trade_outcome_taxonomy_is_the_strategy() {
        let payload = StrandPayload::decode(
            &StrandKind::TradeOutcome,
            &json!({"strategy": "momentum", "success": true, "realized_rr": 2.0}),
        )
        .unwrap();
        assert_eq!(
            TradeOutcomeScorer.taxonomy_bucket(&payload).as_deref(),
            Some("momentum")
        );
    }
}
