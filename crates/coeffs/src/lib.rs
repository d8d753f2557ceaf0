//! Coefficient updater: turns closed-trade outcomes into per-lever and
//! per-interaction-pattern weights for upstream allocation logic.
//!
//! Triggered by `position_closed` strands. Each completed trade updates the
//! short and long EWMA of every lever active in its entry context, plus one
//! interaction pattern keyed by the sorted concatenation of the lever
//! buckets. When an interaction weight has moved away from neutral, the
//! overlapping single-lever weights are bled back toward 1.0 so the synergy
//! is not double-counted. An outcome's updates run as a single guarded
//! transaction, so redelivering the strand applies nothing the second time.

pub mod decay;

use std::sync::Arc;

use tracing::{debug, info, instrument};

use weft_store::{CoefficientBatch, CoefficientKey, StoreError, StrandStore};
use weft_strand::{BucketVocabulary, EntryContext, PositionClosedContent, StrandId};

use decay::{bleed, decay_weight, effective_alpha, ewma};

/// Bounds class of a coefficient.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeverClass {
    /// Allocation multipliers: clamped to `[0.5, 2.0]`.
    Allocation,
    /// Portfolio-wide outcome baselines (raw R/R units): `[-10, 10]`.
    Baseline,
}

impl LeverClass {
    pub fn bounds(&self) -> (f64, f64) {
        match self {
            LeverClass::Allocation => (0.5, 2.0),
            LeverClass::Baseline => (-10.0, 10.0),
        }
    }
}

/// Decay and bleed parameters; defaults match the process configuration.
#[derive(Debug, Clone, Copy)]
pub struct DecayParams {
    pub tau_short_days: f64,
    pub tau_long_days: f64,
    pub bleed_beta: f64,
    pub bleed_threshold: f64,
}

impl Default for DecayParams {
    fn default() -> Self {
        Self {
            tau_short_days: 14.0,
            tau_long_days: 90.0,
            bleed_beta: 0.2,
            bleed_threshold: 0.05,
        }
    }
}

/// What one `position_closed` strand did to the coefficient table.
#[derive(Debug, Default, Clone)]
pub struct UpdateReport {
    pub trades: usize,
    pub levers_updated: usize,
    pub interactions_updated: usize,
    pub bleeds_applied: usize,
    /// False when the outcome had already been applied (redelivery).
    pub applied: bool,
}

pub struct CoefficientUpdater {
    store: Arc<StrandStore>,
    vocab: BucketVocabulary,
    params: DecayParams,
}

impl CoefficientUpdater {
    pub fn new(store: Arc<StrandStore>, params: DecayParams) -> Self {
        Self {
            store,
            vocab: BucketVocabulary::current(),
            params,
        }
    }

    /// Apply every completed trade in an outcome strand for `module` (the
    /// module whose allocation weights are being learned). `outcome_id` is
    /// the strand's id and doubles as the idempotency guard.
    #[instrument(skip(self, content), fields(module, outcome = %outcome_id, trades = content.completed_trades.len()))]
    pub fn apply_position_closed(
        &self,
        module: &str,
        outcome_id: StrandId,
        content: &PositionClosedContent,
    ) -> Result<UpdateReport, StoreError> {
        let mut report = UpdateReport::default();
        let levers = self.levers(&content.entry_context);
        let now = self.store.clock().now();
        let params = self.params;
        let vocab_version = self.vocab.version();

        let applied = self.store.with_coefficient_batch(outcome_id, |batch| {
            for trade in &content.completed_trades {
                let age_days =
                    (now - trade.exit_timestamp).num_seconds().max(0) as f64 / 86_400.0;
                let alpha_short = effective_alpha(decay_weight(age_days, params.tau_short_days));
                let alpha_long = effective_alpha(decay_weight(age_days, params.tau_long_days));
                report.trades += 1;

                // Single levers.
                for (name, key) in &levers {
                    let coeff_key =
                        CoefficientKey::new(module, "allocation", name.clone(), key.clone());
                    ewma_update(
                        batch,
                        &coeff_key,
                        vocab_version,
                        LeverClass::Allocation,
                        trade.rr,
                        alpha_short,
                        alpha_long,
                    )?;
                    report.levers_updated += 1;
                }

                // Interaction pattern: sorted concatenation of the lever keys.
                if levers.len() >= 2 {
                    let mut parts: Vec<&str> = levers.iter().map(|(_, key)| key.as_str()).collect();
                    parts.sort_unstable();
                    let interaction_key = parts.join("|");
                    let coeff_key =
                        CoefficientKey::new(module, "allocation", "interaction", interaction_key);
                    let updated = ewma_update(
                        batch,
                        &coeff_key,
                        vocab_version,
                        LeverClass::Allocation,
                        trade.rr,
                        alpha_short,
                        alpha_long,
                    )?;
                    report.interactions_updated += 1;

                    // Importance bleed: the interaction has captured a
                    // synergy; pull the overlapping single levers toward
                    // neutral.
                    if (updated - 1.0).abs() > params.bleed_threshold {
                        let (lo, hi) = LeverClass::Allocation.bounds();
                        for (name, key) in &levers {
                            let lever_key = CoefficientKey::new(
                                module,
                                "allocation",
                                name.clone(),
                                key.clone(),
                            );
                            batch.update(&lever_key, vocab_version, |c| {
                                c.weight_short = bleed(c.weight_short, params.bleed_beta).clamp(lo, hi);
                                c.weight_long = bleed(c.weight_long, params.bleed_beta).clamp(lo, hi);
                            })?;
                            report.bleeds_applied += 1;
                        }
                    }
                }

                // Portfolio-wide baseline, same EWMA rule.
                let baseline_key =
                    CoefficientKey::new(module, "global", "baseline_rr", "portfolio");
                ewma_update(
                    batch,
                    &baseline_key,
                    vocab_version,
                    LeverClass::Baseline,
                    trade.rr,
                    alpha_short,
                    alpha_long,
                )?;
            }
            Ok(())
        })?;

        if !applied {
            debug!("outcome redelivered; coefficients unchanged");
            return Ok(UpdateReport::default());
        }

        report.applied = true;
        info!(
            trades = report.trades,
            levers = report.levers_updated,
            interactions = report.interactions_updated,
            bleeds = report.bleeds_applied,
            "coefficients updated"
        );
        Ok(report)
    }

    /// Active levers of an entry context as `(name, "name=bucket")` pairs.
    /// Raw values are normalized through the bucket vocabulary when the
    /// emitter did not pre-bucket them.
    fn levers(&self, entry: &EntryContext) -> Vec<(String, String)> {
        let mut out = Vec::new();
        let mut push = |name: &str, value: Option<String>| {
            if let Some(value) = value {
                out.push((name.to_string(), format!("{name}={value}")));
            }
        };

        push("curator", entry.curator.clone());
        push("chain", entry.chain.clone());
        push(
            "cap",
            entry.mcap_bucket.clone().or_else(|| {
                entry
                    .market_cap_usd
                    .map(|v| self.vocab.mcap_bucket(v).to_string())
            }),
        );
        push(
            "vol",
            entry.vol_bucket.clone().or_else(|| {
                entry
                    .volume_24h_usd
                    .map(|v| self.vocab.vol_bucket(v).to_string())
            }),
        );
        push(
            "age",
            entry.age_bucket.clone().or_else(|| {
                entry
                    .token_age_days
                    .map(|v| self.vocab.age_bucket(v).to_string())
            }),
        );
        push("intent", entry.intent.clone());
        push(
            "confidence",
            entry
                .confidence
                .map(|c| self.vocab.confidence_bucket(c).to_string()),
        );
        push("timeframe", entry.timeframe.clone());
        out
    }
}

/// EWMA-update both memories of one coefficient; returns the new short
/// weight.
fn ewma_update(
    batch: &mut CoefficientBatch<'_>,
    key: &CoefficientKey,
    vocab_version: u32,
    class: LeverClass,
    observed: f64,
    alpha_short: f64,
    alpha_long: f64,
) -> Result<f64, StoreError> {
    let (lo, hi) = class.bounds();
    let updated = batch.update(key, vocab_version, |c| {
        c.last_weight = c.weight_short;
        c.weight_short = ewma(c.weight_short, observed, alpha_short).clamp(lo, hi);
        c.weight_long = ewma(c.weight_long, observed, alpha_long).clamp(lo, hi);
        c.observation_count += 1;
    })?;
    Ok(updated.weight_short)
}
