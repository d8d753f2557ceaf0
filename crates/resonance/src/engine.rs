use std::collections::HashMap;

use tracing::trace;

use weft_strand::{ResonanceScores, ScorerId, StrandPayload};

use crate::algebra::{
    cohort_diversity, downstream_blend, improvement_rate, pairwise_agreement, rank_weighted_mean,
};

/// Aggregate inputs the coordinator assembles from store queries before
/// scoring. All series are for the same kind and recency window as the
/// strand being scored.
#[derive(Debug, Clone, Default)]
pub struct Cohort {
    /// Taxonomy bucket label of each active cohort member.
    pub taxonomy: Vec<String>,
    /// Historical accuracy of this strand's taxonomy bucket, newest first.
    pub bucket_history: Vec<f64>,
    /// Outcomes of the immediately downstream module, causally linked via
    /// `parent_ids`.
    pub downstream_successes: u64,
    pub downstream_total: u64,
}

impl Cohort {
    pub fn empty() -> Self {
        Self::default()
    }
}

/// Module-specific components of the selection score, all in `[0, 1]`.
/// Stability and orthogonality are supplied by the engine (φ and θ).
#[derive(Debug, Clone, Copy)]
pub struct SelectionInputs {
    pub accuracy: f64,
    pub precision: f64,
    pub cost: f64,
}

/// Weights of the selection-score terms. The four squared terms should sum
/// to roughly 1 so an ideal strand lands near the top of the unit interval.
#[derive(Debug, Clone, Copy)]
pub struct SelectionWeights {
    pub accuracy: f64,
    pub precision: f64,
    pub stability: f64,
    pub orthogonality: f64,
    pub cost: f64,
}

/// One module's bindings of the shared resonance algebra.
pub trait ModuleScorer: Send + Sync {
    fn id(&self) -> ScorerId;

    /// Declared bounds of ρ for this module.
    fn rho_bounds(&self) -> (f64, f64) {
        (0.0, 2.0)
    }

    /// Named scales the module reports quality at.
    fn scale_set(&self) -> &[&'static str];

    /// Taxonomy bucket of a strand (pattern type, method, plan type, ...).
    fn taxonomy_bucket(&self, payload: &StrandPayload) -> Option<String>;

    /// Realized-outcome factor before downstream blending.
    fn rho_base(&self, payload: &StrandPayload) -> f64;

    /// The observation this strand contributes to its bucket's accuracy
    /// series; also the `current` term of ω.
    fn current_accuracy(&self, payload: &StrandPayload) -> Option<f64>;

    fn selection_inputs(&self, payload: &StrandPayload) -> SelectionInputs;

    fn selection_weights(&self) -> SelectionWeights;

    /// Shortest bucket history ω can be evaluated on.
    fn min_history(&self) -> usize {
        5
    }

    fn downstream_weight(&self) -> f64 {
        0.3
    }

    fn min_downstream_samples(&self) -> u64 {
        10
    }
}

/// The per-kind scorer table plus the shared scoring skeleton.
pub struct ResonanceEngine {
    scorers: HashMap<ScorerId, Box<dyn ModuleScorer>>,
}

impl ResonanceEngine {
    pub fn new(scorers: Vec<Box<dyn ModuleScorer>>) -> Self {
        Self {
            scorers: scorers.into_iter().map(|s| (s.id(), s)).collect(),
        }
    }

    /// The engine with every built-in module scorer registered.
    pub fn with_default_modules() -> Self {
        use crate::modules::*;
        Self::new(vec![
            Box::new(PatternScorer::default()),
            Box::new(PredictionScorer::default()),
            Box::new(PlanScorer::default()),
            Box::new(DecisionScorer::default()),
            Box::new(TradeOutcomeScorer::default()),
            Box::new(ExecutionScorer::default()),
            Box::new(PassiveScorer),
        ])
    }

    pub fn scorer(&self, id: ScorerId) -> &dyn ModuleScorer {
        self.scorers
            .get(&id)
            .or_else(|| self.scorers.get(&ScorerId::Passive))
            .expect("passive scorer is always registered")
            .as_ref()
    }

    /// Score one strand's payload against its cohort. Deterministic: the
    /// same payload and cohort always produce bit-identical scores, which is
    /// what makes score re-computation after redelivery safe.
    pub fn score(&self, id: ScorerId, payload: &StrandPayload, cohort: &Cohort) -> ResonanceScores {
        let scorer = self.scorer(id);
        if scorer.id() == ScorerId::Passive {
            return ResonanceScores::neutral();
        }

        let phi = match payload.scale_quality() {
            Some(quality) => pairwise_agreement(quality, scorer.scale_set()),
            None => 0.5,
        };

        let downstream = if cohort.downstream_total >= scorer.min_downstream_samples() {
            cohort.downstream_successes as f64 / cohort.downstream_total as f64
        } else {
            1.0
        };
        let (rho_lo, rho_hi) = scorer.rho_bounds();
        let rho = downstream_blend(scorer.rho_base(payload), downstream, scorer.downstream_weight())
            .clamp(rho_lo, rho_hi);

        let bucket = scorer
            .taxonomy_bucket(payload)
            .unwrap_or_else(|| "unclassified".to_string());
        let theta = cohort_diversity(&bucket, &cohort.taxonomy);

        let (omega, insufficient_history) =
            if cohort.bucket_history.len() < scorer.min_history() {
                (1.0, true)
            } else {
                let historical = rank_weighted_mean(&cohort.bucket_history)
                    .expect("non-empty history has a mean");
                let current = scorer.current_accuracy(payload).unwrap_or(historical);
                (improvement_rate(current, historical), false)
            };

        let inputs = scorer.selection_inputs(payload);
        let w = scorer.selection_weights();
        let selection_score = (w.accuracy * inputs.accuracy.clamp(0.0, 1.0).powi(2)
            + w.precision * inputs.precision.clamp(0.0, 1.0).powi(2)
            + w.stability * phi.powi(2)
            + w.orthogonality * theta.powi(2)
            - w.cost * inputs.cost.clamp(0.0, 1.0))
        .clamp(0.0, 1.0);

        let scores = ResonanceScores {
            phi,
            rho,
            theta,
            omega,
            selection_score,
            insufficient_history,
        };
        trace!(scorer = ?id, ?scores, "strand scored");
        scores
    }

    /// Braid scores: the selection-score-weighted mean of the parents. A
    /// cohort-less braid keeps this aggregate; once it has enough siblings
    /// ω can be re-evaluated against the braid cohort.
    pub fn aggregate_parents(parents: &[ResonanceScores]) -> ResonanceScores {
        if parents.is_empty() {
            return ResonanceScores::neutral();
        }

        let raw: Vec<f64> = parents.iter().map(|p| p.selection_score.max(0.0)).collect();
        let total: f64 = raw.iter().sum();
        let weights: Vec<f64> = if total > 0.0 {
            raw.iter().map(|s| s / total).collect()
        } else {
            vec![1.0 / parents.len() as f64; parents.len()]
        };

        let mut agg = ResonanceScores {
            phi: 0.0,
            rho: 0.0,
            theta: 0.0,
            omega: 0.0,
            selection_score: 0.0,
            insufficient_history: parents.iter().any(|p| p.insufficient_history),
        };
        for (parent, weight) in parents.iter().zip(&weights) {
            agg.phi += weight * parent.phi;
            agg.rho += weight * parent.rho;
            agg.theta += weight * parent.theta;
            agg.omega += weight * parent.omega;
            agg.selection_score += weight * parent.selection_score;
        }
        agg.phi = agg.phi.clamp(0.0, 1.0);
        agg.theta = agg.theta.clamp(0.0, 1.0);
        agg.omega = agg.omega.clamp(0.0, 2.0);
        agg.selection_score = agg.selection_score.clamp(0.0, 1.0);
        agg
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use weft_strand::{ResonanceScores, ScorerId, StrandKind, StrandPayload};

    use super::{Cohort, ResonanceEngine};

    fn pattern_payload(success_rate: f64, confidence: f64) -> StrandPayload {
        StrandPayload::decode(
            &StrandKind::Pattern,
            &json!({
                "pattern_type": "volume_spike",
                "success_rate": success_rate,
                "confidence": confidence,
                "sample_count": 40,
                "scale_quality": {"1m": 0.7, "5m": 0.72, "15m": 0.68}
            }),
        )
        .unwrap()
    }

    #[test]
    fn scores_respect_the_declared_bounds() {
        let engine = ResonanceEngine::with_default_modules();
        for (sr, conf) in [(0.0, 0.0), (0.3, 0.9), (1.0, 1.0), (0.5, 0.5)] {
            let scores = engine.score(
                ScorerId::Pattern,
                &pattern_payload(sr, conf),
                &Cohort::empty(),
            );
            assert!(scores.in_bounds((0.0, 2.0)), "out of bounds: {scores:?}");
        }
    }

    #[test]
    fn short_history_marks_insufficient_and_neutral_omega() {
        let engine = ResonanceEngine::with_default_modules();
        let cohort = Cohort {
            bucket_history: vec![0.5, 0.6],
            ..Cohort::empty()
        };
        let scores = engine.score(ScorerId::Pattern, &pattern_payload(0.7, 0.8), &cohort);
        assert!(scores.insufficient_history);
        assert_eq!(scores.omega, 1.0);
    }

    #[test]
    fn improving_bucket_lifts_omega_above_one() {
        let engine = ResonanceEngine::with_default_modules();
        let cohort = Cohort {
            // Flat mediocre history; the strand itself is much better.
            bucket_history: vec![0.4, 0.4, 0.4, 0.4, 0.4, 0.4],
            ..Cohort::empty()
        };
        let scores = engine.score(ScorerId::Pattern, &pattern_payload(0.8, 0.8), &cohort);
        assert!(!scores.insufficient_history);
        assert!(scores.omega > 1.0, "omega={}", scores.omega);
        assert!(scores.omega <= 2.0);
    }

    #[test]
    fn downstream_failures_depress_rho() {
        let engine = ResonanceEngine::with_default_modules();
        let healthy = Cohort {
            downstream_successes: 18,
            downstream_total: 20,
            ..Cohort::empty()
        };
        let failing = Cohort {
            downstream_successes: 2,
            downstream_total: 20,
            ..Cohort::empty()
        };
        let below_floor = Cohort {
            downstream_successes: 0,
            downstream_total: 5,
            ..Cohort::empty()
        };

        let payload = pattern_payload(0.7, 0.8);
        let rho_healthy = engine.score(ScorerId::Pattern, &payload, &healthy).rho;
        let rho_failing = engine.score(ScorerId::Pattern, &payload, &failing).rho;
        let rho_neutral = engine.score(ScorerId::Pattern, &payload, &below_floor).rho;

        assert!(rho_failing < rho_healthy);
        // Below the sample floor the downstream factor is neutral.
        assert_eq!(
            rho_neutral,
            engine.score(ScorerId::Pattern, &payload, &Cohort::empty()).rho
        );
    }

    #[test]
    fn unknown_scorer_falls_back_to_passive_neutral() {
        let engine = ResonanceEngine::with_default_modules();
        let scores = engine.score(
            ScorerId::Passive,
            &StrandPayload::Opaque(json!({})),
            &Cohort::empty(),
        );
        assert_eq!(scores, ResonanceScores::neutral());
    }

    #[test]
    fn parent_aggregation_weights_by_selection_score() {
        let strong = ResonanceScores {
            phi: 0.9,
            rho: 1.2,
            theta: 0.8,
            omega: 1.4,
            selection_score: 0.9,
            insufficient_history: false,
        };
        let weak = ResonanceScores {
            phi: 0.1,
            rho: 0.2,
            theta: 0.2,
            omega: 0.6,
            selection_score: 0.1,
            insufficient_history: false,
        };

        let agg = ResonanceEngine::aggregate_parents(&[strong, weak]);
        // The strong parent dominates 9:1.
        assert!(agg.phi > 0.8);
        assert!(agg.selection_score > 0.8);
        assert!(agg.in_bounds((0.0, 2.0)));

        let identity = ResonanceEngine::aggregate_parents(&[strong]);
        assert_eq!(identity, strong);
    }
}
