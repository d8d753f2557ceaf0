//! Built-in templates, learning configs, and formatters.

use schemars::schema_for;

use weft_strand::{LearningConfig, ScorerId, StrandKind, TemplateId, ViewId};

use crate::registry::{FormatterSpec, PromptRegistry, PromptTemplate};
use crate::synthesis::BraidSynthesis;

const SYSTEM: &str = "You are the learning core of a trading intelligence platform. \
You synthesize clusters of related observation records into one durable insight. \
Ground every statement in the records you are given; never invent numbers. \
Respond with ONLY a JSON object with keys summary, insights, recommended_scope, \
confidence. No prose outside the JSON.";

/// The braid body shared by every kind; `{focus}` is the kind-specific
/// framing sentence baked in at registration.
const BRAID_BODY: &str = "{focus}\n\n\
CLUSTER\nview: {view}\nbucket: {bucket}\nmembers: {member_count}\n\n\
MEMBER RECORDS (id | key fields | resonance):\n{members}\n\n\
AGGREGATE STATISTICS:\n{stats}\n\n\
Synthesize what these records collectively establish. summary: one paragraph. \
insights: up to five specific, decision-relevant observations. \
recommended_scope: where the insight applies (asset, timeframe, regime, or \"general\"). \
confidence: your confidence in the synthesis, 0 to 1.";

fn braid_template(id: &str, focus: &str) -> PromptTemplate {
    PromptTemplate {
        id: TemplateId::new(id),
        version: 1,
        system: SYSTEM.to_string(),
        body: BRAID_BODY.replace("{focus}", focus),
        required_variables: vec![
            "view".to_string(),
            "bucket".to_string(),
            "member_count".to_string(),
            "members".to_string(),
            "stats".to_string(),
        ],
        response_schema: schema_for!(BraidSynthesis),
        temperature: 0.2,
        max_tokens: 768,
    }
}

pub(crate) fn install(registry: &mut PromptRegistry) {
    // ── braid templates ───────────────────────────────────────────────────
    registry.register_template(braid_template(
        "braid_pattern",
        "These records are detections of the same market pattern.",
    ));
    registry.register_template(braid_template(
        "braid_prediction_review",
        "These records are post-hoc reviews of predictions made the same way.",
    ));
    registry.register_template(braid_template(
        "braid_conditional_trading_plan",
        "These records are conditional trading plans of the same type.",
    ));
    registry.register_template(braid_template(
        "braid_trading_decision",
        "These records are trading decisions driven by the same dominant factor.",
    ));
    registry.register_template(braid_template(
        "braid_trade_outcome",
        "These records are realized trade outcomes in the same outcome bucket.",
    ));
    registry.register_template(braid_template(
        "braid_execution_outcome",
        "These records are execution reports for the same execution strategy.",
    ));
    registry.register_template(braid_template(
        "braid_meta",
        "These records are themselves synthesized insights sharing a scope; \
         produce the higher-order insight that connects them.",
    ));

    // ── learning configs ──────────────────────────────────────────────────
    let base = |views: Vec<ViewId>, scorer: ScorerId, prompt: &str| LearningConfig {
        views,
        scorer,
        braid_prompt: Some(TemplateId::new(prompt)),
        min_cluster_size: 3,
        max_braid_level: 4,
        recency_window_hours: 24,
        passive: false,
    };

    registry.register_learning_config(
        StrandKind::Pattern,
        base(
            vec![ViewId::PatternSignature, ViewId::McapBucket],
            ScorerId::Pattern,
            "braid_pattern",
        ),
    );
    registry.register_learning_config(
        StrandKind::PredictionReview,
        base(
            vec![ViewId::Method, ViewId::GroupSignature],
            ScorerId::Prediction,
            "braid_prediction_review",
        ),
    );
    registry.register_learning_config(
        StrandKind::ConditionalTradingPlan,
        base(
            vec![ViewId::PlanType, ViewId::Regime],
            ScorerId::Plan,
            "braid_conditional_trading_plan",
        ),
    );
    registry.register_learning_config(
        StrandKind::TradingDecision,
        base(
            vec![ViewId::DecisionFactor],
            ScorerId::Decision,
            "braid_trading_decision",
        ),
    );
    registry.register_learning_config(
        StrandKind::TradeOutcome,
        base(
            vec![ViewId::OutcomeBucket, ViewId::Asset],
            ScorerId::TradeOutcome,
            "braid_trade_outcome",
        ),
    );
    registry.register_learning_config(
        StrandKind::ExecutionOutcome,
        base(
            vec![ViewId::ExecutionStrategy],
            ScorerId::Execution,
            "braid_execution_outcome",
        ),
    );
    // Braids re-cluster along the model's recommended scope to form the
    // next level up.
    registry.register_learning_config(
        StrandKind::Braid,
        base(vec![ViewId::Scope], ScorerId::Braid, "braid_meta"),
    );

    // Outcome strands feed the coefficient updater; they never cluster.
    registry.register_learning_config(
        StrandKind::PositionClosed,
        LearningConfig {
            views: Vec::new(),
            scorer: ScorerId::Passive,
            braid_prompt: None,
            min_cluster_size: usize::MAX,
            max_braid_level: 1,
            recency_window_hours: 0,
            passive: false,
        },
    );
    registry.register_learning_config(StrandKind::BraidFailed, LearningConfig::passive());

    // ── formatters ────────────────────────────────────────────────────────
    registry.register_formatter("standard", FormatterSpec::Standard);
    registry.register_formatter("compact", FormatterSpec::Compact);
}

#[cfg(test)]
mod tests {
    use weft_strand::{StrandKind, TemplateId};

    use crate::registry::{FormatterSpec, PromptRegistry};

    #[test]
    fn every_braiding_kind_has_a_registered_template() {
        let registry = PromptRegistry::with_defaults();
        for kind in [
            StrandKind::Pattern,
            StrandKind::PredictionReview,
            StrandKind::ConditionalTradingPlan,
            StrandKind::TradingDecision,
            StrandKind::TradeOutcome,
            StrandKind::ExecutionOutcome,
            StrandKind::Braid,
        ] {
            let config = registry.learning_config(&kind, 1);
            let prompt = config
                .braid_prompt
                .unwrap_or_else(|| panic!("{kind} should braid"));
            registry.template(&prompt, None).unwrap();
        }
    }

    #[test]
    fn position_closed_never_braids_but_is_not_passive() {
        let registry = PromptRegistry::with_defaults();
        let config = registry.learning_config(&StrandKind::PositionClosed, 1);
        assert!(config.braid_prompt.is_none());
        assert!(config.views.is_empty());
        assert!(!config.passive);
    }

    #[test]
    fn formatter_lookup_falls_back_to_standard() {
        let registry = PromptRegistry::with_defaults();
        assert_eq!(registry.formatter("compact"), FormatterSpec::Compact);
        assert_eq!(registry.formatter("nonexistent"), FormatterSpec::Standard);
    }

    #[test]
    fn meta_template_resolves_for_higher_level_braids() {
        let registry = PromptRegistry::with_defaults();
        let config = registry.learning_config(&StrandKind::Braid, 2);
        assert_eq!(config.braid_prompt, Some(TemplateId::new("braid_meta")));
    }
}
