use std::fmt;

use chrono::Duration;
use serde::{Deserialize, Serialize};

/// One clustering view: a deterministic bucketing function identity.
///
/// The bucketer implementations live in the clustering engine; this enum is
/// the stable vocabulary the learning configs and cluster keys refer to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewId {
    Asset,
    Timeframe,
    Regime,
    /// Composite `asset|timeframe|pattern_type` signature. A pattern's
    /// primary identity: three facets that only mean something together.
    PatternSignature,
    PatternType,
    Method,
    PlanType,
    DecisionFactor,
    ExecutionStrategy,
    OutcomeBucket,
    McapBucket,
    GroupSignature,
    /// Braid-only view over the LLM's `recommended_scope`.
    Scope,
}

impl ViewId {
    pub fn slug(&self) -> &'static str {
        match self {
            ViewId::Asset => "asset",
            ViewId::Timeframe => "timeframe",
            ViewId::Regime => "regime",
            ViewId::PatternSignature => "pattern_signature",
            ViewId::PatternType => "pattern_type",
            ViewId::Method => "method",
            ViewId::PlanType => "plan_type",
            ViewId::DecisionFactor => "decision_factor",
            ViewId::ExecutionStrategy => "execution_strategy",
            ViewId::OutcomeBucket => "outcome_bucket",
            ViewId::McapBucket => "mcap_bucket",
            ViewId::GroupSignature => "group_signature",
            ViewId::Scope => "scope",
        }
    }
}

impl fmt::Display for ViewId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

/// Identity of a per-module resonance scorer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScorerId {
    Pattern,
    Prediction,
    Plan,
    Decision,
    TradeOutcome,
    Execution,
    Braid,
    /// Records neutral scores and nothing else.
    Passive,
}

/// Stable identifier of a prompt template in the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TemplateId(pub String);

impl TemplateId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TemplateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a context formatter owned by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FormatterId(pub String);

impl FormatterId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A consumer's declared filter over braid kinds for context retrieval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub consumer_id: String,
    /// Strand kinds whose braids this consumer pulls, in priority order.
    pub kinds: Vec<crate::kind::StrandKind>,
    pub min_braid_level: u32,
    pub min_score: f64,
    pub max_age_hours: i64,
    pub max_items: usize,
    pub formatter: FormatterId,
}

impl Subscription {
    pub fn max_age(&self) -> Duration {
        Duration::hours(self.max_age_hours)
    }
}

/// Static per-kind learning configuration resolved by the classifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningConfig {
    /// Views this kind clusters along, orthogonal by construction.
    pub views: Vec<ViewId>,
    pub scorer: ScorerId,
    /// Braid prompt id; `None` for passive kinds that never braid.
    pub braid_prompt: Option<TemplateId>,
    pub min_cluster_size: usize,
    pub max_braid_level: u32,
    /// Clustering and braid-dedup window, in hours.
    pub recency_window_hours: i64,
    /// Passive kinds are stored and nothing more.
    pub passive: bool,
}

impl LearningConfig {
    /// The record returned for unknown kinds: store, score neutrally, skip
    /// clustering and braiding.
    pub fn passive() -> Self {
        Self {
            views: Vec::new(),
            scorer: ScorerId::Passive,
            braid_prompt: None,
            min_cluster_size: usize::MAX,
            max_braid_level: 1,
            recency_window_hours: 0,
            passive: true,
        }
    }

    pub fn recency_window(&self) -> Duration {
        Duration::hours(self.recency_window_hours)
    }
}
