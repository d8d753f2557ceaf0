use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::id::StrandId;
use crate::kind::StrandKind;
use crate::learning::ViewId;

/// The five resonance quantities computed for every scored strand and braid.
///
/// Bounds: `phi`, `theta`, `selection_score` in `[0, 1]`; `omega` in `[0, 2]`;
/// `rho` in the range declared by the emitting module's scorer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResonanceScores {
    /// Fractal self-similarity: agreement of behavior quality across scales.
    pub phi: f64,
    /// Recursive feedback: realized-outcome factor with downstream coupling.
    pub rho: f64,
    /// Collective intelligence: diversity against the active cohort.
    pub theta: f64,
    /// Meta-evolution: improvement rate over the taxonomy bucket's history.
    pub omega: f64,
    /// Mathematical fitness used for clustering and context eligibility.
    pub selection_score: f64,
    /// Set when the bucket history was too short to evaluate omega.
    #[serde(default)]
    pub insufficient_history: bool,
}

impl ResonanceScores {
    /// Neutral scores used for passive strands and as aggregation identity.
    pub fn neutral() -> Self {
        Self {
            phi: 0.5,
            rho: 1.0,
            theta: 0.5,
            omega: 1.0,
            selection_score: 0.0,
            insufficient_history: false,
        }
    }

    /// Whether the shared-bound invariants hold (`rho` is checked against the
    /// caller-supplied module range).
    pub fn in_bounds(&self, rho_range: (f64, f64)) -> bool {
        (0.0..=1.0).contains(&self.phi)
            && (0.0..=1.0).contains(&self.theta)
            && (0.0..=2.0).contains(&self.omega)
            && (0.0..=1.0).contains(&self.selection_score)
            && (rho_range.0..=rho_range.1).contains(&self.rho)
    }
}

/// Materialized bucket label for one clustering view.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterKey {
    pub view: ViewId,
    pub bucket: String,
}

impl ClusterKey {
    pub fn new(view: ViewId, bucket: impl Into<String>) -> Self {
        Self { view, bucket: bucket.into() }
    }
}

/// Immutable event record shared by every module and by the core itself.
///
/// `braid_level == 1` marks a leaf emitted by a module; `>= 2` marks a braid
/// whose `parent_ids` reference strands of exactly `braid_level - 1`. After
/// creation only `resonance` may change, through the `score_version`
/// compare-and-set on the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Strand {
    pub id: StrandId,
    pub kind: StrandKind,
    pub braid_level: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeframe: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regime: Option<String>,
    /// Kind-specific payload; decoded on demand via
    /// [`crate::payload::StrandPayload::decode`].
    pub content: Value,
    /// Emitter-private payload the core stores but never interprets beyond
    /// the per-scale quality map some scorers read from it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module_intelligence: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resonance: Option<ResonanceScores>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parent_ids: Vec<StrandId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cluster_keys: Vec<ClusterKey>,
    /// Optimistic-concurrency counter for resonance updates only.
    #[serde(default)]
    pub score_version: u64,
}

impl Strand {
    /// Construct a level-1 strand. Braids go through the braider, which sets
    /// level, parents, and aggregated scores itself.
    pub fn leaf(id: StrandId, kind: StrandKind, created_at: DateTime<Utc>, content: Value) -> Self {
        Self {
            id,
            kind,
            braid_level: 1,
            created_at,
            symbol: None,
            timeframe: None,
            regime: None,
            content,
            module_intelligence: None,
            resonance: None,
            tags: Vec::new(),
            parent_ids: Vec::new(),
            cluster_keys: Vec::new(),
            score_version: 0,
        }
    }

    pub fn with_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = Some(symbol.into());
        self
    }

    pub fn with_timeframe(mut self, timeframe: impl Into<String>) -> Self {
        self.timeframe = Some(timeframe.into());
        self
    }

    pub fn with_regime(mut self, regime: impl Into<String>) -> Self {
        self.regime = Some(regime.into());
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn is_braid(&self) -> bool {
        self.braid_level >= 2
    }

    /// Bucket label this strand was assigned under `view`, if any.
    pub fn bucket_for(&self, view: ViewId) -> Option<&str> {
        self.cluster_keys
            .iter()
            .find(|k| k.view == view)
            .map(|k| k.bucket.as_str())
    }

    /// Selection score, or 0.0 for an unscored strand. Unscored strands are
    /// never eligible for clustering or context, so the zero default is safe.
    pub fn selection_score(&self) -> f64 {
        self.resonance.map(|r| r.selection_score).unwrap_or(0.0)
    }
}
