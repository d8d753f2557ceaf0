use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use weft_store::LineageEntry;
use weft_strand::StrandId;

/// Optional facet filter a consumer passes with a context request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContextHint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeframe: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regime: Option<String>,
}

impl ContextHint {
    pub fn is_empty(&self) -> bool {
        self.symbol.is_none() && self.timeframe.is_none() && self.regime.is_none()
    }

    /// Stable cache-key fragment.
    pub(crate) fn cache_key(&self) -> String {
        format!(
            "{}|{}|{}",
            self.symbol.as_deref().unwrap_or("*"),
            self.timeframe.as_deref().unwrap_or("*"),
            self.regime.as_deref().unwrap_or("*"),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextInsight {
    pub text: String,
    pub source_braid_id: StrandId,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextCaveat {
    pub text: String,
    pub source_braid_id: StrandId,
}

/// Prompt-ready context for one consumer. Never an error: a consumer that
/// cannot be served gets an empty payload with `degraded = true`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextPayload {
    pub consumer_id: String,
    pub generated_at: DateTime<Utc>,
    pub degraded: bool,
    pub insights: Vec<ContextInsight>,
    pub caveats: Vec<ContextCaveat>,
    pub quantitative_signals: BTreeMap<String, f64>,
    pub lineage: Vec<LineageEntry>,
}

impl ContextPayload {
    pub(crate) fn empty(consumer_id: &str, generated_at: DateTime<Utc>) -> Self {
        Self {
            consumer_id: consumer_id.to_string(),
            generated_at,
            degraded: true,
            insights: Vec::new(),
            caveats: Vec::new(),
            quantitative_signals: BTreeMap::new(),
            lineage: Vec::new(),
        }
    }
}
