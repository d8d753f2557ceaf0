use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::RegistryError;

/// The response contract of every braid template.
///
/// The model must return exactly this shape; [`BraidSynthesis::validate`] is
/// the gate between the model and the data model. A braid's `content` is
/// always a validated instance of this plus provenance.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct BraidSynthesis {
    /// One-paragraph summary of what the cluster's members have in common.
    pub summary: String,
    /// Actionable observations, most significant first.
    #[serde(default)]
    pub insights: Vec<String>,
    /// Where the insight applies (asset, timeframe, regime, or "general").
    #[serde(default)]
    pub recommended_scope: String,
    /// Model's own confidence in the synthesis, in `[0, 1]`.
    pub confidence: f64,
}

impl BraidSynthesis {
    /// Deserialize and bounds-check a model reply.
    pub fn validate(value: &Value) -> Result<Self, RegistryError> {
        let synthesis: BraidSynthesis = serde_json::from_value(value.clone())
            .map_err(|e| RegistryError::SchemaViolation(e.to_string()))?;

        if synthesis.summary.trim().is_empty() {
            return Err(RegistryError::SchemaViolation("empty summary".to_string()));
        }
        if !(0.0..=1.0).contains(&synthesis.confidence) {
            return Err(RegistryError::SchemaViolation(format!(
                "confidence {} outside [0, 1]",
                synthesis.confidence
            )));
        }
        Ok(synthesis)
    }
}
