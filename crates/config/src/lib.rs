use std::env;
use std::fs;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningConfigSection {
    /// Short EWMA memory time constant, in days.
    pub tau_short_days: f64,
    /// Long EWMA memory time constant, in days.
    pub tau_long_days: f64,
    /// Importance-bleed fraction pulling overlapping levers toward neutral.
    pub bleed_beta: f64,
    /// Interaction deviation from 1.0 that triggers the bleed.
    pub bleed_threshold: f64,
    pub min_cluster_size: usize,
    pub max_braid_level: u32,
    /// Default clustering / braid-dedup window, in hours.
    pub recency_window_hours: i64,
}

impl Default for LearningConfigSection {
    fn default() -> Self {
        Self {
            tau_short_days: 14.0,
            tau_long_days: 90.0,
            bleed_beta: 0.2,
            bleed_threshold: 0.05,
            min_cluster_size: 3,
            max_braid_level: 4,
            recency_window_hours: 24,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfigSection {
    /// Base URL of an OpenAI-compatible chat-completions endpoint.
    /// Overridden at runtime by `WEFT_LLM_BASE_URL` when set.
    pub base_url: String,
    pub model: String,
    /// Hard per-call deadline, in seconds.
    pub deadline_secs: u64,
    /// Retry budget for schema violations and transient errors.
    pub max_retries: u32,
}

impl Default for LlmConfigSection {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434/v1".to_string(),
            model: "llama3.1:8b".to_string(),
            deadline_secs: 30,
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfigSection {
    pub batch_size: usize,
    pub worker_count: usize,
    /// Visibility timeout for claimed items, in seconds.
    pub visibility_secs: i64,
    /// Delivery attempts before an item is parked as failed.
    pub max_attempts: u32,
    /// Queue depth above which braiding and promotion are shed.
    pub backpressure_threshold: usize,
}

impl Default for QueueConfigSection {
    fn default() -> Self {
        Self {
            batch_size: 16,
            worker_count: 4,
            visibility_secs: 120,
            max_attempts: 5,
            backpressure_threshold: 512,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfigSection {
    /// Context payload cache TTL, in seconds.
    pub cache_ttl_secs: i64,
    pub cache_capacity: usize,
}

impl Default for ContextConfigSection {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 900,
            cache_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfigSection {
    pub db_path: String,
}

impl Default for StoreConfigSection {
    fn default() -> Self {
        Self {
            db_path: "weft.redb".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfigSection {
    pub log_level: String,
}

impl Default for TelemetryConfigSection {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// One subscription seed: which braids a consumer pulls as context.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionSeed {
    pub consumer_id: String,
    pub kinds: Vec<String>,
    pub min_braid_level: u32,
    pub min_score: f64,
    pub max_age_hours: i64,
    pub max_items: usize,
    pub formatter: String,
}

impl Default for SubscriptionSeed {
    fn default() -> Self {
        Self {
            consumer_id: String::new(),
            kinds: Vec::new(),
            min_braid_level: 2,
            min_score: 0.3,
            max_age_hours: 24 * 7,
            max_items: 8,
            formatter: "standard".to_string(),
        }
    }
}

/// The single per-process configuration object. Everything else the core
/// does is derived from per-kind learning configs and subscription records.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub learning: LearningConfigSection,
    pub llm: LlmConfigSection,
    pub queue: QueueConfigSection,
    pub context: ContextConfigSection,
    pub store: StoreConfigSection,
    pub telemetry: TelemetryConfigSection,
    pub subscriptions: Vec<SubscriptionSeed>,
}

impl AppConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }

        if let Ok(value) = env::var("WEFT_LLM_BASE_URL") {
            if !value.is_empty() {
                config.llm.base_url = value;
            }
        }
        if let Ok(value) = env::var("WEFT_DB_PATH") {
            if !value.is_empty() {
                config.store.db_path = value;
            }
        }

        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }
}
