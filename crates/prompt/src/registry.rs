use std::collections::{BTreeMap, HashMap};

use schemars::schema::RootSchema;
use tracing::debug;

use weft_llm::LlmRequest;
use weft_strand::{LearningConfig, StrandKind, TemplateId};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown template: {0}")]
    UnknownTemplate(String),
    #[error("unknown version {version} of template {id}")]
    UnknownVersion { id: String, version: u32 },
    #[error("template {template} is missing required variable {name}")]
    MissingVariable { template: String, name: String },
    #[error("response schema violation: {0}")]
    SchemaViolation(String),
}

/// A versioned prompt template with its declared contract.
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    pub id: TemplateId,
    pub version: u32,
    pub system: String,
    /// Body with `{name}` placeholders for the required variables.
    pub body: String,
    pub required_variables: Vec<String>,
    pub response_schema: RootSchema,
    pub temperature: f64,
    pub max_tokens: u32,
}

/// Rendering style a consumer's context payload is produced with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatterSpec {
    /// Full insights, caveats, quantitative signals, and lineage.
    Standard,
    /// Insights only, truncated; for consumers with tight prompt budgets.
    Compact,
}

/// Versioned catalog of templates, learning configs, and formatters.
pub struct PromptRegistry {
    templates: HashMap<(String, u32), PromptTemplate>,
    latest: HashMap<String, u32>,
    learning: HashMap<String, LearningConfig>,
    formatters: HashMap<String, FormatterSpec>,
}

impl PromptRegistry {
    pub fn empty() -> Self {
        Self {
            templates: HashMap::new(),
            latest: HashMap::new(),
            learning: HashMap::new(),
            formatters: HashMap::new(),
        }
    }

    /// The registry with every built-in braid template, learning config,
    /// and formatter registered.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        crate::defaults::install(&mut registry);
        registry
    }

    // ── templates ─────────────────────────────────────────────────────────

    /// Register a template version. The `latest` pointer moves forward only;
    /// re-registering an older version never rolls consumers back.
    pub fn register_template(&mut self, template: PromptTemplate) {
        let id = template.id.as_str().to_string();
        let version = template.version;
        self.templates.insert((id.clone(), version), template);
        let latest = self.latest.entry(id).or_insert(version);
        if version > *latest {
            *latest = version;
        }
    }

    /// Resolve a template: pinned version, or the latest when `None`.
    pub fn template(
        &self,
        id: &TemplateId,
        version: Option<u32>,
    ) -> Result<&PromptTemplate, RegistryError> {
        let latest = self
            .latest
            .get(id.as_str())
            .ok_or_else(|| RegistryError::UnknownTemplate(id.to_string()))?;
        let version = version.unwrap_or(*latest);
        self.templates
            .get(&(id.as_str().to_string(), version))
            .ok_or_else(|| RegistryError::UnknownVersion {
                id: id.to_string(),
                version,
            })
    }

    /// Materialize a template into a ready-to-send request. Every required
    /// variable must be present; extra variables are ignored.
    pub fn materialize(
        &self,
        id: &TemplateId,
        version: Option<u32>,
        variables: &BTreeMap<String, String>,
    ) -> Result<LlmRequest, RegistryError> {
        let template = self.template(id, version)?;
        for name in &template.required_variables {
            if !variables.contains_key(name) {
                return Err(RegistryError::MissingVariable {
                    template: id.to_string(),
                    name: name.clone(),
                });
            }
        }

        let mut prompt = template.body.clone();
        for (name, value) in variables {
            prompt = prompt.replace(&format!("{{{name}}}"), value);
        }

        debug!(template = %id, version = template.version, "prompt materialized");
        Ok(LlmRequest {
            system: template.system.clone(),
            prompt,
            temperature: template.temperature,
            max_tokens: template.max_tokens,
        })
    }

    /// Materialize with the response schema appended verbatim. Used on
    /// retries after a schema violation: the model gets the exact contract
    /// it failed to meet.
    pub fn materialize_hardened(
        &self,
        id: &TemplateId,
        version: Option<u32>,
        variables: &BTreeMap<String, String>,
    ) -> Result<LlmRequest, RegistryError> {
        let template = self.template(id, version)?;
        let mut request = self.materialize(id, version, variables)?;
        let schema = serde_json::to_string_pretty(&template.response_schema)
            .unwrap_or_else(|_| "{}".to_string());
        request.prompt.push_str(&format!(
            "\n\nYour previous reply did not validate. Respond with ONLY a JSON object \
             matching this schema exactly. No prose, no markdown fences:\n{schema}"
        ));
        Ok(request)
    }

    // ── learning configs (the classifier) ─────────────────────────────────

    pub fn register_learning_config(&mut self, kind: StrandKind, config: LearningConfig) {
        self.learning.insert(kind.slug().to_string(), config);
    }

    /// Classify a strand: its kind's learning configuration. Unknown kinds
    /// get the passive config. `braid_level` is accepted so braid configs
    /// can diverge per level later; today every level shares its kind's
    /// record.
    pub fn learning_config(&self, kind: &StrandKind, _braid_level: u32) -> LearningConfig {
        self.learning
            .get(kind.slug())
            .cloned()
            .unwrap_or_else(LearningConfig::passive)
    }

    // ── formatters ────────────────────────────────────────────────────────

    pub fn register_formatter(&mut self, id: impl Into<String>, spec: FormatterSpec) {
        self.formatters.insert(id.into(), spec);
    }

    /// Formatter lookup; unknown ids fall back to the standard rendering.
    pub fn formatter(&self, id: &str) -> FormatterSpec {
        self.formatters.get(id).copied().unwrap_or(FormatterSpec::Standard)
    }
}
