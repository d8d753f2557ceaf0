//! The LLM capability.
//!
//! The learning core treats the model as a typed capability: a call takes a
//! materialized prompt and returns JSON, or a classified error the braider's
//! retry policy dispatches on. Free-form text never enters the data model;
//! callers validate the JSON against their declared response type.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("llm call exceeded its {0}s deadline")]
    Deadline(u64),
    #[error("llm transport error: {0}")]
    Transport(String),
    #[error("llm endpoint returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("llm response missing message content: {0}")]
    MissingContent(String),
    #[error("llm response is not the requested json: {0}")]
    NotJson(String),
}

impl LlmError {
    /// Schema-class errors get a hardened prompt on retry; everything else
    /// is transient and retried as-is.
    pub fn is_schema(&self) -> bool {
        matches!(self, LlmError::MissingContent(_) | LlmError::NotJson(_))
    }
}

/// One fully-materialized call. The registry produces these; nothing else
/// assembles prompts.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub system: String,
    pub prompt: String,
    pub temperature: f64,
    pub max_tokens: u32,
}

#[async_trait]
pub trait LlmCapability: Send + Sync {
    async fn call(&self, request: &LlmRequest) -> Result<Value, LlmError>;
}

// ── HTTP client ───────────────────────────────────────────────────────────────

/// Client for any OpenAI-compatible chat-completions endpoint (Ollama's
/// `/v1`, OpenRouter, vLLM). One hard deadline per call; on deadline the
/// request future is dropped and the cluster is retried later.
#[derive(Debug, Clone)]
pub struct HttpLlmClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    deadline_secs: u64,
}

impl HttpLlmClient {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, deadline_secs: u64) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            model: model.into(),
            deadline_secs,
        }
    }
}

#[async_trait]
impl LlmCapability for HttpLlmClient {
    async fn call(&self, request: &LlmRequest) -> Result<Value, LlmError> {
        let endpoint = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let payload = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": request.system},
                {"role": "user", "content": request.prompt},
            ],
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
            "response_format": {"type": "json_object"},
            "stream": false,
        });

        debug!(endpoint = %endpoint, model = %self.model, "llm call");
        let send = self.client.post(&endpoint).json(&payload).send();
        let response = tokio::time::timeout(Duration::from_secs(self.deadline_secs), send)
            .await
            .map_err(|_| LlmError::Deadline(self.deadline_secs))?
            .map_err(|e| LlmError::Transport(e.to_string()))?;

        let status = response.status();
        let body: Value = tokio::time::timeout(
            Duration::from_secs(self.deadline_secs),
            response.json::<Value>(),
        )
        .await
        .map_err(|_| LlmError::Deadline(self.deadline_secs))?
        .map_err(|e| LlmError::Transport(e.to_string()))?;

        if !status.is_success() {
            warn!(status = status.as_u16(), "llm endpoint error");
            return Err(LlmError::Status {
                status: status.as_u16(),
                body: body.to_string(),
            });
        }

        let content = body
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .ok_or_else(|| LlmError::MissingContent(body.to_string()))?;

        parse_json_reply(content)
    }
}

/// Parse the model's reply as JSON, tolerating a markdown code fence around
/// the object.
pub fn parse_json_reply(content: &str) -> Result<Value, LlmError> {
    let trimmed = content.trim();
    let inner = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed);

    serde_json::from_str(inner).map_err(|e| LlmError::NotJson(format!("{e}: {inner}")))
}

// ── scripted client ───────────────────────────────────────────────────────────

#[derive(Debug)]
enum ScriptStep {
    Ok(Value),
    Transient(String),
    Schema(String),
}

/// Deterministic capability for tests: replays a queue of scripted replies,
/// then falls back to a default reply (or errors when none is set). Counts
/// calls so tests can assert the model was, or was not, consulted.
#[derive(Debug, Default)]
pub struct ScriptedLlm {
    steps: Mutex<VecDeque<ScriptStep>>,
    fallback: Option<Value>,
    calls: AtomicUsize,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self::default()
    }

    /// A client that answers every call with `reply`.
    pub fn always(reply: Value) -> Self {
        Self {
            fallback: Some(reply),
            ..Self::default()
        }
    }

    pub fn push_ok(&self, reply: Value) {
        self.steps.lock().unwrap().push_back(ScriptStep::Ok(reply));
    }

    pub fn push_transient_error(&self, message: impl Into<String>) {
        self.steps
            .lock()
            .unwrap()
            .push_back(ScriptStep::Transient(message.into()));
    }

    pub fn push_schema_error(&self, message: impl Into<String>) {
        self.steps
            .lock()
            .unwrap()
            .push_back(ScriptStep::Schema(message.into()));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmCapability for ScriptedLlm {
    async fn call(&self, _request: &LlmRequest) -> Result<Value, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self.steps.lock().unwrap().pop_front();
        match step {
            Some(ScriptStep::Ok(value)) => Ok(value),
            Some(ScriptStep::Transient(message)) => Err(LlmError::Transport(message)),
            Some(ScriptStep::Schema(message)) => Err(LlmError::NotJson(message)),
            None => match &self.fallback {
                Some(value) => Ok(value.clone()),
                None => Err(LlmError::Transport("script exhausted".to_string())),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{LlmCapability, LlmError, LlmRequest, ScriptedLlm, parse_json_reply};

    fn request() -> LlmRequest {
        LlmRequest {
            system: "system".to_string(),
            prompt: "prompt".to_string(),
            temperature: 0.2,
            max_tokens: 512,
        }
    }

    #[test]
    fn parses_bare_and_fenced_json() {
        assert_eq!(parse_json_reply(r#"{"a": 1}"#).unwrap(), json!({"a": 1}));
        assert_eq!(
            parse_json_reply("```json\n{\"a\": 1}\n```").unwrap(),
            json!({"a": 1})
        );
        assert!(matches!(
            parse_json_reply("not json at all"),
            Err(LlmError::NotJson(_))
        ));
    }

    #[tokio::test]
    async fn scripted_llm_replays_then_falls_back() {
        let llm = ScriptedLlm::always(json!({"fallback": true}));
        llm.push_transient_error("boom");
        llm.push_ok(json!({"first": true}));

        assert!(llm.call(&request()).await.is_err());
        assert_eq!(llm.call(&request()).await.unwrap(), json!({"first": true}));
        assert_eq!(llm.call(&request()).await.unwrap(), json!({"fallback": true}));
        assert_eq!(llm.calls(), 3);
    }

    #[test]
    fn schema_errors_are_distinguished_from_transient() {
        assert!(LlmError::NotJson("x".into()).is_schema());
        assert!(!LlmError::Transport("x".into()).is_schema());
        assert!(!LlmError::Deadline(30).is_schema());
    }
}
