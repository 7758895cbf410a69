//! Contract with the LLM inference service.
//!
//! The transport is external; this module owns the request/response
//! shapes, the effective model configuration (user override merged over
//! defaults, field by field, with constraint validation), and the retry
//! wrapper that implements the engine's error policy: cancellation is
//! terminal-but-clean, rate limits and security violations propagate
//! without retry, transient failures retry with backoff up to an attempt
//! limit.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::control::StopSignal;
use crate::errors::InferenceError;
use crate::state::ConversationMessage;

// ── Model configuration ──────────────────────────────────────────────

const TEMPERATURE_RANGE: std::ops::RangeInclusive<f32> = 0.0..=2.0;
const MAX_OUTPUT_TOKENS_CEILING: u32 = 128_000;

/// Effective model settings attached to every inference request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub model: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
    /// Cheaper model substituted on rate-limited responses.
    pub fallback_model: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model: "coder-large".to_string(),
            temperature: 0.2,
            max_output_tokens: 16_384,
            fallback_model: Some("coder-small".to_string()),
        }
    }
}

/// Per-user override; unset fields keep the defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelOverride {
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<u32>,
}

impl ModelConfig {
    /// Merge an override field by field. Values failing constraint
    /// validation fall back to the default for that field rather than
    /// rejecting the whole override.
    pub fn with_override(&self, user: &ModelOverride) -> ModelConfig {
        let mut merged = self.clone();
        if let Some(model) = &user.model {
            if is_valid_model_name(model) {
                merged.model = model.clone();
            } else {
                warn!(target: "crucible::inference", model = %model, "invalid model name, keeping default");
            }
        }
        if let Some(temperature) = user.temperature {
            if TEMPERATURE_RANGE.contains(&temperature) {
                merged.temperature = temperature;
            } else {
                warn!(target: "crucible::inference", temperature, "temperature out of range, keeping default");
            }
        }
        if let Some(max_output_tokens) = user.max_output_tokens {
            if (1..=MAX_OUTPUT_TOKENS_CEILING).contains(&max_output_tokens) {
                merged.max_output_tokens = max_output_tokens;
            } else {
                warn!(target: "crucible::inference", max_output_tokens, "token limit out of range, keeping default");
            }
        }
        merged
    }

    /// The same configuration pointed at the fallback model, if one is
    /// configured and differs from the current model.
    pub fn fallback(&self) -> Option<ModelConfig> {
        let fallback = self.fallback_model.as_ref()?;
        if fallback == &self.model {
            return None;
        }
        Some(ModelConfig {
            model: fallback.clone(),
            fallback_model: None,
            ..self.clone()
        })
    }
}

fn is_valid_model_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':' | '/'))
}

// ── Request / response ───────────────────────────────────────────────

/// JSON-schema description of a callable tool, sent with agentic requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// A tool invocation requested by the model. Arguments arrive as the raw
/// string the model produced; parsing happens at planning time and a parse
/// failure is never fatal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: String,
    /// Explicit ordering declared by the model, by call id.
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub conflicts_with: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct InferenceRequest {
    /// Action identifier, e.g. `"phase_generation"`.
    pub action: String,
    pub system: Option<String>,
    pub messages: Vec<ConversationMessage>,
    pub model: ModelConfig,
    pub tools: Vec<ToolSchema>,
}

impl InferenceRequest {
    pub fn new(action: impl Into<String>, messages: Vec<ConversationMessage>, model: ModelConfig) -> Self {
        Self {
            action: action.into(),
            system: None,
            messages,
            model,
            tools: Vec::new(),
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolSchema>) -> Self {
        self.tools = tools;
        self
    }
}

#[derive(Debug, Clone)]
pub struct InferenceResponse {
    /// The assistant message produced for this request.
    pub message: ConversationMessage,
    /// Tool invocations the model requested, in emission order.
    pub tool_calls: Vec<ToolCallRequest>,
}

/// The inference transport implemented by the hosting application.
#[async_trait]
pub trait InferenceService: Send + Sync {
    async fn infer(&self, request: InferenceRequest) -> Result<InferenceResponse, InferenceError>;
}

// ── Retry wrapper ────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(1u32 << exp);
        delay.min(self.max_delay)
    }
}

/// Call the inference service under the engine's retry policy.
///
/// A rate-limited response is retried once on the configured fallback
/// model; without a usable fallback it propagates immediately. The stop
/// signal is observed before every attempt, so cancellation never waits
/// out a backoff sleep.
pub async fn infer_with_retry(
    service: &dyn InferenceService,
    mut request: InferenceRequest,
    policy: &RetryPolicy,
    cancel: &StopSignal,
) -> Result<InferenceResponse, InferenceError> {
    let mut attempt: u32 = 0;
    loop {
        if cancel.is_raised() {
            return Err(InferenceError::Cancelled);
        }
        attempt += 1;
        match service.infer(request.clone()).await {
            Ok(response) => return Ok(response),
            Err(InferenceError::RateLimited(message)) => match request.model.fallback() {
                Some(fallback) => {
                    warn!(target: "crucible::inference", action = %request.action,
                        fallback = %fallback.model, "rate limited, switching to fallback model");
                    request.model = fallback;
                }
                None => return Err(InferenceError::RateLimited(message)),
            },
            Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                debug!(target: "crucible::inference", action = %request.action, attempt,
                    delay_ms = delay.as_millis() as u64, error = %e, "retrying inference");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_override_merges_field_by_field() {
        let defaults = ModelConfig::default();
        let merged = defaults.with_override(&ModelOverride {
            model: Some("coder-xl".into()),
            temperature: None,
            max_output_tokens: Some(4_096),
        });
        assert_eq!(merged.model, "coder-xl");
        assert_eq!(merged.temperature, defaults.temperature);
        assert_eq!(merged.max_output_tokens, 4_096);
    }

    #[test]
    fn test_override_invalid_fields_keep_defaults() {
        let defaults = ModelConfig::default();
        let merged = defaults.with_override(&ModelOverride {
            model: Some("not a model!!".into()),
            temperature: Some(9.5),
            max_output_tokens: Some(0),
        });
        assert_eq!(merged.model, defaults.model);
        assert_eq!(merged.temperature, defaults.temperature);
        assert_eq!(merged.max_output_tokens, defaults.max_output_tokens);
    }

    #[test]
    fn test_fallback_model() {
        let config = ModelConfig::default();
        let fallback = config.fallback().unwrap();
        assert_eq!(fallback.model, "coder-small");
        assert!(fallback.fallback_model.is_none(), "fallback must not chain");

        let mut same = ModelConfig::default();
        same.fallback_model = Some(same.model.clone());
        assert!(same.fallback().is_none());
    }

    #[test]
    fn test_retry_delay_is_exponential_and_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(4),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_secs(1));
        assert_eq!(policy.delay_for(3), Duration::from_secs(2));
        assert_eq!(policy.delay_for(5), Duration::from_secs(4));
        assert_eq!(policy.delay_for(12), Duration::from_secs(4));
    }

    struct ScriptedService {
        responses: Mutex<Vec<Result<InferenceResponse, InferenceError>>>,
        calls: AtomicU32,
        models_seen: Mutex<Vec<String>>,
    }

    impl ScriptedService {
        fn new(responses: Vec<Result<InferenceResponse, InferenceError>>) -> Self {
            Self {
                responses: Mutex::new(responses),
                calls: AtomicU32::new(0),
                models_seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl InferenceService for ScriptedService {
        async fn infer(&self, request: InferenceRequest) -> Result<InferenceResponse, InferenceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.models_seen.lock().unwrap().push(request.model.model.clone());
            self.responses.lock().unwrap().remove(0)
        }
    }

    fn ok_response(content: &str) -> Result<InferenceResponse, InferenceError> {
        Ok(InferenceResponse {
            message: ConversationMessage::assistant(content),
            tool_calls: Vec::new(),
        })
    }

    fn request() -> InferenceRequest {
        InferenceRequest::new("test_action", Vec::new(), ModelConfig::default())
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    #[tokio::test]
    async fn test_transient_errors_retry_then_succeed() {
        let service = ScriptedService::new(vec![
            Err(InferenceError::Transient("blip".into())),
            ok_response("done"),
        ]);
        let response = infer_with_retry(&service, request(), &fast_policy(), &StopSignal::new())
            .await
            .unwrap();
        assert_eq!(response.message.content, "done");
        assert_eq!(service.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_transient_errors_exhaust_attempt_limit() {
        let service = ScriptedService::new(vec![
            Err(InferenceError::Transient("1".into())),
            Err(InferenceError::Transient("2".into())),
            Err(InferenceError::Transient("3".into())),
        ]);
        let err = infer_with_retry(&service, request(), &fast_policy(), &StopSignal::new())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(service.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_rate_limit_falls_back_to_cheaper_model_once() {
        let service = ScriptedService::new(vec![
            Err(InferenceError::RateLimited("429".into())),
            ok_response("from fallback"),
        ]);
        let response = infer_with_retry(&service, request(), &fast_policy(), &StopSignal::new())
            .await
            .unwrap();
        assert_eq!(response.message.content, "from fallback");
        let models = service.models_seen.lock().unwrap().clone();
        assert_eq!(models, vec!["coder-large".to_string(), "coder-small".to_string()]);
    }

    #[tokio::test]
    async fn test_rate_limit_without_fallback_propagates() {
        let service = ScriptedService::new(vec![
            Err(InferenceError::RateLimited("429".into())),
            Err(InferenceError::RateLimited("429 again".into())),
        ]);
        let err = infer_with_retry(&service, request(), &fast_policy(), &StopSignal::new())
            .await
            .unwrap_err();
        assert!(matches!(err, InferenceError::RateLimited(_)));
        // first call on the primary, second on the fallback, then stop
        assert_eq!(service.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_security_error_never_retries() {
        let service = ScriptedService::new(vec![Err(InferenceError::Security("blocked".into()))]);
        let err = infer_with_retry(&service, request(), &fast_policy(), &StopSignal::new())
            .await
            .unwrap_err();
        assert!(matches!(err, InferenceError::Security(_)));
        assert_eq!(service.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_short_circuits_before_first_attempt() {
        let service = ScriptedService::new(vec![ok_response("never seen")]);
        let cancel = StopSignal::new();
        cancel.raise();
        let err = infer_with_retry(&service, request(), &fast_policy(), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancellation());
        assert_eq!(service.calls.load(Ordering::SeqCst), 0);
    }
}
