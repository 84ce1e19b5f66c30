//! Boundary to the external language-model service

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

pub const INTENT_TEMPLATE: &str = "intent_classification";
pub const SYNTHESIS_TEMPLATE: &str = "response_synthesis";
pub const GUIDANCE_TEMPLATE: &str = "guidance";

/// Output of one reasoning call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ReasoningOutput {
    Text(String),
    Json(Value),
}

impl ReasoningOutput {
    /// Structured view; text that happens to be JSON is parsed
    pub fn as_json(&self) -> Option<Value> {
        match self {
            Self::Json(value) => Some(value.clone()),
            Self::Text(text) => serde_json::from_str(extract_json_block(text)).ok(),
        }
    }

    pub fn into_text(self) -> String {
        match self {
            Self::Text(text) => text,
            Self::Json(Value::String(text)) => text,
            Self::Json(value) => value.to_string(),
        }
    }
}

/// Strip a fenced ```json block if the model wrapped its answer in one
fn extract_json_block(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Reasoning service failures
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReasoningError {
    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("timed out")]
    Timeout,
}

/// Language-model invocation port
#[async_trait]
pub trait ReasoningService: Send + Sync {
    async fn invoke(
        &self,
        template_id: &str,
        variables: &Map<String, Value>,
    ) -> Result<ReasoningOutput, ReasoningError>;
}

/// Exponential backoff for reasoning calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn no_delay(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `retries_used + 1`
    pub fn delay_for(&self, retries_used: u32) -> Duration {
        let base_ms = self.base_delay.as_millis();
        if base_ms == 0 {
            return Duration::ZERO;
        }
        let max_ms = self.max_delay.as_millis().max(base_ms);
        let multiplier = 1u128 << retries_used.min(20);
        let backoff_ms = base_ms.saturating_mul(multiplier).min(max_ms);
        Duration::from_millis(u64::try_from(backoff_ms).unwrap_or(u64::MAX))
    }
}

/// Invoke with retries; returns the last error once attempts run out
pub async fn invoke_with_backoff(
    service: &dyn ReasoningService,
    template_id: &str,
    variables: &Map<String, Value>,
    policy: &BackoffPolicy,
) -> Result<ReasoningOutput, ReasoningError> {
    let attempts = policy.max_attempts.max(1);
    let mut retries_used = 0;

    loop {
        match service.invoke(template_id, variables).await {
            Ok(output) => {
                debug!(template_id, attempt = retries_used + 1, "Reasoning call succeeded");
                return Ok(output);
            }
            Err(error) if retries_used + 1 >= attempts => {
                warn!(template_id, error = %error, attempts, "Reasoning call exhausted retries");
                return Err(error);
            }
            Err(error) => {
                let delay = policy.delay_for(retries_used);
                warn!(
                    template_id,
                    error = %error,
                    retry_in_ms = delay.as_millis() as u64,
                    "Reasoning call failed, backing off"
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                retries_used += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedReasoning;
    use serde_json::json;

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = BackoffPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(350));
        assert_eq!(BackoffPolicy::no_delay(3).delay_for(4), Duration::ZERO);
    }

    #[test]
    fn test_text_output_with_fenced_json_parses() {
        let output = ReasoningOutput::Text("```json\n{\"intent\": \"search\"}\n```".into());
        assert_eq!(output.as_json(), Some(json!({"intent": "search"})));
        assert_eq!(ReasoningOutput::Text("plain words".into()).as_json(), None);
    }

    #[tokio::test]
    async fn test_invoke_retries_until_success() {
        let service = ScriptedReasoning::new();
        service.push(INTENT_TEMPLATE, Err(ReasoningError::Timeout));
        service.push(INTENT_TEMPLATE, Ok(ReasoningOutput::Text("ok".into())));

        let output = invoke_with_backoff(&service, INTENT_TEMPLATE, &Map::new(), &BackoffPolicy::no_delay(3))
            .await
            .unwrap();

        assert_eq!(output, ReasoningOutput::Text("ok".into()));
        assert_eq!(service.calls(INTENT_TEMPLATE), 2);
    }

    #[tokio::test]
    async fn test_invoke_gives_up_after_max_attempts() {
        let service = ScriptedReasoning::new();

        let err = invoke_with_backoff(&service, SYNTHESIS_TEMPLATE, &Map::new(), &BackoffPolicy::no_delay(2))
            .await
            .unwrap_err();

        assert!(matches!(err, ReasoningError::Unavailable(_)));
        assert_eq!(service.calls(SYNTHESIS_TEMPLATE), 2);
    }
}
