//! Team executor contract and per-step results

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::planner::StepId;

/// Input handed to a team for one step
#[derive(Debug, Clone)]
pub struct TeamInput {
    pub step_id: StepId,
    pub team: String,
    /// Required inputs resolved from the shared context
    pub inputs: Map<String, Value>,
    /// Fires when the whole request is cancelled
    pub cancellation: CancellationToken,
}

impl TeamInput {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.inputs.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.inputs.get(key).and_then(Value::as_str)
    }
}

/// What a team reports back
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TeamOutcome {
    Success { data: Value },
    Error { error: String },
}

impl TeamOutcome {
    pub fn success(data: Value) -> Self {
        Self::Success { data }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self::Error {
            error: error.into(),
        }
    }
}

/// A pluggable capability group.
///
/// Implementations must tolerate being invoked again for the same step: the
/// retry controller re-dispatches failed steps.
#[async_trait]
pub trait TeamExecutor: Send + Sync {
    async fn execute(&self, input: TeamInput) -> TeamOutcome;
}

/// Terminal status of a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    Failed,
    Skipped,
}

/// Why a step did not succeed
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum StepError {
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    #[error("execution failed: {0}")]
    Execution(String),

    #[error("dependency_missing: {0}")]
    DependencyMissing(String),

    #[error("cancelled")]
    Cancelled,

    #[error("team returned empty output")]
    EmptyOutput,

    #[error("could not publish output: {0}")]
    ContextWrite(String),
}

impl StepError {
    /// Short machine label used on progress events
    pub fn label(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::Execution(_) => "execution_failed",
            Self::DependencyMissing(_) => "dependency_missing",
            Self::Cancelled => "cancelled",
            Self::EmptyOutput => "empty_output",
            Self::ContextWrite(_) => "context_write",
        }
    }
}

/// Outcome of one executed (or skipped) step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamResult {
    pub step_id: StepId,
    pub team: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    pub duration: Duration,
    /// Dispatch round that produced this result (0 = first)
    pub round: u32,
}

impl TeamResult {
    pub fn success(step_id: StepId, team: impl Into<String>, output: Value, duration: Duration, round: u32) -> Self {
        Self {
            step_id,
            team: team.into(),
            status: StepStatus::Success,
            output: Some(output),
            error: None,
            duration,
            round,
        }
    }

    pub fn failed(step_id: StepId, team: impl Into<String>, error: StepError, duration: Duration, round: u32) -> Self {
        Self {
            step_id,
            team: team.into(),
            status: StepStatus::Failed,
            output: None,
            error: Some(error),
            duration,
            round,
        }
    }

    pub fn skipped(step_id: StepId, team: impl Into<String>, error: StepError, round: u32) -> Self {
        Self {
            step_id,
            team: team.into(),
            status: StepStatus::Skipped,
            output: None,
            error: Some(error),
            duration: Duration::ZERO,
            round,
        }
    }

    /// Success with a non-empty payload
    pub fn is_usable(&self) -> bool {
        self.status == StepStatus::Success && self.output.as_ref().is_some_and(|v| !is_empty_value(v))
    }
}

/// Null, blank strings and empty containers count as no output
pub fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}
