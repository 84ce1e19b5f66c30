//! Request identity and the per-request orchestration state machine

use std::collections::BTreeMap;
use std::fmt;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::OrchestratorError;

/// Context key under which the request text is seeded for every attempt.
pub const QUERY_KEY: &str = "query";

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generate a new random ID
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

uuid_id!(
    /// Identifies a conversation; checkpoints are keyed by it
    SessionId
);

uuid_id!(
    /// Identifies one orchestration attempt for a request
    AttemptId
);

/// An incoming query. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub text: String,
    pub session_id: SessionId,
    pub attempt_id: AttemptId,
    /// Extra caller-supplied values seeded into the shared context
    #[serde(default)]
    pub inputs: BTreeMap<String, Value>,
}

impl Request {
    /// Create a request in a fresh session
    pub fn new(text: impl Into<String>) -> Self {
        Self::in_session(text, SessionId::new())
    }

    /// Create a request for an existing session
    pub fn in_session(text: impl Into<String>, session_id: SessionId) -> Self {
        Self {
            text: text.into(),
            session_id,
            attempt_id: AttemptId::new(),
            inputs: BTreeMap::new(),
        }
    }

    /// Attach an extra seed input
    pub fn with_input(mut self, key: impl Into<String>, value: Value) -> Self {
        self.inputs.insert(key.into(), value);
        self
    }

    /// Keys available in the context before any team runs
    pub fn seed_keys(&self) -> Vec<String> {
        let mut keys = vec![QUERY_KEY.to_string()];
        keys.extend(self.inputs.keys().filter(|k| k.as_str() != QUERY_KEY).cloned());
        keys
    }
}

/// Lifecycle of one request attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestrationState {
    Initialized,
    Planning,
    Executing,
    Evaluating,
    Retrying,
    Synthesizing,
    Completed,
    Failed,
}

impl OrchestrationState {
    /// `Completed` or `Failed`
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether `self -> next` is an edge of the lifecycle graph
    pub fn can_transition_to(&self, next: OrchestrationState) -> bool {
        use OrchestrationState::*;

        if self.is_terminal() {
            return false;
        }
        if next == Failed {
            return true;
        }

        matches!(
            (self, next),
            (Initialized, Planning)
                | (Planning, Executing)
                // empty plan: the dispatcher is bypassed
                | (Planning, Synthesizing)
                | (Executing, Evaluating)
                | (Evaluating, Retrying)
                | (Evaluating, Synthesizing)
                | (Retrying, Executing)
                | (Synthesizing, Completed)
        )
    }
}

impl fmt::Display for OrchestrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Initialized => "initialized",
            Self::Planning => "planning",
            Self::Executing => "executing",
            Self::Evaluating => "evaluating",
            Self::Retrying => "retrying",
            Self::Synthesizing => "synthesizing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Runtime state for one request attempt
pub struct Session {
    pub request: Request,
    state: RwLock<OrchestrationState>,
    history: RwLock<Vec<OrchestrationState>>,
}

impl Session {
    /// Open a session at `Initialized`
    pub fn new(request: Request) -> Self {
        Self::resumed(request, OrchestrationState::Initialized)
    }

    /// Rebuild a session at a previously checkpointed state
    pub fn resumed(request: Request, state: OrchestrationState) -> Self {
        info!(
            session_id = %request.session_id,
            attempt_id = %request.attempt_id,
            state = %state,
            "Opening orchestration session"
        );

        Self {
            request,
            state: RwLock::new(state),
            history: RwLock::new(vec![state]),
        }
    }

    /// Get the current state
    pub fn state(&self) -> OrchestrationState {
        *self.state.read()
    }

    /// Every state visited so far, in order
    pub fn history(&self) -> Vec<OrchestrationState> {
        self.history.read().clone()
    }

    /// Move to `next`, rejecting edges outside the lifecycle graph
    pub fn transition(&self, next: OrchestrationState) -> Result<(), OrchestratorError> {
        let mut guard = self.state.write();
        let current = *guard;
        if !current.can_transition_to(next) {
            return Err(OrchestratorError::InvalidTransition {
                from: current,
                to: next,
            });
        }
        *guard = next;
        drop(guard);

        self.history.write().push(next);
        debug!(
            attempt_id = %self.request.attempt_id,
            from = %current,
            to = %next,
            "State transition"
        );
        Ok(())
    }
}
