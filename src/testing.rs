//! Scripted fakes shared by unit tests

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};

use crate::intent::IntentKind;
use crate::reasoning::{ReasoningError, ReasoningOutput, ReasoningService};
use crate::registry::{CapabilityRegistry, TeamSpec};
use crate::team::{TeamExecutor, TeamInput, TeamOutcome};

/// Route test logs through the test harness; `RUST_LOG` picks the level
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Team that replays a script of outcomes; the last one repeats
pub struct ScriptedTeam {
    script: Mutex<VecDeque<TeamOutcome>>,
    fallback: TeamOutcome,
    delay: Mutex<Option<Duration>>,
    inputs: Mutex<Vec<Map<String, Value>>>,
}

impl ScriptedTeam {
    pub fn sequence(outcomes: Vec<TeamOutcome>) -> Arc<Self> {
        let fallback = outcomes
            .last()
            .cloned()
            .unwrap_or_else(|| TeamOutcome::error("empty script"));
        Arc::new(Self {
            script: Mutex::new(outcomes.into()),
            fallback,
            delay: Mutex::new(None),
            inputs: Mutex::new(Vec::new()),
        })
    }

    pub fn ok(data: impl Into<Value>) -> Arc<Self> {
        Self::sequence(vec![TeamOutcome::success(data.into())])
    }

    pub fn failing(error: &str) -> Arc<Self> {
        Self::sequence(vec![TeamOutcome::error(error)])
    }

    pub fn with_delay(self: Arc<Self>, delay: Duration) -> Arc<Self> {
        *self.delay.lock() = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.inputs.lock().len()
    }

    /// Input maps seen so far, in call order
    pub fn inputs(&self) -> Vec<Map<String, Value>> {
        self.inputs.lock().clone()
    }
}

#[async_trait]
impl TeamExecutor for ScriptedTeam {
    async fn execute(&self, input: TeamInput) -> TeamOutcome {
        self.inputs.lock().push(input.inputs.clone());
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.script.lock().pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }
}

/// Reasoning service answering from per-template queues
#[derive(Default)]
pub struct ScriptedReasoning {
    responses: Mutex<HashMap<String, VecDeque<Result<ReasoningOutput, ReasoningError>>>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl ScriptedReasoning {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, template_id: &str, response: Result<ReasoningOutput, ReasoningError>) {
        self.responses
            .lock()
            .entry(template_id.to_string())
            .or_default()
            .push_back(response);
    }

    pub fn calls(&self, template_id: &str) -> usize {
        self.calls.lock().get(template_id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl ReasoningService for ScriptedReasoning {
    async fn invoke(
        &self,
        template_id: &str,
        _variables: &Map<String, Value>,
    ) -> Result<ReasoningOutput, ReasoningError> {
        *self.calls.lock().entry(template_id.to_string()).or_default() += 1;
        self.responses
            .lock()
            .get_mut(template_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Err(ReasoningError::Unavailable(format!("no scripted response for {template_id}"))))
    }
}

/// `search` (query → search_results) and `analysis` (search_results → analysis)
pub fn sample_registry(search: Arc<dyn TeamExecutor>, analysis: Arc<dyn TeamExecutor>) -> CapabilityRegistry {
    CapabilityRegistry::builder()
        .team(TeamSpec::new("search", "search_results").requires("query"), search)
        .team(
            TeamSpec::new("analysis", "analysis").requires("search_results"),
            analysis,
        )
        .route(IntentKind::PriceLookup, ["search"])
        .route(IntentKind::Search, ["search"])
        .route(IntentKind::Analysis, ["search", "analysis"])
        .route(IntentKind::Comprehensive, ["search", "analysis"])
        .build()
        .expect("sample registry is valid")
}
