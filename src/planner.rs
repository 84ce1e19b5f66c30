//! Plan builder - intent + registry → validated execution plan

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::graph::DependencyGraph;
use crate::intent::Intent;
use crate::registry::CapabilityRegistry;
use crate::session::QUERY_KEY;

pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_STEPS: usize = 25;
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.5;

/// Strongly-typed step ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(String);

impl StepId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for StepId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for StepId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl PartialEq<&str> for StepId {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// One team invocation in a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStep {
    pub step_id: StepId,
    pub team: String,
    pub required_inputs: Vec<String>,
    pub produced_output_key: String,
    pub priority: i32,
    pub timeout: Duration,
    pub optional: bool,
    /// Derived from `required_inputs` against other steps' produced keys
    pub depends_on: Vec<StepId>,
}

/// How the dispatcher schedules a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Sequential,
    Parallel,
    Dag,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Sequential => "sequential",
            Self::Parallel => "parallel",
            Self::Dag => "dag",
        })
    }
}

/// Ordered, dependency-annotated set of steps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    /// Topologically ordered
    pub steps: Vec<ExecutionStep>,
    pub strategy: Strategy,
    pub estimated_time: Duration,
}

impl ExecutionPlan {
    pub fn empty() -> Self {
        Self {
            steps: Vec::new(),
            strategy: Strategy::Sequential,
            estimated_time: Duration::ZERO,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn step(&self, step_id: &StepId) -> Option<&ExecutionStep> {
        self.steps.iter().find(|s| &s.step_id == step_id)
    }

    pub fn step_ids(&self) -> Vec<StepId> {
        self.steps.iter().map(|s| s.step_id.clone()).collect()
    }

    pub fn teams(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.team.as_str()).collect()
    }

    pub fn graph(&self) -> DependencyGraph {
        DependencyGraph::from_edges(self.steps.iter().map(|s| (&s.step_id, s.depends_on.as_slice())))
    }
}

/// Reasons a plan is rejected before dispatch
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanValidationError {
    #[error("dependency cycle involving step '{0}'")]
    CycleDetected(StepId),

    #[error("unknown team '{0}'")]
    UnknownTeam(String),

    #[error("team '{0}' is disabled")]
    DisabledTeam(String),

    #[error("output key '{key}' is produced by both '{first}' and '{second}'")]
    DuplicateOutputKey {
        key: String,
        first: String,
        second: String,
    },

    #[error("step '{step}' requires '{input}' which no step or request provides")]
    UnresolvedInput { step: StepId, input: String },

    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: StepId, dependency: StepId },

    #[error("plan has {count} steps, more than the limit of {max}")]
    TooManySteps { count: usize, max: usize },
}

/// Writer name reported when a team would overwrite a request seed
pub const REQUEST_WRITER: &str = "request";

/// Turns an intent into a plan using the registry's static routes
#[derive(Debug, Clone)]
pub struct PlanBuilder {
    pub confidence_threshold: f32,
    pub default_timeout: Duration,
    pub max_steps: usize,
}

impl Default for PlanBuilder {
    fn default() -> Self {
        Self {
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            default_timeout: DEFAULT_STEP_TIMEOUT,
            max_steps: DEFAULT_MAX_STEPS,
        }
    }
}

impl PlanBuilder {
    pub fn new(confidence_threshold: f32, default_timeout: Duration, max_steps: usize) -> Self {
        Self {
            confidence_threshold,
            default_timeout,
            max_steps,
        }
    }

    /// Build a plan where only the request text is available up front
    pub fn build(&self, intent: &Intent, registry: &CapabilityRegistry) -> Result<ExecutionPlan, PlanValidationError> {
        self.build_with_inputs(intent, registry, &[QUERY_KEY.to_string()])
    }

    /// Build a plan; `external_inputs` are keys seeded from the request
    #[instrument(skip_all, fields(intent = %intent.kind, confidence = intent.confidence))]
    pub fn build_with_inputs(
        &self,
        intent: &Intent,
        registry: &CapabilityRegistry,
        external_inputs: &[String],
    ) -> Result<ExecutionPlan, PlanValidationError> {
        if !intent.is_actionable(self.confidence_threshold) {
            info!(threshold = self.confidence_threshold, "Intent not actionable, empty plan");
            return Ok(ExecutionPlan::empty());
        }

        let mut team_names: Vec<&str> = Vec::new();
        for name in registry.teams_for(&intent.kind) {
            if !team_names.contains(&name.as_str()) {
                team_names.push(name);
            }
        }
        if team_names.is_empty() {
            info!("No teams routed for intent, empty plan");
            return Ok(ExecutionPlan::empty());
        }
        if team_names.len() > self.max_steps {
            return Err(PlanValidationError::TooManySteps {
                count: team_names.len(),
                max: self.max_steps,
            });
        }

        let mut candidates = Vec::with_capacity(team_names.len());
        for name in team_names {
            let spec = registry
                .get(name)
                .ok_or_else(|| PlanValidationError::UnknownTeam(name.to_string()))?;
            if !spec.enabled {
                return Err(PlanValidationError::DisabledTeam(name.to_string()));
            }
            let declared_at = registry.declaration_index(name).unwrap_or(usize::MAX);
            candidates.push((declared_at, spec));
        }
        // Tie-break order: declaration order, then priority descending
        candidates.sort_by_key(|(declared_at, spec)| (*declared_at, std::cmp::Reverse(spec.priority)));

        let external: BTreeSet<&str> = external_inputs.iter().map(String::as_str).collect();
        let mut producers: HashMap<&str, &str> = HashMap::new();
        for (_, spec) in &candidates {
            // request seeds are the first writer of their keys
            if external.contains(spec.produced_output_key.as_str()) {
                return Err(PlanValidationError::DuplicateOutputKey {
                    key: spec.produced_output_key.clone(),
                    first: REQUEST_WRITER.to_string(),
                    second: spec.name.clone(),
                });
            }
            if let Some(first) = producers.insert(&spec.produced_output_key, &spec.name) {
                return Err(PlanValidationError::DuplicateOutputKey {
                    key: spec.produced_output_key.clone(),
                    first: first.to_string(),
                    second: spec.name.clone(),
                });
            }
        }

        let mut steps = Vec::with_capacity(candidates.len());
        for (_, spec) in &candidates {
            let step_id = StepId::new(spec.name.clone());
            let mut depends_on = Vec::new();
            for input in &spec.required_inputs {
                match producers.get(input.as_str()) {
                    Some(producer) => {
                        let dep = StepId::new(*producer);
                        if !depends_on.contains(&dep) {
                            depends_on.push(dep);
                        }
                    }
                    None if external.contains(input.as_str()) => {}
                    None => {
                        return Err(PlanValidationError::UnresolvedInput {
                            step: step_id,
                            input: input.clone(),
                        })
                    }
                }
            }
            steps.push(ExecutionStep {
                step_id,
                team: spec.name.clone(),
                required_inputs: spec.required_inputs.clone(),
                produced_output_key: spec.produced_output_key.clone(),
                priority: spec.priority,
                timeout: spec.timeout().unwrap_or(self.default_timeout),
                optional: spec.optional,
                depends_on,
            });
        }

        let plan = order_plan(steps)?;
        self.validate(&plan, registry)?;

        info!(
            steps = plan.len(),
            strategy = %plan.strategy,
            estimated_ms = plan.estimated_time.as_millis() as u64,
            "Plan built"
        );
        Ok(plan)
    }

    /// Check a plan against the registry; used for built and resumed plans alike
    pub fn validate(&self, plan: &ExecutionPlan, registry: &CapabilityRegistry) -> Result<(), PlanValidationError> {
        if plan.len() > self.max_steps {
            return Err(PlanValidationError::TooManySteps {
                count: plan.len(),
                max: self.max_steps,
            });
        }

        for step in &plan.steps {
            let spec = registry
                .get(&step.team)
                .ok_or_else(|| PlanValidationError::UnknownTeam(step.team.clone()))?;
            if !spec.enabled {
                return Err(PlanValidationError::DisabledTeam(step.team.clone()));
            }
            for dep in &step.depends_on {
                if plan.step(dep).is_none() {
                    return Err(PlanValidationError::UnknownDependency {
                        step: step.step_id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        plan.graph()
            .topological_order()
            .map(|_| ())
            .map_err(PlanValidationError::CycleDetected)
    }
}

/// Topologically order steps and pick the strategy
fn order_plan(steps: Vec<ExecutionStep>) -> Result<ExecutionPlan, PlanValidationError> {
    let graph = DependencyGraph::from_edges(steps.iter().map(|s| (&s.step_id, s.depends_on.as_slice())));
    let order = graph
        .topological_order()
        .map_err(PlanValidationError::CycleDetected)?;

    let strategy = if graph.has_edges() {
        if graph.is_chain(&order) {
            Strategy::Sequential
        } else {
            Strategy::Dag
        }
    } else if steps.len() > 1 {
        Strategy::Parallel
    } else {
        Strategy::Sequential
    };

    let mut by_id: HashMap<StepId, ExecutionStep> =
        steps.into_iter().map(|s| (s.step_id.clone(), s)).collect();
    let ordered: Vec<ExecutionStep> = order.iter().filter_map(|id| by_id.remove(id)).collect();
    let estimated_time = estimate_time(&ordered, strategy);

    debug!(order = ?order, strategy = %strategy, "Plan ordered");
    Ok(ExecutionPlan {
        steps: ordered,
        strategy,
        estimated_time,
    })
}

/// Sequential plans add up; otherwise the critical path through timeouts
fn estimate_time(ordered: &[ExecutionStep], strategy: Strategy) -> Duration {
    if strategy == Strategy::Sequential {
        return ordered.iter().map(|s| s.timeout).sum();
    }
    let mut finish: HashMap<&StepId, Duration> = HashMap::new();
    for step in ordered {
        let start = step
            .depends_on
            .iter()
            .filter_map(|dep| finish.get(dep))
            .max()
            .copied()
            .unwrap_or(Duration::ZERO);
        finish.insert(&step.step_id, start + step.timeout);
    }
    finish.into_values().max().unwrap_or(Duration::ZERO)
}
