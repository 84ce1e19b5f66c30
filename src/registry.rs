//! Capability registry - which teams exist and which intents route to them
//!
//! Built once at startup and shared read-only behind an `Arc`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::OrchestratorError;
use crate::intent::IntentKind;
use crate::team::TeamExecutor;

fn default_true() -> bool {
    true
}

/// Declared I/O contract of a team
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamSpec {
    pub name: String,
    #[serde(default)]
    pub required_inputs: Vec<String>,
    pub produced_output_key: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Optional teams never make a response incomplete
    #[serde(default)]
    pub optional: bool,
    /// Overrides the orchestrator-wide step timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl TeamSpec {
    pub fn new(name: impl Into<String>, produced_output_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required_inputs: Vec::new(),
            produced_output_key: produced_output_key.into(),
            priority: 0,
            enabled: true,
            optional: false,
            timeout_secs: None,
        }
    }

    pub fn requires(mut self, input: impl Into<String>) -> Self {
        self.required_inputs.push(input.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = Some(timeout.as_secs().max(1));
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

struct TeamEntry {
    spec: TeamSpec,
    executor: Arc<dyn TeamExecutor>,
}

/// Immutable registry of teams and intent routes
pub struct CapabilityRegistry {
    teams: Vec<TeamEntry>,
    index: HashMap<String, usize>,
    routes: HashMap<IntentKind, Vec<String>>,
}

impl CapabilityRegistry {
    /// Start an empty registry builder
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Get a team spec by name
    pub fn get(&self, team: &str) -> Option<&TeamSpec> {
        self.index.get(team).map(|&i| &self.teams[i].spec)
    }

    /// Get the executor bound to a team
    pub fn executor(&self, team: &str) -> Option<Arc<dyn TeamExecutor>> {
        self.index.get(team).map(|&i| Arc::clone(&self.teams[i].executor))
    }

    /// Position of the team in declaration order
    pub fn declaration_index(&self, team: &str) -> Option<usize> {
        self.index.get(team).copied()
    }

    /// Team set declared for an intent, in route order
    pub fn teams_for(&self, intent: &IntentKind) -> &[String] {
        self.routes.get(intent).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Team names in declaration order
    pub fn team_names(&self) -> Vec<&str> {
        self.teams.iter().map(|t| t.spec.name.as_str()).collect()
    }

    /// Number of registered teams
    pub fn len(&self) -> usize {
        self.teams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.teams.is_empty()
    }
}

impl std::fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("teams", &self.team_names())
            .field("routes", &self.routes)
            .finish()
    }
}

/// Collects teams and routes before freezing them into a registry
#[derive(Default)]
pub struct RegistryBuilder {
    teams: Vec<TeamEntry>,
    routes: Vec<(IntentKind, Vec<String>)>,
}

impl RegistryBuilder {
    pub fn team(mut self, spec: TeamSpec, executor: Arc<dyn TeamExecutor>) -> Self {
        self.teams.push(TeamEntry { spec, executor });
        self
    }

    /// Declare the team set for an intent. Later routes for the same intent replace earlier ones.
    pub fn route<I, S>(mut self, intent: IntentKind, teams: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.routes
            .push((intent, teams.into_iter().map(Into::into).collect()));
        self
    }

    /// Bind configured team specs to executors by name
    pub fn from_config(
        teams: &[TeamSpec],
        routes: &BTreeMap<String, Vec<String>>,
        executors: &HashMap<String, Arc<dyn TeamExecutor>>,
    ) -> Result<Self, OrchestratorError> {
        let mut builder = Self::default();
        for spec in teams {
            let executor = executors.get(&spec.name).ok_or_else(|| {
                OrchestratorError::Config(format!("no executor bound for team '{}'", spec.name))
            })?;
            builder = builder.team(spec.clone(), Arc::clone(executor));
        }
        for (intent, team_names) in routes {
            builder = builder.route(IntentKind::from_name(intent), team_names.iter().cloned());
        }
        Ok(builder)
    }

    pub fn build(self) -> Result<CapabilityRegistry, OrchestratorError> {
        let mut index = HashMap::new();
        for (i, entry) in self.teams.iter().enumerate() {
            let name = entry.spec.name.trim();
            if name.is_empty() {
                return Err(OrchestratorError::Config("team name must not be empty".into()));
            }
            if entry.spec.produced_output_key.trim().is_empty() {
                return Err(OrchestratorError::Config(format!(
                    "team '{name}' must declare a produced_output_key"
                )));
            }
            if index.insert(entry.spec.name.clone(), i).is_some() {
                return Err(OrchestratorError::Config(format!("duplicate team '{name}'")));
            }
        }

        // Unknown team names in routes are left for plan validation to reject
        let routes: HashMap<IntentKind, Vec<String>> = self.routes.into_iter().collect();

        info!(teams = self.teams.len(), routes = routes.len(), "Capability registry built");
        Ok(CapabilityRegistry {
            teams: self.teams,
            index,
            routes,
        })
    }
}
