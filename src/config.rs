//! Orchestrator and registry configuration

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::OrchestratorError;
use crate::evaluator::DEFAULT_MAX_RETRIES;
use crate::planner::{PlanBuilder, DEFAULT_CONFIDENCE_THRESHOLD, DEFAULT_MAX_STEPS};
use crate::reasoning::BackoffPolicy;
use crate::registry::TeamSpec;

/// Engine-wide knobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub max_retries: u32,
    pub confidence_threshold: f32,
    pub step_timeout_secs: u64,
    pub max_steps: usize,
    pub reasoning_max_attempts: u32,
    pub reasoning_backoff_ms: u64,
    pub reasoning_max_backoff_ms: u64,
    /// Fall back to the keyword classifier when reasoning fails
    pub heuristic_fallback: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            step_timeout_secs: 30,
            max_steps: DEFAULT_MAX_STEPS,
            reasoning_max_attempts: 3,
            reasoning_backoff_ms: 200,
            reasoning_max_backoff_ms: 5_000,
            heuristic_fallback: true,
        }
    }
}

impl OrchestratorConfig {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: self.reasoning_max_attempts,
            base_delay: Duration::from_millis(self.reasoning_backoff_ms),
            max_delay: Duration::from_millis(self.reasoning_max_backoff_ms),
        }
    }

    pub fn plan_builder(&self) -> PlanBuilder {
        PlanBuilder::new(self.confidence_threshold, self.step_timeout(), self.max_steps)
    }

    pub fn validate(&self) -> Result<(), OrchestratorError> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(OrchestratorError::Config(format!(
                "confidence_threshold must be within [0, 1], got {}",
                self.confidence_threshold
            )));
        }
        if self.step_timeout_secs == 0 {
            return Err(OrchestratorError::Config("step_timeout_secs must be positive".into()));
        }
        if self.max_steps == 0 {
            return Err(OrchestratorError::Config("max_steps must be positive".into()));
        }
        if self.reasoning_max_attempts == 0 {
            return Err(OrchestratorError::Config(
                "reasoning_max_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Team declarations plus intent routes, keyed by intent name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub teams: Vec<TeamSpec>,
    pub routes: BTreeMap<String, Vec<String>>,
}

/// Top-level config file layout
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub orchestrator: OrchestratorConfig,
    pub registry: RegistryConfig,
}

/// Parse and validate config text
pub fn parse_config(content: &str) -> Result<FileConfig, OrchestratorError> {
    let config: FileConfig =
        toml::from_str(content).map_err(|e| OrchestratorError::Config(e.to_string()))?;
    config.orchestrator.validate()?;
    Ok(config)
}

/// Load a config file; a missing file yields the defaults
pub fn load_config(path: &Path) -> Result<FileConfig> {
    if !path.exists() {
        return Ok(FileConfig::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read orchestrator config at '{}'", path.display()))?;
    parse_config(&content).with_context(|| {
        format!(
            "invalid orchestrator configuration in '{}'. Check team declarations and limits.",
            path.display()
        )
    })
}
