//! Quality evaluation and bounded retry

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::planner::{ExecutionPlan, StepId};
use crate::team::{StepError, StepStatus, TeamResult};

pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// A required output that is not available
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingInformation {
    pub step_id: StepId,
    pub team: String,
    pub output_key: String,
    pub reason: String,
}

/// Verdict on one dispatch round
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub complete: bool,
    pub needs_retry: bool,
    /// Root-cause steps to re-run, in plan order
    pub retry_targets: Vec<StepId>,
    pub attempt_count: u32,
    pub missing: Vec<MissingInformation>,
}

impl Evaluation {
    /// Evaluation of a plan that had nothing to run
    pub fn nothing_to_do() -> Self {
        Self {
            complete: true,
            needs_retry: false,
            retry_targets: Vec::new(),
            attempt_count: 0,
            missing: Vec::new(),
        }
    }

    pub fn degraded(&self) -> bool {
        !self.complete
    }
}

/// Decides completeness and what a retry should target
#[derive(Debug, Clone)]
pub struct QualityEvaluator {
    max_retries: u32,
}

impl Default for QualityEvaluator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES)
    }
}

impl QualityEvaluator {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn evaluate(
        &self,
        plan: &ExecutionPlan,
        team_results: &BTreeMap<StepId, TeamResult>,
        attempt_count: u32,
    ) -> Evaluation {
        let mut missing = Vec::new();
        let mut unmet: Vec<&StepId> = Vec::new();

        for step in plan.steps.iter().filter(|s| !s.optional) {
            let result = team_results.get(&step.step_id);
            if result.is_some_and(TeamResult::is_usable) {
                continue;
            }
            let reason = match result.and_then(|r| r.error.as_ref()) {
                Some(error) => error.to_string(),
                None if result.is_some() => "no usable output".to_string(),
                None => "not executed".to_string(),
            };
            missing.push(MissingInformation {
                step_id: step.step_id.clone(),
                team: step.team.clone(),
                output_key: step.produced_output_key.clone(),
                reason,
            });
            unmet.push(&step.step_id);
        }

        // A step skipped only because an unmet producer failed is not a root cause;
        // the retry round re-runs it once the producer succeeds.
        let retry_targets: Vec<StepId> = unmet
            .iter()
            .filter(|id| {
                let skipped_on = team_results
                    .get(**id)
                    .filter(|r| r.status == StepStatus::Skipped)
                    .and_then(|r| match &r.error {
                        Some(StepError::DependencyMissing(key)) => Some(key.as_str()),
                        _ => None,
                    });
                match skipped_on {
                    Some(key) => !plan
                        .steps
                        .iter()
                        .any(|s| s.produced_output_key == key && unmet.contains(&&s.step_id)),
                    None => true,
                }
            })
            .map(|id| (*id).clone())
            .collect();

        let complete = missing.is_empty();
        let needs_retry = !complete && attempt_count < self.max_retries && !retry_targets.is_empty();

        if complete {
            debug!(attempt_count, "All required outputs present");
        } else {
            info!(
                attempt_count,
                missing = missing.len(),
                needs_retry,
                targets = ?retry_targets,
                "Plan outputs incomplete"
            );
        }

        Evaluation {
            complete,
            needs_retry,
            retry_targets,
            attempt_count,
            missing,
        }
    }
}

/// Counts retry rounds and refuses to go past the limit
#[derive(Debug, Clone)]
pub struct RetryController {
    max_retries: u32,
    attempts: u32,
}

impl RetryController {
    pub fn new(max_retries: u32) -> Self {
        Self::resumed(max_retries, 0)
    }

    /// Controller that already used `attempts` retries
    pub fn resumed(max_retries: u32, attempts: u32) -> Self {
        Self {
            max_retries,
            attempts: attempts.min(max_retries),
        }
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempts
    }

    pub fn exhausted(&self) -> bool {
        self.attempts >= self.max_retries
    }

    /// Start a retry round if the evaluation asks for one and budget remains
    pub fn begin_retry(&mut self, evaluation: &Evaluation) -> Option<Vec<StepId>> {
        if !evaluation.needs_retry || self.exhausted() || evaluation.retry_targets.is_empty() {
            return None;
        }
        self.attempts += 1;
        info!(
            attempt = self.attempts,
            max_retries = self.max_retries,
            targets = ?evaluation.retry_targets,
            "Starting retry round"
        );
        Some(evaluation.retry_targets.clone())
    }
}
