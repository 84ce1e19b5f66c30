//! Team dispatcher - runs a plan's steps against the shared context
//!
//! Sequential plans run one step at a time. Parallel and DAG plans run in
//! waves: every step in a wave has all of its producers in earlier waves, and
//! each wave is joined before the next one starts.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::channel::{ProgressSender, StepProgress};
use crate::context::SharedContext;
use crate::error::OrchestratorError;
use crate::planner::{ExecutionPlan, ExecutionStep, PlanValidationError, StepId, Strategy};
use crate::registry::CapabilityRegistry;
use crate::team::{is_empty_value, StepError, StepStatus, TeamInput, TeamOutcome, TeamResult};

/// Results of one dispatch round
#[derive(Debug, Clone, Default)]
pub struct DispatchReport {
    /// Every step's latest result, keyed by step id
    pub team_results: BTreeMap<StepId, TeamResult>,
    /// Steps whose executor was invoked this round, in completion order
    pub executed: Vec<StepId>,
    pub cancelled: bool,
}

/// Executes plans against registered teams
pub struct Dispatcher {
    registry: Arc<CapabilityRegistry>,
    max_steps: usize,
    progress: ProgressSender,
}

impl Dispatcher {
    pub fn new(registry: Arc<CapabilityRegistry>, max_steps: usize, progress: ProgressSender) -> Self {
        Self {
            registry,
            max_steps,
            progress,
        }
    }

    /// Run every step of the plan
    #[instrument(skip_all, fields(steps = plan.len(), strategy = %plan.strategy))]
    pub async fn dispatch(
        &self,
        plan: &ExecutionPlan,
        context: &SharedContext,
        cancel: &CancellationToken,
    ) -> Result<DispatchReport, OrchestratorError> {
        self.check_ceiling(plan)?;
        let selected: BTreeSet<StepId> = plan.steps.iter().map(|s| s.step_id.clone()).collect();
        Ok(self.run_selected(plan, context, &selected, BTreeMap::new(), 0, cancel).await)
    }

    /// Re-run `targets` and whichever of their dependents have not succeeded.
    ///
    /// Steps that already succeeded are never invoked again; their outputs stay
    /// in the context and their previous results carry over.
    #[instrument(skip_all, fields(round = round, targets = targets.len()))]
    pub async fn redispatch(
        &self,
        plan: &ExecutionPlan,
        context: &SharedContext,
        previous: &BTreeMap<StepId, TeamResult>,
        targets: &[StepId],
        round: u32,
        cancel: &CancellationToken,
    ) -> Result<DispatchReport, OrchestratorError> {
        self.check_ceiling(plan)?;
        let selected = retry_selection(plan, previous, targets);
        info!(selected = ?selected, "Redispatching steps");
        Ok(self
            .run_selected(plan, context, &selected, previous.clone(), round, cancel)
            .await)
    }

    fn check_ceiling(&self, plan: &ExecutionPlan) -> Result<(), OrchestratorError> {
        if plan.len() > self.max_steps {
            return Err(PlanValidationError::TooManySteps {
                count: plan.len(),
                max: self.max_steps,
            }
            .into());
        }
        Ok(())
    }

    async fn run_selected(
        &self,
        plan: &ExecutionPlan,
        context: &SharedContext,
        selected: &BTreeSet<StepId>,
        mut team_results: BTreeMap<StepId, TeamResult>,
        round: u32,
        cancel: &CancellationToken,
    ) -> DispatchReport {
        let mut executed = Vec::new();

        for step in plan.steps.iter().filter(|s| selected.contains(&s.step_id)) {
            self.progress.step(&step.step_id, StepProgress::Pending, None);
        }

        let waves: Vec<Vec<&ExecutionStep>> = match plan.strategy {
            Strategy::Sequential => plan
                .steps
                .iter()
                .filter(|s| selected.contains(&s.step_id))
                .map(|s| vec![s])
                .collect(),
            Strategy::Parallel | Strategy::Dag => {
                let graph_waves = plan.graph().waves().unwrap_or_default();
                graph_waves
                    .iter()
                    .map(|wave| {
                        wave.iter()
                            .filter(|id| selected.contains(*id))
                            .filter_map(|id| plan.step(id))
                            .collect::<Vec<_>>()
                    })
                    .filter(|wave| !wave.is_empty())
                    .collect()
            }
        };

        for (index, wave) in waves.iter().enumerate() {
            debug!(wave = index, size = wave.len(), "Starting wave");
            let results = join_all(
                wave.iter()
                    .map(|step| self.run_step(plan, step, context, round, cancel)),
            )
            .await;

            for result in results {
                // skipped steps never reached their executor
                if result.status != StepStatus::Skipped {
                    executed.push(result.step_id.clone());
                }
                team_results.insert(result.step_id.clone(), result);
            }
        }

        let cancelled = cancel.is_cancelled();
        if cancelled {
            warn!(round, "Dispatch cancelled");
        }
        DispatchReport {
            team_results,
            executed,
            cancelled,
        }
    }

    async fn run_step(
        &self,
        plan: &ExecutionPlan,
        step: &ExecutionStep,
        context: &SharedContext,
        round: u32,
        cancel: &CancellationToken,
    ) -> TeamResult {
        if cancel.is_cancelled() {
            return self.finish(TeamResult::skipped(
                step.step_id.clone(),
                &step.team,
                StepError::Cancelled,
                round,
            ));
        }

        let input = match self.resolve_inputs(plan, step, context, cancel) {
            Ok(input) => input,
            Err(error) => {
                return self.finish(TeamResult::skipped(step.step_id.clone(), &step.team, error, round));
            }
        };

        let Some(executor) = self.registry.executor(&step.team) else {
            return self.finish(TeamResult::skipped(
                step.step_id.clone(),
                &step.team,
                StepError::Execution(format!("no executor registered for '{}'", step.team)),
                round,
            ));
        };

        self.progress.step(&step.step_id, StepProgress::InProgress, None);
        debug!(step_id = %step.step_id, team = %step.team, timeout_ms = step.timeout.as_millis() as u64, "Step started");

        let started = Instant::now();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(StepError::Cancelled),
            result = tokio::time::timeout(step.timeout, executor.execute(input)) => {
                result.map_err(|_| StepError::Timeout(step.timeout))
            }
        };
        let duration = started.elapsed();

        let result = match outcome {
            Ok(TeamOutcome::Success { data }) => self.publish(step, data, context, duration, round),
            Ok(TeamOutcome::Error { error }) => {
                TeamResult::failed(step.step_id.clone(), &step.team, StepError::Execution(error), duration, round)
            }
            Err(error) => TeamResult::failed(step.step_id.clone(), &step.team, error, duration, round),
        };
        self.finish(result)
    }

    /// Seeds plus required inputs; fails on a required producer that did not deliver
    fn resolve_inputs(
        &self,
        plan: &ExecutionPlan,
        step: &ExecutionStep,
        context: &SharedContext,
        cancel: &CancellationToken,
    ) -> Result<TeamInput, StepError> {
        let mut inputs = context.seed_values();
        for key in &step.required_inputs {
            match context.read(key) {
                Ok(value) => {
                    inputs.insert(key.clone(), value);
                }
                Err(_) => {
                    let producer_optional = plan
                        .steps
                        .iter()
                        .find(|s| &s.produced_output_key == key)
                        .is_some_and(|s| s.optional);
                    if !producer_optional {
                        return Err(StepError::DependencyMissing(key.clone()));
                    }
                    debug!(step_id = %step.step_id, key = %key, "Optional input absent");
                }
            }
        }
        Ok(TeamInput {
            step_id: step.step_id.clone(),
            team: step.team.clone(),
            inputs,
            cancellation: cancel.child_token(),
        })
    }

    fn publish(
        &self,
        step: &ExecutionStep,
        data: Value,
        context: &SharedContext,
        duration: Duration,
        round: u32,
    ) -> TeamResult {
        if is_empty_value(&data) {
            return TeamResult::failed(step.step_id.clone(), &step.team, StepError::EmptyOutput, duration, round);
        }
        match context.write_produced(&step.produced_output_key, data.clone(), &step.team) {
            Ok(()) => TeamResult::success(step.step_id.clone(), &step.team, data, duration, round),
            Err(e) => TeamResult::failed(
                step.step_id.clone(),
                &step.team,
                StepError::ContextWrite(e.to_string()),
                duration,
                round,
            ),
        }
    }

    /// Log and report a terminal step result
    fn finish(&self, result: TeamResult) -> TeamResult {
        let duration_ms = result.duration.as_millis() as u64;
        match (&result.status, &result.error) {
            (StepStatus::Success, _) => {
                info!(step_id = %result.step_id, team = %result.team, duration_ms, "Step completed");
                self.progress.step(&result.step_id, StepProgress::Completed, None);
            }
            (status, error) => {
                let detail = error.as_ref().map(ToString::to_string);
                warn!(
                    step_id = %result.step_id,
                    team = %result.team,
                    status = ?status,
                    error = detail.as_deref().unwrap_or("unknown"),
                    duration_ms,
                    "Step did not succeed"
                );
                self.progress.step(&result.step_id, StepProgress::Failed, detail);
            }
        }
        result
    }
}

/// Targets plus their transitive dependents, minus anything already successful
fn retry_selection(
    plan: &ExecutionPlan,
    previous: &BTreeMap<StepId, TeamResult>,
    targets: &[StepId],
) -> BTreeSet<StepId> {
    let graph = plan.graph();
    let succeeded = |id: &StepId| previous.get(id).is_some_and(|r| r.status == StepStatus::Success);

    let mut selected = BTreeSet::new();
    for target in targets.iter().filter(|t| plan.step(t).is_some()) {
        if !succeeded(target) {
            selected.insert(target.clone());
        }
        for dependent in graph.transitive_dependents(target) {
            if !succeeded(&dependent) {
                selected.insert(dependent);
            }
        }
    }
    selected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ProgressChannel, ProgressEvent};
    use crate::intent::{Intent, IntentKind};
    use crate::planner::PlanBuilder;
    use crate::registry::TeamSpec;
    use crate::session::{AttemptId, Request};
    use crate::testing::{sample_registry, ScriptedTeam};
    use serde_json::json;

    fn plan_for(registry: &CapabilityRegistry, kind: IntentKind) -> ExecutionPlan {
        PlanBuilder::default().build(&Intent::new(kind, 0.9), registry).unwrap()
    }

    fn seeded(text: &str) -> SharedContext {
        SharedContext::for_request(&Request::new(text)).unwrap()
    }

    #[tokio::test]
    async fn test_sequential_write_visible_before_dependent_starts() {
        let search = ScriptedTeam::ok(json!(["gold at 2400"]));
        let analysis = ScriptedTeam::ok(json!("bullish"));
        let registry = Arc::new(sample_registry(search.clone(), analysis.clone()));
        let plan = plan_for(&registry, IntentKind::Comprehensive);
        let ctx = seeded("gold outlook");

        let report = Dispatcher::new(Arc::clone(&registry), 25, ProgressSender::noop())
            .dispatch(&plan, &ctx, &CancellationToken::new())
            .await
            .unwrap();

        assert!(report.team_results.values().all(|r| r.status == StepStatus::Success));
        let seen = analysis.inputs();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].get("search_results"), Some(&json!(["gold at 2400"])));
        assert_eq!(seen[0].get("query"), Some(&json!("gold outlook")));
        assert_eq!(ctx.read("analysis").unwrap(), json!("bullish"));
        assert_eq!(report.executed, vec![StepId::new("search"), StepId::new("analysis")]);
    }

    #[tokio::test]
    async fn test_failed_producer_skips_dependent() {
        let search = ScriptedTeam::failing("upstream down");
        let analysis = ScriptedTeam::ok(json!("bullish"));
        let registry = Arc::new(sample_registry(search, analysis.clone()));
        let plan = plan_for(&registry, IntentKind::Comprehensive);
        let ctx = seeded("gold outlook");

        let report = Dispatcher::new(Arc::clone(&registry), 25, ProgressSender::noop())
            .dispatch(&plan, &ctx, &CancellationToken::new())
            .await
            .unwrap();

        let search = &report.team_results[&StepId::new("search")];
        assert_eq!(search.status, StepStatus::Failed);
        assert_eq!(search.error, Some(StepError::Execution("upstream down".into())));
        let analysis_result = &report.team_results[&StepId::new("analysis")];
        assert_eq!(analysis_result.status, StepStatus::Skipped);
        assert_eq!(
            analysis_result.error,
            Some(StepError::DependencyMissing("search_results".into()))
        );
        assert_eq!(analysis.calls(), 0);
    }

    #[tokio::test]
    async fn test_optional_producer_failure_does_not_skip_dependent() {
        let registry = Arc::new(
            CapabilityRegistry::builder()
                .team(
                    TeamSpec::new("news", "news").requires("query").optional(),
                    ScriptedTeam::failing("no feed"),
                )
                .team(TeamSpec::new("summary", "summary").requires("news"), ScriptedTeam::ok("short"))
                .route(IntentKind::Search, ["news", "summary"])
                .build()
                .unwrap(),
        );
        let plan = plan_for(&registry, IntentKind::Search);

        let report = Dispatcher::new(Arc::clone(&registry), 25, ProgressSender::noop())
            .dispatch(&plan, &seeded("headlines"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.team_results[&StepId::new("summary")].status, StepStatus::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fails_only_that_step() {
        let registry = Arc::new(
            CapabilityRegistry::builder()
                .team(
                    TeamSpec::new("slow", "slow").with_timeout(Duration::from_secs(1)),
                    ScriptedTeam::ok("late").with_delay(Duration::from_secs(5)),
                )
                .team(TeamSpec::new("fast", "fast"), ScriptedTeam::ok("quick"))
                .route(IntentKind::Search, ["slow", "fast"])
                .build()
                .unwrap(),
        );
        let plan = plan_for(&registry, IntentKind::Search);
        assert_eq!(plan.strategy, Strategy::Parallel);

        let report = Dispatcher::new(Arc::clone(&registry), 25, ProgressSender::noop())
            .dispatch(&plan, &seeded("q"), &CancellationToken::new())
            .await
            .unwrap();

        let slow = &report.team_results[&StepId::new("slow")];
        assert_eq!(slow.error, Some(StepError::Timeout(Duration::from_secs(1))));
        assert_eq!(report.team_results[&StepId::new("fast")].status, StepStatus::Success);
    }

    #[tokio::test]
    async fn test_empty_output_is_a_failure() {
        let registry = Arc::new(sample_registry(ScriptedTeam::ok(json!([])), ScriptedTeam::ok("x")));
        let plan = plan_for(&registry, IntentKind::PriceLookup);
        let ctx = seeded("gold");

        let report = Dispatcher::new(Arc::clone(&registry), 25, ProgressSender::noop())
            .dispatch(&plan, &ctx, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.team_results[&StepId::new("search")].error, Some(StepError::EmptyOutput));
        assert!(!ctx.contains("search_results"));
    }

    #[tokio::test]
    async fn test_dag_fan_in_runs_in_waves() {
        let analysis = ScriptedTeam::ok("combined");
        let registry = Arc::new(
            CapabilityRegistry::builder()
                .team(TeamSpec::new("search", "search_results").requires("query"), ScriptedTeam::ok("s"))
                .team(TeamSpec::new("pricing", "prices").requires("query"), ScriptedTeam::ok("p"))
                .team(
                    TeamSpec::new("analysis", "analysis").requires("search_results").requires("prices"),
                    analysis.clone(),
                )
                .route(IntentKind::Comprehensive, ["search", "pricing", "analysis"])
                .build()
                .unwrap(),
        );
        let plan = plan_for(&registry, IntentKind::Comprehensive);
        assert_eq!(plan.strategy, Strategy::Dag);

        let report = Dispatcher::new(Arc::clone(&registry), 25, ProgressSender::noop())
            .dispatch(&plan, &seeded("q"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.executed.last(), Some(&StepId::new("analysis")));
        let seen = analysis.inputs();
        assert_eq!(seen[0].get("prices"), Some(&json!("p")));
        assert_eq!(seen[0].get("search_results"), Some(&json!("s")));
    }

    #[tokio::test]
    async fn test_redispatch_skips_successful_steps() {
        let search = ScriptedTeam::sequence(vec![
            TeamOutcome::error("flaky"),
            TeamOutcome::success(json!(["hit"])),
        ]);
        let analysis = ScriptedTeam::ok("insight");
        let registry = Arc::new(sample_registry(search.clone(), analysis.clone()));
        let plan = plan_for(&registry, IntentKind::Comprehensive);
        let ctx = seeded("q");
        let dispatcher = Dispatcher::new(Arc::clone(&registry), 25, ProgressSender::noop());
        let cancel = CancellationToken::new();

        let first = dispatcher.dispatch(&plan, &ctx, &cancel).await.unwrap();
        let second = dispatcher
            .redispatch(&plan, &ctx, &first.team_results, &[StepId::new("search")], 1, &cancel)
            .await
            .unwrap();

        assert_eq!(search.calls(), 2);
        assert_eq!(analysis.calls(), 1);
        assert!(second.team_results.values().all(|r| r.status == StepStatus::Success));
        assert_eq!(second.team_results[&StepId::new("search")].round, 1);

        let third = dispatcher
            .redispatch(&plan, &ctx, &second.team_results, &[StepId::new("search")], 2, &cancel)
            .await
            .unwrap();
        assert!(third.executed.is_empty());
        assert_eq!(search.calls(), 2);
    }

    #[tokio::test]
    async fn test_cancellation_aborts_in_flight_steps() {
        let registry = Arc::new(sample_registry(
            ScriptedTeam::ok("late").with_delay(Duration::from_secs(10)),
            ScriptedTeam::ok("x"),
        ));
        let plan = plan_for(&registry, IntentKind::Comprehensive);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let report = Dispatcher::new(Arc::clone(&registry), 25, ProgressSender::noop())
            .dispatch(&plan, &seeded("q"), &cancel)
            .await
            .unwrap();

        assert!(report.cancelled);
        assert_eq!(report.team_results[&StepId::new("search")].error, Some(StepError::Cancelled));
        assert_eq!(report.team_results[&StepId::new("analysis")].error, Some(StepError::Cancelled));
    }

    #[tokio::test]
    async fn test_step_ceiling_enforced() {
        let registry = Arc::new(sample_registry(ScriptedTeam::ok("a"), ScriptedTeam::ok("b")));
        let plan = plan_for(&registry, IntentKind::Comprehensive);

        let result = Dispatcher::new(Arc::clone(&registry), 1, ProgressSender::noop())
            .dispatch(&plan, &seeded("q"), &CancellationToken::new())
            .await;

        assert!(matches!(
            result,
            Err(OrchestratorError::PlanValidation(PlanValidationError::TooManySteps { .. }))
        ));
    }

    #[tokio::test]
    async fn test_progress_events_per_step() {
        let registry = Arc::new(sample_registry(ScriptedTeam::ok("a"), ScriptedTeam::ok("b")));
        let plan = plan_for(&registry, IntentKind::PriceLookup);
        let (mut channel, pair) = ProgressChannel::new();

        Dispatcher::new(Arc::clone(&registry), 25, pair.event_tx)
            .dispatch(&plan, &SharedContext::new(AttemptId::new()), &CancellationToken::new())
            .await
            .unwrap();

        let statuses: Vec<StepProgress> = channel
            .drain()
            .into_iter()
            .filter_map(|e| match e {
                ProgressEvent::StepUpdate { status, .. } => Some(status),
                _ => None,
            })
            .collect();
        // no query seeded, so search cannot start
        assert_eq!(statuses, vec![StepProgress::Pending, StepProgress::Failed]);
    }
}
