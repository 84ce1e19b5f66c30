//! Main orchestrator - drives one request through the lifecycle
//!
//! classify → plan → dispatch → evaluate (→ retry) → synthesize, with a
//! checkpoint after every state transition when a store is configured.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::channel::{ChannelPair, ControlMessage, ProgressEvent, ProgressSender};
use crate::checkpoint::{Checkpoint, CheckpointError, CheckpointStore};
use crate::config::OrchestratorConfig;
use crate::context::SharedContext;
use crate::dispatcher::Dispatcher;
use crate::error::OrchestratorError;
use crate::evaluator::{Evaluation, QualityEvaluator, RetryController};
use crate::intent::{HeuristicClassifier, Intent, IntentClassifier};
use crate::planner::{ExecutionPlan, PlanBuilder, StepId};
use crate::reasoning::ReasoningService;
use crate::registry::CapabilityRegistry;
use crate::session::{AttemptId, OrchestrationState, Request, Session, SessionId};
use crate::synthesizer::{FinalResponse, ResponseSynthesizer};
use crate::team::{StepStatus, TeamResult};

/// What a finished request looks like
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub response: FinalResponse,
    pub state: OrchestrationState,
    pub intent: Intent,
    pub plan: ExecutionPlan,
    /// `None` when the dispatcher was bypassed
    pub evaluation: Option<Evaluation>,
    pub team_results: BTreeMap<StepId, TeamResult>,
    pub history: Vec<OrchestrationState>,
}

/// Per-attempt working state
struct Attempt {
    session: Session,
    context: SharedContext,
    intent: Option<Intent>,
    plan: Option<ExecutionPlan>,
    team_results: BTreeMap<StepId, TeamResult>,
    retry: RetryController,
    evaluation: Option<Evaluation>,
    response: Option<FinalResponse>,
}

impl Attempt {
    fn new(request: Request, max_retries: u32) -> Result<Self, OrchestratorError> {
        let context = SharedContext::for_request(&request)?;
        Ok(Self {
            session: Session::new(request),
            context,
            intent: None,
            plan: None,
            team_results: BTreeMap::new(),
            retry: RetryController::new(max_retries),
            evaluation: None,
            response: None,
        })
    }

    fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            request: self.session.request.clone(),
            state: self.session.state(),
            intent: self.intent.clone(),
            plan: self.plan.clone(),
            context: self.context.snapshot(),
            team_results: self.team_results.clone(),
            attempt_count: self.retry.attempt_count(),
            response: self.response.clone(),
        }
    }
}

/// The orchestration engine
///
/// Holds only immutable collaborators, so one instance serves any number of
/// concurrent requests.
pub struct Orchestrator {
    config: OrchestratorConfig,
    registry: Arc<CapabilityRegistry>,
    classifier: IntentClassifier,
    planner: PlanBuilder,
    evaluator: QualityEvaluator,
    synthesizer: ResponseSynthesizer,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        registry: Arc<CapabilityRegistry>,
        reasoning: Option<Arc<dyn ReasoningService>>,
    ) -> Result<Self, OrchestratorError> {
        config.validate()?;
        let backoff = config.backoff_policy();
        let heuristic = config.heuristic_fallback.then(HeuristicClassifier::default);

        info!(
            teams = registry.len(),
            max_retries = config.max_retries,
            reasoning = reasoning.is_some(),
            "Creating orchestrator"
        );
        Ok(Self {
            classifier: IntentClassifier::new(reasoning.clone(), backoff, heuristic),
            planner: config.plan_builder(),
            evaluator: QualityEvaluator::new(config.max_retries),
            synthesizer: ResponseSynthesizer::new(reasoning, backoff),
            checkpoints: None,
            registry,
            config,
        })
    }

    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    /// Handle one request end to end
    #[instrument(skip_all, fields(session_id = %request.session_id, attempt_id = %request.attempt_id))]
    pub async fn run(
        &self,
        request: Request,
        progress: &ProgressSender,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, OrchestratorError> {
        info!(text_len = request.text.len(), "Orchestrating request");
        let mut attempt = Attempt::new(request, self.config.max_retries)?;
        self.advance(&attempt, OrchestrationState::Planning).await?;

        let classified = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(OrchestratorError::Cancelled),
            result = self.classifier.classify(&attempt.session.request.text) => result,
        };
        let intent = match classified {
            Ok(intent) => intent,
            Err(e) => return Err(self.fail(&attempt, progress, e).await),
        };
        attempt.intent = Some(intent.clone());

        let seeds = attempt.session.request.seed_keys();
        let plan = match self.planner.build_with_inputs(&intent, &self.registry, &seeds) {
            Ok(plan) => plan,
            Err(e) => return Err(self.fail(&attempt, progress, e.into()).await),
        };
        attempt.plan = Some(plan.clone());

        if plan.is_empty() {
            info!(intent = %intent.kind, confidence = intent.confidence, "No plan, answering with guidance");
            self.advance(&attempt, OrchestrationState::Synthesizing).await?;
            let response = self.synthesizer.guidance(&attempt.session.request, &intent).await;
            return self.complete(attempt, response, progress).await;
        }

        progress.emit(ProgressEvent::PlanReady {
            steps: plan.steps.clone(),
            strategy: plan.strategy,
            estimated_time_ms: plan.estimated_time.as_millis() as u64,
        });
        self.execute(attempt, progress, &cancel, None).await
    }

    /// Run a request with control messages read from the channel pair.
    ///
    /// `Cancel` cancels the request. Plan approval and rejection are recorded
    /// but do not gate dispatch.
    pub async fn run_with_channel(
        &self,
        request: Request,
        channels: ChannelPair,
    ) -> Result<RunOutcome, OrchestratorError> {
        let ChannelPair {
            mut control_rx,
            event_tx,
        } = channels;
        let session_id = request.session_id;
        let stop = CancellationToken::new();
        let cancel = stop.child_token();
        let request_cancel = cancel.clone();
        let watcher_stop = stop.clone();

        let watcher = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = watcher_stop.cancelled() => break,
                    message = control_rx.recv() => match message {
                        Some(ControlMessage::Cancel) => {
                            info!(session_id = %session_id, "Cancel requested by client");
                            request_cancel.cancel();
                            break;
                        }
                        Some(ControlMessage::ApprovePlan) => {
                            info!(session_id = %session_id, "Plan approved by client");
                        }
                        Some(ControlMessage::RejectPlan { reason }) => {
                            info!(
                                session_id = %session_id,
                                reason = reason.as_deref().unwrap_or("none given"),
                                "Plan rejected by client"
                            );
                        }
                        None => break,
                    },
                }
            }
        });

        let outcome = self.run(request, &event_tx, cancel).await;
        stop.cancel();
        if let Err(e) = watcher.await {
            warn!(error = %e, "Control watcher ended abnormally");
        }
        outcome
    }

    /// Continue a checkpointed session.
    ///
    /// Successful steps are never re-run; their outputs come back from the
    /// context snapshot.
    #[instrument(skip(self, progress, cancel))]
    pub async fn resume(
        &self,
        session_id: SessionId,
        progress: &ProgressSender,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, OrchestratorError> {
        let store = self
            .checkpoints
            .as_ref()
            .ok_or_else(|| OrchestratorError::Config("no checkpoint store configured".into()))?;
        let checkpoint = store
            .load(session_id)
            .await?
            .ok_or(CheckpointError::NotFound(session_id))?;

        info!(state = %checkpoint.state, attempt_count = checkpoint.attempt_count, "Resuming session");

        match (checkpoint.state, checkpoint.response, checkpoint.plan, checkpoint.intent) {
            (OrchestrationState::Completed, Some(response), plan, intent) => Ok(RunOutcome {
                response,
                state: OrchestrationState::Completed,
                intent: intent.unwrap_or_else(Intent::unclear),
                plan: plan.unwrap_or_else(ExecutionPlan::empty),
                evaluation: None,
                team_results: checkpoint.team_results,
                history: vec![OrchestrationState::Completed],
            }),
            (state, _, Some(plan), Some(intent)) if !state.is_terminal() && !plan.is_empty() => {
                self.planner.validate(&plan, &self.registry)?;
                let request = checkpoint.request;
                let context = SharedContext::restore(request.attempt_id, checkpoint.context);
                // a dispatched round is only evaluated; earlier states finish
                // the unfinished steps of the round already counted
                let entry = match state {
                    OrchestrationState::Synthesizing | OrchestrationState::Evaluating => state,
                    _ => OrchestrationState::Retrying,
                };
                let attempt = Attempt {
                    session: Session::resumed(request, entry),
                    context,
                    intent: Some(intent),
                    plan: Some(plan.clone()),
                    team_results: checkpoint.team_results,
                    retry: RetryController::resumed(self.config.max_retries, checkpoint.attempt_count),
                    evaluation: None,
                    response: None,
                };

                match entry {
                    OrchestrationState::Synthesizing => self.synthesize(attempt, progress, &cancel).await,
                    OrchestrationState::Evaluating => {
                        let dispatcher =
                            Dispatcher::new(Arc::clone(&self.registry), self.config.max_steps, progress.clone());
                        self.evaluate_and_retry(attempt, &plan, &dispatcher, progress, &cancel)
                            .await
                    }
                    _ => {
                        let unfinished = unfinished_steps(&attempt);
                        self.execute(attempt, progress, &cancel, Some(unfinished)).await
                    }
                }
            }
            _ => {
                // nothing reusable; start a fresh attempt in the same session
                let mut request = checkpoint.request;
                request.attempt_id = AttemptId::new();
                self.run(request, progress, cancel).await
            }
        }
    }

    /// Dispatch, then evaluate and retry until complete or out of budget
    async fn execute(
        &self,
        mut attempt: Attempt,
        progress: &ProgressSender,
        cancel: &CancellationToken,
        targets: Option<Vec<StepId>>,
    ) -> Result<RunOutcome, OrchestratorError> {
        let plan = attempt.plan.clone().unwrap_or_else(ExecutionPlan::empty);
        let dispatcher = Dispatcher::new(Arc::clone(&self.registry), self.config.max_steps, progress.clone());

        self.advance(&attempt, OrchestrationState::Executing).await?;
        let dispatched = match &targets {
            None => dispatcher.dispatch(&plan, &attempt.context, cancel).await,
            Some(targets) => {
                dispatcher
                    .redispatch(
                        &plan,
                        &attempt.context,
                        &attempt.team_results,
                        targets,
                        attempt.retry.attempt_count(),
                        cancel,
                    )
                    .await
            }
        };
        let report = match dispatched {
            Ok(report) => report,
            Err(e) => return Err(self.fail(&attempt, progress, e).await),
        };
        attempt.team_results = report.team_results;
        if report.cancelled {
            return Err(self.fail(&attempt, progress, OrchestratorError::Cancelled).await);
        }
        self.advance(&attempt, OrchestrationState::Evaluating).await?;

        self.evaluate_and_retry(attempt, &plan, &dispatcher, progress, cancel)
            .await
    }

    /// From `Evaluating`: retry while the budget allows, then synthesize
    async fn evaluate_and_retry(
        &self,
        mut attempt: Attempt,
        plan: &ExecutionPlan,
        dispatcher: &Dispatcher,
        progress: &ProgressSender,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, OrchestratorError> {
        loop {
            let evaluation = self
                .evaluator
                .evaluate(plan, &attempt.team_results, attempt.retry.attempt_count());
            attempt.evaluation = Some(evaluation.clone());

            let Some(targets) = attempt.retry.begin_retry(&evaluation) else {
                break;
            };
            self.advance(&attempt, OrchestrationState::Retrying).await?;
            self.advance(&attempt, OrchestrationState::Executing).await?;

            let report = match dispatcher
                .redispatch(
                    plan,
                    &attempt.context,
                    &attempt.team_results,
                    &targets,
                    attempt.retry.attempt_count(),
                    cancel,
                )
                .await
            {
                Ok(report) => report,
                Err(e) => return Err(self.fail(&attempt, progress, e).await),
            };
            attempt.team_results = report.team_results;
            if report.cancelled {
                return Err(self.fail(&attempt, progress, OrchestratorError::Cancelled).await);
            }
            self.advance(&attempt, OrchestrationState::Evaluating).await?;
        }

        self.advance(&attempt, OrchestrationState::Synthesizing).await?;
        self.synthesize(attempt, progress, cancel).await
    }

    async fn synthesize(
        &self,
        attempt: Attempt,
        progress: &ProgressSender,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, OrchestratorError> {
        let evaluation = match &attempt.evaluation {
            Some(evaluation) => evaluation.clone(),
            None => match &attempt.plan {
                Some(plan) => self
                    .evaluator
                    .evaluate(plan, &attempt.team_results, attempt.retry.attempt_count()),
                None => Evaluation::nothing_to_do(),
            },
        };

        let synthesized = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            response = self.synthesizer.synthesize(&attempt.session.request, &attempt.context, &evaluation) => Some(response),
        };
        let Some(response) = synthesized else {
            return Err(self.fail(&attempt, progress, OrchestratorError::Cancelled).await);
        };

        let mut attempt = attempt;
        attempt.evaluation = Some(evaluation);
        self.complete(attempt, response, progress).await
    }

    async fn complete(
        &self,
        mut attempt: Attempt,
        response: FinalResponse,
        progress: &ProgressSender,
    ) -> Result<RunOutcome, OrchestratorError> {
        attempt.response = Some(response.clone());
        self.advance(&attempt, OrchestrationState::Completed).await?;

        info!(
            mode = ?response.mode,
            degraded = response.degraded,
            sources = response.sources_used.len(),
            attempts = attempt.retry.attempt_count(),
            "Request completed"
        );
        progress.emit(ProgressEvent::Complete {
            final_response: response.clone(),
        });

        Ok(RunOutcome {
            response,
            state: attempt.session.state(),
            intent: attempt.intent.unwrap_or_else(Intent::unclear),
            plan: attempt.plan.unwrap_or_else(ExecutionPlan::empty),
            evaluation: attempt.evaluation,
            team_results: attempt.team_results,
            history: attempt.session.history(),
        })
    }

    /// Transition and checkpoint
    async fn advance(&self, attempt: &Attempt, next: OrchestrationState) -> Result<(), OrchestratorError> {
        attempt.session.transition(next)?;
        self.save(attempt).await;
        Ok(())
    }

    /// Move to `Failed`, tell the client, and hand the error back
    async fn fail(&self, attempt: &Attempt, progress: &ProgressSender, error: OrchestratorError) -> OrchestratorError {
        error!(
            session_id = %attempt.session.request.session_id,
            state = %attempt.session.state(),
            error = %error,
            "Request failed"
        );
        if let Err(e) = attempt.session.transition(OrchestrationState::Failed) {
            debug!(error = %e, "Session already terminal");
        }
        self.save(attempt).await;
        progress.emit(ProgressEvent::Error {
            message: error.to_string(),
        });
        error
    }

    async fn save(&self, attempt: &Attempt) {
        let Some(store) = &self.checkpoints else {
            return;
        };
        let session_id = attempt.session.request.session_id;
        if let Err(e) = store.save(session_id, &attempt.checkpoint()).await {
            warn!(session_id = %session_id, error = %e, "Checkpoint save failed");
        }
    }
}

fn unfinished_steps(attempt: &Attempt) -> Vec<StepId> {
    attempt
        .plan
        .iter()
        .flat_map(|plan| plan.steps.iter())
        .filter(|step| {
            attempt
                .team_results
                .get(&step.step_id)
                .map_or(true, |r| r.status != StepStatus::Success)
        })
        .map(|step| step.step_id.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ProgressChannel, StepProgress};
    use crate::checkpoint::InMemoryCheckpointStore;
    use crate::intent::IntentKind;
    use crate::planner::Strategy;
    use crate::reasoning::{ReasoningOutput, INTENT_TEMPLATE};
    use crate::synthesizer::ResponseMode;
    use crate::team::{StepError, TeamOutcome};
    use crate::testing::{init_tracing, sample_registry, ScriptedReasoning, ScriptedTeam};
    use serde_json::json;
    use std::time::Duration;

    fn config() -> OrchestratorConfig {
        OrchestratorConfig {
            reasoning_backoff_ms: 0,
            reasoning_max_attempts: 1,
            ..OrchestratorConfig::default()
        }
    }

    fn classifying(kind: &str, confidence: f64) -> Arc<ScriptedReasoning> {
        let reasoning = Arc::new(ScriptedReasoning::new());
        reasoning.push(
            INTENT_TEMPLATE,
            Ok(ReasoningOutput::Json(json!({"intent": kind, "confidence": confidence}))),
        );
        reasoning
    }

    fn orchestrator(
        search: Arc<ScriptedTeam>,
        analysis: Arc<ScriptedTeam>,
        reasoning: Arc<ScriptedReasoning>,
    ) -> Orchestrator {
        init_tracing();
        let registry = Arc::new(sample_registry(search, analysis));
        Orchestrator::new(config(), registry, Some(reasoning)).unwrap()
    }

    #[tokio::test]
    async fn test_price_lookup_single_round() {
        let search = ScriptedTeam::ok(json!(["gold at 2400"]));
        let orchestrator = orchestrator(search.clone(), ScriptedTeam::ok("x"), classifying("price_lookup", 0.9));

        let outcome = orchestrator
            .run(Request::new("price of gold"), &ProgressSender::noop(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.plan.teams(), vec!["search"]);
        assert_eq!(outcome.plan.strategy, Strategy::Sequential);
        assert_eq!(outcome.evaluation.as_ref().unwrap().attempt_count, 0);
        assert_eq!(outcome.response.mode, ResponseMode::Full);
        assert_eq!(outcome.response.sources_used, vec!["search".to_string()]);
        assert_eq!(outcome.state, OrchestrationState::Completed);
        assert_eq!(search.calls(), 1);
    }

    #[tokio::test]
    async fn test_comprehensive_retries_only_failed_producer() {
        let search = ScriptedTeam::sequence(vec![
            TeamOutcome::error("rate limited"),
            TeamOutcome::success(json!(["gold at 2400"])),
        ]);
        let analysis = ScriptedTeam::ok("steady demand");
        let orchestrator = orchestrator(search.clone(), analysis.clone(), classifying("comprehensive", 0.9));

        let outcome = orchestrator
            .run(Request::new("gold outlook"), &ProgressSender::noop(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(search.calls(), 2);
        assert_eq!(analysis.calls(), 1);
        let evaluation = outcome.evaluation.unwrap();
        assert!(evaluation.complete);
        assert_eq!(evaluation.attempt_count, 1);
        assert!(!outcome.response.degraded);
        assert_eq!(
            outcome.history,
            vec![
                OrchestrationState::Initialized,
                OrchestrationState::Planning,
                OrchestrationState::Executing,
                OrchestrationState::Evaluating,
                OrchestrationState::Retrying,
                OrchestrationState::Executing,
                OrchestrationState::Evaluating,
                OrchestrationState::Synthesizing,
                OrchestrationState::Completed,
            ]
        );
    }

    #[tokio::test]
    async fn test_low_confidence_bypasses_dispatch() {
        let search = ScriptedTeam::ok("x");
        let orchestrator = orchestrator(search.clone(), ScriptedTeam::ok("y"), classifying("search", 0.2));
        let (mut channel, pair) = ProgressChannel::new();

        let outcome = orchestrator
            .run(Request::new("hmm"), &pair.event_tx, CancellationToken::new())
            .await
            .unwrap();

        assert!(outcome.plan.is_empty());
        assert!(outcome.evaluation.is_none());
        assert_eq!(outcome.response.mode, ResponseMode::Guidance);
        assert_eq!(search.calls(), 0);
        let events = channel.drain();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ProgressEvent::Complete { .. }));
    }

    #[tokio::test]
    async fn test_exhausted_retries_complete_degraded() {
        let search = ScriptedTeam::failing("down");
        let analysis = ScriptedTeam::ok("never");
        let orchestrator = orchestrator(search.clone(), analysis.clone(), classifying("comprehensive", 0.9));

        let outcome = orchestrator
            .run(Request::new("gold outlook"), &ProgressSender::noop(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.state, OrchestrationState::Completed);
        assert!(outcome.response.degraded);
        assert_eq!(outcome.response.mode, ResponseMode::Degraded);
        assert_eq!(outcome.response.missing.len(), 2);
        assert!(outcome.response.answer.contains("could not be obtained"));
        assert_eq!(search.calls(), 3);
        assert_eq!(analysis.calls(), 0);
        assert_eq!(outcome.evaluation.unwrap().attempt_count, 2);
    }

    #[tokio::test]
    async fn test_progress_stream_for_a_run() {
        let orchestrator = orchestrator(ScriptedTeam::ok("hits"), ScriptedTeam::ok("y"), classifying("price_lookup", 0.9));
        let (mut channel, pair) = ProgressChannel::new();

        orchestrator
            .run(Request::new("price of gold"), &pair.event_tx, CancellationToken::new())
            .await
            .unwrap();

        let events = channel.drain();
        assert!(matches!(events.first(), Some(ProgressEvent::PlanReady { .. })));
        assert!(events.iter().any(|e| matches!(
            e,
            ProgressEvent::StepUpdate { status: StepProgress::Completed, .. }
        )));
        assert!(matches!(events.last(), Some(ProgressEvent::Complete { .. })));
    }

    #[tokio::test]
    async fn test_plan_validation_failure_fails_request() {
        let registry = Arc::new(
            CapabilityRegistry::builder()
                .team(
                    crate::registry::TeamSpec::new("search", "search_results").disabled(),
                    ScriptedTeam::ok("x"),
                )
                .route(IntentKind::PriceLookup, ["search"])
                .build()
                .unwrap(),
        );
        let orchestrator = Orchestrator::new(config(), registry, Some(classifying("price_lookup", 0.9))).unwrap();
        let (mut channel, pair) = ProgressChannel::new();

        let err = orchestrator
            .run(Request::new("price of gold"), &pair.event_tx, CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, OrchestratorError::PlanValidation(_)));
        assert!(matches!(channel.drain().last(), Some(ProgressEvent::Error { .. })));
    }

    #[tokio::test]
    async fn test_cancel_message_fails_request() {
        let search = ScriptedTeam::ok("late").with_delay(Duration::from_secs(30));
        let orchestrator = orchestrator(search, ScriptedTeam::ok("y"), classifying("price_lookup", 0.9));
        let store = Arc::new(InMemoryCheckpointStore::new());
        let orchestrator = orchestrator.with_checkpoint_store(store.clone());
        let (mut channel, pair) = ProgressChannel::new();
        let request = Request::new("price of gold");
        let session_id = request.session_id;

        channel.send(ControlMessage::ApprovePlan).unwrap();
        let control = channel.control_sender();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = control.send(ControlMessage::Cancel);
        });

        let err = orchestrator.run_with_channel(request, pair).await.unwrap_err();

        assert!(matches!(err, OrchestratorError::Cancelled));
        let checkpoint = store.load(session_id).await.unwrap().unwrap();
        assert_eq!(checkpoint.state, OrchestrationState::Failed);
        assert!(channel
            .drain()
            .iter()
            .any(|e| matches!(e, ProgressEvent::Error { .. })));
    }

    #[tokio::test]
    async fn test_resume_skips_successful_steps() {
        let search = ScriptedTeam::ok(json!(["gold at 2400"]));
        let analysis = ScriptedTeam::ok("steady");
        let store = Arc::new(InMemoryCheckpointStore::new());
        let orchestrator = orchestrator(search.clone(), analysis.clone(), classifying("comprehensive", 0.9))
            .with_checkpoint_store(store.clone());

        // checkpoint as if the process died after search finished
        let request = Request::new("gold outlook");
        let session_id = request.session_id;
        let plan = orchestrator
            .planner
            .build(&Intent::new(IntentKind::Comprehensive, 0.9), &orchestrator.registry)
            .unwrap();
        let context = SharedContext::for_request(&request).unwrap();
        context
            .write_produced("search_results", json!(["gold at 2400"]), "search")
            .unwrap();
        let mut checkpoint = Checkpoint::new(request, OrchestrationState::Executing);
        checkpoint.intent = Some(Intent::new(IntentKind::Comprehensive, 0.9));
        checkpoint.plan = Some(plan);
        checkpoint.context = context.snapshot();
        checkpoint.team_results.insert(
            StepId::new("search"),
            TeamResult::success(StepId::new("search"), "search", json!(["gold at 2400"]), Duration::ZERO, 0),
        );
        store.save(session_id, &checkpoint).await.unwrap();

        let outcome = orchestrator
            .resume(session_id, &ProgressSender::noop(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(search.calls(), 0);
        assert_eq!(analysis.calls(), 1);
        assert!(!outcome.response.degraded);
        assert_eq!(
            analysis.inputs()[0].get("search_results"),
            Some(&json!(["gold at 2400"]))
        );

        // a completed session resumes to its stored answer
        let again = orchestrator
            .resume(session_id, &ProgressSender::noop(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(again.response, outcome.response);
        assert_eq!(analysis.calls(), 1);
    }

    /// Checkpoint taken right after a dispatch round in which search failed
    async fn save_evaluating_checkpoint(
        orchestrator: &Orchestrator,
        store: &InMemoryCheckpointStore,
        attempt_count: u32,
    ) -> SessionId {
        let request = Request::new("gold outlook");
        let session_id = request.session_id;
        let plan = orchestrator
            .planner
            .build(&Intent::new(IntentKind::Comprehensive, 0.9), &orchestrator.registry)
            .unwrap();
        let context = SharedContext::for_request(&request).unwrap();

        let mut checkpoint = Checkpoint::new(request, OrchestrationState::Evaluating);
        checkpoint.intent = Some(Intent::new(IntentKind::Comprehensive, 0.9));
        checkpoint.plan = Some(plan);
        checkpoint.context = context.snapshot();
        checkpoint.attempt_count = attempt_count;
        checkpoint.team_results.insert(
            StepId::new("search"),
            TeamResult::failed(
                StepId::new("search"),
                "search",
                StepError::Execution("rate limited".into()),
                Duration::ZERO,
                attempt_count,
            ),
        );
        checkpoint.team_results.insert(
            StepId::new("analysis"),
            TeamResult::skipped(
                StepId::new("analysis"),
                "analysis",
                StepError::DependencyMissing("search_results".into()),
                attempt_count,
            ),
        );
        store.save(session_id, &checkpoint).await.unwrap();
        session_id
    }

    #[tokio::test]
    async fn test_resume_with_exhausted_budget_does_not_redispatch() {
        let search = ScriptedTeam::ok(json!(["gold at 2400"]));
        let analysis = ScriptedTeam::ok("steady");
        let store = Arc::new(InMemoryCheckpointStore::new());
        let orchestrator = orchestrator(search.clone(), analysis.clone(), classifying("comprehensive", 0.9))
            .with_checkpoint_store(store.clone());
        let session_id = save_evaluating_checkpoint(&orchestrator, &store, 2).await;

        let outcome = orchestrator
            .resume(session_id, &ProgressSender::noop(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(search.calls(), 0);
        assert_eq!(analysis.calls(), 0);
        assert!(outcome.response.degraded);
        assert_eq!(outcome.evaluation.unwrap().attempt_count, 2);
        assert_eq!(
            outcome.history,
            vec![
                OrchestrationState::Evaluating,
                OrchestrationState::Synthesizing,
                OrchestrationState::Completed,
            ]
        );
    }

    #[tokio::test]
    async fn test_resume_from_evaluating_spends_remaining_budget() {
        let search = ScriptedTeam::ok(json!(["gold at 2400"]));
        let analysis = ScriptedTeam::ok("steady");
        let store = Arc::new(InMemoryCheckpointStore::new());
        let orchestrator = orchestrator(search.clone(), analysis.clone(), classifying("comprehensive", 0.9))
            .with_checkpoint_store(store.clone());
        let session_id = save_evaluating_checkpoint(&orchestrator, &store, 1).await;

        let outcome = orchestrator
            .resume(session_id, &ProgressSender::noop(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(search.calls(), 1);
        assert_eq!(analysis.calls(), 1);
        assert!(!outcome.response.degraded);
        assert_eq!(outcome.evaluation.unwrap().attempt_count, 2);
        assert_eq!(outcome.history[0], OrchestrationState::Evaluating);
        assert_eq!(outcome.history[1], OrchestrationState::Retrying);
    }

    #[tokio::test]
    async fn test_resume_without_checkpoint() {
        let orchestrator = orchestrator(ScriptedTeam::ok("x"), ScriptedTeam::ok("y"), classifying("search", 0.9))
            .with_checkpoint_store(Arc::new(InMemoryCheckpointStore::new()));

        let err = orchestrator
            .resume(SessionId::new(), &ProgressSender::noop(), CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, OrchestratorError::Checkpoint(CheckpointError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_heuristic_fallback_when_reasoning_is_down() {
        let search = ScriptedTeam::ok(json!({"price": 2400}));
        let reasoning = Arc::new(ScriptedReasoning::new());
        let orchestrator = orchestrator(search.clone(), ScriptedTeam::ok("y"), reasoning);

        let outcome = orchestrator
            .run(Request::new("what is the price of gold"), &ProgressSender::noop(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.intent.kind, IntentKind::PriceLookup);
        assert_eq!(search.calls(), 1);
        assert!(outcome.response.answer.contains("search results"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_errors_recorded_as_data() {
        let search = ScriptedTeam::ok("late").with_delay(Duration::from_secs(60));
        let registry = Arc::new(sample_registry(search, ScriptedTeam::ok("y")));
        let orchestrator = Orchestrator::new(
            OrchestratorConfig {
                step_timeout_secs: 1,
                max_retries: 0,
                ..config()
            },
            registry,
            Some(classifying("price_lookup", 0.9)),
        )
        .unwrap();

        let outcome = orchestrator
            .run(Request::new("price of gold"), &ProgressSender::noop(), CancellationToken::new())
            .await
            .unwrap();

        let result = &outcome.team_results[&StepId::new("search")];
        assert_eq!(result.error, Some(StepError::Timeout(Duration::from_secs(1))));
        assert!(outcome.response.degraded);
    }
}
