//! # Conclave
//!
//! Intent-driven orchestration of capability teams.
//!
//! A request is classified, turned into a dependency-aware plan over the
//! registered teams, dispatched against a write-once shared context, checked
//! for completeness with bounded retries, and finally synthesized into one
//! answer.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                            ORCHESTRATOR                              │
//! │  ┌────────────┐   ┌─────────────┐   ┌────────────┐   ┌────────────┐  │
//! │  │  Intent    │──▶│ Plan Builder│──▶│ Dispatcher │──▶│ Evaluator  │  │
//! │  │ Classifier │   │  (registry) │   │ seq/par/dag│   │  + Retry   │  │
//! │  └────────────┘   └─────────────┘   └─────┬──────┘   └─────┬──────┘  │
//! │                                           │   retry targets│         │
//! │                                           ◀────────────────┘         │
//! │                                           │                          │
//! │                                    ┌──────▼──────┐   ┌────────────┐  │
//! │                                    │   Shared    │──▶│ Synthesizer│  │
//! │                                    │   Context   │   └────────────┘  │
//! │                                    └─────────────┘                   │
//! └───────────────────────────────┬──────────────────────────────────────┘
//!                                 │ progress events / control messages
//!          ┌──────────────────────┼──────────────────────┐
//!          ▼                      ▼                      ▼
//!   ┌─────────────┐        ┌─────────────┐        ┌─────────────┐
//!   │ Search Team │        │Analysis Team│        │  ... Team   │
//!   └─────────────┘        └─────────────┘        └─────────────┘
//! ```
//!
//! ## Key Concepts
//!
//! - **Team**: a pluggable capability behind [`TeamExecutor`]
//! - **Plan**: ordered steps with dependencies inferred from declared inputs and outputs
//! - **Shared context**: per-attempt blackboard where each key has exactly one writer
//! - **Session**: lifecycle state machine for one request attempt

pub mod channel;
pub mod checkpoint;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod evaluator;
pub mod graph;
pub mod intent;
pub mod orchestrator;
pub mod planner;
pub mod reasoning;
pub mod registry;
pub mod session;
pub mod synthesizer;
pub mod team;

#[cfg(test)]
pub(crate) mod testing;

pub use channel::{ChannelPair, ControlMessage, ProgressChannel, ProgressEvent, ProgressSender, StepProgress};
pub use checkpoint::{Checkpoint, CheckpointStore, InMemoryCheckpointStore, JsonFileCheckpointStore};
pub use config::{load_config, FileConfig, OrchestratorConfig, RegistryConfig};
pub use context::SharedContext;
pub use dispatcher::{DispatchReport, Dispatcher};
pub use error::OrchestratorError;
pub use evaluator::{Evaluation, QualityEvaluator, RetryController};
pub use intent::{Intent, IntentClassifier, IntentKind};
pub use orchestrator::{Orchestrator, RunOutcome};
pub use planner::{ExecutionPlan, ExecutionStep, PlanBuilder, PlanValidationError, StepId, Strategy};
pub use reasoning::{BackoffPolicy, ReasoningError, ReasoningOutput, ReasoningService};
pub use registry::{CapabilityRegistry, RegistryBuilder, TeamSpec};
pub use session::{AttemptId, OrchestrationState, Request, SessionId};
pub use synthesizer::{FinalResponse, ResponseMode, ResponseSynthesizer};
pub use team::{StepError, StepStatus, TeamExecutor, TeamInput, TeamOutcome, TeamResult};
