//! Request-level error types
//!
//! Step failures are recorded as data on [`crate::team::TeamResult`]; only the
//! errors below abort a request.

use thiserror::Error;

use crate::checkpoint::CheckpointError;
use crate::context::ContextError;
use crate::planner::PlanValidationError;
use crate::reasoning::ReasoningError;
use crate::session::OrchestrationState;

/// Errors that can end an orchestration attempt
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Neither the reasoning service nor the heuristic could classify
    #[error("Could not understand the request: {0}")]
    ClassificationFailure(String),

    /// The plan was rejected before dispatch
    #[error("Plan rejected: {0}")]
    PlanValidation(#[from] PlanValidationError),

    /// Reasoning service failed and no fallback applied
    #[error("Reasoning service error: {0}")]
    ReasoningService(#[from] ReasoningError),

    /// Shared context misuse
    #[error("Context error: {0}")]
    Context(#[from] ContextError),

    /// State machine edge outside the lifecycle graph
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition {
        from: OrchestrationState,
        to: OrchestrationState,
    },

    /// The request was cancelled by the client
    #[error("Request cancelled")]
    Cancelled,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Checkpoint persistence error
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
}
