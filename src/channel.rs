//! Progress and control channels between the orchestrator and its client

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::trace;

use crate::planner::{ExecutionStep, StepId, Strategy};
use crate::synthesizer::FinalResponse;

/// Step status as the client sees it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepProgress {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// Events streamed to the client while a request runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    PlanReady {
        steps: Vec<ExecutionStep>,
        strategy: Strategy,
        estimated_time_ms: u64,
    },
    StepUpdate {
        step_id: StepId,
        status: StepProgress,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    Complete {
        final_response: FinalResponse,
    },
    Error {
        message: String,
    },
}

/// Client → orchestrator messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    ApprovePlan,
    RejectPlan {
        #[serde(default)]
        reason: Option<String>,
    },
    Cancel,
}

/// Orchestrator-side event sender.
///
/// Emission is fire-and-forget: a client that went away never stalls a run.
#[derive(Debug, Clone, Default)]
pub struct ProgressSender {
    tx: Option<mpsc::UnboundedSender<ProgressEvent>>,
}

impl ProgressSender {
    pub fn new(tx: mpsc::UnboundedSender<ProgressEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// Sender that drops everything
    pub fn noop() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: ProgressEvent) {
        if let Some(tx) = &self.tx {
            if tx.send(event).is_err() {
                trace!("Progress receiver dropped, event discarded");
            }
        }
    }

    pub fn step(&self, step_id: &StepId, status: StepProgress, detail: Option<String>) {
        self.emit(ProgressEvent::StepUpdate {
            step_id: step_id.clone(),
            status,
            detail,
        });
    }

    pub fn is_closed(&self) -> bool {
        self.tx.as_ref().map_or(true, |tx| tx.is_closed())
    }
}

/// Orchestrator end of a channel pair
pub struct ChannelPair {
    pub control_rx: mpsc::UnboundedReceiver<ControlMessage>,
    pub event_tx: ProgressSender,
}

/// Client end: send control messages, receive progress events
pub struct ProgressChannel {
    control_tx: mpsc::UnboundedSender<ControlMessage>,
    event_rx: mpsc::UnboundedReceiver<ProgressEvent>,
}

impl ProgressChannel {
    /// Returns the client channel and the orchestrator channel pair
    pub fn new() -> (Self, ChannelPair) {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let channel = Self { control_tx, event_rx };
        let pair = ChannelPair {
            control_rx,
            event_tx: ProgressSender::new(event_tx),
        };

        (channel, pair)
    }

    pub fn send(&self, message: ControlMessage) -> Result<(), ChannelError> {
        self.control_tx.send(message).map_err(|_| ChannelError::Closed)
    }

    /// Cloneable handle for sending control messages from elsewhere
    pub fn control_sender(&self) -> mpsc::UnboundedSender<ControlMessage> {
        self.control_tx.clone()
    }

    /// Non-blocking receive
    pub fn try_recv(&mut self) -> Option<ProgressEvent> {
        self.event_rx.try_recv().ok()
    }

    /// Wait for the next event; `None` once the orchestrator side is gone
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        self.event_rx.recv().await
    }

    /// Drain everything currently buffered
    pub fn drain(&mut self) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.event_rx.try_recv() {
            events.push(event);
        }
        events
    }

    pub fn is_closed(&self) -> bool {
        self.control_tx.is_closed()
    }
}

/// Channel errors
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel is closed")]
    Closed,
}
