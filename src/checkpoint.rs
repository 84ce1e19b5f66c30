//! Checkpoint persistence for resuming interrupted requests

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::context::ContextSnapshot;
use crate::intent::Intent;
use crate::planner::{ExecutionPlan, StepId};
use crate::session::{OrchestrationState, Request, SessionId};
use crate::synthesizer::FinalResponse;
use crate::team::TeamResult;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("no checkpoint for session {0}")]
    NotFound(SessionId),

    #[error("storage failure: {0}")]
    Storage(String),

    #[error("serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Everything needed to pick a request back up
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub request: Request,
    pub state: OrchestrationState,
    #[serde(default)]
    pub intent: Option<Intent>,
    #[serde(default)]
    pub plan: Option<ExecutionPlan>,
    #[serde(default)]
    pub context: ContextSnapshot,
    #[serde(default)]
    pub team_results: BTreeMap<StepId, TeamResult>,
    #[serde(default)]
    pub attempt_count: u32,
    /// Set once the request completed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<FinalResponse>,
}

impl Checkpoint {
    pub fn new(request: Request, state: OrchestrationState) -> Self {
        Self {
            request,
            state,
            intent: None,
            plan: None,
            context: ContextSnapshot::default(),
            team_results: BTreeMap::new(),
            attempt_count: 0,
            response: None,
        }
    }
}

/// Where checkpoints live; one per session, latest wins
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, session_id: SessionId, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;

    async fn load(&self, session_id: SessionId) -> Result<Option<Checkpoint>, CheckpointError>;
}

#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: RwLock<HashMap<SessionId, Checkpoint>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.checkpoints.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoints.read().is_empty()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, session_id: SessionId, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        self.checkpoints.write().insert(session_id, checkpoint.clone());
        Ok(())
    }

    async fn load(&self, session_id: SessionId) -> Result<Option<Checkpoint>, CheckpointError> {
        Ok(self.checkpoints.read().get(&session_id).cloned())
    }
}

/// One pretty-printed JSON file per session under a directory
#[derive(Debug, Clone)]
pub struct JsonFileCheckpointStore {
    dir: PathBuf,
}

impl JsonFileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, session_id: SessionId) -> PathBuf {
        self.dir.join(format!("{session_id}.json"))
    }
}

#[async_trait]
impl CheckpointStore for JsonFileCheckpointStore {
    async fn save(&self, session_id: SessionId, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let body = serde_json::to_vec_pretty(checkpoint)?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| CheckpointError::Storage(format!("{}: {e}", self.dir.display())))?;

        // atomic replace
        let path = self.path_for(session_id);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body)
            .await
            .map_err(|e| CheckpointError::Storage(format!("{}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| CheckpointError::Storage(format!("{}: {e}", path.display())))?;

        debug!(session_id = %session_id, path = %path.display(), state = %checkpoint.state, "Checkpoint saved");
        Ok(())
    }

    async fn load(&self, session_id: SessionId) -> Result<Option<Checkpoint>, CheckpointError> {
        let path = self.path_for(session_id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CheckpointError::Storage(format!("{}: {e}", path.display()))),
        }
    }
}
