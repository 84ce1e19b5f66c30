//! Shared context - the write-once blackboard between steps
//!
//! Each key has exactly one writer per attempt. The dependency graph orders
//! every read after the matching write, so the lock here only guards the map
//! itself and is never held across an await.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::session::{AttemptId, Request, QUERY_KEY};

/// Context store errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("key '{0}' was already written in this attempt")]
    KeyAlreadyWritten(String),

    #[error("dependency missing: '{0}' has not been produced")]
    DependencyMissing(String),
}

/// A stored value and who wrote it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextRecord {
    pub key: String,
    pub value: Value,
    /// Team that produced the value; `None` for request seeds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub producer: Option<String>,
}

/// Serializable copy of a context, in write order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub attempt_id: Option<AttemptId>,
    pub records: Vec<ContextRecord>,
}

/// Append-only key/value store scoped to one request attempt
#[derive(Debug)]
pub struct SharedContext {
    attempt_id: AttemptId,
    records: RwLock<Vec<ContextRecord>>,
}

impl SharedContext {
    /// Create an empty context for an attempt
    pub fn new(attempt_id: AttemptId) -> Self {
        Self {
            attempt_id,
            records: RwLock::new(Vec::new()),
        }
    }

    /// Context with the request text and extra inputs already seeded
    pub fn for_request(request: &Request) -> Result<Self, ContextError> {
        let context = Self::new(request.attempt_id);
        context.write(QUERY_KEY, Value::String(request.text.clone()))?;
        for (key, value) in request.inputs.iter().filter(|(k, _)| k.as_str() != QUERY_KEY) {
            context.write(key.clone(), value.clone())?;
        }
        Ok(context)
    }

    /// Rebuild from a checkpoint snapshot
    pub fn restore(attempt_id: AttemptId, snapshot: ContextSnapshot) -> Self {
        if snapshot.attempt_id.is_some_and(|id| id != attempt_id) {
            warn!(
                attempt_id = %attempt_id,
                "Restoring context snapshot taken in a different attempt"
            );
        }
        Self {
            attempt_id,
            records: RwLock::new(snapshot.records),
        }
    }

    /// Get the attempt this context belongs to
    pub fn attempt_id(&self) -> AttemptId {
        self.attempt_id
    }

    /// Write a request-level value
    pub fn write(&self, key: impl Into<String>, value: Value) -> Result<(), ContextError> {
        self.insert(key.into(), value, None)
    }

    /// Write a team's output under its produced key
    pub fn write_produced(
        &self,
        key: impl Into<String>,
        value: Value,
        producer: impl Into<String>,
    ) -> Result<(), ContextError> {
        self.insert(key.into(), value, Some(producer.into()))
    }

    fn insert(&self, key: String, value: Value, producer: Option<String>) -> Result<(), ContextError> {
        let mut records = self.records.write();
        if records.iter().any(|r| r.key == key) {
            return Err(ContextError::KeyAlreadyWritten(key));
        }
        debug!(attempt_id = %self.attempt_id, key = %key, producer = ?producer, "Context write");
        records.push(ContextRecord { key, value, producer });
        Ok(())
    }

    /// Read a value; a missing key is a missing dependency
    pub fn read(&self, key: &str) -> Result<Value, ContextError> {
        self.records
            .read()
            .iter()
            .find(|r| r.key == key)
            .map(|r| r.value.clone())
            .ok_or_else(|| ContextError::DependencyMissing(key.to_string()))
    }

    /// Check whether a key has been written
    pub fn contains(&self, key: &str) -> bool {
        self.records.read().iter().any(|r| r.key == key)
    }

    /// Keys in write order
    pub fn keys(&self) -> Vec<String> {
        self.records.read().iter().map(|r| r.key.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Teams whose output is present, in write order
    pub fn producers(&self) -> Vec<String> {
        let mut producers: Vec<String> = Vec::new();
        for record in self.records.read().iter() {
            if let Some(p) = &record.producer {
                if !producers.contains(p) {
                    producers.push(p.clone());
                }
            }
        }
        producers
    }

    /// Values written by teams, keyed by output key
    pub fn produced_values(&self) -> Map<String, Value> {
        self.records
            .read()
            .iter()
            .filter(|r| r.producer.is_some())
            .map(|r| (r.key.clone(), r.value.clone()))
            .collect()
    }

    /// Request-seeded values, keyed by seed key
    pub fn seed_values(&self) -> Map<String, Value> {
        self.records
            .read()
            .iter()
            .filter(|r| r.producer.is_none())
            .map(|r| (r.key.clone(), r.value.clone()))
            .collect()
    }

    /// All values, keyed by context key
    pub fn to_map(&self) -> BTreeMap<String, Value> {
        self.records
            .read()
            .iter()
            .map(|r| (r.key.clone(), r.value.clone()))
            .collect()
    }

    /// Capture the records for a checkpoint
    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            attempt_id: Some(self.attempt_id),
            records: self.records.read().clone(),
        }
    }
}
