use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::trace;

use super::call::{CallOrigin, OperationCall};
use crate::core::errors::{Result, StagehandError};

#[derive(Debug, Default)]
struct RecorderState {
    calls: Vec<OperationCall>,
    sealed: bool,
}

/// Append-only log of operation calls for one stage execution
///
/// Clones share the same log. Once sealed, every further record fails.
#[derive(Debug, Clone)]
pub struct TraceRecorder {
    stage_id: Arc<str>,
    state: Arc<Mutex<RecorderState>>,
}

impl TraceRecorder {
    pub fn new(stage_id: impl Into<String>) -> Self {
        let stage_id: String = stage_id.into();
        Self {
            stage_id: Arc::from(stage_id),
            state: Arc::new(Mutex::new(RecorderState::default())),
        }
    }

    pub fn stage_id(&self) -> &str {
        &self.stage_id
    }

    pub fn record(&self, call: OperationCall) -> Result<()> {
        let mut state = self.state.lock();
        if state.sealed {
            return Err(StagehandError::trace_sealed(self.stage_id.as_ref()));
        }
        trace!(
            stage = %self.stage_id,
            operation = %call.operation,
            origin = %call.origin,
            success = call.succeeded(),
            "Recorded operation call"
        );
        state.calls.push(call);
        Ok(())
    }

    pub fn is_sealed(&self) -> bool {
        self.state.lock().sealed
    }

    pub fn len(&self) -> usize {
        self.state.lock().calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Freeze the log and return its contents; sealing twice returns the same calls
    pub fn seal(&self) -> Trace {
        let mut state = self.state.lock();
        state.sealed = true;
        Trace {
            stage_id: self.stage_id.to_string(),
            calls: state.calls.clone(),
            sealed_at: Utc::now(),
        }
    }
}

/// Immutable, ordered record of the calls made during one stage execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    pub stage_id: String,
    pub calls: Vec<OperationCall>,
    pub sealed_at: DateTime<Utc>,
}

impl Trace {
    pub fn empty(stage_id: impl Into<String>) -> Self {
        Self {
            stage_id: stage_id.into(),
            calls: Vec::new(),
            sealed_at: Utc::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Names of operations with at least one successful call
    pub fn succeeded_operations(&self) -> BTreeSet<String> {
        self.calls
            .iter()
            .filter(|c| c.succeeded())
            .map(|c| c.operation.clone())
            .collect()
    }

    /// Append another trace's calls after this one's, keeping both orders
    pub fn chain(&self, other: &Trace) -> Trace {
        let mut calls = self.calls.clone();
        calls.extend(other.calls.iter().cloned());
        Trace {
            stage_id: self.stage_id.clone(),
            calls,
            sealed_at: other.sealed_at.max(self.sealed_at),
        }
    }

    /// Most recent successful value for an operation
    pub fn last_success(&self, operation: &str) -> Option<&Value> {
        self.calls
            .iter()
            .rev()
            .filter(|c| c.operation == operation)
            .find_map(|c| c.outcome.value())
    }

    /// Object of operation name to most recent successful value
    pub fn success_values(&self) -> Map<String, Value> {
        let mut values = Map::new();
        for call in &self.calls {
            if let Some(value) = call.outcome.value() {
                values.insert(call.operation.clone(), value.clone());
            }
        }
        values
    }

    pub fn calls_from(&self, origin: CallOrigin) -> impl Iterator<Item = &OperationCall> {
        self.calls.iter().filter(move |c| c.origin == origin)
    }
}
