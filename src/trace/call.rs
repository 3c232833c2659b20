use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

/// Who initiated an operation call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallOrigin {
    /// The stage's autonomous delegate
    Delegate,
    /// The engine itself during recovery
    DeterministicExecutor,
}

impl fmt::Display for CallOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallOrigin::Delegate => f.write_str("delegate"),
            CallOrigin::DeterministicExecutor => f.write_str("deterministic_executor"),
        }
    }
}

/// What came back from an operation call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CallOutcome {
    Success { value: Value },
    Failure { reason: String, transient: bool },
}

impl CallOutcome {
    pub fn success(value: Value) -> Self {
        CallOutcome::Success { value }
    }

    pub fn failure(reason: impl Into<String>, transient: bool) -> Self {
        CallOutcome::Failure {
            reason: reason.into(),
            transient,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, CallOutcome::Success { .. })
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            CallOutcome::Success { value } => Some(value),
            CallOutcome::Failure { .. } => None,
        }
    }
}

/// Record of one invocation of a registered operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationCall {
    pub id: Uuid,
    pub operation: String,
    pub arguments: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
    pub outcome: CallOutcome,
    pub origin: CallOrigin,
    /// Provider attempts made, including retries
    pub attempts: u32,
    pub elapsed_ms: u64,
}

impl OperationCall {
    pub fn new(
        operation: impl Into<String>,
        arguments: Map<String, Value>,
        outcome: CallOutcome,
        origin: CallOrigin,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            operation: operation.into(),
            arguments,
            timestamp: Utc::now(),
            outcome,
            origin,
            attempts: 1,
            elapsed_ms: 0,
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_elapsed_ms(mut self, elapsed_ms: u64) -> Self {
        self.elapsed_ms = elapsed_ms;
        self
    }

    pub fn succeeded(&self) -> bool {
        self.outcome.is_success()
    }
}
