use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::context::RunContext;
use super::delegate::{Delegate, Toolbox};
use super::report::StageReport;
use super::validator::Verification;
use crate::core::errors::{Result, StagehandError};
use crate::operation::DeterministicExecutor;
use crate::trace::{Trace, TraceRecorder};

/// Operation names a stage must see succeed
pub type RequirementSet = BTreeSet<String>;

/// Lifecycle of a stage within one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Verified,
    Unverified,
    Recovered,
    Failed,
}

impl StageStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StageStatus::Verified | StageStatus::Recovered | StageStatus::Failed
        )
    }

    /// Forward-only transitions; nothing skips `Running`
    pub fn can_transition_to(&self, next: StageStatus) -> bool {
        use StageStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, Verified)
                | (Running, Unverified)
                | (Unverified, Recovered)
                | (Unverified, Failed)
        )
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StageStatus::Pending => "pending",
            StageStatus::Running => "running",
            StageStatus::Verified => "verified",
            StageStatus::Unverified => "unverified",
            StageStatus::Recovered => "recovered",
            StageStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Declaration of one stage in a pipeline graph
#[derive(Clone)]
pub struct StageSpec {
    pub id: String,
    pub delegate: Arc<dyn Delegate>,
    pub requirements: RequirementSet,
    /// Operations the delegate may use besides its requirements
    pub operations: BTreeSet<String>,
    pub depends_on: BTreeSet<String>,
    /// Session key the result is written to
    pub output_key: String,
    /// Deadline for the delegate attempt; engine default when unset
    pub timeout: Option<Duration>,
}

impl StageSpec {
    pub fn new(id: impl Into<String>, delegate: Arc<dyn Delegate>) -> Self {
        let id = id.into();
        Self {
            output_key: id.clone(),
            id,
            delegate,
            requirements: RequirementSet::new(),
            operations: BTreeSet::new(),
            depends_on: BTreeSet::new(),
            timeout: None,
        }
    }

    pub fn requires(mut self, operation: impl Into<String>) -> Self {
        self.requirements.insert(operation.into());
        self
    }

    pub fn allows(mut self, operation: impl Into<String>) -> Self {
        self.operations.insert(operation.into());
        self
    }

    pub fn depends_on(mut self, stage_id: impl Into<String>) -> Self {
        self.depends_on.insert(stage_id.into());
        self
    }

    pub fn output_key(mut self, key: impl Into<String>) -> Self {
        self.output_key = key.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Requirements plus extra allowed operations
    pub fn available_operations(&self) -> BTreeSet<String> {
        self.requirements
            .iter()
            .chain(self.operations.iter())
            .cloned()
            .collect()
    }
}

impl fmt::Debug for StageSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageSpec")
            .field("id", &self.id)
            .field("delegate", &self.delegate.name())
            .field("requirements", &self.requirements)
            .field("operations", &self.operations)
            .field("depends_on", &self.depends_on)
            .field("output_key", &self.output_key)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// How a delegate attempt ended abnormally
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptFailureKind {
    Error,
    Panic,
    Timeout,
    /// The engine gave up on the stage
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptFailure {
    pub kind: AttemptFailureKind,
    pub reason: String,
    pub transient: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    pub status: StageStatus,
    pub at: DateTime<Utc>,
}

/// Runtime state of one stage during one run
#[derive(Debug)]
pub struct Stage {
    spec: Arc<StageSpec>,
    status: StageStatus,
    result: Option<Value>,
    delegate_output: Option<Value>,
    delegate_trace: Option<Trace>,
    recovery_trace: Option<Trace>,
    missing: RequirementSet,
    failure_reasons: BTreeMap<String, String>,
    attempt_failure: Option<AttemptFailure>,
    store_error: Option<String>,
    history: Vec<StatusChange>,
    started: Option<Instant>,
    elapsed_ms: u64,
}

impl Stage {
    pub fn new(spec: Arc<StageSpec>) -> Self {
        Self {
            spec,
            status: StageStatus::Pending,
            result: None,
            delegate_output: None,
            delegate_trace: None,
            recovery_trace: None,
            missing: RequirementSet::new(),
            failure_reasons: BTreeMap::new(),
            attempt_failure: None,
            store_error: None,
            history: vec![StatusChange {
                status: StageStatus::Pending,
                at: Utc::now(),
            }],
            started: None,
            elapsed_ms: 0,
        }
    }

    pub fn id(&self) -> &str {
        &self.spec.id
    }

    pub fn spec(&self) -> &StageSpec {
        &self.spec
    }

    pub fn requirements(&self) -> &RequirementSet {
        &self.spec.requirements
    }

    pub fn status(&self) -> StageStatus {
        self.status
    }

    pub fn result(&self) -> Option<&Value> {
        self.result.as_ref()
    }

    pub fn delegate_trace(&self) -> Option<&Trace> {
        self.delegate_trace.as_ref()
    }

    pub fn recovery_trace(&self) -> Option<&Trace> {
        self.recovery_trace.as_ref()
    }

    pub fn attempt_failure(&self) -> Option<&AttemptFailure> {
        self.attempt_failure.as_ref()
    }

    pub fn failure_reasons(&self) -> &BTreeMap<String, String> {
        &self.failure_reasons
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed_ms
    }

    /// A stage the engine could not drive to completion itself
    pub(crate) fn abandoned(spec: Arc<StageSpec>, reason: String) -> Self {
        let mut stage = Self::new(spec);
        let at = Utc::now();
        for status in [StageStatus::Running, StageStatus::Unverified, StageStatus::Failed] {
            stage.history.push(StatusChange { status, at });
        }
        stage.status = StageStatus::Failed;
        stage.missing = stage.spec.requirements.clone();
        stage.failure_reasons = stage
            .spec
            .requirements
            .iter()
            .map(|op| (op.clone(), "stage aborted before verification".to_string()))
            .collect();
        stage.attempt_failure = Some(AttemptFailure {
            kind: AttemptFailureKind::Aborted,
            reason,
            transient: false,
        });
        stage
    }

    /// Delegate trace followed by the recovery segment, if any
    pub fn final_trace(&self) -> Trace {
        let delegate = self
            .delegate_trace
            .clone()
            .unwrap_or_else(|| Trace::empty(self.id()));
        match &self.recovery_trace {
            Some(recovery) => delegate.chain(recovery),
            None => delegate,
        }
    }

    pub(crate) fn transition(&mut self, next: StageStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(StagehandError::invalid_transition(
                self.id(),
                self.status,
                next,
            ));
        }
        debug!(stage_id = %self.spec.id, from = %self.status, to = %next, "Stage transition");
        self.status = next;
        self.history.push(StatusChange {
            status: next,
            at: Utc::now(),
        });
        if next.is_terminal() {
            if let Some(started) = self.started {
                self.elapsed_ms = started.elapsed().as_millis() as u64;
            }
        }
        Ok(())
    }

    /// Run the delegate once and seal its trace
    ///
    /// Delegate errors, panics and deadline overruns are kept on the stage as
    /// an [`AttemptFailure`]; whatever was recorded before still counts.
    pub async fn execute(
        &mut self,
        ctx: &RunContext,
        executor: Arc<DeterministicExecutor>,
        default_timeout: Duration,
    ) -> Result<Trace> {
        self.transition(StageStatus::Running)?;
        self.started = Some(Instant::now());

        let mut operations = BTreeMap::new();
        for name in self.spec.available_operations() {
            let operation = executor.registry().lookup(&name)?;
            operations.insert(name, operation);
        }

        let recorder = TraceRecorder::new(self.id());
        let toolbox = Toolbox::new(self.id(), operations, recorder.clone(), executor);
        let delegate = Arc::clone(&self.spec.delegate);
        let deadline = self.spec.timeout.unwrap_or(default_timeout);

        info!(
            stage_id = %self.spec.id,
            delegate = delegate.name(),
            run_id = %ctx.run_id(),
            "Delegate attempt started"
        );

        let attempt = AssertUnwindSafe(delegate.attempt(ctx, &toolbox)).catch_unwind();
        let outcome = timeout(deadline, attempt).await;
        let trace = recorder.seal();

        match outcome {
            Ok(Ok(Ok(output))) => {
                self.delegate_output = output;
            }
            Ok(Ok(Err(err))) => {
                warn!(stage_id = %self.spec.id, error = %err, "Delegate attempt returned an error");
                self.attempt_failure = Some(AttemptFailure {
                    kind: AttemptFailureKind::Error,
                    reason: format!("{:#}", err),
                    transient: false,
                });
            }
            Ok(Err(panic)) => {
                let reason = panic_message(panic.as_ref());
                warn!(stage_id = %self.spec.id, reason = %reason, "Delegate attempt panicked");
                self.attempt_failure = Some(AttemptFailure {
                    kind: AttemptFailureKind::Panic,
                    reason,
                    transient: false,
                });
            }
            Err(_) => {
                warn!(
                    stage_id = %self.spec.id,
                    deadline_ms = deadline.as_millis() as u64,
                    "Delegate attempt timed out"
                );
                self.attempt_failure = Some(AttemptFailure {
                    kind: AttemptFailureKind::Timeout,
                    reason: format!("delegate attempt exceeded {:?}", deadline),
                    transient: true,
                });
            }
        }

        debug!(stage_id = %self.spec.id, calls = trace.len(), "Delegate trace sealed");
        self.delegate_trace = Some(trace.clone());
        Ok(trace)
    }

    /// Apply the validator's verdict on the delegate trace
    pub fn apply_verification(&mut self, verification: Verification) -> Result<()> {
        match verification {
            Verification::Verified => {
                self.transition(StageStatus::Verified)?;
                let result = match self.delegate_output.take() {
                    Some(output) => output,
                    None => Value::Object(self.final_trace().success_values()),
                };
                self.result = Some(result);
            }
            Verification::Unverified { missing } => {
                self.transition(StageStatus::Unverified)?;
                self.missing = missing;
            }
        }
        Ok(())
    }

    pub(crate) fn set_recovery_trace(&mut self, trace: Trace) {
        self.recovery_trace = Some(trace);
    }

    /// The result comes from the recovery segment alone
    pub(crate) fn mark_recovered(&mut self) -> Result<()> {
        self.transition(StageStatus::Recovered)?;
        let values = self
            .recovery_trace
            .as_ref()
            .map(Trace::success_values)
            .unwrap_or_default();
        self.result = Some(Value::Object(values));
        Ok(())
    }

    pub(crate) fn mark_failed(&mut self, reasons: BTreeMap<String, String>) -> Result<()> {
        self.transition(StageStatus::Failed)?;
        self.failure_reasons = reasons;
        self.result = None;
        Ok(())
    }

    pub(crate) fn set_store_error(&mut self, error: &StagehandError) {
        self.store_error = Some(error.to_string());
    }

    pub fn into_report(self) -> StageReport {
        let final_trace = self.final_trace();
        StageReport {
            id: self.spec.id.clone(),
            delegate: self.spec.delegate.name().to_string(),
            output_key: self.spec.output_key.clone(),
            status: self.status,
            requirements: self.spec.requirements.clone(),
            result: self.result,
            missing_after_delegate: self.missing,
            failure_reasons: self.failure_reasons,
            attempt_failure: self.attempt_failure,
            store_error: self.store_error,
            delegate_trace: self.delegate_trace,
            recovery_trace: self.recovery_trace,
            satisfied: final_trace.succeeded_operations(),
            history: self.history,
            elapsed_ms: self.elapsed_ms,
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "delegate panicked".to_string()
    }
}
