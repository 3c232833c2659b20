//! The autonomous side of a stage
//!
//! A [`Delegate`] decides for itself which operations to invoke. It is handed
//! a [`Toolbox`] that exposes only the operations its stage allows and records
//! every call it makes; it is never forced to call anything.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use super::context::RunContext;
use crate::core::errors::{Result, StagehandError};
use crate::operation::{DeterministicExecutor, Operation};
use crate::trace::{CallOrigin, CallOutcome, OperationCall, TraceRecorder};

/// Decision-maker bound to a stage
#[async_trait]
pub trait Delegate: Send + Sync {
    fn name(&self) -> &str;

    /// Make a best-effort attempt at the stage's work
    ///
    /// Returns the delegate's own rendering of the result, if it has one. The
    /// engine trusts only what the toolbox recorded.
    async fn attempt(&self, ctx: &RunContext, toolbox: &Toolbox) -> anyhow::Result<Option<Value>>;
}

/// Operations available to one stage execution, wired to its trace recorder
#[derive(Clone)]
pub struct Toolbox {
    stage_id: Arc<str>,
    operations: Arc<BTreeMap<String, Arc<Operation>>>,
    recorder: TraceRecorder,
    executor: Arc<DeterministicExecutor>,
}

impl Toolbox {
    pub fn new(
        stage_id: &str,
        operations: BTreeMap<String, Arc<Operation>>,
        recorder: TraceRecorder,
        executor: Arc<DeterministicExecutor>,
    ) -> Self {
        Self {
            stage_id: Arc::from(stage_id),
            operations: Arc::new(operations),
            recorder,
            executor,
        }
    }

    pub fn stage_id(&self) -> &str {
        &self.stage_id
    }

    /// Operations this stage may invoke
    pub fn operations(&self) -> impl Iterator<Item = &Operation> {
        self.operations.values().map(|op| op.as_ref())
    }

    pub fn operation(&self, name: &str) -> Option<&Operation> {
        self.operations.get(name).map(|op| op.as_ref())
    }

    pub fn can_invoke(&self, name: &str) -> bool {
        self.operations.contains_key(name)
    }

    /// Perform one attempt of an operation and record it
    ///
    /// Calls rejected before reaching the provider are still recorded, as
    /// failures, and the rejection is returned.
    pub async fn invoke(&self, name: &str, arguments: Map<String, Value>) -> Result<OperationCall> {
        if !self.can_invoke(name) {
            return Err(StagehandError::unknown_operation(name));
        }
        match self
            .executor
            .invoke_once(name, arguments.clone(), CallOrigin::Delegate)
            .await
        {
            Ok(call) => {
                self.recorder.record(call.clone())?;
                Ok(call)
            }
            Err(err) => {
                let rejected = OperationCall::new(
                    name,
                    arguments,
                    CallOutcome::failure(err.to_string(), false),
                    CallOrigin::Delegate,
                );
                self.recorder.record(rejected)?;
                Err(err)
            }
        }
    }

    /// Record a call the delegate performed through its own means
    pub fn record(&self, mut call: OperationCall) -> Result<()> {
        if !self.can_invoke(&call.operation) {
            return Err(StagehandError::unknown_operation(&call.operation));
        }
        call.origin = CallOrigin::Delegate;
        self.recorder.record(call)
    }
}

/// Delegate backed by an async closure
pub struct FnDelegate<F> {
    name: String,
    func: F,
}

impl<F, Fut> FnDelegate<F>
where
    F: Fn(RunContext, Toolbox) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Option<Value>>> + Send + 'static,
{
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

#[async_trait]
impl<F, Fut> Delegate for FnDelegate<F>
where
    F: Fn(RunContext, Toolbox) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Option<Value>>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn attempt(&self, ctx: &RunContext, toolbox: &Toolbox) -> anyhow::Result<Option<Value>> {
        (self.func)(ctx.clone(), toolbox.clone()).await
    }
}

/// Named delegates, used to resolve declarative pipeline definitions
#[derive(Clone, Default)]
pub struct DelegateRegistry {
    delegates: Arc<RwLock<BTreeMap<String, Arc<dyn Delegate>>>>,
}

impl DelegateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register under the delegate's own name, replacing any previous one
    pub fn register(&self, delegate: Arc<dyn Delegate>) {
        self.delegates
            .write()
            .insert(delegate.name().to_string(), delegate);
    }

    pub fn with_delegate(self, delegate: Arc<dyn Delegate>) -> Self {
        self.register(delegate);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Delegate>> {
        self.delegates.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.delegates.read().contains_key(name)
    }

    pub fn list(&self) -> Vec<String> {
        self.delegates.read().keys().cloned().collect()
    }
}
