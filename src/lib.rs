//! Tool-enforcing orchestration for delegated work
//!
//! Stages hand their work to a [`Delegate`] that may or may not call the
//! operations the stage requires. Every call is recorded in a sealed
//! [`Trace`]; the [`Validator`] decides from that trace alone whether the
//! stage is satisfied, and the [`FallbackController`] invokes whatever is
//! missing through the [`DeterministicExecutor`] with arguments taken from
//! the original request.

// Infrastructure shared by every part of the engine
pub mod core;

// Operation catalog and direct invocation
pub mod operation;

// Per-stage call records
pub mod trace;

// Run-scoped key/value results
pub mod session;

// Stages, graphs and the coordinator
pub mod pipeline;

// Trip planning built on the engine
pub mod travel;

pub use crate::core::config::{BackoffStrategy, EngineConfig, RetryPolicy};
pub use crate::core::errors::{Result, StagehandError};
pub use operation::{
    DeterministicExecutor, FailureKind, FnProvider, Operation, OperationProvider,
    OperationRegistry, ParamSpec, ParamType, ProviderFailure,
};
pub use pipeline::{
    Delegate, DelegateRegistry, FallbackController, FieldMapping, FnDelegate, PipelineCoordinator,
    PipelineDefinition, PipelineGraph, RunContext, RunEvent, RunId, RunResult, Stage, StageReport,
    StageSpec, StageStatus, Toolbox, Validator, Verification,
};
pub use session::SessionStore;
pub use trace::{CallOrigin, CallOutcome, OperationCall, Trace, TraceRecorder};
