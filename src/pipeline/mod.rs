//! Stage graphs and the machinery that runs them
//!
//! A [`PipelineGraph`] is built from [`StageSpec`]s and validated up front.
//! The [`PipelineCoordinator`] runs each stage's [`Delegate`] as soon as its
//! dependencies are terminal, checks the sealed trace with the [`Validator`],
//! and hands unverified stages to the [`FallbackController`].

pub mod context;
pub mod coordinator;
pub mod delegate;
pub mod events;
pub mod fallback;
pub mod graph;
pub mod report;
pub mod stage;
pub mod validator;

pub use context::{RunContext, RunId};
pub use coordinator::PipelineCoordinator;
pub use delegate::{Delegate, DelegateRegistry, FnDelegate, Toolbox};
pub use events::{EventBus, RunEvent};
pub use fallback::{ArgumentExtractor, FallbackController, FieldBinding, FieldMapping};
pub use graph::{PipelineDefinition, PipelineGraph, StageDefinition};
pub use report::{RunResult, StageReport};
pub use stage::{
    AttemptFailure, AttemptFailureKind, RequirementSet, Stage, StageSpec, StageStatus,
    StatusChange,
};
pub use validator::{Validator, Verification};
