//! Operation catalog and the deterministic path that performs operations
//!
//! An [`Operation`] is a named external action with a typed parameter schema.
//! The [`OperationRegistry`] holds every operation the system knows about;
//! the [`DeterministicExecutor`] performs them through bound
//! [`OperationProvider`]s with validation, timeouts and retries.

pub mod executor;
pub mod provider;
pub mod registry;
pub mod schema;

pub use executor::DeterministicExecutor;
pub use provider::{FailureKind, FnProvider, OperationProvider, ProviderFailure};
pub use registry::{Operation, OperationRegistry};
pub use schema::{ArgumentValidator, ParamSpec, ParamType};
