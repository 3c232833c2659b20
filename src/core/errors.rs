use std::fmt;
use thiserror::Error;

/// Unified error type for the stagehand library
#[derive(Debug, Error)]
pub enum StagehandError {
    /// Malformed pipeline graph, raised before any stage runs
    #[error("Invalid pipeline: {reason}")]
    InvalidPipeline {
        reason: String,
        stage: Option<String>,
    },

    /// An operation with this name is already registered
    #[error("Operation already registered: {name}")]
    DuplicateOperation { name: String },

    /// No operation with this name is registered (or reachable)
    #[error("Unknown operation: {name}")]
    UnknownOperation { name: String },

    /// Arguments did not satisfy an operation's parameter schema
    #[error("Invalid arguments for operation '{operation}': {}", .violations.join("; "))]
    ArgumentValidation {
        operation: String,
        violations: Vec<String>,
    },

    /// A record was attempted on a trace that was already sealed
    #[error("Trace for stage '{stage_id}' is sealed")]
    TraceSealed { stage_id: String },

    /// Arguments for a recovery call could not be derived from the run context
    #[error("Cannot extract argument '{parameter}' for operation '{operation}': {reason}")]
    Extraction {
        operation: String,
        parameter: String,
        reason: String,
    },

    /// A second write to an already set session key
    #[error("Session key '{key}' in run {run_id} owned by '{existing_writer}', not '{writer}'")]
    KeyCollision {
        run_id: String,
        key: String,
        existing_writer: String,
        writer: String,
    },

    /// The session store for a run is closed or otherwise unusable
    #[error("Session store for run {run_id} is unavailable")]
    SessionUnavailable { run_id: String },

    /// A stage status change that the state machine does not allow
    #[error("Stage '{stage_id}' cannot move from {from} to {to}")]
    InvalidTransition {
        stage_id: String,
        from: String,
        to: String,
    },

    /// The operation exists but nothing can perform it
    #[error("No provider bound for operation '{operation}'")]
    ProviderMissing { operation: String },

    /// A run request field is missing or out of range
    #[error("Invalid request field '{field}': {reason}")]
    InvalidRequest { field: String, reason: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// Serialization errors
    #[error("Serialization failed: {format}")]
    Serialization {
        format: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// IO errors
    #[error("IO operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },
}

impl StagehandError {
    pub fn invalid_pipeline<S: Into<String>>(reason: S) -> Self {
        Self::InvalidPipeline {
            reason: reason.into(),
            stage: None,
        }
    }

    /// Create an invalid pipeline error pinned to one stage
    pub fn invalid_stage<S: Into<String>, R: Into<String>>(stage: S, reason: R) -> Self {
        let stage = stage.into();
        Self::InvalidPipeline {
            reason: format!("stage '{}': {}", stage, reason.into()),
            stage: Some(stage),
        }
    }

    pub fn duplicate_operation<S: Into<String>>(name: S) -> Self {
        Self::DuplicateOperation { name: name.into() }
    }

    pub fn unknown_operation<S: Into<String>>(name: S) -> Self {
        Self::UnknownOperation { name: name.into() }
    }

    pub fn argument_validation<S: Into<String>>(operation: S, violations: Vec<String>) -> Self {
        Self::ArgumentValidation {
            operation: operation.into(),
            violations,
        }
    }

    pub fn trace_sealed<S: Into<String>>(stage_id: S) -> Self {
        Self::TraceSealed {
            stage_id: stage_id.into(),
        }
    }

    pub fn extraction<O: Into<String>, P: Into<String>, R: Into<String>>(
        operation: O,
        parameter: P,
        reason: R,
    ) -> Self {
        Self::Extraction {
            operation: operation.into(),
            parameter: parameter.into(),
            reason: reason.into(),
        }
    }

    pub fn session_unavailable(run_id: impl fmt::Display) -> Self {
        Self::SessionUnavailable {
            run_id: run_id.to_string(),
        }
    }

    pub fn invalid_transition(
        stage_id: impl Into<String>,
        from: impl fmt::Display,
        to: impl fmt::Display,
    ) -> Self {
        Self::InvalidTransition {
            stage_id: stage_id.into(),
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    pub fn provider_missing<S: Into<String>>(operation: S) -> Self {
        Self::ProviderMissing {
            operation: operation.into(),
        }
    }

    pub fn invalid_request<F: Into<String>, R: Into<String>>(field: F, reason: R) -> Self {
        Self::InvalidRequest {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
            field: None,
        }
    }

    /// Create a configuration error naming the offending field
    pub fn configuration_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Configuration {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    pub fn serialization<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        format: S,
        source: E,
    ) -> Self {
        Self::Serialization {
            format: format.into(),
            source: Box::new(source),
        }
    }

    pub fn io<S: Into<String>>(operation: S, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    /// Errors that abort a whole run rather than a single stage or call
    pub fn is_run_fatal(&self) -> bool {
        matches!(
            self,
            Self::InvalidPipeline { .. } | Self::SessionUnavailable { .. }
        )
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::InvalidPipeline { .. } => "invalid_pipeline",
            Self::DuplicateOperation { .. } => "duplicate_operation",
            Self::UnknownOperation { .. } => "unknown_operation",
            Self::ArgumentValidation { .. } => "argument_validation",
            Self::TraceSealed { .. } => "trace_sealed",
            Self::Extraction { .. } => "extraction",
            Self::KeyCollision { .. } => "key_collision",
            Self::SessionUnavailable { .. } => "session_unavailable",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::ProviderMissing { .. } => "provider_missing",
            Self::InvalidRequest { .. } => "invalid_request",
            Self::Configuration { .. } => "configuration",
            Self::Serialization { .. } => "serialization",
            Self::Io { .. } => "io",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, StagehandError>;

impl From<std::io::Error> for StagehandError {
    fn from(err: std::io::Error) -> Self {
        Self::io("io_operation", err)
    }
}

impl From<serde_json::Error> for StagehandError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization("json", err)
    }
}

impl From<serde_yaml::Error> for StagehandError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::serialization("yaml", err)
    }
}
