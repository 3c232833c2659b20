use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::future::Future;
use thiserror::Error;

/// Why a provider could not perform an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    RateLimited,
    Unavailable,
    Rejected,
    NotFound,
    InvalidArgument,
    Other,
}

impl FailureKind {
    /// Transient failures are worth retrying
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FailureKind::Timeout | FailureKind::RateLimited | FailureKind::Unavailable
        )
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::Timeout => "timeout",
            FailureKind::RateLimited => "rate_limited",
            FailureKind::Unavailable => "unavailable",
            FailureKind::Rejected => "rejected",
            FailureKind::NotFound => "not_found",
            FailureKind::InvalidArgument => "invalid_argument",
            FailureKind::Other => "other",
        };
        f.write_str(s)
    }
}

/// Failure reported by an operation provider
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct ProviderFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl ProviderFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Unavailable, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(FailureKind::RateLimited, message)
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Rejected, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(FailureKind::NotFound, message)
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

/// Performs one operation against the outside world
#[async_trait]
pub trait OperationProvider: Send + Sync {
    async fn perform(
        &self,
        arguments: &Map<String, Value>,
    ) -> std::result::Result<Value, ProviderFailure>;
}

/// Provider backed by an async closure
pub struct FnProvider<F> {
    func: F,
}

impl<F, Fut> FnProvider<F>
where
    F: Fn(Map<String, Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Value, ProviderFailure>> + Send + 'static,
{
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

#[async_trait]
impl<F, Fut> OperationProvider for FnProvider<F>
where
    F: Fn(Map<String, Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Value, ProviderFailure>> + Send + 'static,
{
    async fn perform(
        &self,
        arguments: &Map<String, Value>,
    ) -> std::result::Result<Value, ProviderFailure> {
        (self.func)(arguments.clone()).await
    }
}
