use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use super::provider::{FailureKind, OperationProvider, ProviderFailure};
use super::registry::OperationRegistry;
use crate::core::config::{EngineConfig, RetryPolicy};
use crate::core::errors::{Result, StagehandError};
use crate::trace::call::{CallOrigin, CallOutcome, OperationCall};

/// Performs registered operations directly, bypassing any delegate
///
/// Arguments are validated against the operation's schema before the provider
/// is touched. Provider failures come back as `Failure` outcomes, never as
/// errors; only transient ones are retried.
#[derive(Clone)]
pub struct DeterministicExecutor {
    registry: Arc<OperationRegistry>,
    providers: HashMap<String, Arc<dyn OperationProvider>>,
    retry: RetryPolicy,
    call_timeout: Duration,
}

impl DeterministicExecutor {
    pub fn new(registry: Arc<OperationRegistry>) -> Self {
        Self::from_config(registry, &EngineConfig::default())
    }

    pub fn from_config(registry: Arc<OperationRegistry>, config: &EngineConfig) -> Self {
        Self {
            registry,
            providers: HashMap::new(),
            retry: config.retry.clone(),
            call_timeout: config.operation_timeout(),
        }
    }

    /// Bind the provider that performs `operation`
    pub fn register_provider(
        &mut self,
        operation: &str,
        provider: Arc<dyn OperationProvider>,
    ) -> Result<()> {
        if !self.registry.contains(operation) {
            return Err(StagehandError::unknown_operation(operation));
        }
        self.providers.insert(operation.to_string(), provider);
        Ok(())
    }

    pub fn with_provider<P>(mut self, operation: &str, provider: P) -> Result<Self>
    where
        P: OperationProvider + 'static,
    {
        self.register_provider(operation, Arc::new(provider))?;
        Ok(self)
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    pub fn registry(&self) -> &Arc<OperationRegistry> {
        &self.registry
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn has_provider(&self, operation: &str) -> bool {
        self.providers.contains_key(operation)
    }

    /// Perform an operation as the engine, retrying transient failures
    pub async fn invoke(
        &self,
        operation: &str,
        arguments: Map<String, Value>,
    ) -> Result<OperationCall> {
        self.perform(
            operation,
            arguments,
            CallOrigin::DeterministicExecutor,
            self.retry.max_retries,
        )
        .await
    }

    /// Perform a single attempt on behalf of `origin`, without retries
    pub async fn invoke_once(
        &self,
        operation: &str,
        arguments: Map<String, Value>,
        origin: CallOrigin,
    ) -> Result<OperationCall> {
        self.perform(operation, arguments, origin, 0).await
    }

    async fn perform(
        &self,
        operation: &str,
        arguments: Map<String, Value>,
        origin: CallOrigin,
        max_retries: u32,
    ) -> Result<OperationCall> {
        self.registry.validate_arguments(operation, &arguments)?;
        let provider = self
            .providers
            .get(operation)
            .ok_or_else(|| StagehandError::provider_missing(operation))?;

        let started = Instant::now();
        let mut attempt: u32 = 0;
        let outcome = loop {
            attempt += 1;
            debug!(operation, attempt, origin = %origin, "Performing operation");

            let failure = match timeout(self.call_timeout, provider.perform(&arguments)).await {
                Ok(Ok(value)) => break CallOutcome::success(value),
                Ok(Err(failure)) => failure,
                Err(_) => ProviderFailure::new(
                    FailureKind::Timeout,
                    format!("no response after {:?}", self.call_timeout),
                ),
            };

            let retries_used = attempt - 1;
            if failure.is_transient() && retries_used < max_retries {
                let delay = self.retry.delay_for(attempt);
                warn!(
                    operation,
                    attempt,
                    error = %failure,
                    delay_ms = delay.as_millis() as u64,
                    "Transient failure, retrying"
                );
                sleep(delay).await;
                continue;
            }

            info!(
                operation,
                attempts = attempt,
                error = %failure,
                transient = failure.is_transient(),
                "Operation failed"
            );
            break CallOutcome::failure(failure.to_string(), failure.is_transient());
        };

        Ok(OperationCall::new(operation, arguments, outcome, origin)
            .with_attempts(attempt)
            .with_elapsed_ms(started.elapsed().as_millis() as u64))
    }
}

impl fmt::Debug for DeterministicExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut bound: Vec<&String> = self.providers.keys().collect();
        bound.sort();
        f.debug_struct("DeterministicExecutor")
            .field("providers", &bound)
            .field("retry", &self.retry)
            .field("call_timeout", &self.call_timeout)
            .finish()
    }
}
