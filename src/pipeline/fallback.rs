//! Deterministic recovery of operations a delegate skipped
//!
//! Each recoverable operation has an [`ArgumentExtractor`] that derives its
//! arguments from the run request. Extraction never guesses: a required field
//! that is absent fails the operation with an extraction error.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{error, info, warn};

use super::context::RunContext;
use super::stage::{RequirementSet, Stage, StageStatus};
use super::validator::{Validator, Verification};
use crate::core::config::EngineConfig;
use crate::core::errors::{Result, StagehandError};
use crate::operation::DeterministicExecutor;
use crate::trace::{CallOrigin, CallOutcome, OperationCall, TraceRecorder};

/// Derives concrete operation arguments from a run context
pub trait ArgumentExtractor: Send + Sync {
    fn extract(&self, ctx: &RunContext) -> Result<Map<String, Value>>;
}

impl<F> ArgumentExtractor for F
where
    F: Fn(&RunContext) -> Result<Map<String, Value>> + Send + Sync,
{
    fn extract(&self, ctx: &RunContext) -> Result<Map<String, Value>> {
        self(ctx)
    }
}

/// Binds one operation parameter to a request field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldBinding {
    pub param: String,
    /// Dotted path into the request
    pub field: String,
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

/// Extraction rule that copies request fields into parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub operation: String,
    pub bindings: Vec<FieldBinding>,
}

impl FieldMapping {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            bindings: Vec::new(),
        }
    }

    pub fn bind(mut self, param: impl Into<String>, field: impl Into<String>) -> Self {
        self.bindings.push(FieldBinding {
            param: param.into(),
            field: field.into(),
            required: true,
        });
        self
    }

    /// Bind a parameter that is left out when the field is absent
    pub fn bind_optional(mut self, param: impl Into<String>, field: impl Into<String>) -> Self {
        self.bindings.push(FieldBinding {
            param: param.into(),
            field: field.into(),
            required: false,
        });
        self
    }
}

impl ArgumentExtractor for FieldMapping {
    fn extract(&self, ctx: &RunContext) -> Result<Map<String, Value>> {
        let mut arguments = Map::new();
        for binding in &self.bindings {
            match ctx.param(&binding.field) {
                Some(value) => {
                    arguments.insert(binding.param.clone(), value.clone());
                }
                None if binding.required => {
                    return Err(StagehandError::extraction(
                        &self.operation,
                        &binding.param,
                        format!("request field '{}' is absent", binding.field),
                    ));
                }
                None => {}
            }
        }
        Ok(arguments)
    }
}

/// Drives the deterministic executor for unverified stages
pub struct FallbackController {
    executor: Arc<DeterministicExecutor>,
    rules: HashMap<String, Arc<dyn ArgumentExtractor>>,
    timeout: Duration,
}

impl FallbackController {
    pub fn new(executor: Arc<DeterministicExecutor>) -> Self {
        Self::from_config(executor, &EngineConfig::default())
    }

    pub fn from_config(executor: Arc<DeterministicExecutor>, config: &EngineConfig) -> Self {
        Self {
            executor,
            rules: HashMap::new(),
            timeout: config.fallback_timeout(),
        }
    }

    pub fn register_rule(
        &mut self,
        operation: impl Into<String>,
        rule: Arc<dyn ArgumentExtractor>,
    ) {
        self.rules.insert(operation.into(), rule);
    }

    pub fn with_rule<E>(mut self, operation: impl Into<String>, rule: E) -> Self
    where
        E: ArgumentExtractor + 'static,
    {
        self.register_rule(operation, Arc::new(rule));
        self
    }

    pub fn with_mapping(self, mapping: FieldMapping) -> Self {
        let operation = mapping.operation.clone();
        self.with_rule(operation, mapping)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn has_rule(&self, operation: &str) -> bool {
        self.rules.contains_key(operation)
    }

    pub fn executor(&self) -> &Arc<DeterministicExecutor> {
        &self.executor
    }

    /// Perform the missing operations and settle the stage as Recovered or Failed
    ///
    /// Only an `Unverified` stage is accepted. Failures of individual
    /// operations end up in the stage's failure reasons, not as errors.
    pub async fn recover(
        &self,
        stage: &mut Stage,
        ctx: &RunContext,
        missing: &RequirementSet,
    ) -> Result<()> {
        if stage.status() != StageStatus::Unverified {
            return Err(StagehandError::invalid_transition(
                stage.id(),
                stage.status(),
                StageStatus::Recovered,
            ));
        }

        info!(
            stage_id = %stage.id(),
            run_id = %ctx.run_id(),
            missing = ?missing,
            "Recovering skipped operations"
        );

        let recorder = TraceRecorder::new(stage.id());
        let mut reasons: BTreeMap<String, String> = BTreeMap::new();

        let work = async {
            for operation in missing {
                if let Err(reason) = self.recover_operation(operation, ctx, &recorder).await {
                    warn!(
                        stage_id = %stage.id(),
                        operation = %operation,
                        reason = %reason,
                        "Recovery call did not succeed"
                    );
                    reasons.insert(operation.clone(), reason);
                }
            }
        };
        let timed_out = timeout(self.timeout, work).await.is_err();
        if timed_out {
            warn!(
                stage_id = %stage.id(),
                timeout_ms = self.timeout.as_millis() as u64,
                "Recovery deadline exceeded"
            );
        }

        stage.set_recovery_trace(recorder.seal());
        let combined = stage.final_trace();

        match Validator::check(stage.requirements(), &combined) {
            Verification::Verified => {
                stage.mark_recovered()?;
                info!(stage_id = %stage.id(), "Stage recovered");
            }
            Verification::Unverified { missing: still_missing } => {
                let failures: BTreeMap<String, String> = still_missing
                    .into_iter()
                    .map(|operation| {
                        let reason = reasons.remove(&operation).unwrap_or_else(|| {
                            if timed_out {
                                format!("recovery exceeded {:?}", self.timeout)
                            } else {
                                "no successful call after recovery".to_string()
                            }
                        });
                        (operation, reason)
                    })
                    .collect();
                error!(stage_id = %stage.id(), failures = ?failures, "Stage failed after recovery");
                stage.mark_failed(failures)?;
            }
        }
        Ok(())
    }

    async fn recover_operation(
        &self,
        operation: &str,
        ctx: &RunContext,
        recorder: &TraceRecorder,
    ) -> std::result::Result<(), String> {
        let rule = self
            .rules
            .get(operation)
            .ok_or_else(|| format!("no extraction rule for operation '{}'", operation))?;
        let arguments = rule.extract(ctx).map_err(|e| e.to_string())?;

        match self.executor.invoke(operation, arguments.clone()).await {
            Ok(call) => {
                let outcome = call.outcome.clone();
                recorder.record(call).map_err(|e| e.to_string())?;
                match outcome {
                    CallOutcome::Success { .. } => Ok(()),
                    CallOutcome::Failure { reason, .. } => Err(reason),
                }
            }
            Err(err) => {
                let rejected = OperationCall::new(
                    operation,
                    arguments,
                    CallOutcome::failure(err.to_string(), false),
                    CallOrigin::DeterministicExecutor,
                );
                recorder.record(rejected).map_err(|e| e.to_string())?;
                Err(err.to_string())
            }
        }
    }
}

impl fmt::Debug for FallbackController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut rules: Vec<&String> = self.rules.keys().collect();
        rules.sort();
        f.debug_struct("FallbackController")
            .field("rules", &rules)
            .field("timeout", &self.timeout)
            .finish()
    }
}
