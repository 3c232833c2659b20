use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use super::context::RunId;
use super::stage::{AttemptFailure, RequirementSet, StageStatus, StatusChange};
use crate::trace::Trace;

/// Terminal account of one stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    pub id: String,
    pub delegate: String,
    pub output_key: String,
    pub status: StageStatus,
    pub requirements: RequirementSet,
    pub result: Option<Value>,
    /// Requirements the delegate alone left unsatisfied
    pub missing_after_delegate: RequirementSet,
    /// Operation name to why it could not be satisfied
    pub failure_reasons: BTreeMap<String, String>,
    pub attempt_failure: Option<AttemptFailure>,
    /// Set when the result could not be written to the session
    pub store_error: Option<String>,
    pub delegate_trace: Option<Trace>,
    pub recovery_trace: Option<Trace>,
    /// Operations with a successful call in the final trace
    pub satisfied: BTreeSet<String>,
    pub history: Vec<StatusChange>,
    pub elapsed_ms: u64,
}

impl StageReport {
    pub fn final_trace(&self) -> Trace {
        let delegate = self
            .delegate_trace
            .clone()
            .unwrap_or_else(|| Trace::empty(&self.id));
        match &self.recovery_trace {
            Some(recovery) => delegate.chain(recovery),
            None => delegate,
        }
    }

    /// Whether the engine had to perform operations itself
    pub fn used_fallback(&self) -> bool {
        self.recovery_trace.is_some()
    }
}

/// Outcome of a pipeline run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: RunId,
    pub pipeline: String,
    /// Session contents at the end of the run, by output key
    pub outputs: BTreeMap<String, Value>,
    pub stages: BTreeMap<String, StageReport>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_ms: u64,
}

impl RunResult {
    pub fn status(&self, stage_id: &str) -> Option<StageStatus> {
        self.stages.get(stage_id).map(|s| s.status)
    }

    pub fn output(&self, key: &str) -> Option<&Value> {
        self.outputs.get(key)
    }

    pub fn stage(&self, stage_id: &str) -> Option<&StageReport> {
        self.stages.get(stage_id)
    }

    /// True when no stage ended `Failed`
    pub fn is_fully_satisfied(&self) -> bool {
        self.stages.values().all(|s| s.status != StageStatus::Failed)
    }

    /// Ids of stages that ended in `status`
    pub fn stages_with(&self, status: StageStatus) -> Vec<&str> {
        self.stages
            .values()
            .filter(|s| s.status == status)
            .map(|s| s.id.as_str())
            .collect()
    }

    pub fn statuses(&self) -> BTreeMap<&str, StageStatus> {
        self.stages
            .iter()
            .map(|(id, s)| (id.as_str(), s.status))
            .collect()
    }
}
