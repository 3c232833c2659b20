use serde::{Deserialize, Serialize};

use super::stage::{RequirementSet, Stage};
use crate::trace::Trace;

/// Verdict on whether a trace satisfies a stage's requirements
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verification {
    Verified,
    Unverified { missing: RequirementSet },
}

impl Verification {
    pub fn is_verified(&self) -> bool {
        matches!(self, Verification::Verified)
    }

    pub fn missing(&self) -> Option<&RequirementSet> {
        match self {
            Verification::Verified => None,
            Verification::Unverified { missing } => Some(missing),
        }
    }
}

/// Compares what a stage required with what its trace shows succeeded
///
/// A call that ended in `Failure` never satisfies a requirement.
pub struct Validator;

impl Validator {
    pub fn validate(stage: &Stage, trace: &Trace) -> Verification {
        Self::check(stage.requirements(), trace)
    }

    pub fn check(requirements: &RequirementSet, trace: &Trace) -> Verification {
        let satisfied = trace.succeeded_operations();
        let missing: RequirementSet = requirements.difference(&satisfied).cloned().collect();
        if missing.is_empty() {
            Verification::Verified
        } else {
            Verification::Unverified { missing }
        }
    }
}
