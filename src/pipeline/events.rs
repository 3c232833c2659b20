use async_broadcast::{InactiveReceiver, Receiver, Sender};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::trace;

use super::context::RunId;
use super::stage::{RequirementSet, StageStatus};
use crate::trace::OperationCall;

/// Lifecycle notifications published while a pipeline runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        run_id: RunId,
        pipeline: String,
        stages: usize,
        at: DateTime<Utc>,
    },
    StageStarted {
        run_id: RunId,
        stage_id: String,
        at: DateTime<Utc>,
    },
    OperationRecorded {
        run_id: RunId,
        stage_id: String,
        call: OperationCall,
    },
    StageUnverified {
        run_id: RunId,
        stage_id: String,
        missing: RequirementSet,
    },
    StageFinished {
        run_id: RunId,
        stage_id: String,
        status: StageStatus,
        elapsed_ms: u64,
    },
    RunFinished {
        run_id: RunId,
        pipeline: String,
        statuses: BTreeMap<String, StageStatus>,
        elapsed_ms: u64,
    },
}

impl RunEvent {
    pub fn run_id(&self) -> &RunId {
        match self {
            RunEvent::RunStarted { run_id, .. }
            | RunEvent::StageStarted { run_id, .. }
            | RunEvent::OperationRecorded { run_id, .. }
            | RunEvent::StageUnverified { run_id, .. }
            | RunEvent::StageFinished { run_id, .. }
            | RunEvent::RunFinished { run_id, .. } => run_id,
        }
    }
}

/// Broadcast channel for run events
///
/// Slow subscribers lose the oldest events; publishing never blocks.
#[derive(Clone)]
pub struct EventBus {
    sender: Sender<RunEvent>,
    _idle: InactiveReceiver<RunEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (mut sender, receiver) = async_broadcast::broadcast(capacity.max(1));
        sender.set_overflow(true);
        sender.set_await_active(false);
        Self {
            sender,
            _idle: receiver.deactivate(),
        }
    }

    /// Receive every event published from now on
    pub fn subscribe(&self) -> Receiver<RunEvent> {
        self.sender.new_receiver()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn emit(&self, event: RunEvent) {
        if self.sender.receiver_count() == 0 {
            return;
        }
        if let Err(e) = self.sender.try_broadcast(event) {
            trace!(error = %e, "Run event dropped");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
