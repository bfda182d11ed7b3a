use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::lifecycle::{ExecutionStatus, StageResult, TaskStatus};
use crate::types::Qid;

/// How one task ended for one qid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub message: String,
}

/// Per-qid result of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QidOutcome {
    pub success: bool,
    /// First failure message, empty on success.
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub tasks: Vec<TaskOutcome>,
}

impl QidOutcome {
    /// Outcome for a qid whose dispatch unit never reported back.
    pub fn aborted(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            tasks: Vec::new(),
        }
    }
}

/// Results of one dispatch unit, keyed by qid.
pub type BatchOutcome = BTreeMap<Qid, QidOutcome>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub execution_id: Uuid,
    pub status: ExecutionStatus,
    pub results: BTreeMap<Qid, QidOutcome>,
    #[serde(default)]
    pub stage_results: Vec<StageResult>,
}

impl ExecutionReport {
    pub fn failed_qids(&self) -> Vec<&Qid> {
        self.results
            .iter()
            .filter(|(_, outcome)| !outcome.success)
            .map(|(qid, _)| qid)
            .collect()
    }
}
