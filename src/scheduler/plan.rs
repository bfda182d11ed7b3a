//! Schedule tree walked by the orchestrator.
//!
//! `Serial` children run one after another, `Parallel` children run
//! concurrently behind a barrier, and a `Batch` is one dispatch unit whose
//! qids run in sequence. Nodes carry an explicit `"type"` discriminant on the
//! wire.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::{CalibError, CalibResult};
use crate::scheduler::box_conflict::{Stage, SynchronizedStep};
use crate::scheduler::coupling::CouplingStage;
use crate::types::Qid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "items", rename_all = "snake_case")]
pub enum ScheduleNode {
    Serial(Vec<ScheduleNode>),
    Parallel(Vec<ScheduleNode>),
    Batch(Vec<Qid>),
}

impl ScheduleNode {
    /// Stages in order, MUX groups in parallel, qubits of a MUX in one batch.
    pub fn from_stages(stages: &[Stage]) -> Self {
        Self::Serial(
            stages
                .iter()
                .map(|stage| {
                    Self::Parallel(
                        stage
                            .parallel_groups
                            .iter()
                            .map(|group| Self::Batch(group.clone()))
                            .collect(),
                    )
                })
                .collect(),
        )
    }

    /// Steps in order, every qid of a step in its own concurrent batch.
    pub fn from_steps(steps: &[SynchronizedStep]) -> Self {
        Self::Serial(
            steps
                .iter()
                .map(|step| {
                    Self::Parallel(
                        step.parallel_qids
                            .iter()
                            .map(|qid| Self::Batch(vec![qid.clone()]))
                            .collect(),
                    )
                })
                .collect(),
        )
    }

    pub fn from_coupling_stages(stages: &[CouplingStage]) -> Self {
        Self::Serial(
            stages
                .iter()
                .flat_map(|stage| stage.rounds.iter())
                .map(|round| {
                    Self::Parallel(round.iter().map(|c| Self::Batch(vec![c.clone()])).collect())
                })
                .collect(),
        )
    }

    /// Every qid in the tree, depth-first.
    pub fn qids(&self) -> Vec<Qid> {
        let mut out = Vec::new();
        self.collect_qids(&mut out);
        out
    }

    fn collect_qids(&self, out: &mut Vec<Qid>) {
        match self {
            Self::Serial(children) | Self::Parallel(children) => {
                for child in children {
                    child.collect_qids(out);
                }
            }
            Self::Batch(qids) => out.extend(qids.iter().cloned()),
        }
    }

    pub fn batch_count(&self) -> usize {
        match self {
            Self::Serial(children) | Self::Parallel(children) => {
                children.iter().map(Self::batch_count).sum()
            }
            Self::Batch(_) => 1,
        }
    }

    /// Rejects empty trees and any qid scheduled twice. Results are keyed by
    /// qid, so a qid may appear in only one batch.
    pub fn validate(&self) -> CalibResult<()> {
        let qids = self.qids();
        if qids.is_empty() {
            return Err(CalibError::scheduling("schedule tree contains no qids"));
        }

        let mut seen = BTreeSet::new();
        for qid in qids {
            if !seen.insert(qid.clone()) {
                return Err(CalibError::scheduling(format!(
                    "qid {qid} appears more than once in the schedule tree"
                )));
            }
        }
        Ok(())
    }
}
