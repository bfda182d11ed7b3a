//! Task and execution records for a calibration run.
//!
//! - `TaskRecord` / `TaskStatus`: per `(task, qid)` state machine
//! - `CalibDataDelta`: parameters produced during the run, keyed by qid
//! - `ExecutionRecord`: the canonical record finalized once per run
//! - `TaskLifecycleStore`: the per-execution registry that mutates them

mod artifacts;
mod store;

pub use artifacts::{Figure, artifact_base_name, unique_name};
pub use store::TaskLifecycleStore;

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CalibError, CalibResult};
use crate::types::{ChipId, ProjectId, Qid, Tristate};

/// What a task calibrates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Qubit,
    Coupling,
    Global,
    System,
}

impl TaskKind {
    /// Qubit and coupling tasks are tracked per qid; the rest are flat lists.
    pub const fn is_keyed(self) -> bool {
        matches!(self, Self::Qubit | Self::Coupling)
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Qubit => write!(f, "qubit"),
            Self::Coupling => write!(f, "coupling"),
            Self::Global => write!(f, "global"),
            Self::System => write!(f, "system"),
        }
    }
}

/// Task state machine.
///
/// ```text
/// SCHEDULED ──► RUNNING ──► COMPLETED | FAILED | SKIPPED
///     │                          ▲
///     └──────────────────────────┘
/// ```
///
/// Transitions only move right; terminal states never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Scheduled,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl TaskStatus {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    const fn rank(self) -> u8 {
        match self {
            Self::Scheduled => 0,
            Self::Running => 1,
            Self::Completed | Self::Failed | Self::Skipped => 2,
        }
    }

    pub const fn can_transition_to(self, next: TaskStatus) -> bool {
        next.rank() > self.rank()
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scheduled => write!(f, "SCHEDULED"),
            Self::Running => write!(f, "RUNNING"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Skipped => write!(f, "SKIPPED"),
        }
    }
}

/// A calibrated value produced by a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputParameter {
    pub value: f64,
    #[serde(default)]
    pub unit: String,
    /// Fit uncertainty; `Null` clears a previously stored error.
    #[serde(default, skip_serializing_if = "Tristate::is_absent")]
    pub error: Tristate<f64>,
    #[serde(default)]
    pub description: String,
    pub calibrated_at: DateTime<Utc>,
    /// Stamped by the store when the parameter is persisted.
    #[serde(default)]
    pub execution_id: Option<Uuid>,
    #[serde(default)]
    pub task_id: Option<Uuid>,
}

impl OutputParameter {
    pub fn new(value: f64) -> Self {
        Self {
            value,
            unit: String::new(),
            error: Tristate::Absent,
            description: String::new(),
            calibrated_at: Utc::now(),
            execution_id: None,
            task_id: None,
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    pub fn with_error(mut self, error: f64) -> Self {
        self.error = Tristate::Value(error);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

pub type ParameterMap = BTreeMap<String, OutputParameter>;
pub type InputParameters = BTreeMap<String, serde_json::Value>;

/// Per `(task, qid)` state within one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: Uuid,
    pub name: String,
    pub kind: TaskKind,
    pub qid: Qid,
    pub status: TaskStatus,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub input_params: InputParameters,
    #[serde(default)]
    pub output_params: ParameterMap,
    pub upstream_id: Option<Uuid>,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    /// Seconds between `start_at` and `end_at`.
    pub elapsed_time: Option<f64>,
    #[serde(default)]
    pub figure_paths: Vec<String>,
    #[serde(default)]
    pub json_figure_paths: Vec<String>,
    #[serde(default)]
    pub raw_data_paths: Vec<String>,
}

impl TaskRecord {
    pub fn new(name: &str, kind: TaskKind, qid: Qid, upstream_id: Option<Uuid>) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            name: name.to_string(),
            kind,
            qid,
            status: TaskStatus::Scheduled,
            message: String::new(),
            input_params: InputParameters::new(),
            output_params: ParameterMap::new(),
            upstream_id,
            start_at: None,
            end_at: None,
            elapsed_time: None,
            figure_paths: Vec::new(),
            json_figure_paths: Vec::new(),
            raw_data_paths: Vec::new(),
        }
    }

    /// Moves to `next`, refusing backward moves and changes to terminal states.
    pub fn transition(&mut self, next: TaskStatus) -> CalibResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(CalibError::InvalidStateTransition {
                task: format!("{}[{}]", self.name, self.qid),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }
}

/// Parameters produced during a run, owned by the orchestrator until the
/// execution record is finalized.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CalibDataDelta {
    #[serde(default)]
    pub qubit: BTreeMap<Qid, ParameterMap>,
    #[serde(default)]
    pub coupling: BTreeMap<Qid, ParameterMap>,
}

impl CalibDataDelta {
    fn section(&self, kind: TaskKind) -> Option<&BTreeMap<Qid, ParameterMap>> {
        match kind {
            TaskKind::Qubit => Some(&self.qubit),
            TaskKind::Coupling => Some(&self.coupling),
            TaskKind::Global | TaskKind::System => None,
        }
    }

    fn section_mut(&mut self, kind: TaskKind) -> Option<&mut BTreeMap<Qid, ParameterMap>> {
        match kind {
            TaskKind::Qubit => Some(&mut self.qubit),
            TaskKind::Coupling => Some(&mut self.coupling),
            TaskKind::Global | TaskKind::System => None,
        }
    }

    pub fn get(&self, kind: TaskKind, qid: &Qid, name: &str) -> Option<&OutputParameter> {
        self.section(kind)?.get(qid)?.get(name)
    }

    pub fn params_for(&self, kind: TaskKind, qid: &Qid) -> Option<&ParameterMap> {
        self.section(kind)?.get(qid)
    }

    /// Sets a value and returns the one it replaced.
    pub fn put(
        &mut self,
        kind: TaskKind,
        qid: &Qid,
        name: &str,
        param: OutputParameter,
    ) -> Option<OutputParameter> {
        let section = self.section_mut(kind)?;
        let params = section.entry(qid.clone()).or_default();
        let mut param = param;
        if let Some(old) = params.get(name) {
            param.error = param.error.merge_into(old.error);
        }
        params.insert(name.to_string(), param)
    }

    /// Puts back exactly `previous`, or removes the entry when it is `None`.
    pub(crate) fn restore(
        &mut self,
        kind: TaskKind,
        qid: &Qid,
        name: &str,
        previous: Option<OutputParameter>,
    ) {
        match previous {
            Some(param) => {
                if let Some(section) = self.section_mut(kind) {
                    section.entry(qid.clone()).or_default().insert(name.to_string(), param);
                }
            }
            None => {
                self.remove(kind, qid, name);
            }
        }
    }

    pub fn remove(&mut self, kind: TaskKind, qid: &Qid, name: &str) -> Option<OutputParameter> {
        let section = self.section_mut(kind)?;
        let params = section.get_mut(qid)?;
        let removed = params.remove(name);
        if params.is_empty() {
            section.remove(qid);
        }
        removed
    }

    /// Overlays `other` on top of this delta.
    pub fn merge(&mut self, other: &CalibDataDelta) {
        for (qid, params) in &other.qubit {
            self.qubit.entry(qid.clone()).or_default().extend(params.clone());
        }
        for (qid, params) in &other.coupling {
            self.coupling.entry(qid.clone()).or_default().extend(params.clone());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.qubit.is_empty() && self.coupling.is_empty()
    }
}

/// Point-in-time view of an execution, handed to history sinks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSnapshot {
    pub execution_id: Uuid,
    pub project_id: ProjectId,
    pub chip_id: ChipId,
    pub taken_at: DateTime<Utc>,
    /// Task count per status name.
    pub status_counts: BTreeMap<String, usize>,
    pub calib_data: CalibDataDelta,
}

/// Run-level status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Scheduled,
    Running,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub const fn is_final(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Outcome of one top-level phase of the schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub label: String,
    pub qids: Vec<Qid>,
    pub succeeded: usize,
    pub failed: usize,
}

/// Canonical record of one calibration run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: Uuid,
    pub project_id: ProjectId,
    pub chip_id: ChipId,
    pub name: String,
    pub status: ExecutionStatus,
    pub calib_data: CalibDataDelta,
    pub stage_results: Vec<StageResult>,
    pub lock_held: bool,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    pub elapsed_time: Option<f64>,
    #[serde(default)]
    pub message: String,
}

impl ExecutionRecord {
    pub fn new(execution_id: Uuid, project_id: ProjectId, chip_id: ChipId, name: impl Into<String>) -> Self {
        Self {
            execution_id,
            project_id,
            chip_id,
            name: name.into(),
            status: ExecutionStatus::Scheduled,
            calib_data: CalibDataDelta::default(),
            stage_results: Vec::new(),
            lock_held: false,
            start_at: None,
            end_at: None,
            elapsed_time: None,
            message: String::new(),
        }
    }

    /// Folds one task's accepted outputs into `calib_data`.
    pub fn merge_outputs(&mut self, kind: TaskKind, qid: &Qid, params: &ParameterMap) {
        for (name, param) in params {
            self.calib_data.put(kind, qid, name, param.clone());
        }
    }

    pub fn start(&mut self) {
        self.status = ExecutionStatus::Running;
        self.lock_held = true;
        self.start_at = Some(Utc::now());
    }

    fn finalize(&mut self, status: ExecutionStatus, message: String) -> CalibResult<()> {
        if self.status.is_final() {
            return Err(CalibError::AlreadyFinalized {
                execution_id: self.execution_id.to_string(),
            });
        }
        let end = Utc::now();
        self.status = status;
        self.message = message;
        self.end_at = Some(end);
        self.elapsed_time = self.start_at.map(|start| seconds_between(start, end));
        Ok(())
    }

    pub fn complete(&mut self) -> CalibResult<()> {
        self.finalize(ExecutionStatus::Completed, String::new())
    }

    pub fn fail(&mut self, message: impl Into<String>) -> CalibResult<()> {
        self.finalize(ExecutionStatus::Failed, message.into())
    }
}

pub(crate) fn seconds_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    (end - start).num_microseconds().unwrap_or(0) as f64 / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_moves_forward_only() {
        use TaskStatus::*;
        assert!(Scheduled.can_transition_to(Running));
        assert!(Scheduled.can_transition_to(Skipped));
        assert!(Running.can_transition_to(Failed));
        assert!(!Running.can_transition_to(Scheduled));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Running.can_transition_to(Running));
        assert!(Failed.is_terminal());
        assert!(!Running.is_terminal());
    }

    #[test]
    fn record_transition_rejects_backwards() {
        let mut record = TaskRecord::new("CheckRabi", TaskKind::Qubit, Qid::new("0"), None);
        record.transition(TaskStatus::Running).unwrap();
        record.transition(TaskStatus::Completed).unwrap();
        let err = record.transition(TaskStatus::Running).unwrap_err();
        assert!(matches!(err, CalibError::InvalidStateTransition { .. }));
        assert_eq!(record.status, TaskStatus::Completed);
    }

    #[test]
    fn delta_put_returns_replaced_and_keeps_error() {
        let mut delta = CalibDataDelta::default();
        let qid = Qid::new("0");
        assert!(delta
            .put(TaskKind::Qubit, &qid, "t1", OutputParameter::new(10.0).with_error(0.5))
            .is_none());

        let old = delta
            .put(TaskKind::Qubit, &qid, "t1", OutputParameter::new(12.0))
            .unwrap();
        assert_eq!(old.value, 10.0);

        let current = delta.get(TaskKind::Qubit, &qid, "t1").unwrap();
        assert_eq!(current.value, 12.0);
        assert_eq!(current.error, Tristate::Value(0.5));

        assert!(delta.put(TaskKind::Global, &qid, "x", OutputParameter::new(1.0)).is_none());
        assert!(delta.get(TaskKind::Global, &qid, "x").is_none());
    }

    #[test]
    fn delta_remove_prunes_empty_qids() {
        let mut delta = CalibDataDelta::default();
        let qid = Qid::new("0-1");
        delta.put(TaskKind::Coupling, &qid, "cr_amp", OutputParameter::new(0.3));
        assert!(delta.remove(TaskKind::Coupling, &qid, "cr_amp").is_some());
        assert!(delta.is_empty());
    }

    #[test]
    fn execution_record_finalizes_once() {
        let mut record = ExecutionRecord::new(
            Uuid::new_v4(),
            ProjectId::new("proj"),
            ChipId::new("chip"),
            "daily",
        );
        record.start();
        assert_eq!(record.status, ExecutionStatus::Running);
        assert!(record.lock_held);

        record.complete().unwrap();
        assert!(record.elapsed_time.is_some());
        let err = record.fail("late").unwrap_err();
        assert!(matches!(err, CalibError::AlreadyFinalized { .. }));
        assert_eq!(record.status, ExecutionStatus::Completed);
    }

    #[test]
    fn merge_outputs_ignores_global_tasks() {
        let mut record = ExecutionRecord::new(
            Uuid::new_v4(),
            ProjectId::new("proj"),
            ChipId::new("chip"),
            "daily",
        );
        let mut params = ParameterMap::new();
        params.insert("t1".to_string(), OutputParameter::new(30.0));

        record.merge_outputs(TaskKind::Qubit, &Qid::new("0"), &params);
        record.merge_outputs(TaskKind::Global, &Qid::global(), &params);

        assert_eq!(record.calib_data.get(TaskKind::Qubit, &Qid::new("0"), "t1").unwrap().value, 30.0);
        assert_eq!(record.calib_data.qubit.len(), 1);
        assert!(record.calib_data.coupling.is_empty());
    }
}
