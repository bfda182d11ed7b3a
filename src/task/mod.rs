//! Calibration task contract.
//!
//! A `Task` is three hooks (`preprocess`, `run`, `postprocess`) plus the
//! metadata the executor needs to schedule and validate it. Tasks talk to
//! hardware through a `Backend`.

pub mod registry;

pub use registry::TaskRegistry;

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

use crate::error::ValidationError;
use crate::lifecycle::{Figure, InputParameters, ParameterMap, TaskKind};
use crate::types::{ChipId, Qid};

/// Minimum R² accepted when a task does not override it.
pub const DEFAULT_R2_THRESHOLD: f64 = 0.7;

/// Largest accepted value for fidelity-like outputs.
pub const FIDELITY_LIMIT: f64 = 1.0 + 1e-6;

/// Hardware (or simulator) a task runs against.
#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    /// Push freshly calibrated values into the backend's own configuration.
    async fn write_back(&self, _qid: &Qid, _params: &ParameterMap) -> Result<()> {
        Ok(())
    }
}

/// Read-only view handed to task hooks.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub execution_id: Uuid,
    pub chip_id: ChipId,
    pub qid: Qid,
    /// Values produced earlier in this run for the same qid.
    pub calib_data: ParameterMap,
}

#[derive(Debug, Clone, Default)]
pub struct PreProcessResult {
    pub input_parameters: InputParameters,
}

#[derive(Debug, Clone, Default)]
pub struct RunResult {
    /// Fit quality per qid. A qid without an entry is not gated.
    pub r2: BTreeMap<Qid, f64>,
    pub raw: serde_json::Value,
}

impl RunResult {
    pub fn with_r2(mut self, qid: Qid, r2: f64) -> Self {
        self.r2.insert(qid, r2);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct PostProcessResult {
    pub output_parameters: ParameterMap,
    pub figures: Vec<Figure>,
    pub raw_data: Vec<serde_json::Value>,
}

#[async_trait]
pub trait Task: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> TaskKind;

    /// Backend this task requires, `None` if any backend will do.
    fn backend(&self) -> Option<&str> {
        None
    }

    fn r2_threshold(&self) -> f64 {
        DEFAULT_R2_THRESHOLD
    }

    /// Overrides the orchestrator's default task timeout.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    fn is_qubit_task(&self) -> bool {
        self.kind() == TaskKind::Qubit
    }

    fn is_coupling_task(&self) -> bool {
        self.kind() == TaskKind::Coupling
    }

    async fn preprocess(&self, _backend: &dyn Backend, _ctx: &TaskContext) -> Result<Option<PreProcessResult>> {
        Ok(None)
    }

    /// `Ok(None)` means the task had nothing to measure.
    async fn run(&self, backend: &dyn Backend, ctx: &TaskContext) -> Result<Option<RunResult>>;

    async fn postprocess(
        &self,
        backend: &dyn Backend,
        ctx: &TaskContext,
        run: &RunResult,
    ) -> Result<PostProcessResult>;
}

/// Result of the quality gates applied after `postprocess`.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationOutcome {
    Passed,
    Rejected(ValidationError),
}

impl ValidationOutcome {
    pub fn is_passed(&self) -> bool {
        matches!(self, Self::Passed)
    }
}

/// Applies the fidelity gate, then the R² gate.
pub fn validate_outputs(
    qid: &Qid,
    r2_threshold: f64,
    run: &RunResult,
    outputs: &ParameterMap,
) -> ValidationOutcome {
    let over_limit = outputs
        .iter()
        .find(|(name, param)| name.contains("fidelity") && param.value > FIDELITY_LIMIT);
    if let Some((name, param)) = over_limit {
        return ValidationOutcome::Rejected(ValidationError::Fidelity {
            qid: qid.to_string(),
            parameter: name.clone(),
            value: param.value,
        });
    }

    match run.r2.get(qid) {
        Some(&r2) if r2 < r2_threshold => ValidationOutcome::Rejected(ValidationError::R2 {
            qid: qid.to_string(),
            r2,
            threshold: r2_threshold,
        }),
        _ => ValidationOutcome::Passed,
    }
}
