//! Error taxonomy for calibration orchestration.
//!
//! Quality-gate failures (`ValidationError`) and execution failures
//! (`ExecutionError`) are scoped to a single `(task, qid)` pair. A
//! `LockConflict` aborts a run before any state is created.

use std::time::Duration;

use crate::types::ProjectId;

/// The result type used throughout the crate.
pub type CalibResult<T> = std::result::Result<T, CalibError>;

/// Quality-gate failures raised after `postprocess`.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    /// The fit quality for a qid fell below the task's threshold.
    #[error("R² value {r2:.4} for qid {qid} is below threshold {threshold:.4}")]
    R2 {
        qid: String,
        r2: f64,
        threshold: f64,
    },

    /// A probability-like output exceeded 1.0.
    #[error("fidelity parameter {parameter} for qid {qid} is {value} (> 1.0)")]
    Fidelity {
        qid: String,
        parameter: String,
        value: f64,
    },
}

/// Failures while running a task's hooks.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    /// `run` or `postprocess` returned an error.
    #[error("task {task} failed for qid {qid}: {message}")]
    Failed {
        task: String,
        qid: String,
        message: String,
    },

    /// The task exceeded its timeout.
    #[error("task {task} timed out for qid {qid} after {timeout:?}")]
    Timeout {
        task: String,
        qid: String,
        timeout: Duration,
    },

    /// A dispatched unit panicked or was cancelled by the runner.
    #[error("execution unit aborted: {message}")]
    Aborted { message: String },
}

/// Errors that can occur in calibration orchestration.
#[derive(Debug, thiserror::Error)]
pub enum CalibError {
    /// Missing or malformed wiring / orchestrator configuration.
    #[error("configuration error: {message}")]
    Config { message: String },

    /// The scheduler could not produce a schedule.
    #[error("scheduling error: {message}")]
    Scheduling { message: String },

    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    /// Another calibration run holds the project lock.
    #[error("execution already in progress for project {project_id}")]
    LockConflict { project_id: ProjectId },

    /// A task status moved backwards or out of a terminal state.
    #[error("invalid state transition: {from} -> {to} ({task})")]
    InvalidStateTransition {
        task: String,
        from: String,
        to: String,
    },

    /// No task record (or registered task) exists under this name.
    #[error("task not found: {name}")]
    TaskNotFound { name: String },

    /// The execution record was already completed or failed.
    #[error("execution {execution_id} is already finalized")]
    AlreadyFinalized { execution_id: String },

    /// An artifact or repository operation failed.
    #[error("storage error: {message}")]
    Storage {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl CalibError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn scheduling(message: impl Into<String>) -> Self {
        Self::Scheduling {
            message: message.into(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Returns true for quality-gate failures.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}

impl From<anyhow::Error> for CalibError {
    fn from(err: anyhow::Error) -> Self {
        Self::Storage {
            message: err.to_string(),
            source: Some(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn r2_error_display() {
        let err = CalibError::from(ValidationError::R2 {
            qid: "3".into(),
            r2: 0.42,
            threshold: 0.7,
        });
        let msg = err.to_string();
        assert!(msg.contains("0.4200"));
        assert!(msg.contains("qid 3"));
        assert!(err.is_validation());
    }

    #[test]
    fn lock_conflict_display() {
        let err = CalibError::LockConflict {
            project_id: ProjectId::new("proj-a"),
        };
        assert!(err.to_string().contains("proj-a"));
        assert!(!err.is_validation());
    }

    #[test]
    fn timeout_is_execution_error() {
        let err: CalibError = ExecutionError::Timeout {
            task: "CheckRabi".into(),
            qid: "0".into(),
            timeout: Duration::from_secs(5),
        }
        .into();
        assert!(matches!(err, CalibError::Execution(ExecutionError::Timeout { .. })));
        assert!(err.to_string().contains("timed out"));
    }
}
