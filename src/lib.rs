// Core modules
pub mod config;
pub mod error;
pub mod types;

// Scheduling and execution
pub mod engine;
pub mod lifecycle;
pub mod lock;
pub mod orchestrator;
pub mod repository;
pub mod scheduler;
pub mod task;

// Re-export key types and functions
pub use config::{OrchestratorConfig, WiringConfig, WiringEntry, resolve_wiring_path};
pub use error::{CalibError, CalibResult, ExecutionError, ValidationError};
pub use types::{ChipId, ProjectId, Qid, TaskName, Tristate};

pub use engine::{ExecutionContext, TaskExecutionResult, TaskExecutor, TaskRunner, TokioTaskRunner};
pub use lifecycle::{
    CalibDataDelta, ExecutionRecord, ExecutionStatus, OutputParameter, TaskKind, TaskLifecycleStore,
    TaskRecord, TaskStatus,
};
pub use lock::{ExecutionLock, ExecutionLockGuard, InMemoryExecutionLock};
pub use orchestrator::{ExecutionOrchestrator, ExecutionReport, QidOutcome, RunRequest, ScheduleMode, Targets};
pub use scheduler::{
    BoxConflictScheduler, BoxType, CouplingScheduler, OrderingKind, ScheduleNode, Stage, SynchronizedStep,
    WiringTopology,
};
pub use task::{Backend, Task, TaskRegistry};

use std::sync::Arc;

use repository::{FsArtifactStore, InMemoryHistoryRecorder, InMemoryNoteStore, InMemoryParameterStore};

/// Convenience function to build an orchestrator for local runs.
///
/// Loads the wiring from `wiring`, writes artifacts under
/// `config.artifact_root` and keeps history, parameters and notes in memory.
pub fn create_local_orchestrator(
    wiring: &WiringConfig,
    config: OrchestratorConfig,
    registry: TaskRegistry,
    backend: Arc<dyn Backend>,
) -> CalibResult<ExecutionOrchestrator> {
    let topology = Arc::new(WiringTopology::from_config(wiring, config.strict_wiring)?);

    let executor = TaskExecutor::new(
        Arc::new(InMemoryHistoryRecorder::new()),
        Arc::new(InMemoryParameterStore::new()),
        Arc::new(InMemoryNoteStore::new()),
        Arc::new(FsArtifactStore::new(config.artifact_root.clone())),
    );

    Ok(ExecutionOrchestrator::new(config, topology, registry, backend, executor))
}
