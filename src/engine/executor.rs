//! Runs one task against one qid.
//!
//! The executor owns the task state machine: it moves the record through
//! SCHEDULED → RUNNING → COMPLETED | FAILED, applies the quality gates,
//! rolls back outputs on any failure, and writes accepted results through
//! to the backend, the note store and finally the parameter store.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use super::ExecutionContext;
use crate::error::{CalibError, CalibResult, ExecutionError};
use crate::lifecycle::{ParameterMap, TaskKind, TaskStatus};
use crate::repository::{ArtifactStore, HistoryRecorder, NoteStore, ParameterStore};
use crate::task::{Backend, Task, ValidationOutcome, validate_outputs};
use crate::types::Qid;

/// Message stored on a task that completed without measuring anything.
pub const NO_RUN_RESULT: &str = "no run result";

const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(600);

/// Final state of one `(task, qid)` execution.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskExecutionResult {
    pub task_id: Uuid,
    pub task: String,
    pub qid: Qid,
    pub status: TaskStatus,
    pub message: String,
    pub output_parameters: ParameterMap,
}

pub struct TaskExecutor {
    history: Arc<dyn HistoryRecorder>,
    parameters: Arc<dyn ParameterStore>,
    notes: Arc<dyn NoteStore>,
    artifacts: Arc<dyn ArtifactStore>,
    default_timeout: Duration,
}

fn failed(task: &str, qid: &Qid, err: anyhow::Error) -> CalibError {
    ExecutionError::Failed {
        task: task.to_string(),
        qid: qid.to_string(),
        message: format!("{err:#}"),
    }
    .into()
}

impl TaskExecutor {
    pub fn new(
        history: Arc<dyn HistoryRecorder>,
        parameters: Arc<dyn ParameterStore>,
        notes: Arc<dyn NoteStore>,
        artifacts: Arc<dyn ArtifactStore>,
    ) -> Self {
        Self {
            history,
            parameters,
            notes,
            artifacts,
            default_timeout: DEFAULT_TASK_TIMEOUT,
        }
    }

    /// Timeout for tasks that do not set their own.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub async fn execute(
        &self,
        ctx: &ExecutionContext,
        task: &dyn Task,
        backend: &dyn Backend,
        qid: &Qid,
    ) -> CalibResult<TaskExecutionResult> {
        let name = task.name();
        let kind = task.kind();

        {
            let mut store = ctx.store.lock().await;
            store.ensure_task(name, kind, qid, None);
            store.start_task(name, kind, qid)?;
        }
        tracing::info!(execution_id = %ctx.execution_id, task = name, %qid, "task started");
        self.record_history(ctx, name, kind, qid).await;

        let timeout = task.timeout().unwrap_or(self.default_timeout);
        let result = match tokio::time::timeout(timeout, self.run_hooks(ctx, task, backend, qid)).await {
            Ok(result) => result,
            Err(_) => Err(ExecutionError::Timeout {
                task: name.to_string(),
                qid: qid.to_string(),
                timeout,
            }
            .into()),
        };

        let outcome = self.settle(ctx, name, kind, qid, result).await;
        self.finish(ctx, name, kind, qid).await;
        outcome
    }

    /// Steps 3 to 6: hooks, quality gates and write-back.
    async fn run_hooks(
        &self,
        ctx: &ExecutionContext,
        task: &dyn Task,
        backend: &dyn Backend,
        qid: &Qid,
    ) -> CalibResult<String> {
        let name = task.name();
        let kind = task.kind();

        if let Some(required) = task.backend() {
            if required != backend.name() {
                return Err(failed(
                    name,
                    qid,
                    anyhow::anyhow!("requires backend `{required}`, got `{}`", backend.name()),
                ));
            }
        }

        let hook_ctx = ctx.task_context(kind, qid).await;

        match task.preprocess(backend, &hook_ctx).await {
            Ok(Some(pre)) => {
                ctx.store
                    .lock()
                    .await
                    .put_input_parameters(name, kind, qid, pre.input_parameters)?;
                self.record_history(ctx, name, kind, qid).await;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(execution_id = %ctx.execution_id, task = name, %qid, error = %format!("{e:#}"), "preprocess failed, continuing");
            }
        }

        let run = match task.run(backend, &hook_ctx).await.map_err(|e| failed(name, qid, e))? {
            Some(run) => run,
            None => return Ok(NO_RUN_RESULT.to_string()),
        };

        let post = task
            .postprocess(backend, &hook_ctx, &run)
            .await
            .map_err(|e| failed(name, qid, e))?;

        {
            let mut store = ctx.store.lock().await;
            store.put_output_parameters(name, kind, qid, post.output_parameters.clone())?;
        }

        if let ValidationOutcome::Rejected(err) =
            validate_outputs(qid, task.r2_threshold(), &run, &post.output_parameters)
        {
            let mut store = ctx.store.lock().await;
            store.rollback_output_parameters(name, kind, qid)?;
            return Err(err.into());
        }

        let outputs = {
            let mut store = ctx.store.lock().await;
            store.save_figures(name, kind, qid, &post.figures, self.artifacts.as_ref())?;
            store.save_raw_data(name, kind, qid, &post.raw_data, self.artifacts.as_ref())?;
            store
                .task(name, kind, qid)
                .map(|record| record.output_params.clone())
                .unwrap_or_default()
        };

        if outputs.is_empty() {
            return Ok(String::new());
        }

        backend
            .write_back(qid, &outputs)
            .await
            .map_err(|e| failed(name, qid, e.context("backend write-back failed")))?;
        self.notes
            .write_calibration_note(ctx.execution_id, name, qid, &outputs)
            .await
            .map_err(|e| CalibError::storage(format!("calibration note failed: {e:#}")))?;
        // Last fallible step: nothing after it can fail the task.
        if kind.is_keyed() {
            self.parameters
                .upsert(&ctx.chip_id, kind, qid, &outputs)
                .await
                .map_err(|e| CalibError::storage(format!("parameter upsert failed: {e:#}")))?;
        }

        Ok(String::new())
    }

    /// Step 7: record COMPLETED, or roll back and record FAILED.
    async fn settle(
        &self,
        ctx: &ExecutionContext,
        name: &str,
        kind: TaskKind,
        qid: &Qid,
        result: CalibResult<String>,
    ) -> CalibResult<TaskExecutionResult> {
        let mut store = ctx.store.lock().await;
        match result {
            Ok(message) => {
                store.update_status(name, kind, qid, TaskStatus::Completed, message)?;
                let record = store.task(name, kind, qid).ok_or_else(|| CalibError::TaskNotFound {
                    name: format!("{name}[{qid}]"),
                })?;
                tracing::info!(execution_id = %ctx.execution_id, task = name, %qid, outputs = record.output_params.len(), "task completed");
                Ok(TaskExecutionResult {
                    task_id: record.task_id,
                    task: record.name.clone(),
                    qid: record.qid.clone(),
                    status: record.status,
                    message: record.message.clone(),
                    output_parameters: record.output_params.clone(),
                })
            }
            Err(err) => {
                if let Err(e) = store.rollback_output_parameters(name, kind, qid) {
                    tracing::error!(execution_id = %ctx.execution_id, task = name, %qid, error = %e, "rollback failed");
                }
                if let Err(e) = store.update_status(name, kind, qid, TaskStatus::Failed, err.to_string()) {
                    tracing::error!(execution_id = %ctx.execution_id, task = name, %qid, error = %e, "cannot mark task failed");
                }
                if err.is_validation() {
                    tracing::warn!(execution_id = %ctx.execution_id, task = name, %qid, error = %err, "task rejected by validation");
                } else {
                    tracing::error!(execution_id = %ctx.execution_id, task = name, %qid, error = %err, "task failed");
                }
                Err(err)
            }
        }
    }

    /// Step 8: always runs. Collaborator errors are logged only.
    async fn finish(&self, ctx: &ExecutionContext, name: &str, kind: TaskKind, qid: &Qid) {
        {
            let mut store = ctx.store.lock().await;
            if let Err(e) = store.end_task(name, kind, qid) {
                tracing::warn!(execution_id = %ctx.execution_id, task = name, %qid, error = %e, "cannot stamp task end");
            }
        }
        self.record_history(ctx, name, kind, qid).await;

        let snapshot = ctx.store.lock().await.snapshot();
        if let Err(e) = self.history.record_chip_snapshot(&snapshot).await {
            tracing::warn!(execution_id = %ctx.execution_id, task = name, %qid, error = %format!("{e:#}"), "chip snapshot failed");
        }
    }

    async fn record_history(&self, ctx: &ExecutionContext, name: &str, kind: TaskKind, qid: &Qid) {
        let (record, snapshot) = {
            let store = ctx.store.lock().await;
            (store.task(name, kind, qid).cloned(), store.snapshot())
        };
        let Some(record) = record else {
            return;
        };
        if let Err(e) = self.history.record_task(&record, &snapshot).await {
            tracing::warn!(execution_id = %ctx.execution_id, task = name, %qid, error = %format!("{e:#}"), "history record failed");
        }
    }
}
