//! Calibration run orchestration.
//!
//! A run resolves its targets and tasks, takes the project lock, builds a
//! `ScheduleNode` tree and walks it: `Serial` children in order, `Parallel`
//! children concurrently behind a barrier, and each `Batch` as one unit on the
//! `TaskRunner`, bounded by a semaphore. The lock is released exactly once,
//! whatever happens in between.

mod report;


pub use report::{BatchOutcome, ExecutionReport, QidOutcome, TaskOutcome};

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore};
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::engine::{ExecutionContext, TaskExecutor, TaskRunner, TokioTaskRunner, UnitFuture, UnitHandle};
use crate::error::{CalibError, CalibResult, ExecutionError};
use crate::lifecycle::{ExecutionRecord, StageResult, TaskKind, TaskStatus};
use crate::lock::{ExecutionLock, ExecutionLockGuard, InMemoryExecutionLock};
use crate::scheduler::{BoxConflictScheduler, CouplingScheduler, ScheduleNode, WiringTopology};
use crate::task::{Backend, Task, TaskRegistry};
use crate::types::{ProjectId, Qid};

/// What a run calibrates.
#[derive(Debug, Clone, PartialEq)]
pub enum Targets {
    Qubits(Vec<Qid>),
    /// Every qubit of each listed MUX.
    Muxes(Vec<u32>),
    /// Coupling ids, `"a-b"`.
    Couplings(Vec<Qid>),
}

/// How qubit targets are turned into a schedule. Coupling targets always use
/// the coupling scheduler unless a tree is given.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ScheduleMode {
    /// Box stages in sequence, MUX groups in parallel.
    #[default]
    Grouped,
    /// Globally barriered steps, one qubit per MUX per step.
    Synchronized,
    /// Caller-supplied tree.
    Tree(ScheduleNode),
}

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub project_id: ProjectId,
    pub name: String,
    pub targets: Targets,
    /// Run in this order for every target qid.
    pub task_names: Vec<String>,
    pub mode: ScheduleMode,
    /// Overrides the configured concurrency cap.
    pub max_parallel_ops: Option<usize>,
}

impl RunRequest {
    pub fn new(
        project_id: impl Into<ProjectId>,
        name: impl Into<String>,
        targets: Targets,
        task_names: Vec<String>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            name: name.into(),
            targets,
            task_names,
            mode: ScheduleMode::default(),
            max_parallel_ops: None,
        }
    }

    pub fn with_mode(mut self, mode: ScheduleMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_max_parallel_ops(mut self, max_parallel_ops: usize) -> Self {
        self.max_parallel_ops = Some(max_parallel_ops);
        self
    }
}

/// Everything a dispatch unit needs, cloned into each spawned future.
#[derive(Clone)]
struct Dispatch {
    ctx: Arc<ExecutionContext>,
    executor: Arc<TaskExecutor>,
    backend: Arc<dyn Backend>,
    runner: Arc<dyn TaskRunner>,
    tasks: Arc<Vec<Arc<dyn Task>>>,
    permits: Arc<Semaphore>,
    record: Arc<Mutex<ExecutionRecord>>,
}

impl Dispatch {
    /// Submits `node` as one runner unit.
    fn spawn(&self, node: &ScheduleNode) -> UnitHandle {
        match node {
            ScheduleNode::Batch(qids) => self.runner.submit(Box::pin(self.clone().run_batch(qids.clone()))),
            _ => self.runner.submit(self.walk(node)),
        }
    }

    fn walk(&self, node: &ScheduleNode) -> UnitFuture {
        let dispatch = self.clone();
        let node = node.clone();
        Box::pin(async move {
            let mut out = BatchOutcome::new();
            match &node {
                ScheduleNode::Batch(qids) => {
                    out.extend(collect(qids.clone(), dispatch.spawn(&node)).await);
                }
                ScheduleNode::Serial(children) => {
                    for child in children {
                        out.extend(dispatch.walk(child).await);
                    }
                }
                ScheduleNode::Parallel(children) => {
                    let pending: Vec<(Vec<Qid>, UnitHandle)> =
                        children.iter().map(|c| (c.qids(), dispatch.spawn(c))).collect();
                    for (qids, handle) in pending {
                        out.extend(collect(qids, handle).await);
                    }
                }
            }
            out
        })
    }

    async fn run_batch(self, qids: Vec<Qid>) -> BatchOutcome {
        let mut out = BatchOutcome::new();
        let _permit = match self.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                for qid in qids {
                    out.insert(qid, QidOutcome::aborted("dispatch semaphore closed"));
                }
                return out;
            }
        };

        for qid in qids {
            let outcome = self.run_qid(&qid).await;
            out.insert(qid, outcome);
        }
        out
    }

    /// Runs every task for `qid` in order. After a failure the rest are SKIPPED.
    async fn run_qid(&self, qid: &Qid) -> QidOutcome {
        let mut outcome = QidOutcome {
            success: true,
            ..QidOutcome::default()
        };
        let mut failed_task: Option<String> = None;

        for task in self.tasks.iter() {
            let name = task.name();

            if let Some(failed) = &failed_task {
                let message = format!("skipped: {failed} failed");
                let mut store = self.ctx.store.lock().await;
                store.ensure_task(name, task.kind(), qid, None);
                if let Err(e) = store.update_status(name, task.kind(), qid, TaskStatus::Skipped, message.clone()) {
                    tracing::warn!(execution_id = %self.ctx.execution_id, task = name, %qid, error = %e, "cannot mark task skipped");
                }
                outcome.tasks.push(TaskOutcome {
                    task: name.to_string(),
                    status: TaskStatus::Skipped,
                    message,
                });
                continue;
            }

            match self.executor.execute(&self.ctx, task.as_ref(), self.backend.as_ref(), qid).await {
                Ok(result) => {
                    if result.status == TaskStatus::Completed {
                        self.record
                            .lock()
                            .await
                            .merge_outputs(task.kind(), qid, &result.output_parameters);
                    }
                    outcome.tasks.push(TaskOutcome {
                        task: result.task,
                        status: result.status,
                        message: result.message,
                    });
                }
                Err(e) => {
                    let message = e.to_string();
                    outcome.success = false;
                    outcome.message = message.clone();
                    outcome.tasks.push(TaskOutcome {
                        task: name.to_string(),
                        status: TaskStatus::Failed,
                        message,
                    });
                    failed_task = Some(name.to_string());
                }
            }
        }
        outcome
    }
}

/// Waits for a unit; if it died, every qid it owned is reported as aborted.
async fn collect(qids: Vec<Qid>, handle: UnitHandle) -> BatchOutcome {
    match handle.wait().await {
        Ok(out) => out,
        Err(e) => {
            tracing::error!(error = %e, qids = ?qids, "dispatch unit aborted");
            let message = e.to_string();
            qids.into_iter()
                .map(|qid| (qid, QidOutcome::aborted(message.clone())))
                .collect()
        }
    }
}

/// A schedule tree with a label for each top-level phase.
struct Plan {
    tree: ScheduleNode,
    labels: Vec<String>,
}

impl Plan {
    /// Top-level phases: the children of a root `Serial`, else the root itself.
    fn phases(&self) -> Vec<&ScheduleNode> {
        match &self.tree {
            ScheduleNode::Serial(children) => children.iter().collect(),
            other => vec![other],
        }
    }
}

pub struct ExecutionOrchestrator {
    config: OrchestratorConfig,
    topology: Arc<WiringTopology>,
    registry: TaskRegistry,
    backend: Arc<dyn Backend>,
    executor: Arc<TaskExecutor>,
    lock: Arc<dyn ExecutionLock>,
    runner: Arc<dyn TaskRunner>,
    records: Mutex<Vec<ExecutionRecord>>,
}

impl ExecutionOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        topology: Arc<WiringTopology>,
        registry: TaskRegistry,
        backend: Arc<dyn Backend>,
        executor: TaskExecutor,
    ) -> Self {
        let executor = executor.with_default_timeout(config.task_timeout());
        Self {
            config,
            topology,
            registry,
            backend,
            executor: Arc::new(executor),
            lock: Arc::new(InMemoryExecutionLock::new()),
            runner: Arc::new(TokioTaskRunner::new()),
            records: Mutex::new(Vec::new()),
        }
    }

    /// Share a lock table with other orchestrators.
    pub fn with_lock(mut self, lock: Arc<dyn ExecutionLock>) -> Self {
        self.lock = lock;
        self
    }

    pub fn with_runner(mut self, runner: Arc<dyn TaskRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn topology(&self) -> &WiringTopology {
        &self.topology
    }

    /// Finalized execution records, oldest first.
    pub async fn executions(&self) -> Vec<ExecutionRecord> {
        self.records.lock().await.clone()
    }

    pub async fn execution(&self, execution_id: Uuid) -> Option<ExecutionRecord> {
        self.records
            .lock()
            .await
            .iter()
            .find(|r| r.execution_id == execution_id)
            .cloned()
    }

    pub async fn run(&self, request: RunRequest) -> CalibResult<ExecutionReport> {
        let tasks = self.resolve_tasks(&request)?;
        let (setup, per_target): (Vec<_>, Vec<_>) = tasks.into_iter().partition(|t| !t.kind().is_keyed());
        let targets = self.resolve_targets(&request.targets)?;

        let guard = ExecutionLockGuard::acquire(self.lock.clone(), request.project_id.clone())?;

        let execution_id = Uuid::new_v4();
        let mut initial = ExecutionRecord::new(
            execution_id,
            request.project_id.clone(),
            self.topology.chip_id().clone(),
            request.name.clone(),
        );
        initial.start();
        let shared = Arc::new(Mutex::new(initial));
        tracing::info!(
            %execution_id,
            project_id = %request.project_id,
            name = %request.name,
            targets = targets.len(),
            tasks = setup.len() + per_target.len(),
            "execution started"
        );

        let result = self
            .execute(&request, &shared, &targets, setup, per_target)
            .await;

        let mut record = shared.lock().await;

        let finalized = match &result {
            Ok(results) => {
                let failed = results.values().filter(|o| !o.success).count();
                if failed == 0 {
                    record.complete()
                } else {
                    record.fail(format!("{failed} of {} qids failed", results.len()))
                }
            }
            Err(e) => record.fail(e.to_string()),
        };
        if let Err(e) = finalized {
            tracing::error!(%execution_id, error = %e, "cannot finalize execution record");
        }
        record.lock_held = false;

        let status = record.status;
        let stage_results = record.stage_results.clone();
        tracing::info!(%execution_id, status = ?status, elapsed = ?record.elapsed_time, "execution finished");
        self.records.lock().await.push(record.clone());
        drop(record);

        if let Err(e) = guard.release() {
            tracing::error!(%execution_id, error = %e, "failed to release execution lock");
        }

        let results = result?;
        Ok(ExecutionReport {
            execution_id,
            status,
            results,
            stage_results,
        })
    }

    fn resolve_tasks(&self, request: &RunRequest) -> CalibResult<Vec<Arc<dyn Task>>> {
        if request.task_names.is_empty() {
            return Err(CalibError::config("run request names no tasks"));
        }
        let mut seen = HashSet::new();
        if let Some(repeated) = request.task_names.iter().find(|name| !seen.insert(name.as_str())) {
            return Err(CalibError::config(format!("task {repeated} is named more than once")));
        }
        let tasks = self.registry.resolve(request.task_names.as_slice())?;

        let expected = match request.targets {
            Targets::Couplings(_) => TaskKind::Coupling,
            Targets::Qubits(_) | Targets::Muxes(_) => TaskKind::Qubit,
        };
        for task in &tasks {
            if task.kind().is_keyed() && task.kind() != expected {
                return Err(CalibError::config(format!(
                    "task {} is a {} task but the run targets {} ids",
                    task.name(),
                    task.kind(),
                    expected
                )));
            }
        }
        Ok(tasks)
    }

    fn resolve_targets(&self, targets: &Targets) -> CalibResult<Vec<Qid>> {
        let qids = match targets {
            Targets::Qubits(qids) | Targets::Couplings(qids) => qids.clone(),
            Targets::Muxes(muxes) => {
                let mut qids = Vec::new();
                for &mux in muxes {
                    let owned = self.topology.qids_of_mux(mux);
                    if owned.is_empty() {
                        return Err(CalibError::scheduling(format!("MUX {mux} is not in the wiring")));
                    }
                    qids.extend(owned);
                }
                qids
            }
        };
        if qids.is_empty() {
            return Err(CalibError::scheduling("run request has no targets"));
        }
        Ok(qids)
    }

    fn plan(&self, request: &RunRequest, targets: &[Qid]) -> CalibResult<Plan> {
        let plan = match (&request.mode, &request.targets) {
            (ScheduleMode::Tree(tree), _) => {
                let labels = match tree {
                    ScheduleNode::Serial(children) => (0..children.len()).map(|i| format!("phase {i}")).collect(),
                    _ => vec!["phase 0".to_string()],
                };
                Plan {
                    tree: tree.clone(),
                    labels,
                }
            }
            (_, Targets::Couplings(_)) => {
                let stages = CouplingScheduler::new(self.topology.clone())
                    .with_max_parallel_ops(request.max_parallel_ops.or(self.config.max_parallel_ops))
                    .generate(targets)?;
                let labels = stages
                    .iter()
                    .flat_map(|s| (0..s.rounds.len()).map(move |i| format!("{} round {i}", s.box_type)))
                    .collect();
                Plan {
                    tree: ScheduleNode::from_coupling_stages(&stages),
                    labels,
                }
            }
            (ScheduleMode::Synchronized, _) => {
                let steps = self.box_scheduler().generate_synchronized(targets)?;
                let labels = steps
                    .iter()
                    .map(|s| format!("step {} ({})", s.index, s.box_type))
                    .collect();
                Plan {
                    tree: ScheduleNode::from_steps(&steps),
                    labels,
                }
            }
            (ScheduleMode::Grouped, _) => {
                let stages = self.box_scheduler().generate(targets)?;
                let labels = stages.iter().map(|s| format!("{} stage", s.box_type)).collect();
                Plan {
                    tree: ScheduleNode::from_stages(&stages),
                    labels,
                }
            }
        };
        plan.tree.validate()?;
        Ok(plan)
    }

    fn box_scheduler(&self) -> BoxConflictScheduler {
        BoxConflictScheduler::new(self.topology.clone()).with_ordering(self.config.ordering.strategy())
    }

    async fn execute(
        &self,
        request: &RunRequest,
        record: &Arc<Mutex<ExecutionRecord>>,
        targets: &[Qid],
        setup: Vec<Arc<dyn Task>>,
        per_target: Vec<Arc<dyn Task>>,
    ) -> CalibResult<BTreeMap<Qid, QidOutcome>> {
        let plan = self.plan(request, targets)?;
        let limit = request
            .max_parallel_ops
            .or(self.config.max_parallel_ops)
            .unwrap_or_else(|| plan.tree.batch_count())
            .clamp(1, Semaphore::MAX_PERMITS);

        let ctx = {
            let record = record.lock().await;
            Arc::new(ExecutionContext::new(
                record.execution_id,
                record.project_id.clone(),
                record.chip_id.clone(),
            ))
        };
        let execution_id = ctx.execution_id;
        let mut results = BTreeMap::new();

        if !setup.is_empty() {
            let dispatch = self.dispatch(&ctx, record, setup, limit);
            let outcome = dispatch.run_qid(&Qid::global()).await;
            if !outcome.success {
                return Err(ExecutionError::Aborted {
                    message: format!("setup failed, schedule not started: {}", outcome.message),
                }
                .into());
            }
            results.insert(Qid::global(), outcome);
        }

        let dispatch = self.dispatch(&ctx, record, per_target, limit);
        tracing::debug!(
            %execution_id,
            batches = plan.tree.batch_count(),
            limit,
            "walking schedule"
        );

        for (index, phase) in plan.phases().into_iter().enumerate() {
            let outcomes = dispatch.walk(phase).await;
            let qids = phase.qids();
            let succeeded = qids.iter().filter(|q| outcomes.get(*q).is_some_and(|o| o.success)).count();
            let label = plan
                .labels
                .get(index)
                .cloned()
                .unwrap_or_else(|| format!("phase {index}"));
            tracing::info!(%execution_id, phase = %label, succeeded, failed = qids.len() - succeeded, "phase finished");
            record.lock().await.stage_results.push(StageResult {
                label,
                failed: qids.len() - succeeded,
                succeeded,
                qids,
            });
            results.extend(outcomes);
        }

        Ok(results)
    }

    fn dispatch(
        &self,
        ctx: &Arc<ExecutionContext>,
        record: &Arc<Mutex<ExecutionRecord>>,
        tasks: Vec<Arc<dyn Task>>,
        limit: usize,
    ) -> Dispatch {
        Dispatch {
            ctx: ctx.clone(),
            executor: self.executor.clone(),
            backend: self.backend.clone(),
            runner: self.runner.clone(),
            tasks: Arc::new(tasks),
            permits: Arc::new(Semaphore::new(limit)),
            record: record.clone(),
        }
    }
}
