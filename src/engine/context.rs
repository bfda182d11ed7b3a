use tokio::sync::Mutex;
use uuid::Uuid;

use crate::lifecycle::{TaskKind, TaskLifecycleStore};
use crate::task::TaskContext;
use crate::types::{ChipId, ProjectId, Qid};

/// State shared by every unit of one execution.
///
/// Passed by reference into the executor; the store sits behind an async
/// mutex so concurrent batches only contend on short critical sections.
#[derive(Debug)]
pub struct ExecutionContext {
    pub execution_id: Uuid,
    pub project_id: ProjectId,
    pub chip_id: ChipId,
    pub store: Mutex<TaskLifecycleStore>,
}

impl ExecutionContext {
    pub fn new(execution_id: Uuid, project_id: ProjectId, chip_id: ChipId) -> Self {
        let store = TaskLifecycleStore::new(execution_id, project_id.clone(), chip_id.clone());
        Self {
            execution_id,
            project_id,
            chip_id,
            store: Mutex::new(store),
        }
    }

    /// The hook view for `qid`, carrying values produced so far in this run.
    pub async fn task_context(&self, kind: TaskKind, qid: &Qid) -> TaskContext {
        let calib_data = self
            .store
            .lock()
            .await
            .calib_data()
            .params_for(kind, qid)
            .cloned()
            .unwrap_or_default();
        TaskContext {
            execution_id: self.execution_id,
            chip_id: self.chip_id.clone(),
            qid: qid.clone(),
            calib_data,
        }
    }
}
