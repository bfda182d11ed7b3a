// In-memory collaborators for tests and dry runs

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{ArtifactStore, HistoryRecorder, NoteStore, ParameterStore};
use crate::lifecycle::{ExecutionSnapshot, ParameterMap, TaskKind, TaskRecord};
use crate::types::{ChipId, Qid};

/// Keeps every recorded task state and chip snapshot in order.
#[derive(Clone, Default)]
pub struct InMemoryHistoryRecorder {
    tasks: Arc<Mutex<Vec<TaskRecord>>>,
    snapshots: Arc<Mutex<Vec<ExecutionSnapshot>>>,
}

impl InMemoryHistoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn tasks(&self) -> Vec<TaskRecord> {
        self.tasks.lock().await.clone()
    }

    pub async fn snapshots(&self) -> Vec<ExecutionSnapshot> {
        self.snapshots.lock().await.clone()
    }
}

#[async_trait]
impl HistoryRecorder for InMemoryHistoryRecorder {
    async fn record_task(&self, task: &TaskRecord, _snapshot: &ExecutionSnapshot) -> Result<()> {
        self.tasks.lock().await.push(task.clone());
        Ok(())
    }

    async fn record_chip_snapshot(&self, snapshot: &ExecutionSnapshot) -> Result<()> {
        self.snapshots.lock().await.push(snapshot.clone());
        Ok(())
    }
}

type ParamKey = (ChipId, TaskKind, Qid);

#[derive(Clone, Default)]
pub struct InMemoryParameterStore {
    params: Arc<Mutex<HashMap<ParamKey, ParameterMap>>>,
}

impl InMemoryParameterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ParameterStore for InMemoryParameterStore {
    async fn upsert(&self, chip_id: &ChipId, kind: TaskKind, qid: &Qid, params: &ParameterMap) -> Result<()> {
        let mut store = self.params.lock().await;
        let stored = store.entry((chip_id.clone(), kind, qid.clone())).or_default();
        for (name, param) in params {
            let mut param = param.clone();
            if let Some(old) = stored.get(name) {
                param.error = param.error.merge_into(old.error);
            }
            stored.insert(name.clone(), param);
        }
        Ok(())
    }

    async fn get(&self, chip_id: &ChipId, kind: TaskKind, qid: &Qid) -> Result<ParameterMap> {
        let store = self.params.lock().await;
        Ok(store
            .get(&(chip_id.clone(), kind, qid.clone()))
            .cloned()
            .unwrap_or_default())
    }
}

/// A note written after a successful task.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationNote {
    pub execution_id: Uuid,
    pub task: String,
    pub qid: Qid,
    pub params: ParameterMap,
}

#[derive(Clone, Default)]
pub struct InMemoryNoteStore {
    notes: Arc<Mutex<Vec<CalibrationNote>>>,
}

impl InMemoryNoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn notes(&self) -> Vec<CalibrationNote> {
        self.notes.lock().await.clone()
    }
}

#[async_trait]
impl NoteStore for InMemoryNoteStore {
    async fn write_calibration_note(
        &self,
        execution_id: Uuid,
        task: &str,
        qid: &Qid,
        params: &ParameterMap,
    ) -> Result<()> {
        self.notes.lock().await.push(CalibrationNote {
            execution_id,
            task: task.to_string(),
            qid: qid.clone(),
            params: params.clone(),
        });
        Ok(())
    }
}

/// Artifact store backed by a map. Uses a std mutex since the trait is sync.
#[derive(Clone, Default)]
pub struct InMemoryArtifactStore {
    files: Arc<StdMutex<BTreeMap<String, Vec<u8>>>>,
}

impl InMemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().ok()?.get(path).cloned()
    }

    pub fn len(&self) -> usize {
        self.files.lock().map(|f| f.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ArtifactStore for InMemoryArtifactStore {
    fn exists(&self, path: &str) -> bool {
        self.files.lock().map(|f| f.contains_key(path)).unwrap_or(false)
    }

    fn write(&self, path: &str, bytes: &[u8]) -> Result<String> {
        let mut files = self.files.lock().map_err(|_| anyhow!("artifact store poisoned"))?;
        files.insert(path.to_string(), bytes.to_vec());
        Ok(path.to_string())
    }
}
