//! Collaborators the executor writes results through.
//!
//! - `HistoryRecorder`: task and chip snapshots
//! - `ParameterStore`: calibrated values per chip and qid
//! - `NoteStore`: calibration notes consumed by later runs
//! - `ArtifactStore`: figure and raw data files

pub mod fs;
pub mod memory;

pub use fs::FsArtifactStore;
pub use memory::{
    InMemoryArtifactStore, InMemoryHistoryRecorder, InMemoryNoteStore, InMemoryParameterStore,
};

use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

use crate::lifecycle::{ExecutionSnapshot, ParameterMap, TaskKind, TaskRecord};
use crate::types::{ChipId, Qid};

#[async_trait]
pub trait HistoryRecorder: Send + Sync {
    /// Record the current state of one task alongside its execution.
    async fn record_task(&self, task: &TaskRecord, snapshot: &ExecutionSnapshot) -> Result<()>;

    /// Record a chip-wide snapshot after a task finishes.
    async fn record_chip_snapshot(&self, snapshot: &ExecutionSnapshot) -> Result<()>;
}

#[async_trait]
pub trait ParameterStore: Send + Sync {
    /// Merge `params` into the stored values for `(chip, kind, qid)`.
    ///
    /// A parameter's `error` follows `Tristate` rules: absent keeps the
    /// stored error, null clears it.
    async fn upsert(&self, chip_id: &ChipId, kind: TaskKind, qid: &Qid, params: &ParameterMap) -> Result<()>;

    async fn get(&self, chip_id: &ChipId, kind: TaskKind, qid: &Qid) -> Result<ParameterMap>;
}

#[async_trait]
pub trait NoteStore: Send + Sync {
    async fn write_calibration_note(
        &self,
        execution_id: Uuid,
        task: &str,
        qid: &Qid,
        params: &ParameterMap,
    ) -> Result<()>;
}

/// Blob storage for figures and raw data. Paths are relative, `/`-separated.
pub trait ArtifactStore: Send + Sync {
    fn exists(&self, path: &str) -> bool;

    /// Write `bytes` at `path` and return the stored location.
    fn write(&self, path: &str, bytes: &[u8]) -> Result<String>;
}
