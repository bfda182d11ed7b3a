//! Per-execution registry of task records, parameters and artifacts.

use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use uuid::Uuid;

use super::artifacts::{Figure, artifact_base_name, unique_name};
use super::{
    CalibDataDelta, ExecutionSnapshot, InputParameters, OutputParameter, ParameterMap, TaskKind,
    TaskRecord, TaskStatus, seconds_between,
};
use crate::error::{CalibError, CalibResult};
use crate::repository::ArtifactStore;
use crate::types::{ChipId, ProjectId, Qid};

/// Task state for one execution.
///
/// Global and system tasks live in flat lists; qubit and coupling tasks are
/// keyed by qid. Output parameters are written through to a
/// `CalibDataDelta` so later tasks in the same run can read them.
#[derive(Debug)]
pub struct TaskLifecycleStore {
    execution_id: Uuid,
    project_id: ProjectId,
    chip_id: ChipId,
    global: Vec<TaskRecord>,
    system: Vec<TaskRecord>,
    qubit: BTreeMap<Qid, Vec<TaskRecord>>,
    coupling: BTreeMap<Qid, Vec<TaskRecord>>,
    calib_data: CalibDataDelta,
    last_executed: HashMap<Qid, Uuid>,
    /// task_id → parameter name → delta value it replaced.
    output_journal: HashMap<Uuid, BTreeMap<String, Option<OutputParameter>>>,
}

impl TaskLifecycleStore {
    pub fn new(execution_id: Uuid, project_id: ProjectId, chip_id: ChipId) -> Self {
        Self {
            execution_id,
            project_id,
            chip_id,
            global: Vec::new(),
            system: Vec::new(),
            qubit: BTreeMap::new(),
            coupling: BTreeMap::new(),
            calib_data: CalibDataDelta::default(),
            last_executed: HashMap::new(),
            output_journal: HashMap::new(),
        }
    }

    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    fn container(&self, kind: TaskKind, qid: &Qid) -> &[TaskRecord] {
        let keyed = match kind {
            TaskKind::Global => return &self.global,
            TaskKind::System => return &self.system,
            TaskKind::Qubit => &self.qubit,
            TaskKind::Coupling => &self.coupling,
        };
        keyed.get(qid).map(Vec::as_slice).unwrap_or(&[])
    }

    fn container_mut(&mut self, kind: TaskKind, qid: &Qid) -> &mut Vec<TaskRecord> {
        match kind {
            TaskKind::Global => &mut self.global,
            TaskKind::System => &mut self.system,
            TaskKind::Qubit => self.qubit.entry(qid.clone()).or_default(),
            TaskKind::Coupling => self.coupling.entry(qid.clone()).or_default(),
        }
    }

    /// Flat containers hold every qid; match on it too.
    fn matches(record: &TaskRecord, name: &str, qid: &Qid) -> bool {
        record.name == name && &record.qid == qid
    }

    pub fn task(&self, name: &str, kind: TaskKind, qid: &Qid) -> Option<&TaskRecord> {
        self.container(kind, qid).iter().find(|r| Self::matches(r, name, qid))
    }

    fn task_mut(&mut self, name: &str, kind: TaskKind, qid: &Qid) -> CalibResult<&mut TaskRecord> {
        self.container_mut(kind, qid)
            .iter_mut()
            .find(|r| Self::matches(r, name, qid))
            .ok_or_else(|| CalibError::TaskNotFound {
                name: format!("{name}[{qid}]"),
            })
    }

    pub fn tasks_for(&self, kind: TaskKind, qid: &Qid) -> &[TaskRecord] {
        self.container(kind, qid)
    }

    pub fn all_tasks(&self) -> impl Iterator<Item = &TaskRecord> {
        self.global
            .iter()
            .chain(self.system.iter())
            .chain(self.qubit.values().flatten())
            .chain(self.coupling.values().flatten())
    }

    pub fn calib_data(&self) -> &CalibDataDelta {
        &self.calib_data
    }

    /// Id of the task most recently started for `qid`.
    pub fn last_executed(&self, qid: &Qid) -> Option<Uuid> {
        self.last_executed.get(qid).copied()
    }

    /// Inserts a SCHEDULED record unless one already exists; returns its id.
    ///
    /// `upstream_id` is `upstream_override` if given, else the last task
    /// started for the same qid.
    pub fn ensure_task(
        &mut self,
        name: &str,
        kind: TaskKind,
        qid: &Qid,
        upstream_override: Option<Uuid>,
    ) -> Uuid {
        if let Some(existing) = self.task(name, kind, qid) {
            return existing.task_id;
        }

        let upstream_id = upstream_override.or_else(|| self.last_executed(qid));
        let record = TaskRecord::new(name, kind, qid.clone(), upstream_id);
        let task_id = record.task_id;
        self.container_mut(kind, qid).push(record);

        tracing::debug!(task = name, %qid, %task_id, ?upstream_id, "task scheduled");
        task_id
    }

    pub fn start_task(&mut self, name: &str, kind: TaskKind, qid: &Qid) -> CalibResult<()> {
        let record = self.task_mut(name, kind, qid)?;
        record.transition(TaskStatus::Running)?;
        record.start_at = Some(Utc::now());
        let task_id = record.task_id;
        self.last_executed.insert(qid.clone(), task_id);
        Ok(())
    }

    /// Stamps `end_at` and the elapsed time (zero if the task never started).
    pub fn end_task(&mut self, name: &str, kind: TaskKind, qid: &Qid) -> CalibResult<()> {
        let record = self.task_mut(name, kind, qid)?;
        let end = Utc::now();
        record.end_at = Some(end);
        record.elapsed_time = Some(record.start_at.map(|start| seconds_between(start, end)).unwrap_or(0.0));
        Ok(())
    }

    pub fn update_status(
        &mut self,
        name: &str,
        kind: TaskKind,
        qid: &Qid,
        status: TaskStatus,
        message: impl Into<String>,
    ) -> CalibResult<()> {
        let record = self.task_mut(name, kind, qid)?;
        record.transition(status)?;
        record.message = message.into();
        Ok(())
    }

    pub fn put_input_parameters(
        &mut self,
        name: &str,
        kind: TaskKind,
        qid: &Qid,
        params: InputParameters,
    ) -> CalibResult<()> {
        let record = self.task_mut(name, kind, qid)?;
        record.input_params.extend(params);
        Ok(())
    }

    /// Merges outputs into the record and writes them through to the delta.
    ///
    /// The first write of each parameter by this task journals the delta
    /// value it replaced, so `rollback_output_parameters` can restore it.
    pub fn put_output_parameters(
        &mut self,
        name: &str,
        kind: TaskKind,
        qid: &Qid,
        params: ParameterMap,
    ) -> CalibResult<()> {
        let execution_id = self.execution_id;
        let record = self.task_mut(name, kind, qid)?;
        let task_id = record.task_id;

        let mut stamped = ParameterMap::new();
        for (key, mut param) in params {
            param.execution_id = Some(execution_id);
            param.task_id = Some(task_id);
            if let Some(old) = record.output_params.get(&key) {
                param.error = param.error.merge_into(old.error);
            }
            record.output_params.insert(key.clone(), param.clone());
            stamped.insert(key, param);
        }

        if !kind.is_keyed() {
            return Ok(());
        }

        let journal = self.output_journal.entry(task_id).or_default();
        for (key, param) in stamped {
            let replaced = self.calib_data.put(kind, qid, &key, param);
            journal.entry(key).or_insert(replaced);
        }
        Ok(())
    }

    /// Deletes every output of `(task, qid)` and restores the delta values
    /// they replaced. Returns the names that were removed.
    pub fn rollback_output_parameters(
        &mut self,
        name: &str,
        kind: TaskKind,
        qid: &Qid,
    ) -> CalibResult<Vec<String>> {
        let record = self.task_mut(name, kind, qid)?;
        let task_id = record.task_id;
        let removed: Vec<String> = std::mem::take(&mut record.output_params).into_keys().collect();

        if let Some(journal) = self.output_journal.remove(&task_id) {
            for (key, previous) in journal {
                self.calib_data.restore(kind, qid, &key, previous);
            }
        }

        if !removed.is_empty() {
            tracing::info!(task = name, %qid, params = ?removed, "rolled back output parameters");
        }
        Ok(removed)
    }

    fn artifact_taken(&self, candidate: &str) -> bool {
        self.all_tasks().any(|r| {
            r.figure_paths
                .iter()
                .chain(r.json_figure_paths.iter())
                .chain(r.raw_data_paths.iter())
                .any(|p| file_stem(p) == candidate)
        })
    }

    /// Saves each figure as `.png` and `.json` under `{qid}_{task}_{index}`
    /// (suffixed `_n` on collision) and records both paths.
    pub fn save_figures(
        &mut self,
        name: &str,
        kind: TaskKind,
        qid: &Qid,
        figures: &[Figure],
        artifacts: &dyn ArtifactStore,
    ) -> CalibResult<()> {
        let dir = format!("{}/fig", self.execution_id);
        let mut png_paths = Vec::with_capacity(figures.len());
        let mut json_paths = Vec::with_capacity(figures.len());

        for (index, figure) in figures.iter().enumerate() {
            let base = artifact_base_name(qid, name, index);
            let stem = unique_name(&base, |candidate| {
                self.artifact_taken(candidate)
                    || png_paths.iter().chain(json_paths.iter()).any(|p: &String| file_stem(p) == candidate)
                    || artifacts.exists(&format!("{dir}/{candidate}.png"))
                    || artifacts.exists(&format!("{dir}/{candidate}.json"))
            });

            let definition = serde_json::to_vec(&figure.definition).map_err(|e| {
                CalibError::storage(format!("cannot serialize figure {stem}: {e}"))
            })?;
            let png = artifacts
                .write(&format!("{dir}/{stem}.png"), &figure.rendered)
                .map_err(|e| CalibError::storage(format!("cannot write figure {stem}: {e:#}")))?;
            let json = artifacts
                .write(&format!("{dir}/{stem}.json"), &definition)
                .map_err(|e| CalibError::storage(format!("cannot write figure {stem}: {e:#}")))?;
            png_paths.push(png);
            json_paths.push(json);
        }

        let record = self.task_mut(name, kind, qid)?;
        record.figure_paths.extend(png_paths);
        record.json_figure_paths.extend(json_paths);
        Ok(())
    }

    /// Saves raw measurement data as JSON under `{qid}_{task}_raw_data_{index}`.
    pub fn save_raw_data(
        &mut self,
        name: &str,
        kind: TaskKind,
        qid: &Qid,
        raw_data: &[serde_json::Value],
        artifacts: &dyn ArtifactStore,
    ) -> CalibResult<()> {
        let dir = format!("{}/raw_data", self.execution_id);
        let mut paths: Vec<String> = Vec::with_capacity(raw_data.len());

        for (index, data) in raw_data.iter().enumerate() {
            let base = artifact_base_name(qid, &format!("{name}_raw_data"), index);
            let stem = unique_name(&base, |candidate| {
                self.artifact_taken(candidate)
                    || paths.iter().any(|p| file_stem(p) == candidate)
                    || artifacts.exists(&format!("{dir}/{candidate}.json"))
            });
            let bytes = serde_json::to_vec(data)
                .map_err(|e| CalibError::storage(format!("cannot serialize raw data {stem}: {e}")))?;
            let path = artifacts
                .write(&format!("{dir}/{stem}.json"), &bytes)
                .map_err(|e| CalibError::storage(format!("cannot write raw data {stem}: {e:#}")))?;
            paths.push(path);
        }

        let record = self.task_mut(name, kind, qid)?;
        record.raw_data_paths.extend(paths);
        Ok(())
    }

    pub fn snapshot(&self) -> ExecutionSnapshot {
        let mut status_counts = BTreeMap::new();
        for record in self.all_tasks() {
            *status_counts.entry(record.status.to_string()).or_insert(0) += 1;
        }
        ExecutionSnapshot {
            execution_id: self.execution_id,
            project_id: self.project_id.clone(),
            chip_id: self.chip_id.clone(),
            taken_at: Utc::now(),
            status_counts,
            calib_data: self.calib_data.clone(),
        }
    }
}

fn file_stem(path: &str) -> &str {
    let file = path.rsplit(['/', '\\']).next().unwrap_or(path);
    file.rsplit_once('.').map(|(stem, _)| stem).unwrap_or(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::InMemoryArtifactStore;
    use crate::types::Tristate;

    fn store() -> TaskLifecycleStore {
        TaskLifecycleStore::new(Uuid::new_v4(), ProjectId::new("proj"), ChipId::new("chip"))
    }

    fn params(pairs: &[(&str, f64)]) -> ParameterMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), OutputParameter::new(*v)))
            .collect()
    }

    #[test]
    fn ensure_task_is_idempotent() {
        let mut s = store();
        let qid = Qid::new("0");
        let first = s.ensure_task("CheckRabi", TaskKind::Qubit, &qid, None);
        let second = s.ensure_task("CheckRabi", TaskKind::Qubit, &qid, None);

        assert_eq!(first, second);
        assert_eq!(s.tasks_for(TaskKind::Qubit, &qid).len(), 1);
        assert_eq!(s.task("CheckRabi", TaskKind::Qubit, &qid).unwrap().status, TaskStatus::Scheduled);
    }

    #[test]
    fn containers_are_selected_by_kind() {
        let mut s = store();
        s.ensure_task("CheckSkew", TaskKind::System, &Qid::global(), None);
        s.ensure_task("CheckRabi", TaskKind::Qubit, &Qid::new("0"), None);
        s.ensure_task("CheckRabi", TaskKind::Qubit, &Qid::new("1"), None);
        s.ensure_task("CheckCR", TaskKind::Coupling, &Qid::new("0-1"), None);

        assert_eq!(s.tasks_for(TaskKind::System, &Qid::global()).len(), 1);
        assert_eq!(s.tasks_for(TaskKind::Qubit, &Qid::new("1")).len(), 1);
        assert_eq!(s.tasks_for(TaskKind::Coupling, &Qid::new("0-1")).len(), 1);
        assert!(s.tasks_for(TaskKind::Global, &Qid::global()).is_empty());
        assert_eq!(s.all_tasks().count(), 4);
    }

    #[test]
    fn upstream_chains_per_qid() {
        let mut s = store();
        let q0 = Qid::new("0");
        let q1 = Qid::new("1");

        let rabi = s.ensure_task("CheckRabi", TaskKind::Qubit, &q0, None);
        s.start_task("CheckRabi", TaskKind::Qubit, &q0).unwrap();

        s.ensure_task("CheckT1", TaskKind::Qubit, &q0, None);
        s.ensure_task("CheckT1", TaskKind::Qubit, &q1, None);
        let explicit = Uuid::new_v4();
        s.ensure_task("CheckT2", TaskKind::Qubit, &q0, Some(explicit));

        assert_eq!(s.task("CheckT1", TaskKind::Qubit, &q0).unwrap().upstream_id, Some(rabi));
        assert_eq!(s.task("CheckT1", TaskKind::Qubit, &q1).unwrap().upstream_id, None);
        assert_eq!(s.task("CheckT2", TaskKind::Qubit, &q0).unwrap().upstream_id, Some(explicit));
    }

    #[test]
    fn lifecycle_transitions_are_forward_only() {
        let mut s = store();
        let qid = Qid::new("0");
        s.ensure_task("CheckRabi", TaskKind::Qubit, &qid, None);
        s.start_task("CheckRabi", TaskKind::Qubit, &qid).unwrap();
        s.update_status("CheckRabi", TaskKind::Qubit, &qid, TaskStatus::Completed, "ok").unwrap();
        s.end_task("CheckRabi", TaskKind::Qubit, &qid).unwrap();

        let record = s.task("CheckRabi", TaskKind::Qubit, &qid).unwrap();
        assert!(record.elapsed_time.unwrap() >= 0.0);
        assert!(record.end_at.unwrap() >= record.start_at.unwrap());

        let err = s.start_task("CheckRabi", TaskKind::Qubit, &qid).unwrap_err();
        assert!(matches!(err, CalibError::InvalidStateTransition { .. }));
        let missing = s.start_task("Nope", TaskKind::Qubit, &qid).unwrap_err();
        assert!(matches!(missing, CalibError::TaskNotFound { .. }));
    }

    #[test]
    fn end_without_start_has_zero_elapsed() {
        let mut s = store();
        let qid = Qid::new("0");
        s.ensure_task("CheckRabi", TaskKind::Qubit, &qid, None);
        s.end_task("CheckRabi", TaskKind::Qubit, &qid).unwrap();
        assert_eq!(s.task("CheckRabi", TaskKind::Qubit, &qid).unwrap().elapsed_time, Some(0.0));
    }

    #[test]
    fn outputs_write_through_to_delta() {
        let mut s = store();
        let qid = Qid::new("0");
        s.ensure_task("CheckQubitFrequency", TaskKind::Qubit, &qid, None);
        s.put_output_parameters(
            "CheckQubitFrequency",
            TaskKind::Qubit,
            &qid,
            params(&[("qubit_frequency", 7.9)]),
        )
        .unwrap();

        let cached = s.calib_data().get(TaskKind::Qubit, &qid, "qubit_frequency").unwrap();
        assert_eq!(cached.value, 7.9);
        assert_eq!(cached.execution_id, Some(s.execution_id()));

        let record = s.task("CheckQubitFrequency", TaskKind::Qubit, &qid).unwrap();
        assert_eq!(cached.task_id, Some(record.task_id));
    }

    #[test]
    fn rollback_restores_previous_delta_values() {
        let mut s = store();
        let qid = Qid::new("0");

        s.ensure_task("CheckT1", TaskKind::Qubit, &qid, None);
        s.put_output_parameters("CheckT1", TaskKind::Qubit, &qid, params(&[("t1", 30.0)]))
            .unwrap();

        s.ensure_task("RefineT1", TaskKind::Qubit, &qid, None);
        s.put_output_parameters(
            "RefineT1",
            TaskKind::Qubit,
            &qid,
            params(&[("t1", 45.0), ("t1_fit_offset", 0.1)]),
        )
        .unwrap();
        s.put_output_parameters("RefineT1", TaskKind::Qubit, &qid, params(&[("t1", 50.0)]))
            .unwrap();

        let removed = s.rollback_output_parameters("RefineT1", TaskKind::Qubit, &qid).unwrap();
        assert_eq!(removed, vec!["t1".to_string(), "t1_fit_offset".to_string()]);

        assert!(s.task("RefineT1", TaskKind::Qubit, &qid).unwrap().output_params.is_empty());
        assert_eq!(s.calib_data().get(TaskKind::Qubit, &qid, "t1").unwrap().value, 30.0);
        assert!(s.calib_data().get(TaskKind::Qubit, &qid, "t1_fit_offset").is_none());
    }

    #[test]
    fn output_error_tristate_merges_on_record() {
        let mut s = store();
        let qid = Qid::new("0");
        s.ensure_task("CheckT1", TaskKind::Qubit, &qid, None);

        let mut first = ParameterMap::new();
        first.insert("t1".into(), OutputParameter::new(30.0).with_error(1.5));
        s.put_output_parameters("CheckT1", TaskKind::Qubit, &qid, first).unwrap();

        s.put_output_parameters("CheckT1", TaskKind::Qubit, &qid, params(&[("t1", 31.0)]))
            .unwrap();
        let record = s.task("CheckT1", TaskKind::Qubit, &qid).unwrap();
        assert_eq!(record.output_params["t1"].error, Tristate::Value(1.5));

        let mut cleared = ParameterMap::new();
        let mut p = OutputParameter::new(32.0);
        p.error = Tristate::Null;
        cleared.insert("t1".into(), p);
        s.put_output_parameters("CheckT1", TaskKind::Qubit, &qid, cleared).unwrap();
        let record = s.task("CheckT1", TaskKind::Qubit, &qid).unwrap();
        assert_eq!(record.output_params["t1"].error, Tristate::Null);
    }

    #[test]
    fn global_outputs_stay_out_of_delta() {
        let mut s = store();
        let qid = Qid::global();
        s.ensure_task("CheckSkew", TaskKind::Global, &qid, None);
        s.put_output_parameters("CheckSkew", TaskKind::Global, &qid, params(&[("skew", 1.0)]))
            .unwrap();
        assert!(s.calib_data().is_empty());
        assert_eq!(s.task("CheckSkew", TaskKind::Global, &qid).unwrap().output_params.len(), 1);
    }

    #[test]
    fn figures_saved_twice_with_unique_names() {
        let mut s = store();
        let artifacts = InMemoryArtifactStore::new();
        let qid = Qid::new("3");
        s.ensure_task("CheckRabi", TaskKind::Qubit, &qid, None);

        let fig = Figure::new(vec![0x89, 0x50], serde_json::json!({"data": []}));
        s.save_figures("CheckRabi", TaskKind::Qubit, &qid, &[fig.clone(), fig.clone()], &artifacts)
            .unwrap();
        s.save_figures("CheckRabi", TaskKind::Qubit, &qid, &[fig], &artifacts).unwrap();

        let record = s.task("CheckRabi", TaskKind::Qubit, &qid).unwrap();
        let stems: Vec<&str> = record.figure_paths.iter().map(|p| file_stem(p)).collect();
        assert_eq!(stems, vec!["3_CheckRabi_0", "3_CheckRabi_1", "3_CheckRabi_0_1"]);
        assert_eq!(record.json_figure_paths.len(), 3);
        assert!(record.json_figure_paths[2].ends_with("3_CheckRabi_0_1.json"));
        assert_eq!(artifacts.len(), 6);
    }

    #[test]
    fn raw_data_saved_as_json() {
        let mut s = store();
        let artifacts = InMemoryArtifactStore::new();
        let qid = Qid::new("3");
        s.ensure_task("CheckRabi", TaskKind::Qubit, &qid, None);
        s.save_raw_data(
            "CheckRabi",
            TaskKind::Qubit,
            &qid,
            &[serde_json::json!([1.0, 2.0])],
            &artifacts,
        )
        .unwrap();

        let record = s.task("CheckRabi", TaskKind::Qubit, &qid).unwrap();
        assert_eq!(record.raw_data_paths.len(), 1);
        assert_eq!(file_stem(&record.raw_data_paths[0]), "3_CheckRabi_raw_data_0");
    }

    #[test]
    fn snapshot_counts_statuses() {
        let mut s = store();
        s.ensure_task("A", TaskKind::Qubit, &Qid::new("0"), None);
        s.ensure_task("A", TaskKind::Qubit, &Qid::new("1"), None);
        s.start_task("A", TaskKind::Qubit, &Qid::new("1")).unwrap();

        let snap = s.snapshot();
        assert_eq!(snap.status_counts.get("SCHEDULED"), Some(&1));
        assert_eq!(snap.status_counts.get("RUNNING"), Some(&1));
        assert_eq!(snap.project_id.as_str(), "proj");
    }

    #[test]
    fn file_stem_strips_dir_and_extension() {
        assert_eq!(file_stem("exec/fig/3_CheckRabi_0.png"), "3_CheckRabi_0");
        assert_eq!(file_stem("plain"), "plain");
    }
}
