//! In-memory model database.
//!
//! Every capability method locks the whole state once, validates, then
//! mutates: the lock scope is the transaction scope. A store opened from a
//! snapshot file writes the file back on every run, task and checkpoint
//! change, so a later process can resume a run this one left behind.
//!
//! Output values are written back with the next checkpoint or status
//! change. Output of sub-values past the checkpoint is recomputed on
//! restart, so losing it with the process loses nothing.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use msim_types::messages::SubValueState;
use msim_types::{
    MetadataCatalog, ModelStatus, ParamValues, ParameterSource, RunId, RunStatusCode, SetId,
    TaskId, TaskRunId,
};

use crate::aggregate::aggregate;
use crate::capability::{
    NewRun, NewRunRequest, OutputWriter, ParameterReader, ParameterWriter, RunStore,
};
use crate::digest;
use crate::error::{Result, StoreError};
use crate::lineage::resolve_parameters;
use crate::records::{
    AccumulatorRow, ExpressionRow, RunOutput, RunRecord, Task, TaskRunItem, TaskRunRecord,
    Workset, WorksetValue,
};
use crate::snapshot;

/// Longest generated run name.
const MAX_RUN_NAME: usize = 255;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoreState {
    catalog: MetadataCatalog,
    /// Shared id sequence of runs, working sets, tasks and task runs.
    last_id: u32,
    default_set_id: Option<SetId>,
    worksets: BTreeMap<SetId, Workset>,
    tasks: BTreeMap<TaskId, Task>,
    task_runs: BTreeMap<TaskRunId, TaskRunRecord>,
    runs: BTreeMap<RunId, RunRecord>,
    outputs: BTreeMap<RunId, RunOutput>,
}

impl StoreState {
    fn next_id(&mut self) -> u32 {
        self.last_id += 1;
        self.last_id
    }

    fn run(&self, run_id: RunId) -> Result<&RunRecord> {
        self.runs.get(&run_id).ok_or_else(|| StoreError::NotFound(format!("run {run_id}")))
    }

    fn output(&self, run_id: RunId) -> Result<&RunOutput> {
        self.outputs.get(&run_id).ok_or_else(|| StoreError::NotFound(format!("run {run_id}")))
    }

    fn find_workset(&self, set_id: Option<SetId>, set_name: Option<&str>) -> Result<&Workset> {
        let found = match (set_id, set_name) {
            (Some(id), _) => self.worksets.get(&id),
            (None, Some(name)) => self.worksets.values().find(|w| w.name == name),
            (None, None) => self.default_set_id.and_then(|id| self.worksets.get(&id)),
        };
        let ws = found.ok_or_else(|| {
            StoreError::NotFound(format!(
                "working set (id: {set_id:?}, name: {set_name:?}) or model default working set"
            ))
        })?;
        if ws.model_id != self.catalog.model_id() {
            return Err(StoreError::Validation(format!(
                "working set {} belongs to model {}, expected {}",
                ws.name,
                ws.model_id,
                self.catalog.model_id()
            )));
        }
        Ok(ws)
    }
}

// ── MemoryStore ───────────────────────────────────────────────────────────────

pub struct MemoryStore {
    state: Mutex<StoreState>,
    path: Option<PathBuf>,
}

impl MemoryStore {
    /// Empty database of one model, not backed by a file.
    pub fn new(catalog: MetadataCatalog) -> Self {
        let state = StoreState {
            catalog,
            last_id: 100,
            default_set_id: None,
            worksets: BTreeMap::new(),
            tasks: BTreeMap::new(),
            task_runs: BTreeMap::new(),
            runs: BTreeMap::new(),
            outputs: BTreeMap::new(),
        };
        Self { state: Mutex::new(state), path: None }
    }

    /// Empty database of one model, written to `path` on every change.
    pub fn create(path: &Path, catalog: MetadataCatalog) -> Result<Self> {
        let mut store = Self::new(catalog);
        store.path = Some(path.to_path_buf());
        store.commit(&*store.lock()?)?;
        info!(path = %path.display(), "model database created");
        Ok(store)
    }

    /// Open a database snapshot; changes are written back to `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let state: StoreState = snapshot::read_snapshot(path)?;
        info!(
            path = %path.display(),
            model = %state.catalog.model().name,
            runs = state.runs.len(),
            "model database opened"
        );
        Ok(Self { state: Mutex::new(state), path: Some(path.to_path_buf()) })
    }

    /// Write the current state to `path` regardless of where it came from.
    pub fn save_as(&self, path: &Path) -> Result<()> {
        snapshot::write_snapshot(&*self.lock()?, path)
    }

    /// Whole database as pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        snapshot::to_json(&*self.lock()?)
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreState>> {
        self.state.lock().map_err(|_| StoreError::Poisoned)
    }

    fn commit(&self, state: &StoreState) -> Result<()> {
        match &self.path {
            Some(path) => snapshot::write_snapshot(state, path),
            None => Ok(()),
        }
    }

    /// Write output not yet written back to the snapshot file.
    pub fn flush(&self) -> Result<()> {
        self.commit(&*self.lock()?)
    }

    // ── Seeding ─────────────────────────────────────────────────────────

    /// Add a working set. The first one becomes the model default set.
    pub fn add_workset(
        &self,
        name: &str,
        base_run_id: Option<RunId>,
        parameters: BTreeMap<String, WorksetValue>,
    ) -> Result<SetId> {
        let mut st = self.lock()?;
        if st.worksets.values().any(|w| w.name == name) {
            return Err(StoreError::Duplicate(format!("working set {name}")));
        }
        if let Some(unknown) = parameters.keys().find(|n| st.catalog.parameter_by_name(n).is_none()) {
            return Err(StoreError::Validation(format!("working set parameter {unknown} is not in the model")));
        }
        let set_id = st.next_id();
        let model_id = st.catalog.model_id();
        st.worksets.insert(
            set_id,
            Workset { set_id, name: name.to_string(), model_id, base_run_id, parameters },
        );
        st.default_set_id.get_or_insert(set_id);
        self.commit(&st)?;
        Ok(set_id)
    }

    pub fn add_task(&self, name: &str, set_ids: Vec<SetId>) -> Result<TaskId> {
        let mut st = self.lock()?;
        if st.tasks.values().any(|t| t.name == name) {
            return Err(StoreError::Duplicate(format!("task {name}")));
        }
        if let Some(missing) = set_ids.iter().find(|id| !st.worksets.contains_key(*id)) {
            return Err(StoreError::NotFound(format!("working set {missing}")));
        }
        let task_id = st.next_id();
        st.tasks.insert(task_id, Task { task_id, name: name.to_string(), set_ids });
        self.commit(&st)?;
        Ok(task_id)
    }

    /// Copy of everything a run wrote.
    pub fn run_output(&self, run_id: RunId) -> Result<RunOutput> {
        Ok(self.lock()?.output(run_id)?.clone())
    }
}

// ── OutputWriter ──────────────────────────────────────────────────────────────

impl OutputWriter for MemoryStore {
    fn write_accumulator(
        &self,
        run_id: RunId,
        sub_value_id: usize,
        table_id: u32,
        acc_id: u32,
        values: &[f64],
    ) -> Result<()> {
        let mut st = self.lock()?;
        let run = st.run(run_id)?;
        if run.status.is_final() {
            return Err(StoreError::Validation(format!(
                "run {run_id} is completed ({}), cannot write output",
                run.status
            )));
        }
        if sub_value_id >= run.sub_count {
            return Err(StoreError::Validation(format!(
                "sub-value {sub_value_id} out of range of run {run_id} with {} sub-values",
                run.sub_count
            )));
        }
        let table = st
            .catalog
            .table_by_id(table_id)
            .ok_or_else(|| StoreError::NotFound(format!("output table {table_id}")))?;
        if st.catalog.accumulator_index(table_id, acc_id).is_none() {
            return Err(StoreError::NotFound(format!("accumulator {acc_id} of table {}", table.name)));
        }
        if values.len() != table.cell_count {
            return Err(StoreError::Validation(format!(
                "accumulator {acc_id} of table {} has {} cells, received {}",
                table.name,
                table.cell_count,
                values.len()
            )));
        }

        let output = st.outputs.entry(run_id).or_default();
        if output
            .accumulators
            .iter()
            .any(|r| r.table_id == table_id && r.acc_id == acc_id && r.sub_id == sub_value_id)
        {
            return Err(StoreError::Duplicate(format!(
                "accumulator {acc_id} of table {table_id} sub-value {sub_value_id} of run {run_id}"
            )));
        }
        output.accumulators.push(AccumulatorRow {
            table_id,
            acc_id,
            sub_id: sub_value_id,
            values: values.to_vec(),
        });
        debug!(run_id, sub_value_id, table_id, acc_id, "accumulator written");
        Ok(())
    }

    fn write_all_expressions(&self, run_id: RunId, table_name: &str) -> Result<()> {
        let mut st = self.lock()?;
        let sub_count = st.run(run_id)?.sub_count;
        let table = st
            .catalog
            .table_by_name(table_name)
            .ok_or_else(|| StoreError::NotFound(format!("output table {table_name}")))?
            .clone();

        let output = st.output(run_id)?;
        let mut rows = Vec::new();
        for expr in st.catalog.expressions_by_table(table.table_id) {
            let mut subs: Vec<&AccumulatorRow> = output
                .accumulators
                .iter()
                .filter(|r| r.table_id == table.table_id && r.acc_id == expr.acc_id)
                .collect();
            if subs.len() != sub_count {
                return Err(StoreError::Incomplete(format!(
                    "table {table_name} accumulator {} of run {run_id}: {} of {sub_count} sub-values written",
                    expr.acc_id,
                    subs.len()
                )));
            }
            subs.sort_by_key(|r| r.sub_id);
            let values: Vec<&[f64]> = subs.iter().map(|r| r.values.as_slice()).collect();
            rows.push(ExpressionRow {
                table_id: table.table_id,
                expr_id: expr.expr_id,
                values: aggregate(expr.aggregation, &values, table.cell_count),
            });
        }

        let output = st.outputs.entry(run_id).or_default();
        output.expressions.retain(|r| r.table_id != table.table_id);
        output.expressions.extend(rows);
        Ok(())
    }

    fn digest_output(&self, run_id: RunId, table_name: &str) -> Result<String> {
        let mut st = self.lock()?;
        let table_id = st
            .catalog
            .table_by_name(table_name)
            .ok_or_else(|| StoreError::NotFound(format!("output table {table_name}")))?
            .table_id;
        let rows: Vec<ExpressionRow> = st
            .output(run_id)?
            .expressions
            .iter()
            .filter(|r| r.table_id == table_id)
            .cloned()
            .collect();

        let value = digest::table_digest(table_name, &rows);
        st.outputs
            .entry(run_id)
            .or_default()
            .table_digests
            .insert(table_name.to_string(), value.clone());
        Ok(value)
    }
}

// ── Parameters ────────────────────────────────────────────────────────────────

impl ParameterReader for MemoryStore {
    fn read_parameter(&self, run_id: RunId, name: &str, sub_value_id: usize) -> Result<ParamValues> {
        let st = self.lock()?;
        let param = st
            .output(run_id)?
            .parameters
            .get(name)
            .ok_or_else(|| StoreError::NotFound(format!("parameter {name} of run {run_id}")))?;
        let values = match param.values.as_slice() {
            [single] => Some(single),
            many => many.get(sub_value_id),
        };
        values.cloned().ok_or_else(|| {
            StoreError::Validation(format!(
                "parameter {name} of run {run_id} has no sub-value {sub_value_id}"
            ))
        })
    }
}

impl ParameterWriter for MemoryStore {
    fn create_run_parameters(
        &self,
        run_id: RunId,
        set_id: SetId,
        overrides: &BTreeMap<String, String>,
    ) -> Result<()> {
        let mut st = self.lock()?;
        let sub_count = st.run(run_id)?.sub_count;
        let ws = st.find_workset(Some(set_id), None)?;
        let params = resolve_parameters(&st.catalog, ws, sub_count, overrides, &st.outputs)?;
        st.outputs.entry(run_id).or_default().parameters = params;
        self.commit(&st)
    }

    fn parameter_sources(&self, run_id: RunId) -> Result<BTreeMap<String, ParameterSource>> {
        let st = self.lock()?;
        Ok(st
            .output(run_id)?
            .parameters
            .iter()
            .map(|(name, p)| (name.clone(), p.source.clone()))
            .collect())
    }
}

// ── RunStore ──────────────────────────────────────────────────────────────────

impl RunStore for MemoryStore {
    fn load_catalog(&self) -> Result<MetadataCatalog> {
        Ok(self.lock()?.catalog.clone())
    }

    fn find_task(&self, task_id: Option<TaskId>, name: Option<&str>) -> Result<TaskId> {
        let st = self.lock()?;
        let found = match (task_id, name) {
            (Some(id), _) => st.tasks.get(&id),
            (None, Some(name)) => st.tasks.values().find(|t| t.name == name),
            (None, None) => None,
        };
        found
            .map(|t| t.task_id)
            .ok_or_else(|| StoreError::NotFound(format!("modeling task (id: {task_id:?}, name: {name:?})")))
    }

    fn create_task_run(
        &self,
        task_id: TaskId,
        name: Option<&str>,
        sub_count: usize,
        run_stamp: &str,
    ) -> Result<TaskRunId> {
        let mut st = self.lock()?;
        let task_name = st
            .tasks
            .get(&task_id)
            .ok_or_else(|| StoreError::NotFound(format!("modeling task {task_id}")))?
            .name
            .clone();
        let task_run_id = st.next_id();
        let now = Utc::now();
        st.task_runs.insert(
            task_run_id,
            TaskRunRecord {
                task_run_id,
                task_id,
                name: name.map(str::to_string).unwrap_or_else(|| format!("{task_name}_{task_run_id}")),
                sub_count,
                status: RunStatusCode::Init,
                created_at: now,
                updated_at: now,
                run_stamp: run_stamp.to_string(),
                items: Vec::new(),
            },
        );
        self.commit(&st)?;
        info!(task_id, task_run_id, "task run created");
        Ok(task_run_id)
    }

    fn create_new_run(&self, req: &NewRunRequest) -> Result<NewRun> {
        // a single run is created once: from the initial status only
        if req.task_run_id.is_none() && req.current_status != ModelStatus::Init {
            return Ok(NewRun::none(ModelStatus::Shutdown));
        }
        let mut st = self.lock()?;
        let mut status = req.current_status;

        // next working set of the task, if any
        let mut task_set: Option<(TaskRunId, SetId, RunStatusCode, String)> = None;
        if let Some(task_run_id) = req.task_run_id {
            let task_run = st
                .task_runs
                .get(&task_run_id)
                .ok_or_else(|| StoreError::NotFound(format!("task run {task_run_id}")))?;
            let task = st
                .tasks
                .get(&task_run.task_id)
                .ok_or_else(|| StoreError::NotFound(format!("modeling task {}", task_run.task_id)))?;

            let code = match task_run.status {
                RunStatusCode::Init if req.wait_task => RunStatusCode::Wait,
                RunStatusCode::Init => RunStatusCode::Progress,
                RunStatusCode::Progress | RunStatusCode::Wait => task_run.status,
                RunStatusCode::Done => return Ok(NewRun::none(ModelStatus::Done)),
                RunStatusCode::Exit => return Ok(NewRun::none(ModelStatus::Exit)),
                RunStatusCode::Error => return Ok(NewRun::none(ModelStatus::Error)),
            };
            status = if code == RunStatusCode::Wait { ModelStatus::Wait } else { ModelStatus::Progress };

            let next = task
                .set_ids
                .iter()
                .copied()
                .find(|id| !task_run.items.iter().any(|item| item.set_id == *id));
            match next {
                Some(set_id) => {
                    let prefix = req.task_run_name.clone().unwrap_or_else(|| task.name.clone());
                    task_set = Some((task_run_id, set_id, code, prefix));
                }
                // task completed, or waiting for more input from the supervisor
                None if status == ModelStatus::Progress => return Ok(NewRun::none(ModelStatus::Shutdown)),
                None => return Ok(NewRun::none(status)),
            }
        }
        if status == ModelStatus::Init {
            status = ModelStatus::Progress;
        }

        let ws = match &task_set {
            Some((_, set_id, _, _)) => st.find_workset(Some(*set_id), None)?,
            None => st.find_workset(req.set_id, req.set_name.as_deref())?,
        };
        let set_id = ws.set_id;
        let parameters = resolve_parameters(&st.catalog, ws, req.sub_count, &req.overrides, &st.outputs)?;

        let name = match &req.run_name {
            Some(name) => name.clone(),
            None => {
                let mut name = st.catalog.model().name.clone();
                if let Some((_, _, _, prefix)) = &task_set {
                    name = format!("{name}_{prefix}");
                }
                to_alpha_numeric(&format!("{name}_{}", ws.name), MAX_RUN_NAME)
            }
        };

        // validated: apply
        let run_id = st.next_id();
        let now = Utc::now();
        let model_id = st.catalog.model_id();
        st.runs.insert(
            run_id,
            RunRecord {
                run_id,
                model_id,
                name,
                set_id,
                sub_count: req.sub_count,
                sub_started: req.sub_count,
                sub_completed: 0,
                sub_restart: 0,
                status: RunStatusCode::Progress,
                created_at: now,
                updated_at: now,
                digest: None,
                run_stamp: req.run_stamp.clone(),
            },
        );
        st.outputs.insert(run_id, RunOutput { parameters, ..RunOutput::default() });

        if let Some((task_run_id, set_id, code, _)) = task_set {
            if let Some(task_run) = st.task_runs.get_mut(&task_run_id) {
                task_run.status = code;
                task_run.updated_at = now;
                task_run.items.push(TaskRunItem { set_id, run_id });
            }
        }
        self.commit(&st)?;

        info!(run_id, set_id, %status, "run created");
        Ok(NewRun { run_id, set_id, status })
    }

    fn run_record(&self, run_id: RunId) -> Result<Option<RunRecord>> {
        Ok(self.lock()?.runs.get(&run_id).cloned())
    }

    fn runs(&self) -> Result<Vec<RunRecord>> {
        Ok(self.lock()?.runs.values().cloned().collect())
    }

    fn task_run_record(&self, task_run_id: TaskRunId) -> Result<Option<TaskRunRecord>> {
        Ok(self.lock()?.task_runs.get(&task_run_id).cloned())
    }

    fn update_restart_sub_value(&self, run_id: RunId, sub_restart: usize) -> Result<()> {
        let mut st = self.lock()?;
        let run = st
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| StoreError::NotFound(format!("run {run_id}")))?;
        if sub_restart > run.sub_count {
            return Err(StoreError::Validation(format!(
                "restart sub-value {sub_restart} exceeds {} sub-values of run {run_id}",
                run.sub_count
            )));
        }
        if run.status.is_final() {
            return Ok(());
        }
        run.sub_restart = sub_restart;
        run.sub_completed = sub_restart;
        run.updated_at = Utc::now();
        debug!(run_id, sub_restart, "restart checkpoint");
        self.commit(&st)
    }

    fn update_sub_value_states(&self, run_id: RunId, states: &[SubValueState]) -> Result<()> {
        let mut st = self.lock()?;
        let sub_count = st.run(run_id)?.sub_count;
        if let Some(bad) = states.iter().find(|s| s.run_id != run_id || s.sub_value_id >= sub_count) {
            return Err(StoreError::Validation(format!(
                "state of run {} sub-value {} does not belong to run {run_id} with {sub_count} sub-values",
                bad.run_id, bad.sub_value_id
            )));
        }
        let Some(newest) = states.iter().map(|s| s.updated_at).max() else {
            return Ok(());
        };

        let output = st.outputs.entry(run_id).or_default();
        for state in states {
            match output.sub_values.get(&state.sub_value_id) {
                Some(known) if known.updated_at > state.updated_at => {}
                _ => {
                    output.sub_values.insert(state.sub_value_id, *state);
                }
            }
        }
        if let Some(run) = st.runs.get_mut(&run_id) {
            if run.updated_at < newest {
                run.updated_at = newest;
            }
        }
        debug!(run_id, states = states.len(), "sub-value states");
        self.commit(&st)
    }

    fn set_run_status(&self, run_id: RunId, status: ModelStatus) -> Result<()> {
        let mut st = self.lock()?;
        let code = RunStatusCode::from(status);
        let run = st.run(run_id)?;
        if run.status.is_final() || run.status == code {
            return Ok(());
        }

        let run_digest = match code {
            RunStatusCode::Done => Some(digest::run_digest(&st.output(run_id)?.table_digests)),
            _ => None,
        };
        let now = Utc::now();
        if let Some(run) = st.runs.get_mut(&run_id) {
            run.status = code;
            run.updated_at = now;
            if let Some(d) = run_digest {
                run.sub_completed = run.sub_count;
                run.sub_restart = run.sub_count;
                run.digest = Some(d);
            }
        }

        // a failed run fails every task run it belongs to
        if code == RunStatusCode::Error {
            for task_run in st.task_runs.values_mut() {
                if !task_run.status.is_final() && task_run.items.iter().any(|i| i.run_id == run_id) {
                    task_run.status = RunStatusCode::Error;
                    task_run.updated_at = now;
                }
            }
        }
        self.commit(&st)?;
        info!(run_id, status = %code, "run status");
        Ok(())
    }

    fn set_task_run_status(&self, task_run_id: TaskRunId, status: ModelStatus) -> Result<()> {
        let mut st = self.lock()?;
        let task_run = st
            .task_runs
            .get_mut(&task_run_id)
            .ok_or_else(|| StoreError::NotFound(format!("task run {task_run_id}")))?;
        if task_run.status.is_final() {
            return Ok(());
        }
        task_run.status = RunStatusCode::from(status);
        task_run.updated_at = Utc::now();
        self.commit(&st)
    }

    fn restart_run(&self, run_id: RunId, sub_restart: usize) -> Result<()> {
        let mut st = self.lock()?;
        let run = st.run(run_id)?;
        if run.status == RunStatusCode::Done {
            return Err(StoreError::Validation(format!("run {run_id} is already completed")));
        }
        if sub_restart > run.sub_count {
            return Err(StoreError::Validation(format!(
                "restart sub-value {sub_restart} exceeds {} sub-values of run {run_id}",
                run.sub_count
            )));
        }

        let now = Utc::now();
        if let Some(run) = st.runs.get_mut(&run_id) {
            run.status = RunStatusCode::Progress;
            run.sub_started = run.sub_count;
            run.sub_completed = sub_restart;
            run.sub_restart = sub_restart;
            run.digest = None;
            run.updated_at = now;
        }
        let output = st.outputs.entry(run_id).or_default();
        output.table_digests.clear();
        output.expressions.clear();
        output.accumulators.retain(|r| r.sub_id < sub_restart);
        self.commit(&st)?;

        info!(run_id, sub_restart, "run reopened for restart");
        Ok(())
    }

    fn append_task_set(&self, task_id: TaskId, set_id: SetId) -> Result<()> {
        let mut st = self.lock()?;
        if !st.worksets.contains_key(&set_id) {
            return Err(StoreError::NotFound(format!("working set {set_id}")));
        }
        let task = st
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| StoreError::NotFound(format!("modeling task {task_id}")))?;
        if !task.set_ids.contains(&set_id) {
            task.set_ids.push(set_id);
        }
        self.commit(&st)
    }

    fn close_task_run(&self, task_run_id: TaskRunId) -> Result<()> {
        let mut st = self.lock()?;
        let task_run = st
            .task_runs
            .get_mut(&task_run_id)
            .ok_or_else(|| StoreError::NotFound(format!("task run {task_run_id}")))?;
        if matches!(task_run.status, RunStatusCode::Init | RunStatusCode::Wait) {
            task_run.status = RunStatusCode::Progress;
            task_run.updated_at = Utc::now();
        }
        self.commit(&st)
    }
}

/// Replace every non-alphanumeric character with `_` and cap the length.
fn to_alpha_numeric(name: &str, max_len: usize) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .take(max_len)
        .collect()
}

// ── Tests ─────────────────────────────────────────────────────────────────────
