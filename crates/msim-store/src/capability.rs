//! Persistence capabilities consumed by the run coordinator.
//!
//! Every method is one transaction: it either applies all of its changes
//! or none of them.

use std::collections::BTreeMap;

use msim_types::messages::SubValueState;
use msim_types::{
    MetadataCatalog, ModelStatus, ParamValues, ParameterSource, RunId, SetId, TaskId, TaskRunId,
};

use crate::error::Result;
use crate::records::{RunRecord, TaskRunRecord};

// ── Requests ──────────────────────────────────────────────────────────────────

/// Everything needed to create the next run.
#[derive(Debug, Clone, Default)]
pub struct NewRunRequest {
    /// Task run to take the next working set from; `None` for a single run.
    pub task_run_id: Option<TaskRunId>,
    /// Task run is supervised: wait for more input instead of finishing.
    pub wait_task: bool,
    /// Current process status; a single run is only created from `init`.
    pub current_status: ModelStatus,
    /// Working set of a single run; the model default set if both are empty.
    pub set_id: Option<SetId>,
    pub set_name: Option<String>,
    pub run_name: Option<String>,
    /// Prefix of generated run names inside a task.
    pub task_run_name: Option<String>,
    pub sub_count: usize,
    pub run_stamp: String,
    /// `Parameter.<name>` run options.
    pub overrides: BTreeMap<String, String>,
}

/// Result of [`RunStore::create_new_run`]. `run_id == 0`: nothing created,
/// `status` tells whether to wait (`wait`) or stop (`shutdown`, `exit`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewRun {
    pub run_id: RunId,
    pub set_id: SetId,
    pub status: ModelStatus,
}

impl NewRun {
    pub fn none(status: ModelStatus) -> Self {
        Self { run_id: 0, set_id: 0, status }
    }
}

// ── Capabilities ──────────────────────────────────────────────────────────────

pub trait OutputWriter: Send + Sync {
    /// Store one accumulator of one sub-value. Each (run, table, accumulator,
    /// sub-value) is written at most once.
    fn write_accumulator(
        &self,
        run_id: RunId,
        sub_value_id: usize,
        table_id: u32,
        acc_id: u32,
        values: &[f64],
    ) -> Result<()>;

    /// Aggregate every expression of the table over all sub-values.
    fn write_all_expressions(&self, run_id: RunId, table_name: &str) -> Result<()>;

    /// Compute and store the content digest of the table's expression values.
    fn digest_output(&self, run_id: RunId, table_name: &str) -> Result<String>;
}

pub trait ParameterReader: Send + Sync {
    /// Values of one sub-value of a run parameter.
    fn read_parameter(&self, run_id: RunId, name: &str, sub_value_id: usize) -> Result<ParamValues>;
}

pub trait ParameterWriter: Send + Sync {
    /// Copy every model parameter into the run, recording where it came from.
    fn create_run_parameters(
        &self,
        run_id: RunId,
        set_id: SetId,
        overrides: &BTreeMap<String, String>,
    ) -> Result<()>;

    fn parameter_sources(&self, run_id: RunId) -> Result<BTreeMap<String, ParameterSource>>;
}

pub trait RunStore: OutputWriter + ParameterReader + ParameterWriter {
    fn load_catalog(&self) -> Result<MetadataCatalog>;

    /// Task id by id or by name; id wins.
    fn find_task(&self, task_id: Option<TaskId>, name: Option<&str>) -> Result<TaskId>;

    fn create_task_run(
        &self,
        task_id: TaskId,
        name: Option<&str>,
        sub_count: usize,
        run_stamp: &str,
    ) -> Result<TaskRunId>;

    fn create_new_run(&self, request: &NewRunRequest) -> Result<NewRun>;

    fn run_record(&self, run_id: RunId) -> Result<Option<RunRecord>>;

    fn runs(&self) -> Result<Vec<RunRecord>>;

    fn task_run_record(&self, task_run_id: TaskRunId) -> Result<Option<TaskRunRecord>>;

    /// Persist the restart checkpoint: `sub_restart = sub_completed = sub_restart`.
    fn update_restart_sub_value(&self, run_id: RunId, sub_restart: usize) -> Result<()>;

    /// Upsert the progress of sub-values of one run. A state older than the
    /// stored one is ignored; the run's `updated_at` moves to the newest.
    fn update_sub_value_states(&self, run_id: RunId, states: &[SubValueState]) -> Result<()>;

    /// Set-if-not-final. `done` also computes the run digest; `error` also
    /// marks every task run containing the run as failed.
    fn set_run_status(&self, run_id: RunId, status: ModelStatus) -> Result<()>;

    fn set_task_run_status(&self, task_run_id: TaskRunId, status: ModelStatus) -> Result<()>;

    /// Reopen a run at `sub_restart`: status progress, drop expressions,
    /// digests and every accumulator of sub-values `>= sub_restart`.
    fn restart_run(&self, run_id: RunId, sub_restart: usize) -> Result<()>;

    /// Supervisor: add a working set to a task.
    fn append_task_set(&self, task_id: TaskId, set_id: SetId) -> Result<()>;

    /// Supervisor: no more input, let a waiting task run finish.
    fn close_task_run(&self, task_run_id: TaskRunId) -> Result<()>;
}
