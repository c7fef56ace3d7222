//! Persisted rows: runs, task runs, working sets, tasks and output values.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use msim_types::messages::SubValueState;
use msim_types::{ModelId, ParamValues, ParameterSource, RunId, RunStatusCode, SetId, TaskId, TaskRunId};

// ── Runs ──────────────────────────────────────────────────────────────────────

/// Externally observable state of one model run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub model_id: ModelId,
    pub name: String,
    pub set_id: SetId,
    pub sub_count: usize,
    pub sub_started: usize,
    pub sub_completed: usize,
    /// Contiguous prefix of sub-values confirmed written: resume point.
    pub sub_restart: usize,
    pub status: RunStatusCode,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Computed only once the run is done.
    pub digest: Option<String>,
    pub run_stamp: String,
}

/// Copy of one input parameter owned by a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunParameter {
    pub source: ParameterSource,
    /// One entry, or one per sub-value.
    pub values: Vec<ParamValues>,
}

/// Values of one accumulator of one sub-value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccumulatorRow {
    pub table_id: u32,
    pub acc_id: u32,
    pub sub_id: usize,
    pub values: Vec<f64>,
}

/// Aggregated values of one output expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpressionRow {
    pub table_id: u32,
    pub expr_id: u32,
    pub values: Vec<f64>,
}

/// Everything a run wrote.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunOutput {
    pub parameters: BTreeMap<String, RunParameter>,
    pub accumulators: Vec<AccumulatorRow>,
    pub expressions: Vec<ExpressionRow>,
    /// Output digest per table name.
    pub table_digests: BTreeMap<String, String>,
    /// Last known progress of every sub-value.
    #[serde(default)]
    pub sub_values: BTreeMap<usize, SubValueState>,
}

// ── Input ─────────────────────────────────────────────────────────────────────

/// Value of a working set parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorksetValue {
    /// One entry, or one per sub-value.
    Values(Vec<ParamValues>),
    /// Take the parameter of another (possibly foreign) model run.
    Import { model_name: String, run_id: RunId },
}

/// Named input working set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workset {
    pub set_id: SetId,
    pub name: String,
    pub model_id: ModelId,
    /// Parameters missing from the set are taken from this run.
    pub base_run_id: Option<RunId>,
    pub parameters: BTreeMap<String, WorksetValue>,
}

/// Modeling task: an ordered list of working sets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,
    pub name: String,
    pub set_ids: Vec<SetId>,
}

/// One working set of a task run and the run created from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRunItem {
    pub set_id: SetId,
    pub run_id: RunId,
}

/// One execution of a modeling task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRunRecord {
    pub task_run_id: TaskRunId,
    pub task_id: TaskId,
    pub name: String,
    pub sub_count: usize,
    pub status: RunStatusCode,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub run_stamp: String,
    pub items: Vec<TaskRunItem>,
}
