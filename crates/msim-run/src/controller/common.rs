// Helpers shared by the controllers that own the model database.

use std::ops::Range;
use std::sync::{Mutex, MutexGuard, OnceLock};

use tracing::{info, warn};

use msim_store::{NewRunRequest, RunStore};
use msim_types::catalog::TableDic;
use msim_types::messages::SubValueState;
use msim_types::{MetadataCatalog, ModelStatus, ParamValues, RunConfig, RunId, TaskRunId, ValueKind};

use crate::error::{Result, RunError};

/// Lock a controller's state. The state is plain data, a panicked worker
/// does not leave it half-updated.
pub(super) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Value set by `init`; an error if `init` has not run.
pub(super) fn initialized<'a, T>(cell: &'a OnceLock<T>, what: &str) -> Result<&'a T> {
    cell.get().ok_or_else(|| RunError::Validation(format!("{what} is not initialized: call init first")))
}

pub(super) fn set_once<T>(cell: &OnceLock<T>, value: T, what: &str) -> Result<()> {
    cell.set(value).map_err(|_| RunError::Validation(format!("{what} is already initialized")))
}

/// A model without output tables has nothing to compute.
pub(super) fn check_catalog(catalog: &MetadataCatalog) -> Result<()> {
    if catalog.tables().is_empty() {
        return Err(RunError::Validation(format!(
            "model {} has no output tables",
            catalog.model().name
        )));
    }
    Ok(())
}

// ── Runs and task runs ────────────────────────────────────────────────────────

pub(super) fn new_run_request(
    config: &RunConfig,
    task_run_id: Option<TaskRunId>,
    current_status: ModelStatus,
) -> NewRunRequest {
    NewRunRequest {
        task_run_id,
        wait_task: config.wait_task,
        current_status,
        set_id: config.set_id,
        set_name: config.set_name.clone(),
        run_name: config.run_name.clone(),
        task_run_name: config.task_run_name.clone(),
        sub_count: config.sub_values,
        run_stamp: config.run_stamp.clone(),
        overrides: config.parameter_overrides.clone(),
    }
}

/// Create the task run if the process runs a modeling task.
pub(super) fn create_task_run(store: &dyn RunStore, config: &RunConfig) -> Result<Option<TaskRunId>> {
    if !config.is_task() {
        return Ok(None);
    }
    let task_id = store.find_task(config.task_id, config.task_name.as_deref())?;
    let task_run_id = store.create_task_run(
        task_id,
        config.task_run_name.as_deref(),
        config.sub_values,
        &config.run_stamp,
    )?;
    Ok(Some(task_run_id))
}

/// Aggregate expressions and digest every output table, then mark the run done.
pub(super) fn finalize_run(store: &dyn RunStore, catalog: &MetadataCatalog, run_id: RunId) -> Result<()> {
    for table in catalog.tables() {
        store.write_all_expressions(run_id, &table.name)?;
        store.digest_output(run_id, &table.name)?;
    }
    store.set_run_status(run_id, ModelStatus::Done)?;
    info!(run_id, "run done");
    Ok(())
}

/// Best effort: record an abnormal end of the run and its task run.
pub(super) fn mark_exit(store: &dyn RunStore, run_id: RunId, task_run_id: Option<TaskRunId>, status: ModelStatus) {
    if run_id > 0 {
        if let Err(e) = store.set_run_status(run_id, status) {
            warn!(run_id, %status, error = %e, "failed to update run status");
        }
    }
    if let Some(task_run_id) = task_run_id {
        if let Err(e) = store.set_task_run_status(task_run_id, status) {
            warn!(task_run_id, %status, error = %e, "failed to update task run status");
        }
    }
}

/// Persist sub-value states, one transaction per run.
pub(super) fn persist_sub_value_states(store: &dyn RunStore, states: &[SubValueState]) -> Result<()> {
    let mut run_ids: Vec<RunId> = states.iter().map(|s| s.run_id).collect();
    run_ids.sort_unstable();
    run_ids.dedup();
    for run_id in run_ids {
        let batch: Vec<SubValueState> = states.iter().filter(|s| s.run_id == run_id).copied().collect();
        store.update_sub_value_states(run_id, &batch)?;
    }
    Ok(())
}

// ── Parameters ────────────────────────────────────────────────────────────────

/// The model must declare `name` with exactly this kind and size.
pub(super) fn check_parameter(catalog: &MetadataCatalog, name: &str, kind: ValueKind, size: usize) -> Result<()> {
    if name.is_empty() {
        return Err(RunError::Validation("invalid (empty) input parameter name".into()));
    }
    let param = catalog
        .parameter_by_name(name)
        .ok_or_else(|| RunError::Validation(format!("parameter not found: {name}")))?;
    if param.kind != kind || param.size != size {
        return Err(RunError::Validation(format!(
            "parameter {name} is {:?} of size {}, requested {kind:?} of size {size}",
            param.kind, param.size
        )));
    }
    Ok(())
}

pub(super) fn read_parameter(
    store: &dyn RunStore,
    catalog: &MetadataCatalog,
    run_id: RunId,
    name: &str,
    sub_value_id: Option<usize>,
    kind: ValueKind,
    size: usize,
) -> Result<ParamValues> {
    check_parameter(catalog, name, kind, size)?;
    let values = store.read_parameter(run_id, name, sub_value_id.unwrap_or(0))?;
    values.expect_shape(kind, size)?;
    Ok(values)
}

// ── Accumulators ──────────────────────────────────────────────────────────────

/// Output table `table_name` and its global accumulator index range, after
/// checking that `values` holds one full array per accumulator.
pub(super) fn table_accumulators<'a>(
    catalog: &'a MetadataCatalog,
    table_name: &str,
    values: &[Vec<f64>],
) -> Result<(&'a TableDic, Range<usize>)> {
    let table = catalog
        .table_by_name(table_name)
        .ok_or_else(|| RunError::Validation(format!("output table not found: {table_name}")))?;
    let range = catalog.accumulator_range(table.table_id);

    if values.len() != range.len() {
        return Err(RunError::Validation(format!(
            "output table {table_name} has {} accumulators, received {}",
            range.len(),
            values.len()
        )));
    }
    if let Some(bad) = values.iter().find(|v| v.len() != table.cell_count) {
        return Err(RunError::Validation(format!(
            "output table {table_name} has {} cells, received {}",
            table.cell_count,
            bad.len()
        )));
    }
    Ok((table, range))
}

/// Write every accumulator of one table of one sub-value.
pub(super) fn write_accumulators(
    store: &dyn RunStore,
    catalog: &MetadataCatalog,
    run_id: RunId,
    sub_value_id: usize,
    table_name: &str,
    values: &[Vec<f64>],
) -> Result<()> {
    let (table, _) = table_accumulators(catalog, table_name, values)?;
    for (acc, vals) in catalog.accumulators_by_table(table.table_id).iter().zip(values) {
        store.write_accumulator(run_id, sub_value_id, table.table_id, acc.acc_id, vals)?;
    }
    Ok(())
}
