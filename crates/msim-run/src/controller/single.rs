//! Single process: no transport, every sub-value computed by this process.

use std::ops::Range;
use std::sync::{Arc, Mutex, OnceLock};

use tracing::info;

use msim_store::RunStore;
use msim_types::messages::SubValueState;
use msim_types::{MetadataCatalog, ModelStatus, ParamValues, RunConfig, RunId, TaskRunId, ValueKind};

use super::common::{self, lock};
use super::{ControllerRole, RunController};
use crate::completion::CompletionTracker;
use crate::error::{Result, RunError};
use crate::state::ProcessStatus;
use crate::topology::ProcessTopology;

#[derive(Debug, Default)]
struct SingleState {
    run_id: RunId,
    task_run_id: Option<TaskRunId>,
    /// At least one run was created by this process.
    created_any: bool,
}

pub struct SingleController {
    config: RunConfig,
    store: Arc<dyn RunStore>,
    status: Arc<ProcessStatus>,
    topology: OnceLock<ProcessTopology>,
    catalog: OnceLock<Arc<MetadataCatalog>>,
    completion: CompletionTracker,
    inner: Mutex<SingleState>,
}

impl SingleController {
    pub fn new(config: RunConfig, store: Arc<dyn RunStore>, status: Arc<ProcessStatus>) -> Self {
        Self {
            config,
            store,
            status,
            topology: OnceLock::new(),
            catalog: OnceLock::new(),
            completion: CompletionTracker::default(),
            inner: Mutex::new(SingleState::default()),
        }
    }

    pub fn topology(&self) -> Option<&ProcessTopology> {
        self.topology.get()
    }

    /// Sub-values of the current run confirmed written so far.
    pub fn completion(&self) -> &CompletionTracker {
        &self.completion
    }

    fn catalog(&self) -> Result<&Arc<MetadataCatalog>> {
        common::initialized(&self.catalog, "metadata catalog")
    }

    fn check_run(&self, run_id: RunId) -> Result<()> {
        let current = lock(&self.inner).run_id;
        if run_id == 0 || run_id != current {
            return Err(RunError::Validation(format!("run {run_id} is not the current run {current}")));
        }
        Ok(())
    }
}

impl RunController for SingleController {
    fn role(&self) -> ControllerRole {
        ControllerRole::Single
    }

    fn init(&self) -> Result<()> {
        let topology = ProcessTopology::from_config(&self.config, 1, 0)?;
        let catalog = self.store.load_catalog()?;
        common::check_catalog(&catalog)?;
        let task_run_id = common::create_task_run(self.store.as_ref(), &self.config)?;

        self.completion.init(topology.sub_value_count);
        common::set_once(&self.topology, topology, "topology")?;
        common::set_once(&self.catalog, Arc::new(catalog), "metadata catalog")?;
        lock(&self.inner).task_run_id = task_run_id;

        info!(
            role = %self.role(),
            sub_values = topology.sub_value_count,
            threads = self.config.threads,
            task_run_id = ?task_run_id,
            "controller initialized"
        );
        Ok(())
    }

    fn sub_value_count(&self) -> usize {
        self.config.sub_values
    }

    fn next_run(&self) -> Result<RunId> {
        if self.status.is_shutdown_or_exit() {
            return Ok(0);
        }
        let mut st = lock(&self.inner);

        let current = if st.created_any { ModelStatus::Progress } else { ModelStatus::Init };
        let request = common::new_run_request(&self.config, st.task_run_id, current);
        let new = self.store.create_new_run(&request)?;

        if new.run_id == 0 {
            let status = if new.status == ModelStatus::Wait { ModelStatus::Wait } else { ModelStatus::Shutdown };
            self.status.set_status(status);
            st.run_id = 0;
            return Ok(0);
        }

        st.run_id = new.run_id;
        st.created_any = true;
        self.completion.init(self.config.sub_values);
        self.status.set_status(ModelStatus::Progress);
        info!(run_id = new.run_id, set_id = new.set_id, "run started");
        Ok(new.run_id)
    }

    fn local_sub_values(&self, run_id: RunId) -> Range<usize> {
        if run_id > 0 && lock(&self.inner).run_id == run_id {
            0..self.config.sub_values
        } else {
            0..0
        }
    }

    fn read_parameter(
        &self,
        run_id: RunId,
        name: &str,
        sub_value_id: Option<usize>,
        kind: ValueKind,
        size: usize,
    ) -> Result<ParamValues> {
        self.check_run(run_id)?;
        common::read_parameter(self.store.as_ref(), self.catalog()?, run_id, name, sub_value_id, kind, size)
    }

    fn write_accumulators(
        &self,
        run_id: RunId,
        sub_value_id: usize,
        is_last_table: bool,
        table_name: &str,
        values: &[Vec<f64>],
    ) -> Result<()> {
        self.check_run(run_id)?;
        common::write_accumulators(self.store.as_ref(), self.catalog()?, run_id, sub_value_id, table_name, values)?;

        if is_last_table {
            // one checkpoint writer at a time keeps sub_restart monotonic
            let _st = lock(&self.inner);
            self.completion.set_at(sub_value_id);
            self.store.update_restart_sub_value(run_id, self.completion.count_first())?;
        }
        Ok(())
    }

    fn update_run_state(&self, states: &[SubValueState]) -> Result<()> {
        common::persist_sub_value_states(self.store.as_ref(), states)
    }

    fn shutdown_run(&self, run_id: RunId) -> Result<()> {
        self.check_run(run_id)?;
        if !self.completion.is_all() {
            return Err(RunError::Validation(format!(
                "run {run_id} is incomplete: {} of {} sub-values written",
                self.completion.count(),
                self.completion.len()
            )));
        }
        common::finalize_run(self.store.as_ref(), self.catalog()?, run_id)?;
        lock(&self.inner).run_id = 0;
        Ok(())
    }

    fn shutdown_wait_all(&self) -> Result<()> {
        let task_run_id = lock(&self.inner).task_run_id;
        if let Some(task_run_id) = task_run_id {
            self.store.set_task_run_status(task_run_id, ModelStatus::Done)?;
        }
        self.status.set_status(ModelStatus::Done);
        info!(role = %self.role(), "all runs completed");
        Ok(())
    }

    fn shutdown_on_exit(&self, status: ModelStatus) {
        let st = lock(&self.inner);
        common::mark_exit(self.store.as_ref(), st.run_id, st.task_run_id, status);
        self.status.set_status(status);
    }

    fn child_exchange(&self) -> Result<bool> {
        Ok(false)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
