//! Restart: resume an existing run from its last confirmed sub-value.
//!
//! ```text
//!   sub_restart = k          ┌─ kept ─┐┌──── deleted, recomputed ────┐
//!   sub-values               0 .. k-1   k .. count-1
//! ```
//!
//! Output at and after the checkpoint is deleted before anything is
//! recomputed, so every sub-value ends up written exactly once.

use std::ops::Range;
use std::sync::{Arc, Mutex, OnceLock};

use tracing::info;

use msim_store::RunStore;
use msim_types::messages::SubValueState;
use msim_types::{MetadataCatalog, ModelStatus, ParamValues, RunConfig, RunId, RunStatusCode, ValueKind};

use super::common::{self, lock};
use super::{ControllerRole, RunController};
use crate::completion::CompletionTracker;
use crate::error::{Result, RunError};
use crate::state::ProcessStatus;
use crate::topology::ProcessTopology;

#[derive(Debug, Default)]
struct RestartState {
    /// Sub-values of the run, from its record.
    sub_count: usize,
    /// First sub-value to recompute.
    sub_first: usize,
    started: bool,
    /// Run was already complete, or completed by the cleanup itself.
    nothing_to_do: bool,
}

pub struct RestartController {
    config: RunConfig,
    run_id: RunId,
    store: Arc<dyn RunStore>,
    status: Arc<ProcessStatus>,
    catalog: OnceLock<Arc<MetadataCatalog>>,
    completion: CompletionTracker,
    inner: Mutex<RestartState>,
}

impl RestartController {
    pub fn new(config: RunConfig, store: Arc<dyn RunStore>, status: Arc<ProcessStatus>) -> Result<Self> {
        let run_id = config
            .restart_run_id
            .ok_or_else(|| RunError::Validation("restart requires a run id".into()))?;
        Ok(Self {
            config,
            run_id,
            store,
            status,
            catalog: OnceLock::new(),
            completion: CompletionTracker::default(),
            inner: Mutex::new(RestartState::default()),
        })
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Sub-values this process still has to compute.
    pub fn self_sub_count(&self) -> usize {
        let st = lock(&self.inner);
        if st.nothing_to_do {
            0
        } else {
            st.sub_count - st.sub_first
        }
    }

    fn catalog(&self) -> Result<&Arc<MetadataCatalog>> {
        common::initialized(&self.catalog, "metadata catalog")
    }

    fn check_run(&self, run_id: RunId) -> Result<()> {
        if run_id != self.run_id {
            return Err(RunError::Validation(format!("run {run_id} is not the restarted run {}", self.run_id)));
        }
        Ok(())
    }

    /// Reopen the run at its checkpoint and drop everything written after it.
    /// A run already done, or with every sub-value confirmed, leaves nothing
    /// to do.
    fn cleanup_restart_sub_value(&self, catalog: &MetadataCatalog) -> Result<()> {
        let run_id = self.run_id;
        let record = self
            .store
            .run_record(run_id)?
            .ok_or_else(|| RunError::Validation(format!("run not found: {run_id}")))?;

        let mut st = lock(&self.inner);
        if record.status == RunStatusCode::Done {
            info!(run_id, "run is already completed, nothing to do");
            st.nothing_to_do = true;
            self.status.set_status(ModelStatus::Shutdown);
            return Ok(());
        }
        // the default count of one takes the count of the run
        if self.config.sub_values > 1 && record.sub_count != self.config.sub_values {
            return Err(RunError::Validation(format!(
                "run {run_id} has {} sub-values, not {}",
                record.sub_count, self.config.sub_values
            )));
        }

        let count = record.sub_count;
        st.sub_count = count;
        let sub_first = record.sub_restart.min(count);
        self.store.restart_run(run_id, sub_first)?;

        self.completion.init(count);
        self.completion.set_first(sub_first);
        st.sub_first = sub_first;

        if sub_first >= count {
            common::finalize_run(self.store.as_ref(), catalog, run_id)?;
            st.nothing_to_do = true;
            self.status.set_status(ModelStatus::Shutdown);
            return Ok(());
        }
        info!(run_id, sub_restart = sub_first, sub_values = count, "run restarted");
        Ok(())
    }
}

impl RunController for RestartController {
    fn role(&self) -> ControllerRole {
        ControllerRole::Restart
    }

    fn init(&self) -> Result<()> {
        ProcessTopology::from_config(&self.config, 1, 0)?;
        let catalog = self.store.load_catalog()?;
        common::check_catalog(&catalog)?;
        self.cleanup_restart_sub_value(&catalog)?;
        common::set_once(&self.catalog, Arc::new(catalog), "metadata catalog")
    }

    fn sub_value_count(&self) -> usize {
        match lock(&self.inner).sub_count {
            0 => self.config.sub_values,
            count => count,
        }
    }

    fn next_run(&self) -> Result<RunId> {
        let mut st = lock(&self.inner);
        if self.status.is_shutdown_or_exit() || st.nothing_to_do || st.started {
            self.status.set_status(ModelStatus::Shutdown);
            return Ok(0);
        }
        st.started = true;
        self.status.set_status(ModelStatus::Progress);
        Ok(self.run_id)
    }

    fn local_sub_values(&self, run_id: RunId) -> Range<usize> {
        let st = lock(&self.inner);
        if run_id != self.run_id || st.nothing_to_do {
            return 0..0;
        }
        st.sub_first..st.sub_count
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
        common::finalize_run(self.store.as_ref(), self.catalog()?, run_id)
    }

    fn shutdown_wait_all(&self) -> Result<()> {
        self.status.set_status(ModelStatus::Done);
        Ok(())
    }

    fn shutdown_on_exit(&self, status: ModelStatus) {
        common::mark_exit(self.store.as_ref(), self.run_id, None, status);
        self.status.set_status(status);
    }

    fn child_exchange(&self) -> Result<bool> {
        Ok(false)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
