//! Child process of a multi-process world.
//!
//! A child never touches the database. It receives its initial state, the
//! model metadata, then one run assignment plus the input parameters per
//! run, and sends every accumulator of its own sub-values back to the root,
//! together with the progress of those sub-values.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::{Arc, Mutex, OnceLock};

use tracing::{debug, info, warn};

use msim_msg::{accumulator_tag, BroadcastScope, MsgTag, Transport, TransportExt};
use msim_types::messages::{InitialState, ParameterMessage, RunAssignment, StatusMessage, SubValueState};
use msim_types::{MetadataCatalog, ModelStatus, ParamValues, RunConfig, RunId, ValueKind, ROOT_RANK};

use super::common::{self, lock};
use super::{ControllerRole, RunController};
use crate::completion::CompletionTracker;
use crate::error::{Result, RunError};
use crate::state::ProcessStatus;
use crate::topology::ProcessTopology;

#[derive(Debug, Default)]
struct ChildState {
    run_id: RunId,
    parameters: HashMap<String, Vec<ParamValues>>,
    /// Assignment picked up by `child_exchange` while idle.
    pending: Option<RunAssignment>,
}

pub struct ChildController {
    config: RunConfig,
    transport: Arc<dyn Transport>,
    status: Arc<ProcessStatus>,
    topology: OnceLock<ProcessTopology>,
    catalog: OnceLock<Arc<MetadataCatalog>>,
    completion: CompletionTracker,
    inner: Mutex<ChildState>,
}

impl ChildController {
    pub fn new(config: RunConfig, transport: Arc<dyn Transport>, status: Arc<ProcessStatus>) -> Self {
        Self {
            config,
            transport,
            status,
            topology: OnceLock::new(),
            catalog: OnceLock::new(),
            completion: CompletionTracker::default(),
            inner: Mutex::new(ChildState::default()),
        }
    }

    pub fn topology(&self) -> Option<&ProcessTopology> {
        self.topology.get()
    }

    fn topology_or_err(&self) -> Result<&ProcessTopology> {
        common::initialized(&self.topology, "topology")
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

    /// One parameter message per model parameter, in catalog order.
    fn receive_parameters(&self, catalog: &MetadataCatalog, group: usize) -> Result<HashMap<String, Vec<ParamValues>>> {
        let mut parameters = HashMap::with_capacity(catalog.parameters().len());
        for param in catalog.parameters() {
            let msg: ParameterMessage =
                self.transport.broadcast_value(BroadcastScope::Group(group), MsgTag::Parameter, None)?;
            if msg.name != param.name {
                return Err(RunError::Protocol(format!(
                    "expected parameter {}, received {}",
                    param.name, msg.name
                )));
            }
            if msg.values.is_empty() {
                return Err(RunError::Protocol(format!("parameter {} has no values", msg.name)));
            }
            parameters.insert(msg.name, msg.values);
        }
        Ok(parameters)
    }
}

impl RunController for ChildController {
    fn role(&self) -> ControllerRole {
        ControllerRole::Child
    }

    fn init(&self) -> Result<()> {
        let initial: InitialState = self.transport.receive_value(ROOT_RANK, MsgTag::Initial)?;
        if initial.status.is_shutdown_or_exit() {
            info!(rank = self.transport.rank(), "process is not used, exit");
            self.status.set_status(ModelStatus::Shutdown);
            return Ok(());
        }
        if initial.sub_value_count != self.config.sub_values || initial.thread_count != self.config.threads {
            debug!(
                sub_values = initial.sub_value_count,
                threads = initial.thread_count,
                "run options taken from the root process"
            );
        }

        let topology = ProcessTopology::compute(
            initial.sub_value_count,
            initial.thread_count,
            self.transport.world_size(),
            self.transport.rank(),
            initial.root_participates,
        );
        self.transport.create_groups(topology.group_size, topology.group_count)?;
        let catalog: MetadataCatalog = self.transport.broadcast_value(BroadcastScope::All, MsgTag::MetaData, None)?;
        if catalog.model_id() != initial.model_id {
            return Err(RunError::Protocol(format!(
                "metadata of model {} received, expected model {}",
                catalog.model_id(),
                initial.model_id
            )));
        }

        self.completion.init(topology.self_sub_count);
        common::set_once(&self.topology, topology, "topology")?;
        common::set_once(&self.catalog, Arc::new(catalog), "metadata catalog")?;

        info!(
            role = %self.role(),
            rank = topology.rank,
            group = topology.group_number,
            sub_values = ?topology.self_sub_values(),
            "controller initialized"
        );
        Ok(())
    }

    fn sub_value_count(&self) -> usize {
        self.topology.get().map_or(self.config.sub_values, |t| t.sub_value_count)
    }

    fn next_run(&self) -> Result<RunId> {
        if self.status.is_shutdown_or_exit() {
            return Ok(0);
        }
        let topology = *self.topology_or_err()?;
        let catalog = Arc::clone(self.catalog()?);

        let pending = lock(&self.inner).pending.take();
        let assignment = match pending {
            Some(a) => a,
            None => self.transport.broadcast_value(
                BroadcastScope::Group(topology.group_number),
                MsgTag::RunAssignment,
                None,
            )?,
        };

        if assignment.run_id == 0 {
            if assignment.status.is_exit() {
                self.status.set_status(assignment.status);
                return Err(RunError::Protocol(format!(
                    "root process stopped with status {}",
                    assignment.status
                )));
            }
            self.status.set_status(ModelStatus::Shutdown);
            debug!(rank = topology.rank, "no more runs");
            return Ok(0);
        }

        let parameters = self.receive_parameters(&catalog, topology.group_number)?;
        {
            let mut st = lock(&self.inner);
            st.run_id = assignment.run_id;
            st.parameters = parameters;
        }
        self.completion.init(topology.self_sub_count);
        self.status.set_status(ModelStatus::Progress);
        info!(run_id = assignment.run_id, set_id = assignment.set_id, rank = topology.rank, "run received");
        Ok(assignment.run_id)
    }

    fn local_sub_values(&self, run_id: RunId) -> Range<usize> {
        match self.topology.get() {
            Some(topology) if run_id > 0 && lock(&self.inner).run_id == run_id => topology.self_sub_values(),
            _ => 0..0,
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
        common::check_parameter(self.catalog()?, name, kind, size)?;

        let st = lock(&self.inner);
        let all = st
            .parameters
            .get(name)
            .ok_or_else(|| RunError::Protocol(format!("parameter {name} was not received")))?;
        let sub = sub_value_id.unwrap_or(0);
        let values = if all.len() == 1 {
            &all[0]
        } else {
            all.get(sub).ok_or_else(|| {
                RunError::Validation(format!("parameter {name} has no sub-value {sub}"))
            })?
        };
        values.expect_shape(kind, size)?;
        Ok(values.clone())
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
        let topology = self.topology_or_err()?;
        let local = topology.self_sub_values();
        if !local.contains(&sub_value_id) {
            return Err(RunError::Validation(format!(
                "sub-value {sub_value_id} is not computed by rank {}",
                topology.rank
            )));
        }
        let (_, range) = common::table_accumulators(self.catalog()?, table_name, values)?;

        let count = topology.sub_value_count;
        for (acc_index, vals) in range.zip(values) {
            self.transport.send_values(ROOT_RANK, accumulator_tag(sub_value_id, count, acc_index), vals)?;
        }
        if is_last_table {
            self.completion.set_at(sub_value_id - local.start);
        }
        Ok(())
    }

    /// Best effort: the root may already have finished the run and left.
    fn update_run_state(&self, states: &[SubValueState]) -> Result<()> {
        if states.is_empty() {
            return Ok(());
        }
        if let Err(e) = self.transport.send_value(ROOT_RANK, MsgTag::SubValueState, states) {
            warn!(states = states.len(), error = %e, "failed to send sub-value states to root");
        }
        Ok(())
    }

    fn shutdown_run(&self, run_id: RunId) -> Result<()> {
        self.check_run(run_id)?;
        if !self.completion.is_all() {
            return Err(RunError::Validation(format!(
                "run {run_id} is incomplete: {} of {} sub-values sent",
                self.completion.count(),
                self.completion.len()
            )));
        }
        self.transport.wait_send_all()?;

        let mut st = lock(&self.inner);
        st.run_id = 0;
        st.parameters.clear();
        debug!(run_id, "run sent to root");
        Ok(())
    }

    fn shutdown_wait_all(&self) -> Result<()> {
        self.transport.wait_send_all()?;
        self.status.set_status(ModelStatus::Done);
        info!(role = %self.role(), rank = self.transport.rank(), "all runs completed");
        Ok(())
    }

    fn shutdown_on_exit(&self, status: ModelStatus) {
        let run_id = lock(&self.inner).run_id;
        let msg = StatusMessage { run_id, status };
        if let Err(e) = self.transport.send_value(ROOT_RANK, MsgTag::Status, &msg) {
            warn!(run_id, %status, error = %e, "failed to report status to root");
        }
        if let Err(e) = self.transport.wait_send_all() {
            warn!(error = %e, "failed to flush messages to root");
        }
        self.status.set_status(status);
    }

    /// Pick up the next run assignment, or an early stop, without blocking.
    fn child_exchange(&self) -> Result<bool> {
        let mut st = lock(&self.inner);
        if st.pending.is_some() {
            return Ok(false);
        }
        let Some(assignment) = self.transport.try_receive_value::<RunAssignment>(ROOT_RANK, MsgTag::RunAssignment)? else {
            return Ok(false);
        };
        if assignment.run_id == 0 && assignment.status.is_exit() {
            self.status.set_status(assignment.status);
            return Err(RunError::Protocol(format!("root process stopped with status {}", assignment.status)));
        }
        st.pending = Some(assignment);
        Ok(true)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
