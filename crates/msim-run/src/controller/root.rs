//! Root process of a multi-process world.
//!
//! ```text
//!   init:      Initial ──► each child (exit for unused ranks)
//!              MetaData ─► all groups
//!   next_run:  create run ─► RunAssignment + Parameter ─► idle group
//!   exchange:  accumulators ◄── children ─► database, checkpoint
//!              sub-value states ◄── children ─► database
//!              Status ◄── failed child
//!   end:       RunAssignment(run 0, shutdown | error) ─► all groups
//! ```
//!
//! The root owns the database connection and every run group. It computes
//! sub-values itself only as part of the last group, when it is active.

use std::ops::Range;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use tracing::{debug, info, warn};

use msim_msg::{BroadcastScope, MsgTag, Transport, TransportExt};
use msim_store::{NewRun, RunStore};
use msim_types::messages::{InitialState, ParameterMessage, RunAssignment, StatusMessage, SubValueState};
use msim_types::{MetadataCatalog, ModelStatus, ParamValues, RunConfig, RunId, TaskRunId, ValueKind};

use super::common::{self, lock};
use super::{ControllerRole, RunController};
use crate::error::{Result, RunError};
use crate::exchange::AccumulatorExchange;
use crate::run_group::RunGroup;
use crate::state::ProcessStatus;
use crate::topology::ProcessTopology;

#[derive(Debug, Default)]
struct RootState {
    groups: Vec<RunGroup>,
    exchange: AccumulatorExchange,
    task_run_id: Option<TaskRunId>,
    created_any: bool,
    /// The database has no more runs for this process.
    no_more_runs: bool,
    /// Final run assignment sent to every group.
    stop_sent: bool,
}

pub struct RootController {
    config: RunConfig,
    store: Arc<dyn RunStore>,
    transport: Arc<dyn Transport>,
    status: Arc<ProcessStatus>,
    topology: OnceLock<ProcessTopology>,
    catalog: OnceLock<Arc<MetadataCatalog>>,
    inner: Mutex<RootState>,
}

impl RootController {
    pub fn new(
        config: RunConfig,
        store: Arc<dyn RunStore>,
        transport: Arc<dyn Transport>,
        status: Arc<ProcessStatus>,
    ) -> Self {
        Self {
            config,
            store,
            transport,
            status,
            topology: OnceLock::new(),
            catalog: OnceLock::new(),
            inner: Mutex::new(RootState::default()),
        }
    }

    pub fn topology(&self) -> Option<&ProcessTopology> {
        self.topology.get()
    }

    fn catalog(&self) -> Result<&Arc<MetadataCatalog>> {
        common::initialized(&self.catalog, "metadata catalog")
    }

    fn state(&self) -> MutexGuard<'_, RootState> {
        lock(&self.inner)
    }

    // ── Init ────────────────────────────────────────────────────────────

    /// Tell every child its initial state; ranks outside of all groups exit.
    fn send_initial_state(&self, topology: &ProcessTopology, catalog: &MetadataCatalog) -> Result<()> {
        for rank in 1..self.transport.world_size() {
            let child = ProcessTopology::compute(
                self.config.sub_values,
                self.config.threads,
                topology.world_size,
                rank,
                self.config.root_participates,
            );
            let status = if child.is_unused() { ModelStatus::Exit } else { ModelStatus::Init };
            let initial = InitialState {
                status,
                model_id: catalog.model_id(),
                sub_value_count: self.config.sub_values,
                thread_count: self.config.threads,
                root_participates: self.config.root_participates,
            };
            self.transport.send_value(rank, MsgTag::Initial, &initial)?;
            debug!(rank, %status, "initial state sent");
        }
        Ok(())
    }

    // ── Runs ────────────────────────────────────────────────────────────

    /// Every sub-value of one parameter; a single entry if all are equal.
    fn parameter_message(&self, run_id: RunId, name: &str) -> Result<ParameterMessage> {
        let mut values = (0..self.config.sub_values)
            .map(|sub| self.store.read_parameter(run_id, name, sub))
            .collect::<std::result::Result<Vec<ParamValues>, _>>()?;
        if values.windows(2).all(|w| w[0] == w[1]) {
            values.truncate(1);
        }
        Ok(ParameterMessage { name: name.to_string(), values })
    }

    /// Bind a new run to group `index`, send it to the group's children and
    /// expect their accumulators.
    fn assign_run(&self, st: &mut RootState, index: usize, new: NewRun, catalog: &MetadataCatalog) -> Result<()> {
        let RootState { groups, exchange, .. } = st;
        let group = &mut groups[index];
        group.next_run(new.run_id, new.set_id, ModelStatus::Progress);

        if group.child_count > 0 {
            let scope = BroadcastScope::Group(group.group_number);
            let assignment = RunAssignment { run_id: new.run_id, set_id: new.set_id, status: ModelStatus::Progress };
            self.transport.broadcast_value(scope, MsgTag::RunAssignment, Some(assignment))?;

            for param in catalog.parameters() {
                let msg = self.parameter_message(new.run_id, &param.name)?;
                self.transport.broadcast_value(scope, MsgTag::Parameter, Some(msg))?;
            }
        }
        exchange.append_receive_list(group, catalog, self.config.sub_values)?;

        info!(
            run_id = new.run_id,
            set_id = new.set_id,
            group = group.group_number,
            use_root = group.is_use_root,
            "run assigned to group"
        );
        Ok(())
    }

    /// Send the final run assignment to every group, once.
    fn stop_children(&self, st: &mut RootState, status: ModelStatus) -> Result<()> {
        if st.stop_sent || self.transport.world_size() <= 1 {
            return Ok(());
        }
        st.stop_sent = true;
        self.transport.broadcast_value(BroadcastScope::All, MsgTag::RunAssignment, Some(RunAssignment::stop(status)))?;
        info!(%status, "children stopped");
        Ok(())
    }

    /// A child that failed reports its status; that fails the whole process.
    fn poll_child_status(&self, groups: &[RunGroup]) -> Result<()> {
        for rank in groups.iter().flat_map(RunGroup::child_ranks) {
            if let Some(msg) = self.transport.try_receive_value::<StatusMessage>(rank, MsgTag::Status)? {
                debug!(rank, run_id = msg.run_id, status = %msg.status, "child status");
                if msg.status.is_exit() {
                    return Err(RunError::ChildFailed { rank, status: msg.status.to_string() });
                }
            }
        }
        Ok(())
    }

    /// Persist every batch of sub-value states the children sent so far.
    fn receive_sub_value_states(&self, groups: &[RunGroup]) -> Result<usize> {
        let mut received = 0;
        for rank in groups.iter().flat_map(RunGroup::child_ranks) {
            while let Some(states) =
                self.transport.try_receive_value::<Vec<SubValueState>>(rank, MsgTag::SubValueState)?
            {
                common::persist_sub_value_states(self.store.as_ref(), &states)?;
                received += states.len();
            }
        }
        Ok(received)
    }

    /// Group whose run the root computes itself.
    fn own_group(st: &RootState, run_id: RunId) -> Option<&RunGroup> {
        st.groups.iter().find(|g| g.is_use_root && g.run_id == run_id && run_id > 0)
    }

    fn sleep(&self) {
        std::thread::sleep(self.config.poll_interval);
    }
}

impl RunController for RootController {
    fn role(&self) -> ControllerRole {
        ControllerRole::Root
    }

    fn init(&self) -> Result<()> {
        let topology = ProcessTopology::from_config(&self.config, self.transport.world_size(), self.transport.rank())?;
        let catalog = self.store.load_catalog()?;
        common::check_catalog(&catalog)?;

        self.transport.create_groups(topology.group_size, topology.group_count)?;
        self.send_initial_state(&topology, &catalog)?;
        self.transport.broadcast_value(BroadcastScope::All, MsgTag::MetaData, Some(catalog.clone()))?;

        let task_run_id = common::create_task_run(self.store.as_ref(), &self.config)?;
        {
            let mut st = self.state();
            st.groups = RunGroup::all(&topology);
            st.task_run_id = task_run_id;
        }
        common::set_once(&self.topology, topology, "topology")?;
        common::set_once(&self.catalog, Arc::new(catalog), "metadata catalog")?;

        info!(
            role = %self.role(),
            world_size = topology.world_size,
            group_size = topology.group_size,
            group_count = topology.group_count,
            root_active = topology.is_root_active,
            sub_values = topology.sub_value_count,
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
        let catalog = Arc::clone(self.catalog()?);
        let mut st = self.state();

        // ── 1. Fill idle groups ─────────────────────────────────────────
        while !st.no_more_runs {
            let Some(index) = st.groups.iter().position(RunGroup::is_idle) else {
                break;
            };
            let current = if st.created_any { ModelStatus::Progress } else { ModelStatus::Init };
            let request = common::new_run_request(&self.config, st.task_run_id, current);
            let new = self.store.create_new_run(&request)?;

            if new.run_id == 0 {
                if new.status == ModelStatus::Wait {
                    self.status.set_status(ModelStatus::Wait);
                } else {
                    debug!(status = %new.status, "no more runs");
                    st.no_more_runs = true;
                }
                break;
            }
            st.created_any = true;
            self.assign_run(&mut st, index, new, &catalog)?;
            self.status.set_status(ModelStatus::Progress);
        }

        // ── 2. Run of the root's own group ──────────────────────────────
        if let Some(own) = st.groups.iter().find(|g| g.is_use_root && !g.is_idle()) {
            return Ok(own.run_id);
        }

        // ── 3. Stop once every group is idle ────────────────────────────
        if st.no_more_runs && st.groups.iter().all(RunGroup::is_idle) {
            self.stop_children(&mut st, ModelStatus::Shutdown)?;
            self.status.set_status(ModelStatus::Shutdown);
        }
        Ok(0)
    }

    fn local_sub_values(&self, run_id: RunId) -> Range<usize> {
        let st = self.state();
        match (Self::own_group(&st, run_id), self.topology.get()) {
            (Some(_), Some(topology)) => topology.self_sub_values(),
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
        if Self::own_group(&self.state(), run_id).is_none() {
            return Err(RunError::Validation(format!("run {run_id} is not computed by the root process")));
        }
        common::write_accumulators(self.store.as_ref(), self.catalog()?, run_id, sub_value_id, table_name, values)?;

        if is_last_table {
            let st = self.state();
            if let Some(group) = Self::own_group(&st, run_id) {
                group.completion.set_at(sub_value_id);
                self.store.update_restart_sub_value(run_id, group.completion.count_first())?;
            }
        }
        Ok(())
    }

    /// Wait until the children sent every remaining sub-value of the
    /// root's own run, then finalize it.
    fn update_run_state(&self, states: &[SubValueState]) -> Result<()> {
        common::persist_sub_value_states(self.store.as_ref(), states)
    }

    fn shutdown_run(&self, run_id: RunId) -> Result<()> {
        loop {
            {
                let st = self.state();
                match Self::own_group(&st, run_id) {
                    None => return Ok(()),
                    Some(group) if group.completion.is_all() => break,
                    Some(_) => {}
                }
            }
            if !self.child_exchange()? {
                self.sleep();
            }
        }

        let catalog = Arc::clone(self.catalog()?);
        let mut st = self.state();
        common::finalize_run(self.store.as_ref(), &catalog, run_id)?;
        st.exchange.remove_run(run_id);
        if let Some(group) = st.groups.iter_mut().find(|g| g.run_id == run_id) {
            group.reset();
        }
        Ok(())
    }

    fn shutdown_wait_all(&self) -> Result<()> {
        loop {
            if self.state().groups.iter().all(RunGroup::is_idle) {
                break;
            }
            if !self.child_exchange()? {
                self.sleep();
            }
        }

        let mut st = self.state();
        self.stop_children(&mut st, ModelStatus::Shutdown)?;
        self.transport.wait_send_all()?;
        if let Some(task_run_id) = st.task_run_id {
            self.store.set_task_run_status(task_run_id, ModelStatus::Done)?;
        }
        self.status.set_status(ModelStatus::Done);
        info!(role = %self.role(), "all runs completed");
        Ok(())
    }

    fn shutdown_on_exit(&self, status: ModelStatus) {
        let mut st = self.state();
        for group in st.groups.iter().filter(|g| !g.is_idle()) {
            common::mark_exit(self.store.as_ref(), group.run_id, None, status);
        }
        common::mark_exit(self.store.as_ref(), 0, st.task_run_id, status);

        if let Err(e) = self.stop_children(&mut st, status) {
            warn!(error = %e, "failed to stop child processes");
        }
        if let Err(e) = self.transport.wait_send_all() {
            warn!(error = %e, "failed to flush messages to child processes");
        }
        self.status.set_status(status);
    }

    fn child_exchange(&self) -> Result<bool> {
        let catalog = Arc::clone(self.catalog()?);
        let mut st = self.state();
        let RootState { groups, exchange, .. } = &mut *st;

        let received = exchange.receive(self.transport.as_ref(), self.store.as_ref())?;
        exchange.update_receive_list(groups, self.store.as_ref())?;
        let states = self.receive_sub_value_states(groups)?;
        let mut progress = received > 0 || states > 0;

        for group in groups.iter_mut().filter(|g| !g.is_idle() && !g.is_use_root && g.completion.is_all()) {
            common::finalize_run(self.store.as_ref(), &catalog, group.run_id)?;
            exchange.remove_run(group.run_id);
            info!(run_id = group.run_id, group = group.group_number, "group run completed");
            group.reset();
            progress = true;
        }

        self.poll_child_status(groups)?;
        Ok(progress)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use msim_msg::{accumulator_tag, LocalEndpoint, LocalWorld};
    use msim_store::{demo, MemoryStore};
    use msim_types::RunStatusCode;

    fn root(config: RunConfig, world: &mut Vec<LocalEndpoint>) -> (RootController, Arc<MemoryStore>, Arc<ProcessStatus>) {
        let store = Arc::new(demo::store().unwrap());
        let status = Arc::new(ProcessStatus::new());
        let transport: Arc<dyn Transport> = Arc::new(world.remove(0));
        let ctrl = RootController::new(config, store.clone(), transport, status.clone());
        (ctrl, store, status)
    }

    /// Everything a child of `catalog` would send for one sub-value.
    fn send_sub_value(child: &LocalEndpoint, catalog: &MetadataCatalog, sub: usize, count: usize) {
        for (index, acc) in catalog.accumulators().iter().enumerate() {
            let cells = catalog.table_by_id(acc.table_id).unwrap().cell_count;
            child.send_values(0, accumulator_tag(sub, count, index), &vec![1.0; cells]).unwrap();
        }
    }

    #[test]
    fn unused_child_is_told_to_exit() {
        // 2 sub-values, 1 thread, 4 ranks, root idle: one group of 2 children, rank 3 unused
        let mut world = LocalWorld::new(4);
        let config = RunConfig { sub_values: 2, threads: 1, root_participates: false, ..RunConfig::default() };
        let (ctrl, _, _) = root(config, &mut world);
        ctrl.init().unwrap();

        let initial: Vec<InitialState> =
            world.iter().map(|c| c.receive_value(0, MsgTag::Initial).unwrap()).collect();
        assert_eq!(initial[0].status, ModelStatus::Init);
        assert_eq!(initial[1].status, ModelStatus::Init);
        assert_eq!(initial[2].status, ModelStatus::Exit);

        let catalog: MetadataCatalog =
            world[0].broadcast_value(BroadcastScope::All, MsgTag::MetaData, None).unwrap();
        assert_eq!(catalog.accumulator_count(), 3);
        assert_eq!(world[2].try_receive(0, MsgTag::MetaData.tag()).unwrap(), None);
    }

    #[test]
    fn idle_root_collects_a_run_from_its_children() {
        let mut world = LocalWorld::new(3);
        let config = RunConfig { sub_values: 2, threads: 1, root_participates: false, ..RunConfig::default() };
        let (ctrl, store, status) = root(config, &mut world);
        ctrl.init().unwrap();
        let catalog = store.load_catalog().unwrap();

        // the root computes nothing: next_run hands out the run and returns 0
        assert_eq!(ctrl.next_run().unwrap(), 0);
        assert_eq!(status.status(), ModelStatus::Progress);

        for child in &world {
            let _: InitialState = child.receive_value(0, MsgTag::Initial).unwrap();
            let _: MetadataCatalog = child.broadcast_value(BroadcastScope::All, MsgTag::MetaData, None).unwrap();
        }
        let assignments: Vec<RunAssignment> = world
            .iter()
            .map(|c| c.broadcast_value(BroadcastScope::Group(1), MsgTag::RunAssignment, None).unwrap())
            .collect();
        let run_id = assignments[0].run_id;
        assert!(run_id > 0);
        assert_eq!(assignments[1], assignments[0]);

        send_sub_value(&world[1], &catalog, 1, 2);
        assert!(ctrl.child_exchange().unwrap());
        assert_eq!(store.run_record(run_id).unwrap().unwrap().status, RunStatusCode::Progress);

        send_sub_value(&world[0], &catalog, 0, 2);
        assert!(ctrl.child_exchange().unwrap());
        assert_eq!(store.run_record(run_id).unwrap().unwrap().status, RunStatusCode::Done);

        // single run: no more work, children are stopped
        assert_eq!(ctrl.next_run().unwrap(), 0);
        assert_eq!(status.status(), ModelStatus::Shutdown);
        ctrl.shutdown_wait_all().unwrap();
        for child in &world {
            let stop: RunAssignment = child.receive_value(0, MsgTag::RunAssignment).unwrap();
            assert_eq!(stop, RunAssignment::stop(ModelStatus::Shutdown));
        }
    }

    #[test]
    fn failed_child_fails_the_root() {
        let mut world = LocalWorld::new(2);
        let config = RunConfig { sub_values: 1, ..RunConfig::default() };
        let (ctrl, store, _) = root(config, &mut world);
        ctrl.init().unwrap();
        ctrl.next_run().unwrap();
        let run_id = store.runs().unwrap()[0].run_id;

        world[0].send_value(0, MsgTag::Status, &StatusMessage { run_id, status: ModelStatus::Error }).unwrap();
        assert!(matches!(ctrl.child_exchange(), Err(RunError::ChildFailed { rank: 1, .. })));

        ctrl.shutdown_on_exit(ModelStatus::Error);
        assert_eq!(store.run_record(run_id).unwrap().unwrap().status, RunStatusCode::Error);
    }

    #[test]
    fn child_progress_is_persisted() {
        let mut world = LocalWorld::new(2);
        let config = RunConfig { sub_values: 1, ..RunConfig::default() };
        let (ctrl, store, _) = root(config, &mut world);
        ctrl.init().unwrap();
        ctrl.next_run().unwrap();
        let run_id = store.runs().unwrap()[0].run_id;

        let state = SubValueState {
            run_id,
            sub_value_id: 0,
            status: ModelStatus::Progress,
            progress_count: 2,
            progress_value: 40.0,
            updated_at: chrono::Utc::now(),
        };
        world[0].send_value(0, MsgTag::SubValueState, &vec![state]).unwrap();
        assert!(ctrl.child_exchange().unwrap());

        let persisted = store.run_output(run_id).unwrap().sub_values;
        assert_eq!(persisted.get(&0), Some(&state));
        assert!(!ctrl.child_exchange().unwrap());
    }
}
