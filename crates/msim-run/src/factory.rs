//! Pick the controller for this process.

use std::sync::Arc;

use tracing::debug;

use msim_msg::Transport;
use msim_store::RunStore;
use msim_types::{Rank, RunConfig, ROOT_RANK};

use crate::controller::{
    ChildController, ControllerRole, RestartController, RootController, RunController, SingleController,
};
use crate::error::{Result, RunError};
use crate::state::ProcessStatus;

/// Role of a process from its place in the world and the run options.
pub fn select_role(world_size: usize, rank: Rank, config: &RunConfig) -> Result<ControllerRole> {
    if world_size <= 1 {
        return Ok(if config.restart_run_id.is_some() { ControllerRole::Restart } else { ControllerRole::Single });
    }
    if config.restart_run_id.is_some() {
        return Err(RunError::Validation(
            "restart of a run is supported by a single process only".into(),
        ));
    }
    Ok(if rank == ROOT_RANK { ControllerRole::Root } else { ControllerRole::Child })
}

/// Build the controller for this process.
///
/// Without a transport the process is alone in its world. Every role except
/// a child needs the database.
pub fn create_controller(
    config: RunConfig,
    store: Option<Arc<dyn RunStore>>,
    transport: Option<Arc<dyn Transport>>,
    status: Arc<ProcessStatus>,
) -> Result<Arc<dyn RunController>> {
    config.validate()?;
    let (world_size, rank) = transport.as_ref().map_or((1, ROOT_RANK), |t| (t.world_size(), t.rank()));
    let role = select_role(world_size, rank, &config)?;
    debug!(%role, world_size, rank, "controller selected");

    let require_store = |store: Option<Arc<dyn RunStore>>| {
        store.ok_or_else(|| RunError::Validation(format!("{role} process requires a model database")))
    };

    let controller: Arc<dyn RunController> = match (role, transport) {
        (ControllerRole::Single, _) => Arc::new(SingleController::new(config, require_store(store)?, status)),
        (ControllerRole::Restart, _) => Arc::new(RestartController::new(config, require_store(store)?, status)?),
        (ControllerRole::Root, Some(transport)) => {
            Arc::new(RootController::new(config, require_store(store)?, transport, status))
        }
        (ControllerRole::Child, Some(transport)) => Arc::new(ChildController::new(config, transport, status)),
        (role, None) => return Err(RunError::Validation(format!("{role} process requires a transport"))),
    };
    Ok(controller)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use msim_msg::LocalWorld;
    use msim_store::demo;

    #[test]
    fn role_by_world_rank_and_restart() {
        let plain = RunConfig::default();
        let restart = RunConfig { restart_run_id: Some(5), ..RunConfig::default() };

        assert_eq!(select_role(1, 0, &plain).unwrap(), ControllerRole::Single);
        assert_eq!(select_role(1, 0, &restart).unwrap(), ControllerRole::Restart);
        assert_eq!(select_role(4, 0, &plain).unwrap(), ControllerRole::Root);
        assert_eq!(select_role(4, 3, &plain).unwrap(), ControllerRole::Child);
        assert!(matches!(select_role(4, 0, &restart), Err(RunError::Validation(_))));
    }

    #[test]
    fn controllers_from_capabilities() {
        let store: Arc<dyn RunStore> = Arc::new(demo::store().unwrap());
        let status = Arc::new(ProcessStatus::new());

        let single = create_controller(RunConfig::default(), Some(store.clone()), None, status.clone()).unwrap();
        assert_eq!(single.role(), ControllerRole::Single);

        let mut world = LocalWorld::new(2);
        let child: Arc<dyn Transport> = Arc::new(world.remove(1));
        let root: Arc<dyn Transport> = Arc::new(world.remove(0));

        let ctrl = create_controller(RunConfig::default(), Some(store.clone()), Some(root), status.clone()).unwrap();
        assert_eq!(ctrl.role(), ControllerRole::Root);
        let ctrl = create_controller(RunConfig::default(), None, Some(child), status.clone()).unwrap();
        assert_eq!(ctrl.role(), ControllerRole::Child);

        assert!(create_controller(RunConfig::default(), None, None, status.clone()).is_err());
        let bad = RunConfig { sub_values: 0, ..RunConfig::default() };
        assert!(create_controller(bad, Some(store), None, status).is_err());
    }
}
