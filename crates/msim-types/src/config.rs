// Run configuration. Built by the CLI, consumed by the controller factory.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::{Result, TypesError};
use crate::{RunId, SetId, TaskId};

/// Receive-probe interval: how long to sleep between polls of a transport
/// or a worker pool when nothing arrived.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(31);

/// Upper bound of the driver's idle back-off while waiting for input.
pub const DEFAULT_MAX_IDLE_SLEEP: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Number of sub-values (members, replicas) of every run.
    pub sub_values: usize,

    /// Worker threads per process.
    pub threads: usize,

    /// If `false` the root process only coordinates and runs no sub-values.
    pub root_participates: bool,

    /// Modeling task to run; `task_id` wins over `task_name`.
    pub task_id: Option<TaskId>,
    pub task_name: Option<String>,

    /// Input working set of a single (non-task) run; `set_id` wins over `set_name`.
    pub set_id: Option<SetId>,
    pub set_name: Option<String>,

    /// Resume this run instead of creating new ones.
    pub restart_run_id: Option<RunId>,

    pub run_name: Option<String>,
    pub task_run_name: Option<String>,

    /// Task is under external supervision: wait for new working sets
    /// instead of shutting down when the task runs out of input.
    pub wait_task: bool,

    /// `Parameter.<name>=<value>` run options.
    pub parameter_overrides: BTreeMap<String, String>,

    pub poll_interval: Duration,
    pub max_idle_sleep: Duration,

    /// Unique stamp shared by every run this process creates.
    pub run_stamp: String,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            sub_values: 1,
            threads: 1,
            root_participates: true,
            task_id: None,
            task_name: None,
            set_id: None,
            set_name: None,
            restart_run_id: None,
            run_name: None,
            task_run_name: None,
            wait_task: false,
            parameter_overrides: BTreeMap::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_idle_sleep: DEFAULT_MAX_IDLE_SLEEP,
            run_stamp: uuid::Uuid::new_v4().to_string(),
        }
    }
}

impl RunConfig {
    /// Reject settings that make topology impossible to compute.
    pub fn validate(&self) -> Result<()> {
        if self.sub_values == 0 {
            return Err(TypesError::Config("number of sub-values must be positive".into()));
        }
        if self.threads == 0 {
            return Err(TypesError::Config("number of threads must be positive".into()));
        }
        if self.poll_interval.is_zero() {
            return Err(TypesError::Config("poll interval must be positive".into()));
        }
        if self.max_idle_sleep < self.poll_interval {
            return Err(TypesError::Config(
                "max idle sleep must not be shorter than the poll interval".into(),
            ));
        }
        if self.restart_run_id == Some(0) {
            return Err(TypesError::Config("restart run id must be positive".into()));
        }
        Ok(())
    }

    pub fn is_task(&self) -> bool {
        self.task_id.is_some() || self.task_name.is_some()
    }
}
