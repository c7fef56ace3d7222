//! Run driver: the process main loop and its pool of sub-value workers.
//!
//! ```text
//!   init
//!    │
//!    ▼
//!   next_run ──0, wait──► child_exchange, sleep (back-off) ──┐
//!    │   ▲                                                  │
//!    │   └──────────────────────────────────────────────────┘
//!    │ run
//!    ▼
//!   local sub-values ──► JoinSet (≤ threads) ──► Worker::run_sub_value
//!    │                        │ poll interval elapsed
//!    │                        └─► update_run_state, child_exchange
//!    ▼ update_run_state
//!   shutdown_run ──► next_run ... 0, shutdown ──► shutdown_wait_all
//! ```
//!
//! Controller calls block (transport receives, database writes), so every
//! one of them runs on the blocking pool. On any error the driver calls
//! `shutdown_on_exit(error)` before returning it.

use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use msim_types::{ModelStatus, ParamValues, RunConfig, RunId, ValueKind};

use crate::controller::RunController;
use crate::error::{Result, RunError};
use crate::state::{ProcessStatus, RunStateMap};

// ── Worker ────────────────────────────────────────────────────────────────────

/// Model code computing one sub-value of one run.
///
/// Called on a blocking thread; up to `threads` sub-values run at once.
/// The worker reads its inputs and hands off every output table through
/// the context, the last table with `is_last_table = true`.
pub trait Worker: Send + Sync + 'static {
    fn run_sub_value(&self, ctx: &SubValueContext) -> Result<()>;
}

/// What a worker sees of the run it computes.
#[derive(Clone)]
pub struct SubValueContext {
    pub run_id: RunId,
    pub sub_value_id: usize,
    pub sub_value_count: usize,
    controller: Arc<dyn RunController>,
    states: Arc<RunStateMap>,
}

impl SubValueContext {
    pub fn read_parameter(&self, name: &str, kind: ValueKind, size: usize) -> Result<ParamValues> {
        self.controller.read_parameter(self.run_id, name, Some(self.sub_value_id), kind, size)
    }

    pub fn write_accumulators(&self, is_last_table: bool, table_name: &str, values: &[Vec<f64>]) -> Result<()> {
        self.controller
            .write_accumulators(self.run_id, self.sub_value_id, is_last_table, table_name, values)
    }

    pub fn report_progress(&self, count: u32, value: f64) {
        self.states.update_progress(self.run_id, self.sub_value_id, count, value);
    }

    /// Error for a failure in the model code itself.
    pub fn fail(&self, message: impl Into<String>) -> RunError {
        RunError::Worker { run_id: self.run_id, sub_value_id: self.sub_value_id, message: message.into() }
    }
}

// ── RunDriver ─────────────────────────────────────────────────────────────────

pub struct RunDriver {
    controller: Arc<dyn RunController>,
    worker: Arc<dyn Worker>,
    status: Arc<ProcessStatus>,
    states: Arc<RunStateMap>,
    threads: usize,
    poll_interval: Duration,
    max_idle_sleep: Duration,
}

impl RunDriver {
    pub fn new(
        controller: Arc<dyn RunController>,
        worker: Arc<dyn Worker>,
        status: Arc<ProcessStatus>,
        config: &RunConfig,
    ) -> Self {
        Self {
            controller,
            worker,
            status,
            states: Arc::new(RunStateMap::new()),
            threads: config.threads.max(1),
            poll_interval: config.poll_interval,
            max_idle_sleep: config.max_idle_sleep,
        }
    }

    /// Status of every sub-value currently tracked.
    pub fn states(&self) -> &Arc<RunStateMap> {
        &self.states
    }

    pub fn controller(&self) -> &Arc<dyn RunController> {
        &self.controller
    }

    /// Run the process to the end. Returns the final process status.
    pub async fn run(&self) -> Result<ModelStatus> {
        let role = self.controller.role();
        match self.run_loop().await {
            Ok(()) => {
                let status = self.status.status();
                info!(%role, %status, "process completed");
                Ok(status)
            }
            Err(e) => {
                error!(%role, error = %e, "process failed");
                self.exit(ModelStatus::Error).await;
                Err(e)
            }
        }
    }

    /// Abnormal stop with `status`, e.g. on a termination signal.
    pub async fn exit(&self, status: ModelStatus) {
        let ctrl = Arc::clone(&self.controller);
        let result = blocking(move || {
            ctrl.shutdown_on_exit(status);
            Ok(())
        })
        .await;
        if let Err(e) = result {
            warn!(%status, error = %e, "shutdown on exit did not complete");
        }
    }

    async fn run_loop(&self) -> Result<()> {
        let ctrl = Arc::clone(&self.controller);
        blocking(move || ctrl.init()).await?;

        let mut idle: u32 = 0;
        loop {
            let ctrl = Arc::clone(&self.controller);
            let run_id = blocking(move || ctrl.next_run()).await?;

            if run_id == 0 {
                if self.status.is_shutdown_or_exit() {
                    break;
                }
                // waiting for more runs or for children to finish
                let ctrl = Arc::clone(&self.controller);
                if blocking(move || ctrl.child_exchange()).await? {
                    idle = 0;
                } else {
                    idle = idle.saturating_add(1);
                }
                tokio::time::sleep(self.idle_sleep(idle)).await;
                continue;
            }
            idle = 0;

            self.run_sub_values(run_id).await?;
            let ctrl = Arc::clone(&self.controller);
            blocking(move || ctrl.shutdown_run(run_id)).await?;
        }

        if self.status.is_exit() {
            return Ok(());
        }
        let ctrl = Arc::clone(&self.controller);
        blocking(move || ctrl.shutdown_wait_all()).await
    }

    /// Sleep after `idle` polls without progress: grows with each poll up to
    /// the maximum idle sleep.
    fn idle_sleep(&self, idle: u32) -> Duration {
        self.poll_interval.saturating_mul(idle.max(1)).min(self.max_idle_sleep)
    }

    /// Compute every local sub-value of `run_id`, at most `threads` at once.
    ///
    /// The first failure stops new sub-values from starting; those already
    /// running are waited for before the failure is returned.
    async fn run_sub_values(&self, run_id: RunId) -> Result<()> {
        let range: Range<usize> = self.controller.local_sub_values(run_id);
        let sub_value_count = self.controller.sub_value_count();
        debug!(run_id, sub_values = ?range, threads = self.threads, "run sub-values");

        let mut pending = range;
        let mut workers: JoinSet<(usize, Result<()>)> = JoinSet::new();
        let mut failure: Option<RunError> = None;

        loop {
            while failure.is_none() && workers.len() < self.threads {
                let Some(sub_value_id) = pending.next() else { break };
                self.states.add(run_id, sub_value_id);

                let ctx = SubValueContext {
                    run_id,
                    sub_value_id,
                    sub_value_count,
                    controller: Arc::clone(&self.controller),
                    states: Arc::clone(&self.states),
                };
                let worker = Arc::clone(&self.worker);
                workers.spawn_blocking(move || (ctx.sub_value_id, worker.run_sub_value(&ctx)));
            }
            if workers.is_empty() {
                break;
            }

            match tokio::time::timeout(self.poll_interval, workers.join_next()).await {
                Err(_elapsed) => {
                    if let Err(e) = self.sync_states().await {
                        failure.get_or_insert(e);
                    }
                    let ctrl = Arc::clone(&self.controller);
                    if let Err(e) = blocking(move || ctrl.child_exchange()).await {
                        failure.get_or_insert(e);
                    }
                }
                Ok(None) => break,
                Ok(Some(Ok((sub_value_id, Ok(()))))) => {
                    self.states.update_status(run_id, sub_value_id, ModelStatus::Done);
                    debug!(run_id, sub_value_id, "sub-value done");
                }
                Ok(Some(Ok((sub_value_id, Err(e))))) => {
                    self.states.update_status(run_id, sub_value_id, ModelStatus::Error);
                    error!(run_id, sub_value_id, error = %e, "sub-value failed");
                    failure.get_or_insert(e);
                }
                Ok(Some(Err(join))) => {
                    failure.get_or_insert(RunError::Join(join.to_string()));
                }
            }
        }

        if let Err(e) = self.sync_states().await {
            failure.get_or_insert(e);
        }
        let removed = self.states.remove_shutdown_or_exit();
        debug!(run_id, removed = removed.len(), "sub-value states released");
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Hand every sub-value state changed since the last sync to the controller.
    async fn sync_states(&self) -> Result<()> {
        let updates = self.states.take_updates();
        if updates.is_empty() {
            return Ok(());
        }
        let ctrl = Arc::clone(&self.controller);
        blocking(move || ctrl.update_run_state(&updates)).await
    }
}

/// Run a blocking controller call on the blocking pool.
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| RunError::Join(e.to_string()))?
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::SingleController;
    use crate::factory::create_controller;
    use msim_msg::{LocalWorld, Transport};
    use msim_store::{demo, MemoryStore, RunStore};
    use msim_types::RunStatusCode;

    struct Constant;

    impl Worker for Constant {
        fn run_sub_value(&self, ctx: &SubValueContext) -> Result<()> {
            let age = ctx.read_parameter("StartAge", ValueKind::Int, 1)?;
            let ParamValues::Int(age) = age else {
                return Err(ctx.fail("StartAge is not an integer"));
            };
            ctx.report_progress(1, 50.0);
            let income = age[0] as f64 + ctx.sub_value_id as f64;
            ctx.write_accumulators(false, "incomeByAge", &[vec![income; 4], vec![1.0; 4]])?;
            ctx.write_accumulators(true, "deaths", &[vec![0.0; 2]])
        }
    }

    struct FailAt(usize);

    impl Worker for FailAt {
        fn run_sub_value(&self, ctx: &SubValueContext) -> Result<()> {
            if ctx.sub_value_id == self.0 {
                return Err(ctx.fail("simulated failure"));
            }
            Constant.run_sub_value(ctx)
        }
    }

    fn driver(config: RunConfig, worker: Arc<dyn Worker>) -> (RunDriver, Arc<MemoryStore>, Arc<ProcessStatus>) {
        let store = Arc::new(demo::store().unwrap());
        let status = Arc::new(ProcessStatus::new());
        let ctrl = Arc::new(SingleController::new(config.clone(), store.clone(), status.clone()));
        (RunDriver::new(ctrl, worker, status.clone(), &config), store, status)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn single_process_runs_to_done() {
        let config = RunConfig { sub_values: 8, threads: 4, ..RunConfig::default() };
        let (driver, store, status) = driver(config, Arc::new(Constant));

        assert_eq!(driver.run().await.unwrap(), ModelStatus::Done);
        assert_eq!(status.status(), ModelStatus::Done);

        let runs = store.runs().unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatusCode::Done);
        assert_eq!(runs[0].sub_restart, 8);
        assert_eq!(driver.states().count(runs[0].run_id), 0);

        // worker progress reached the database before the states were released
        let sub_values = store.run_output(runs[0].run_id).unwrap().sub_values;
        assert_eq!(sub_values.len(), 8);
        for state in sub_values.values() {
            assert_eq!(state.status, ModelStatus::Done);
            assert_eq!((state.progress_count, state.progress_value), (1, 50.0));
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn worker_failure_fails_the_run() {
        let config = RunConfig { sub_values: 4, threads: 2, ..RunConfig::default() };
        let (driver, store, status) = driver(config, Arc::new(FailAt(1)));

        let err = driver.run().await.unwrap_err();
        assert!(matches!(err, RunError::Worker { sub_value_id: 1, .. }));
        assert_eq!(err.exit_code(), 32);
        assert_eq!(status.status(), ModelStatus::Error);
        assert_eq!(store.runs().unwrap()[0].status, RunStatusCode::Error);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn task_runs_every_working_set() {
        let config = RunConfig { sub_values: 2, task_name: Some(demo::TASK_NAME.into()), ..RunConfig::default() };
        let (driver, store, _) = driver(config, Arc::new(Constant));

        assert_eq!(driver.run().await.unwrap(), ModelStatus::Done);
        let runs = store.runs().unwrap();
        assert_eq!(runs.len(), 2);
        assert!(runs.iter().all(|r| r.status == RunStatusCode::Done));
    }

    /// Every rank of a local world runs its own driver.
    async fn run_world(world_size: usize, config: RunConfig) -> (Arc<MemoryStore>, Vec<Result<ModelStatus>>) {
        let store = Arc::new(demo::store().unwrap());
        let mut handles = Vec::new();
        for endpoint in LocalWorld::new(world_size) {
            let is_root = endpoint.is_root();
            let transport: Arc<dyn Transport> = Arc::new(endpoint);
            let db = is_root.then(|| store.clone() as Arc<dyn RunStore>);
            let status = Arc::new(ProcessStatus::new());
            let ctrl = create_controller(config.clone(), db, Some(transport), status.clone()).unwrap();
            let driver = RunDriver::new(ctrl, Arc::new(Constant), status, &config);
            handles.push(tokio::spawn(async move { driver.run().await }));
        }
        let mut results = Vec::new();
        for h in handles {
            results.push(h.await.unwrap());
        }
        (store, results)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn idle_root_and_four_children() {
        // 31 sub-values, 7 threads, 5 ranks: children compute 7, 7, 7 and 10
        let config = RunConfig { sub_values: 31, threads: 7, root_participates: false, ..RunConfig::default() };
        let (store, results) = run_world(5, config).await;

        for r in &results {
            assert_eq!(*r.as_ref().unwrap(), ModelStatus::Done);
        }
        let runs = store.runs().unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatusCode::Done);
        assert_eq!(runs[0].sub_restart, 31);
        let output = store.run_output(runs[0].run_id).unwrap();
        assert!(output.accumulators.iter().any(|a| a.sub_id == 30));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn active_root_shares_the_last_group() {
        let config = RunConfig { sub_values: 8, threads: 2, ..RunConfig::default() };
        let (store, results) = run_world(3, config).await;

        assert!(results.iter().all(|r| matches!(r, Ok(ModelStatus::Done))));
        let runs = store.runs().unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatusCode::Done);
        assert!(runs[0].digest.is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn restart_resumes_from_the_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.msim");
        let store = MemoryStore::create(&path, demo::catalog().unwrap()).unwrap();
        demo::seed(&store).unwrap();
        let store = Arc::new(store);

        // first attempt fails at sub-value 2, one at a time
        let config = RunConfig { sub_values: 5, threads: 1, ..RunConfig::default() };
        let status = Arc::new(ProcessStatus::new());
        let db: Arc<dyn RunStore> = store.clone();
        let ctrl = create_controller(config.clone(), Some(db), None, status.clone()).unwrap();
        let first = RunDriver::new(ctrl, Arc::new(FailAt(2)), status, &config);
        assert!(first.run().await.is_err());
        drop(first);

        let run = store.runs().unwrap()[0].clone();
        assert_eq!(run.status, RunStatusCode::Error);
        assert_eq!(run.sub_restart, 2);
        drop(store);

        // reopen the database and resume; the sub-value count comes from the run
        let store: Arc<dyn RunStore> = Arc::new(MemoryStore::open(&path).unwrap());
        let config = RunConfig { threads: 2, restart_run_id: Some(run.run_id), ..RunConfig::default() };
        let status = Arc::new(ProcessStatus::new());
        let ctrl = create_controller(config.clone(), Some(store.clone()), None, status.clone()).unwrap();
        let second = RunDriver::new(ctrl, Arc::new(Constant), status, &config);
        assert_eq!(second.run().await.unwrap(), ModelStatus::Done);

        let record = store.run_record(run.run_id).unwrap().unwrap();
        assert_eq!(record.status, RunStatusCode::Done);
        assert_eq!(record.sub_restart, 5);
        assert_eq!(store.runs().unwrap().len(), 1);
    }

    #[test]
    fn idle_sleep_backs_off_to_the_limit() {
        let config = RunConfig {
            poll_interval: Duration::from_millis(10),
            max_idle_sleep: Duration::from_millis(35),
            ..RunConfig::default()
        };
        let (driver, _, _) = driver(config, Arc::new(Constant));
        assert_eq!(driver.idle_sleep(0), Duration::from_millis(10));
        assert_eq!(driver.idle_sleep(2), Duration::from_millis(20));
        assert_eq!(driver.idle_sleep(9), Duration::from_millis(35));
    }
}
