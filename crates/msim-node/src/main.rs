//! msim-node binary — run the demo model against a local database file.
//!
//! ```bash
//! # create the demo database: model, two working sets, one task
//! RUST_LOG=info cargo run --bin msim-node -- init-demo --db model.msim
//!
//! # 16 sub-values on 4 threads, 3 processes in one world
//! RUST_LOG=info cargo run --bin msim-node -- run --db model.msim -s 16 -t 4 -n 3
//!
//! # every working set of the demo task, root process only coordinates
//! cargo run --bin msim-node -- run --db model.msim -s 8 -n 5 --root-idle --task-name scenarios
//!
//! # resume an interrupted run, then list runs
//! cargo run --bin msim-node -- restart --db model.msim --run-id 104 -t 4
//! cargo run --bin msim-node -- show --db model.msim
//! ```

mod model;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use msim_msg::{LocalWorld, Transport};
use msim_run::{create_controller, ControllerRole, ProcessStatus, RunDriver, RunError};
use msim_store::{demo, MemoryStore, RunStore};
use msim_types::{ModelStatus, RunConfig, RunId};

use crate::model::LifeCycle;

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name    = "msim-node",
    version = env!("CARGO_PKG_VERSION"),
    about   = "Microsimulation run coordinator — local process world"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a database file with the demo model, working sets and task.
    InitDemo {
        #[arg(long)]
        db: PathBuf,
    },

    /// Create and compute new runs.
    Run {
        #[arg(long)]
        db: PathBuf,

        /// Sub-values of every run.
        #[arg(short = 's', long, default_value_t = 1)]
        sub_values: usize,

        /// Worker threads per process.
        #[arg(short = 't', long, default_value_t = 1)]
        threads: usize,

        /// Processes in the world; rank 0 owns the database.
        #[arg(short = 'n', long, default_value_t = 1)]
        processes: usize,

        /// Root process only coordinates and computes no sub-values.
        #[arg(long)]
        root_idle: bool,

        /// Modeling task to run.
        #[arg(long)]
        task_name: Option<String>,

        /// Input working set of a single run.
        #[arg(long)]
        set_name: Option<String>,

        #[arg(long)]
        run_name: Option<String>,

        /// Wait for new task input instead of finishing the task.
        #[arg(long)]
        wait_task: bool,

        /// Parameter value for every sub-value: `Name=value`.
        #[arg(long = "param", value_parser = parse_key_val)]
        params: Vec<(String, String)>,
    },

    /// Resume a run from its last confirmed sub-value.
    Restart {
        #[arg(long)]
        db: PathBuf,

        #[arg(long)]
        run_id: RunId,

        #[arg(short = 't', long, default_value_t = 1)]
        threads: usize,
    },

    /// List runs in the database.
    Show {
        #[arg(long)]
        db: PathBuf,

        /// Dump the whole database as JSON.
        #[arg(long)]
        json: bool,
    },
}

fn parse_key_val(s: &str) -> std::result::Result<(String, String), String> {
    let (key, value) = s.split_once('=').ok_or_else(|| format!("expected Name=value, got `{s}`"))?;
    if key.is_empty() {
        return Err(format!("empty parameter name in `{s}`"));
    }
    Ok((key.to_string(), value.to_string()))
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    // Default log level: INFO. Override with RUST_LOG=msim_run=debug etc.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::InitDemo { db } => init_demo(&db),
        Command::Show { db, json } => show(&db, json),
        Command::Run {
            db,
            sub_values,
            threads,
            processes,
            root_idle,
            task_name,
            set_name,
            run_name,
            wait_task,
            params,
        } => {
            let config = RunConfig {
                sub_values,
                threads,
                root_participates: !root_idle,
                task_name,
                set_name,
                run_name,
                wait_task,
                parameter_overrides: params.into_iter().collect::<BTreeMap<_, _>>(),
                ..RunConfig::default()
            };
            let store = open_store(&db)?;
            exit_on_error(run_world(config, store, processes).await)
        }
        Command::Restart { db, run_id, threads } => {
            let store = open_store(&db)?;
            let record = store
                .run_record(run_id)?
                .with_context(|| format!("run {run_id} not found in {}", db.display()))?;
            let config = RunConfig {
                sub_values: record.sub_count,
                threads,
                restart_run_id: Some(run_id),
                ..RunConfig::default()
            };
            exit_on_error(run_world(config, store, 1).await)
        }
    }
}

/// Map a run failure to its process exit code.
fn exit_on_error(result: std::result::Result<ModelStatus, RunError>) -> Result<()> {
    match result {
        Ok(status) => {
            info!(%status, "model run finished");
            Ok(())
        }
        Err(e) => {
            error!(exit_code = e.exit_code(), "{e}");
            std::process::exit(e.exit_code());
        }
    }
}

// ── Database commands ─────────────────────────────────────────────────────────

fn open_store(path: &Path) -> Result<Arc<MemoryStore>> {
    let store = MemoryStore::open(path).with_context(|| format!("open database {}", path.display()))?;
    Ok(Arc::new(store))
}

fn init_demo(path: &Path) -> Result<()> {
    let store = MemoryStore::create(path, demo::catalog()?)
        .with_context(|| format!("create database {}", path.display()))?;
    let ids = demo::seed(&store)?;
    info!(
        path = %path.display(),
        model = demo::MODEL_NAME,
        base_set = ids.base_set_id,
        scenario_set = ids.scenario_set_id,
        task = ids.task_id,
        "demo database created"
    );
    Ok(())
}

fn show(path: &Path, json: bool) -> Result<()> {
    let store = open_store(path)?;
    if json {
        println!("{}", store.to_json()?);
        return Ok(());
    }
    println!("{:>6}  {:<8}  {:>9}  {:<40}  {}", "RUN", "STATUS", "SUB", "NAME", "DIGEST");
    for run in store.runs()? {
        println!(
            "{:>6}  {:<8}  {:>4}/{:<4}  {:<40}  {}",
            run.run_id,
            run.status.to_string(),
            run.sub_restart,
            run.sub_count,
            run.name,
            run.digest.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}

// ── Process world ─────────────────────────────────────────────────────────────

/// Run every rank of a local world, each with its own controller and driver.
/// Returns the final status of the root process, or the first failure.
async fn run_world(
    config: RunConfig,
    store: Arc<MemoryStore>,
    processes: usize,
) -> std::result::Result<ModelStatus, RunError> {
    let processes = processes.max(1);
    let mut drivers: Vec<Arc<RunDriver>> = Vec::with_capacity(processes);

    if processes == 1 {
        let status = Arc::new(ProcessStatus::new());
        let ctrl = create_controller(config.clone(), Some(store as Arc<dyn RunStore>), None, status.clone())?;
        drivers.push(Arc::new(RunDriver::new(ctrl, Arc::new(LifeCycle), status, &config)));
    } else {
        for endpoint in LocalWorld::new(processes) {
            let db: Option<Arc<dyn RunStore>> = endpoint.is_root().then(|| store.clone() as Arc<dyn RunStore>);
            let transport: Arc<dyn Transport> = Arc::new(endpoint);
            let status = Arc::new(ProcessStatus::new());
            let ctrl = create_controller(config.clone(), db, Some(transport), status.clone())?;
            drivers.push(Arc::new(RunDriver::new(ctrl, Arc::new(LifeCycle), status, &config)));
        }
    }
    info!(processes, sub_values = config.sub_values, threads = config.threads, "world started");

    let mut tasks = JoinSet::new();
    for driver in &drivers {
        let driver = Arc::clone(driver);
        tasks.spawn(async move { (driver.controller().role(), driver.run().await) });
    }

    let mut root_status = ModelStatus::Undefined;
    let mut failure: Option<RunError> = None;
    let mut interrupted = false;
    loop {
        tokio::select! {
            joined = tasks.join_next() => match joined {
                None => break,
                Some(Ok((role, Ok(status)))) => {
                    if role != ControllerRole::Child {
                        root_status = status;
                    }
                }
                Some(Ok((role, Err(e)))) => {
                    warn!(%role, error = %e, "process failed");
                    failure.get_or_insert(e);
                }
                Some(Err(join)) => {
                    failure.get_or_insert(RunError::Join(join.to_string()));
                }
            },
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                info!("Ctrl-C — stopping every process");
                interrupted = true;
                for driver in &drivers {
                    driver.exit(ModelStatus::Exit).await;
                }
            }
        }
    }

    match failure {
        Some(e) => Err(e),
        None => Ok(root_status),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use msim_types::RunStatusCode;

    fn demo_db(dir: &Path) -> PathBuf {
        let path = dir.join("model.msim");
        init_demo(&path).unwrap();
        path
    }

    #[test]
    fn key_value_parameters() {
        assert_eq!(parse_key_val("StartAge=30").unwrap(), ("StartAge".into(), "30".into()));
        assert!(parse_key_val("StartAge").is_err());
        assert!(parse_key_val("=30").is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn demo_run_across_three_processes() {
        let dir = tempfile::tempdir().unwrap();
        let path = demo_db(dir.path());

        let config = RunConfig { sub_values: 6, threads: 2, ..RunConfig::default() };
        let status = run_world(config, open_store(&path).unwrap(), 3).await.unwrap();
        assert_eq!(status, ModelStatus::Done);

        let store = open_store(&path).unwrap();
        let runs = store.runs().unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatusCode::Done);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn same_input_same_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = demo_db(dir.path());
        let config = RunConfig { sub_values: 4, threads: 2, ..RunConfig::default() };

        run_world(config.clone(), open_store(&path).unwrap(), 1).await.unwrap();
        run_world(config, open_store(&path).unwrap(), 2).await.unwrap();

        let runs = open_store(&path).unwrap().runs().unwrap();
        assert_eq!(runs.len(), 2);
        assert!(runs[0].digest.is_some());
        assert_eq!(runs[0].digest, runs[1].digest);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn restart_of_a_completed_run_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let path = demo_db(dir.path());
        let config = RunConfig { sub_values: 2, ..RunConfig::default() };
        run_world(config, open_store(&path).unwrap(), 1).await.unwrap();
        let run_id = open_store(&path).unwrap().runs().unwrap()[0].run_id;

        let config = RunConfig { sub_values: 2, restart_run_id: Some(run_id), ..RunConfig::default() };
        assert_eq!(run_world(config, open_store(&path).unwrap(), 1).await.unwrap(), ModelStatus::Done);
        assert_eq!(open_store(&path).unwrap().runs().unwrap().len(), 1);
    }
}
