//! Run controllers: one control contract, four process roles.
//!
//! ```text
//!   world = 1, no restart id ──► SingleController    everything in-process
//!   world = 1, restart id    ──► RestartController   resume a run from sub_restart
//!   world > 1, rank 0        ──► RootController      creates runs, owns groups and the database
//!   world > 1, rank > 0      ──► ChildController     computes, sends accumulators to the root
//! ```
//!
//! The driver calls the contract in this order:
//!
//! ```text
//!   init ─► next_run ─► (workers: read_parameter / write_accumulators,
//!                        update_run_state, child_exchange)*
//!                  ▲            │
//!                  └─ shutdown_run
//!   next_run == 0 and shutdown ─► shutdown_wait_all
//!   any fatal error            ─► shutdown_on_exit
//! ```
//!
//! Every method takes `&self`: a controller is shared between the driver
//! and its worker threads and keeps its mutable state behind a lock.

mod child;
mod common;
mod restart;
mod root;
mod single;

use std::fmt;
use std::ops::Range;

use msim_types::messages::SubValueState;
use msim_types::{ModelStatus, ParamValues, RunId, ValueKind};

use crate::error::Result;

pub use child::ChildController;
pub use restart::RestartController;
pub use root::RootController;
pub use single::SingleController;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerRole {
    Single,
    Root,
    Child,
    Restart,
}

impl fmt::Display for ControllerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single  => write!(f, "single"),
            Self::Root    => write!(f, "root"),
            Self::Child   => write!(f, "child"),
            Self::Restart => write!(f, "restart"),
        }
    }
}

pub trait RunController: Send + Sync {
    fn role(&self) -> ControllerRole;

    /// One-time setup: metadata, topology, completion trackers, task run.
    fn init(&self) -> Result<()>;

    /// Sub-values of every run.
    fn sub_value_count(&self) -> usize;

    /// Next run to compute, or `0`. With `0` the process status tells
    /// `wait` (poll again) from `shutdown`/terminal (no more work).
    fn next_run(&self) -> Result<RunId>;

    /// Sub-values of `run_id` this process computes.
    fn local_sub_values(&self, run_id: RunId) -> Range<usize>;

    /// Values of one input parameter. `sub_value_id = None` reads the
    /// parameter as of sub-value 0.
    fn read_parameter(
        &self,
        run_id: RunId,
        name: &str,
        sub_value_id: Option<usize>,
        kind: ValueKind,
        size: usize,
    ) -> Result<ParamValues>;

    /// Hand off the accumulators of one output table, one value array per
    /// accumulator in catalog order. `is_last_table` marks the sub-value
    /// complete once the values are written.
    fn write_accumulators(
        &self,
        run_id: RunId,
        sub_value_id: usize,
        is_last_table: bool,
        table_name: &str,
        values: &[Vec<f64>],
    ) -> Result<()>;

    /// Persist the progress of local sub-values; a child forwards it to the
    /// root, which owns the database.
    fn update_run_state(&self, states: &[SubValueState]) -> Result<()>;

    /// Finalize a run once every local sub-value returned.
    fn shutdown_run(&self, run_id: RunId) -> Result<()>;

    /// Drain every outstanding exchange and finish the process normally.
    fn shutdown_wait_all(&self) -> Result<()>;

    /// Abnormal exit with `status` (`exit` or `error`). Best effort: never fails.
    fn shutdown_on_exit(&self, status: ModelStatus);

    /// Move pending data and status between processes without blocking.
    /// Returns whether anything moved.
    fn child_exchange(&self) -> Result<bool>;
}
