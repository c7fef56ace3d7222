//! `msim-run` — Run coordination for microsimulation models.
//!
//! This crate decides **who computes what**, not how a model computes. The
//! model code runs behind the [`Worker`] trait; this crate splits sub-values
//! between processes, creates runs in the model database, moves output
//! accumulators from child processes to the root, checkpoints progress for
//! restart and finalizes every run.
//!
//! # Architecture
//!
//! ```text
//!                 ┌──────────────────────────────┐
//!                 │ rank 0: RootController       │ ── model database
//!                 │ runs · groups · exchange     │
//!                 └──────┬──────────────▲────────┘
//!        RunAssignment   │              │  accumulators, status
//!        Parameter       ▼              │
//!   ┌──────────────────────┐   ┌──────────────────────┐
//!   │ group 1: ranks 1..k  │   │ group 2: ranks k..n  │  one run per group
//!   │ ChildController      │   │ ChildController      │
//!   └──────────────────────┘   └──────────────────────┘
//! ```
//!
//! A process alone in its world uses [`SingleController`], or
//! [`RestartController`] to resume an interrupted run. [`RunDriver`] runs
//! any controller to the end with a bounded pool of workers.

pub mod completion;
pub mod controller;
pub mod driver;
pub mod error;
pub mod exchange;
pub mod factory;
pub mod run_group;
pub mod state;
pub mod topology;

// ── Public re-exports ────────────────────────────────────────────────────────

pub use completion::CompletionTracker;
pub use controller::{
    ChildController, ControllerRole, RestartController, RootController, RunController, SingleController,
};
pub use driver::{RunDriver, SubValueContext, Worker};
pub use error::{Result, RunError};
pub use exchange::{AccumulatorExchange, AccumulatorReceipt};
pub use factory::{create_controller, select_role};
pub use run_group::RunGroup;
pub use state::{ProcessStatus, RunState, RunStateMap};
pub use topology::ProcessTopology;
