// Control messages exchanged between the root process and its children.
//
// Shared across msim-msg (encoding) and msim-run (coordinators).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::params::ParamValues;
use crate::status::ModelStatus;
use crate::{ModelId, RunId, SetId};

/// Sent once from root to each child before metadata is broadcast.
///
/// A child beyond the last modeling group receives `status = exit` and
/// leaves immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitialState {
    pub status: ModelStatus,
    pub model_id: ModelId,
    pub sub_value_count: usize,
    pub thread_count: usize,
    /// Children recompute the root's topology from these four values.
    pub root_participates: bool,
}

/// Broadcast from root to one modeling group when a run is assigned to it.
///
/// `run_id == 0` means there is no more work; `status` then says whether the
/// children should stop normally (`shutdown`) or abort (`error`, `exit`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunAssignment {
    pub run_id: RunId,
    pub set_id: SetId,
    pub status: ModelStatus,
}

impl RunAssignment {
    pub fn stop(status: ModelStatus) -> Self {
        Self { run_id: 0, set_id: 0, status }
    }
}

/// One input parameter broadcast to a modeling group.
///
/// `values[k]` holds sub-value `k`; parameters without sub-values carry a
/// single entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterMessage {
    pub name: String,
    pub values: Vec<ParamValues>,
}

/// Out-of-band status notice between root and child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusMessage {
    pub run_id: RunId,
    pub status: ModelStatus,
}

/// Progress of one sub-value as last seen by the process computing it.
///
/// Persisted by the process that owns the database; a child sends a batch
/// of them to the root.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SubValueState {
    pub run_id: RunId,
    pub sub_value_id: usize,
    pub status: ModelStatus,
    pub progress_count: u32,
    pub progress_value: f64,
    pub updated_at: DateTime<Utc>,
}
