//! Run state of the process and of every active sub-value.
//!
//! A terminal status (`done`, `exit`, `error`) never changes again: every
//! setter is a no-op once it is reached, timestamp included.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use msim_types::messages::SubValueState;
use msim_types::{ModelStatus, RunId};

// ── RunState ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunState {
    pub status: ModelStatus,
    pub progress_count: u32,
    pub progress_value: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunState {
    pub fn new(status: ModelStatus) -> Self {
        let now = Utc::now();
        Self { status, progress_count: 0, progress_value: 0.0, created_at: now, updated_at: now }
    }

    pub fn is_exit(&self) -> bool {
        self.status.is_exit()
    }

    pub fn is_shutdown_or_exit(&self) -> bool {
        self.status.is_shutdown_or_exit()
    }

    /// Set-if-not-exit. Returns the status in effect afterwards.
    pub fn set_status(&mut self, status: ModelStatus) -> ModelStatus {
        if !self.status.is_exit() {
            self.status = status;
            self.updated_at = Utc::now();
        }
        self.status
    }

    /// Record worker progress; ignored once the state is terminal.
    pub fn set_progress(&mut self, count: u32, value: f64) {
        if !self.status.is_exit() {
            self.progress_count = count;
            self.progress_value = value;
            self.updated_at = Utc::now();
        }
    }
}

impl Default for RunState {
    fn default() -> Self {
        Self::new(ModelStatus::Init)
    }
}

// ── ProcessStatus ─────────────────────────────────────────────────────────────

/// Aggregate status of the whole process, shared by the driver, the
/// controller and every worker.
#[derive(Debug, Default)]
pub struct ProcessStatus {
    state: Mutex<RunState>,
}

impl ProcessStatus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RunState> {
        // RunState is plain data and stays consistent if a holder panicked
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn status(&self) -> ModelStatus {
        self.lock().status
    }

    pub fn get(&self) -> RunState {
        *self.lock()
    }

    pub fn set_status(&self, status: ModelStatus) -> ModelStatus {
        self.lock().set_status(status)
    }

    pub fn is_exit(&self) -> bool {
        self.status().is_exit()
    }

    pub fn is_shutdown_or_exit(&self) -> bool {
        self.status().is_shutdown_or_exit()
    }
}

// ── RunStateMap ───────────────────────────────────────────────────────────────

/// Live state of every `(run, sub-value)` being computed by this process.
///
/// Each run carries a sync mark: the newest `updated_at` already handed out
/// by [`RunStateMap::take_updates`]. A state leaves the map only once it is
/// terminal and has been handed out.
#[derive(Debug, Default)]
pub struct RunStateMap {
    states: Mutex<BTreeMap<(RunId, usize), RunState>>,
    synced: Mutex<BTreeMap<RunId, DateTime<Utc>>>,
}

impl RunStateMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<(RunId, usize), RunState>> {
        self.states.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Admit a sub-value at `init`. An existing non-terminal state is kept.
    pub fn add(&self, run_id: RunId, sub_value_id: usize) {
        let mut states = self.lock();
        let state = states.entry((run_id, sub_value_id)).or_default();
        if state.is_exit() {
            *state = RunState::default();
        }
    }

    pub fn get(&self, run_id: RunId, sub_value_id: usize) -> Option<RunState> {
        self.lock().get(&(run_id, sub_value_id)).copied()
    }

    /// Set-if-not-exit; `None` if the sub-value is not in the map.
    pub fn update_status(&self, run_id: RunId, sub_value_id: usize, status: ModelStatus) -> Option<ModelStatus> {
        self.lock().get_mut(&(run_id, sub_value_id)).map(|s| s.set_status(status))
    }

    pub fn update_progress(&self, run_id: RunId, sub_value_id: usize, count: u32, value: f64) {
        if let Some(state) = self.lock().get_mut(&(run_id, sub_value_id)) {
            state.set_progress(count, value);
        }
    }

    /// Number of sub-values of `run_id` still in the map.
    pub fn count(&self, run_id: RunId) -> usize {
        self.lock().range((run_id, 0)..=(run_id, usize::MAX)).count()
    }

    /// Most recent update of any sub-value of `run_id`.
    pub fn last_update(&self, run_id: RunId) -> Option<DateTime<Utc>> {
        self.lock().range((run_id, 0)..=(run_id, usize::MAX)).map(|(_, s)| s.updated_at).max()
    }

    /// States changed since the last call, for every run whose last update
    /// moved past its sync mark. Advances the marks.
    pub fn take_updates(&self) -> Vec<SubValueState> {
        let states = self.lock();
        let mut synced = self.synced.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut updates = Vec::new();
        for (&(run_id, sub_value_id), state) in states.iter() {
            let mark = synced.get(&run_id).copied();
            if mark.is_some_and(|m| state.updated_at <= m) {
                continue;
            }
            updates.push(SubValueState {
                run_id,
                sub_value_id,
                status: state.status,
                progress_count: state.progress_count,
                progress_value: state.progress_value,
                updated_at: state.updated_at,
            });
        }
        for u in &updates {
            let mark = synced.entry(u.run_id).or_insert(u.updated_at);
            if *mark < u.updated_at {
                *mark = u.updated_at;
            }
        }
        updates
    }

    /// Remove and return every terminal (or shut down) sub-value state
    /// already handed out by [`RunStateMap::take_updates`]. Live states stay
    /// in the map.
    pub fn remove_shutdown_or_exit(&self) -> Vec<((RunId, usize), RunState)> {
        let mut states = self.lock();
        let mut synced = self.synced.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let done: Vec<(RunId, usize)> = states
            .iter()
            .filter(|((run_id, _), s)| {
                s.is_shutdown_or_exit() && synced.get(run_id).is_some_and(|m| s.updated_at <= *m)
            })
            .map(|(k, _)| *k)
            .collect();
        let removed: Vec<_> = done.into_iter().filter_map(|k| states.remove(&k).map(|s| (k, s))).collect();
        synced.retain(|run_id, _| states.range((*run_id, 0)..=(*run_id, usize::MAX)).next().is_some());
        removed
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
