//! Modeling group: child ranks that compute all sub-values of one run.

use std::ops::Range;

use msim_types::{ModelStatus, Rank, RunId, SetId, ROOT_RANK};

use crate::completion::CompletionTracker;
use crate::state::RunState;
use crate::topology::ProcessTopology;

#[derive(Debug)]
pub struct RunGroup {
    /// 1-based.
    pub group_number: usize,
    /// `0` while the group is idle.
    pub run_id: RunId,
    pub set_id: SetId,
    pub group_size: usize,
    pub sub_per_process: usize,
    pub first_child_rank: Rank,
    pub child_count: usize,
    /// The root computes the first slot of this group.
    pub is_use_root: bool,
    pub state: RunState,
    pub completion: CompletionTracker,
}

impl RunGroup {
    /// Group `group_number` as laid out by the root's topology.
    pub fn new(group_number: usize, root: &ProcessTopology) -> Self {
        let is_last = group_number >= root.group_count;
        Self {
            group_number,
            run_id: 0,
            set_id: 0,
            group_size: root.group_size,
            sub_per_process: root.sub_per_process,
            first_child_rank: 1 + (group_number - 1) * root.group_size,
            child_count: if is_last && root.is_root_active { root.group_size - 1 } else { root.group_size },
            is_use_root: group_number == root.group_number && root.is_root_active,
            state: RunState::default(),
            completion: CompletionTracker::new(root.sub_value_count),
        }
    }

    /// One group per group number of the root's topology.
    pub fn all(root: &ProcessTopology) -> Vec<Self> {
        (1..=root.group_count).map(|g| Self::new(g, root)).collect()
    }

    pub fn is_idle(&self) -> bool {
        self.run_id == 0
    }

    /// Assign the next run: clear completion, store ids, set status.
    pub fn next_run(&mut self, run_id: RunId, set_id: SetId, status: ModelStatus) {
        self.run_id = run_id;
        self.set_id = set_id;
        self.state = RunState::new(ModelStatus::Init);
        self.state.set_status(status);
        self.completion.reset();
    }

    /// Back to idle after the group's run is finalized.
    pub fn reset(&mut self) {
        self.next_run(0, 0, ModelStatus::Init);
    }

    pub fn child_ranks(&self) -> Range<Rank> {
        self.first_child_rank..self.first_child_rank + self.child_count
    }

    /// Rank that computes sub-value `sub_value_id` of the group's run.
    pub fn rank_by_sub_value_id(&self, sub_value_id: usize) -> Rank {
        let n_proc = (sub_value_id / self.sub_per_process).min(self.group_size - 1);
        if !self.is_use_root {
            return self.first_child_rank + n_proc;
        }
        if sub_value_id < self.sub_per_process {
            ROOT_RANK
        } else {
            self.first_child_rank + n_proc - 1
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn root(subs: usize, threads: usize, world: usize, participates: bool) -> ProcessTopology {
        ProcessTopology::compute(subs, threads, world, ROOT_RANK, participates)
    }

    #[test]
    fn groups_without_root() {
        let groups = RunGroup::all(&root(31, 7, 5, false));
        assert_eq!(groups.len(), 1);
        let g = &groups[0];
        assert_eq!(g.child_ranks(), 1..5);
        assert!(!g.is_use_root);
        assert_eq!(g.rank_by_sub_value_id(0), 1);
        assert_eq!(g.rank_by_sub_value_id(20), 3);
        assert_eq!(g.rank_by_sub_value_id(21), 4);
        assert_eq!(g.rank_by_sub_value_id(30), 4);
    }

    #[test]
    fn last_group_uses_root() {
        let groups = RunGroup::all(&root(8, 4, 4, true));
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].child_ranks(), 1..3);
        assert!(!groups[0].is_use_root);

        let last = &groups[1];
        assert!(last.is_use_root);
        assert_eq!(last.child_ranks(), 3..4);
        assert_eq!(last.rank_by_sub_value_id(0), ROOT_RANK);
        assert_eq!(last.rank_by_sub_value_id(3), ROOT_RANK);
        assert_eq!(last.rank_by_sub_value_id(4), 3);
        assert_eq!(last.rank_by_sub_value_id(7), 3);
    }

    #[test]
    fn next_run_and_reset() {
        let mut g = RunGroup::new(1, &root(4, 1, 5, false));
        assert!(g.is_idle());
        g.completion.set_at(1);
        g.next_run(101, 11, ModelStatus::Progress);
        assert_eq!((g.run_id, g.set_id), (101, 11));
        assert_eq!(g.state.status, ModelStatus::Progress);
        assert_eq!(g.completion.count(), 0);
        assert_eq!(g.completion.len(), 4);

        g.reset();
        assert!(g.is_idle());
        assert_eq!(g.state.status, ModelStatus::Init);
    }

    /// The sender rank the root expects for a sub-value is the rank whose
    /// own topology says it computes that sub-value, also when the root
    /// computes and the sub-value count does not divide evenly.
    #[test]
    fn sender_rank_matches_owner_topology() {
        for world in 2..=9 {
            for subs in 1..=17 {
                for threads in 1..=4 {
                    for participates in [true, false] {
                        let ranks: Vec<ProcessTopology> = (0..world)
                            .map(|r| ProcessTopology::compute(subs, threads, world, r, participates))
                            .collect();
                        for group in RunGroup::all(&ranks[0]) {
                            for s in 0..subs {
                                let sender = group.rank_by_sub_value_id(s);
                                let owner = &ranks[sender];
                                assert!(
                                    owner.is_active() && owner.self_sub_values().contains(&s),
                                    "world={world} subs={subs} threads={threads} root={participates} \
                                     group={} sub={s} sender={sender}",
                                    group.group_number
                                );
                                if sender != ROOT_RANK {
                                    assert_eq!(owner.group_number, group.group_number);
                                }
                            }
                        }
                    }
                }
            }
        }
    }
}
