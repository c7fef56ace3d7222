//! Process topology: how sub-values are split between processes.
//!
//! ```text
//! world = 7, sub-values = 12, threads = 2, root computes
//!
//!            group 1                     group 2 (last)
//!   ┌───────────────────────────┐   ┌───────────────────────────┐
//!   │ rank 1   rank 2   rank 3  │   │ rank 0   rank 4   rank 5  │  rank 6
//!   │ 0..4     4..8     8..12   │   │ 0..4     4..8     8..12   │  unused
//!   └───────────────────────────┘   └───────────────────────────┘
//! ```
//!
//! Every group computes all sub-values of one run; groups run different
//! runs at the same time. The root always reports the last group and takes
//! the first slot of it when it computes.

use std::ops::Range;

use msim_types::{Rank, RunConfig, ROOT_RANK};

use crate::error::Result;

/// Group layout as seen from one rank. Immutable once computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessTopology {
    pub world_size: usize,
    pub rank: Rank,
    pub sub_value_count: usize,
    /// Processes computing one run.
    pub group_size: usize,
    pub group_count: usize,
    /// Group of this rank, 1-based. The root reports the last group.
    pub group_number: usize,
    /// Root computes sub-values as part of the last group.
    pub is_root_active: bool,
    /// Slot of this rank among the computing processes of its group.
    pub active_rank: usize,
    /// Sub-values per process; the last process of a group also takes the rest.
    pub sub_per_process: usize,
    pub self_sub_count: usize,
}

impl ProcessTopology {
    /// Compute the layout for `rank`.
    ///
    /// `sub_value_count` and `threads` must be positive; callers validate
    /// them first (see [`ProcessTopology::from_config`]).
    pub fn compute(
        sub_value_count: usize,
        threads: usize,
        world_size: usize,
        rank: Rank,
        root_participates: bool,
    ) -> Self {
        debug_assert!(sub_value_count > 0 && threads > 0 && world_size > 0);
        let threads = threads.max(1);
        let world_size = world_size.max(1);

        let effective_world = if !root_participates && world_size > 1 { world_size - 1 } else { world_size };

        let group_size = (sub_value_count / threads).clamp(1, effective_world);

        let group_count = if group_size > 1 {
            effective_world / group_size
        } else {
            (effective_world - 1) / group_size
        }
        .max(1);

        let group_number = if rank > ROOT_RANK { 1 + (rank - 1) / group_size } else { group_count };

        let is_root_active = root_participates && group_size > 1 && world_size <= group_size * group_count;

        let is_in_last_group = group_number >= group_count;
        let active_rank = if rank > ROOT_RANK && (!is_in_last_group || !is_root_active) {
            (rank - 1) % group_size
        } else {
            rank % group_size
        };

        let sub_per_process = sub_value_count / group_size;
        let self_sub_count = if active_rank < group_size - 1 {
            sub_per_process
        } else {
            sub_value_count - (group_size - 1) * sub_per_process
        };

        Self {
            world_size,
            rank,
            sub_value_count,
            group_size,
            group_count,
            group_number,
            is_root_active,
            active_rank,
            sub_per_process,
            self_sub_count,
        }
    }

    /// Validate the run options, then compute.
    pub fn from_config(config: &RunConfig, world_size: usize, rank: Rank) -> Result<Self> {
        config.validate()?;
        Ok(Self::compute(config.sub_values, config.threads, world_size, rank, config.root_participates))
    }

    /// `true` if this rank runs sub-values at all.
    ///
    /// A single process always computes. Otherwise the root computes only
    /// when active and children beyond the last group are unused.
    pub fn is_active(&self) -> bool {
        if self.world_size == 1 {
            return true;
        }
        if self.rank == ROOT_RANK {
            return self.is_root_active;
        }
        self.rank <= self.group_size * self.group_count
    }

    /// Child rank outside of every modeling group: told to exit at start.
    pub fn is_unused(&self) -> bool {
        self.rank != ROOT_RANK && !self.is_active()
    }

    /// First sub-value computed by this rank.
    pub fn sub_first(&self) -> usize {
        self.active_rank * self.sub_per_process
    }

    /// Sub-values computed by this rank; empty if the rank is not active.
    pub fn self_sub_values(&self) -> Range<usize> {
        if !self.is_active() {
            return 0..0;
        }
        let first = self.sub_first();
        first..first + self.self_sub_count
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn all_ranks(subs: usize, threads: usize, world: usize, root: bool) -> Vec<ProcessTopology> {
        (0..world).map(|r| ProcessTopology::compute(subs, threads, world, r, root)).collect()
    }

    #[test]
    fn single_process_owns_everything() {
        let t = ProcessTopology::compute(8, 4, 1, 0, true);
        assert_eq!(t.group_size, 1);
        assert_eq!(t.group_count, 1);
        assert!(!t.is_root_active);
        assert!(t.is_active());
        assert_eq!(t.self_sub_values(), 0..8);
    }

    #[test]
    fn idle_root_with_four_children() {
        let ranks = all_ranks(31, 7, 5, false);
        let root = &ranks[0];
        assert_eq!(root.group_size, 4);
        assert_eq!(root.group_count, 1);
        assert_eq!(root.group_number, 1);
        assert_eq!(root.sub_per_process, 7);
        assert!(!root.is_root_active);
        assert!(root.self_sub_values().is_empty());

        let counts: Vec<usize> = ranks[1..].iter().map(|t| t.self_sub_count).collect();
        assert_eq!(counts, vec![7, 7, 7, 10]);
        assert_eq!(ranks[4].self_sub_values(), 21..31);
    }

    #[test]
    fn active_root_takes_first_slot_of_last_group() {
        let ranks = all_ranks(8, 4, 4, true);
        let root = &ranks[0];
        assert_eq!((root.group_size, root.group_count), (2, 2));
        assert!(root.is_root_active);
        assert_eq!(root.group_number, 2);
        assert_eq!(root.self_sub_values(), 0..4);

        assert_eq!(ranks[1].group_number, 1);
        assert_eq!(ranks[1].self_sub_values(), 0..4);
        assert_eq!(ranks[2].self_sub_values(), 4..8);
        assert_eq!(ranks[3].group_number, 2);
        assert_eq!(ranks[3].active_rank, 1);
        assert_eq!(ranks[3].self_sub_values(), 4..8);
    }

    #[test]
    fn ranks_beyond_last_group_are_unused() {
        let ranks = all_ranks(12, 2, 8, true);
        let root = &ranks[0];
        assert_eq!((root.group_size, root.group_count), (6, 1));
        assert!(!root.is_root_active);
        assert!(!ranks[6].is_unused());
        assert!(ranks[7].is_unused());
        assert!(ranks[7].self_sub_values().is_empty());
    }

    #[test]
    fn group_size_never_exceeds_world() {
        let t = ProcessTopology::compute(100, 1, 3, 0, true);
        assert_eq!(t.group_size, 3);
        assert_eq!(t.group_count, 1);
        assert!(t.is_root_active);
    }

    #[test]
    fn from_config_rejects_zero_threads() {
        let cfg = RunConfig { threads: 0, ..RunConfig::default() };
        assert!(ProcessTopology::from_config(&cfg, 2, 0).is_err());
    }

    /// Inside every group the sub-value ranges of its computing ranks
    /// partition `0..sub_value_count`; unused ranks own nothing. With a
    /// single group this is the partition over every rank of the world.
    #[test]
    fn every_group_covers_all_sub_values_exactly_once() {
        for world in 1..=9 {
            for subs in 1..=13 {
                for threads in 1..=5 {
                    for root in [true, false] {
                        let ranks = all_ranks(subs, threads, world, root);
                        let group_count = ranks[0].group_count;

                        for group in 1..=group_count {
                            let mut seen = vec![0u32; subs];
                            for t in ranks.iter().filter(|t| t.is_active() && t.group_number == group) {
                                for s in t.self_sub_values() {
                                    seen[s] += 1;
                                }
                            }
                            assert!(
                                seen.iter().all(|&n| n == 1),
                                "world={world} subs={subs} threads={threads} root={root} group={group}: {seen:?}"
                            );
                        }
                        for t in ranks.iter().filter(|t| t.is_unused()) {
                            assert!(t.self_sub_values().is_empty());
                        }
                        if group_count == 1 {
                            let mut seen = vec![0u32; subs];
                            for s in ranks.iter().flat_map(|t| t.self_sub_values()) {
                                seen[s] += 1;
                            }
                            assert!(
                                seen.iter().all(|&n| n == 1),
                                "world={world} subs={subs} threads={threads} root={root}: {seen:?}"
                            );
                        }
                    }
                }
            }
        }
    }
}
