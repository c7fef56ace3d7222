//! Transport capability: point-to-point and broadcast messaging between the
//! ranks of a fixed world.
//!
//! All calls are synchronous. `try_receive` never blocks; `receive` and the
//! non-root side of `broadcast` poll until the message arrives.

use std::ops::Range;

use serde::de::DeserializeOwned;
use serde::Serialize;

use msim_types::{Rank, ROOT_RANK};

use crate::codec;
use crate::error::{MsgError, Result};
use crate::tags::{MsgTag, Tag};

// ── Groups ────────────────────────────────────────────────────────────────────

/// Who a broadcast from the root reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastScope {
    /// Every child rank placed in some modeling group.
    All,
    /// Child ranks of one modeling group (1-based group number).
    Group(usize),
}

/// Partition of child ranks into modeling groups.
///
/// Group `g` holds ranks `1 + (g-1)*group_size ..` up to `group_size` ranks,
/// clipped to the world. When the root computes, the last group has one
/// child fewer and the world ends before the clip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupLayout {
    pub group_size: usize,
    pub group_count: usize,
    pub world_size: usize,
}

impl GroupLayout {
    pub fn new(group_size: usize, group_count: usize, world_size: usize) -> Result<Self> {
        if group_size == 0 || group_count == 0 {
            return Err(MsgError::Group(format!(
                "group size {group_size} and group count {group_count} must be positive"
            )));
        }
        if group_size.saturating_mul(group_count) > world_size {
            return Err(MsgError::Group(format!(
                "{group_count} groups of {group_size} do not fit into world of size {world_size}"
            )));
        }
        Ok(Self { group_size, group_count, world_size })
    }

    /// Child ranks of group `group_number`; empty for an unknown group.
    pub fn child_ranks(&self, group_number: usize) -> Range<Rank> {
        if group_number == 0 || group_number > self.group_count {
            return 0..0;
        }
        let first = 1 + (group_number - 1) * self.group_size;
        let end = (first + self.group_size).min(self.world_size);
        first.min(end)..end
    }

    /// Every child rank placed in a group.
    pub fn all_child_ranks(&self) -> Range<Rank> {
        1..(1 + self.group_size * self.group_count).min(self.world_size)
    }

    pub fn ranks(&self, scope: BroadcastScope) -> Range<Rank> {
        match scope {
            BroadcastScope::All => self.all_child_ranks(),
            BroadcastScope::Group(n) => self.child_ranks(n),
        }
    }

    /// Group a child rank belongs to, `None` for the root and unused ranks.
    pub fn group_of(&self, rank: Rank) -> Option<usize> {
        if rank == ROOT_RANK || !self.all_child_ranks().contains(&rank) {
            return None;
        }
        Some(1 + (rank - 1) / self.group_size)
    }
}

// ── Transport ─────────────────────────────────────────────────────────────────

pub trait Transport: Send + Sync {
    fn rank(&self) -> Rank;

    fn world_size(&self) -> usize;

    fn is_root(&self) -> bool {
        self.rank() == ROOT_RANK
    }

    /// Partition child ranks into modeling groups; required before a
    /// group-scoped broadcast.
    fn create_groups(&self, group_size: usize, group_count: usize) -> Result<()>;

    /// Start sending `payload` to `to`. Delivery between one (sender, tag)
    /// pair is FIFO.
    fn send(&self, to: Rank, tag: Tag, payload: Vec<u8>) -> Result<()>;

    /// Wait until every started send is delivered.
    fn wait_send_all(&self) -> Result<()>;

    /// Non-blocking receive of the oldest message from `from` with `tag`.
    fn try_receive(&self, from: Rank, tag: Tag) -> Result<Option<Vec<u8>>>;

    /// Blocking receive: poll [`Transport::try_receive`] until a message arrives.
    fn receive(&self, from: Rank, tag: Tag) -> Result<Vec<u8>>;

    /// Broadcast from the root. At the root `payload` must be `Some` and is
    /// sent to every rank in `scope`; at a child it must be `None` and the
    /// root's payload is received.
    fn broadcast(&self, scope: BroadcastScope, tag: Tag, payload: Option<Vec<u8>>) -> Result<Vec<u8>>;
}

// ── Typed helpers ─────────────────────────────────────────────────────────────

/// Serde-typed wrappers over [`Transport`]; available on every transport.
pub trait TransportExt: Transport {
    fn send_value<T: Serialize + ?Sized>(&self, to: Rank, tag: MsgTag, value: &T) -> Result<()> {
        self.send(to, tag.tag(), codec::encode(value)?)
    }

    fn try_receive_value<T: DeserializeOwned>(&self, from: Rank, tag: MsgTag) -> Result<Option<T>> {
        match self.try_receive(from, tag.tag())? {
            Some(bytes) => codec::decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    fn receive_value<T: DeserializeOwned>(&self, from: Rank, tag: MsgTag) -> Result<T> {
        codec::decode(&self.receive(from, tag.tag())?)
    }

    /// Root passes `Some(value)` and gets it back; a child passes `None`
    /// and gets the root's value.
    fn broadcast_value<T: Serialize + DeserializeOwned>(
        &self,
        scope: BroadcastScope,
        tag: MsgTag,
        value: Option<T>,
    ) -> Result<T> {
        match value {
            Some(value) if self.is_root() => {
                self.broadcast(scope, tag.tag(), Some(codec::encode(&value)?))?;
                Ok(value)
            }
            None if !self.is_root() => codec::decode(&self.broadcast(scope, tag.tag(), None)?),
            _ => Err(MsgError::BroadcastPayload),
        }
    }

    /// Send one accumulator value array.
    fn send_values(&self, to: Rank, tag: Tag, values: &[f64]) -> Result<()> {
        self.send(to, tag, codec::encode(values)?)
    }

    /// Non-blocking receive of one accumulator; the element count must match.
    fn try_receive_values(&self, from: Rank, tag: Tag, expected: usize) -> Result<Option<Vec<f64>>> {
        match self.try_receive(from, tag)? {
            Some(bytes) => codec::decode_values(&bytes, expected).map(Some),
            None => Ok(None),
        }
    }
}

impl<T: Transport + ?Sized> TransportExt for T {}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn groups_without_active_root() {
        // 5 ranks, root idle: one group of 4 children.
        let layout = GroupLayout::new(4, 1, 5).unwrap();
        assert_eq!(layout.child_ranks(1), 1..5);
        assert_eq!(layout.all_child_ranks(), 1..5);
        assert_eq!(layout.group_of(4), Some(1));
        assert_eq!(layout.group_of(0), None);
    }

    #[test]
    fn last_group_shares_root() {
        // 6 ranks, groups of 3, root computes in group 2.
        let layout = GroupLayout::new(3, 2, 6).unwrap();
        assert_eq!(layout.child_ranks(1), 1..4);
        assert_eq!(layout.child_ranks(2), 4..6);
        assert_eq!(layout.child_ranks(3), 0..0);
    }

    #[test]
    fn unused_ranks_are_outside_groups() {
        // 8 ranks, groups of 3, 2 groups: rank 7 is unused.
        let layout = GroupLayout::new(3, 2, 8).unwrap();
        assert_eq!(layout.all_child_ranks(), 1..7);
        assert_eq!(layout.group_of(7), None);
    }

    #[test]
    fn rejects_layout_larger_than_world() {
        assert!(GroupLayout::new(4, 2, 5).is_err());
        assert!(GroupLayout::new(0, 1, 5).is_err());
    }
}
