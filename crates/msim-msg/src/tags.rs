//! Message tags: the address space of point-to-point messages.
//!
//! ```text
//!   1 .. 127                      control messages (one tag per class)
//!   128 * S ..                    accumulators:  (128 + acc_index) * S + sub_value_id
//! ```
//!
//! `S` is the sub-value count of the run. Control tags are below the
//! accumulator base, so an accumulator tag can never equal a control tag.

use std::fmt;

/// Raw tag value carried with every message.
pub type Tag = u64;

/// Control message classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u64)]
pub enum MsgTag {
    /// Per-child initial state: status, model id, sub-value count, threads.
    Initial = 1,
    /// Packed metadata catalog.
    MetaData = 2,
    /// Run assigned to a modeling group (run id 0 = stop).
    RunAssignment = 3,
    /// One input parameter.
    Parameter = 4,
    /// Status update between root and child.
    Status = 5,
    /// Progress of a child's sub-values, for the root to persist.
    SubValueState = 6,
    /// Base of the accumulator tag space; never sent as is.
    AccumulatorBase = 128,
}

impl MsgTag {
    pub fn tag(self) -> Tag {
        self as Tag
    }
}

impl fmt::Display for MsgTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initial         => write!(f, "initial"),
            Self::MetaData        => write!(f, "metadata"),
            Self::RunAssignment   => write!(f, "run-assignment"),
            Self::Parameter       => write!(f, "parameter"),
            Self::Status          => write!(f, "status"),
            Self::SubValueState   => write!(f, "sub-value-state"),
            Self::AccumulatorBase => write!(f, "accumulator"),
        }
    }
}

/// Tag of one accumulator of one sub-value.
///
/// Injective over `acc_index × [0, sub_value_count)` for a fixed sub-value count.
pub fn accumulator_tag(sub_value_id: usize, sub_value_count: usize, acc_index: usize) -> Tag {
    debug_assert!(sub_value_id < sub_value_count);
    (MsgTag::AccumulatorBase.tag() + acc_index as Tag) * sub_value_count as Tag + sub_value_id as Tag
}

/// Inverse of [`accumulator_tag`]: `(sub_value_id, acc_index)`, or `None` for a control tag.
pub fn split_accumulator_tag(tag: Tag, sub_value_count: usize) -> Option<(usize, usize)> {
    let count = sub_value_count as Tag;
    if count == 0 || tag < MsgTag::AccumulatorBase.tag() * count {
        return None;
    }
    let sub_value_id = (tag % count) as usize;
    let acc_index = (tag / count - MsgTag::AccumulatorBase.tag()) as usize;
    Some((sub_value_id, acc_index))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn accumulator_tags_are_injective() {
        for count in [1usize, 2, 7, 31, 64] {
            let mut seen = HashSet::new();
            for acc in 0..40 {
                for sub in 0..count {
                    let tag = accumulator_tag(sub, count, acc);
                    assert!(seen.insert(tag), "tag {tag} repeated for count {count}");
                    assert_eq!(split_accumulator_tag(tag, count), Some((sub, acc)));
                }
            }
        }
    }

    #[test]
    fn accumulator_tags_never_collide_with_control_tags() {
        let control = [
            MsgTag::Initial,
            MsgTag::MetaData,
            MsgTag::RunAssignment,
            MsgTag::Parameter,
            MsgTag::Status,
            MsgTag::SubValueState,
        ];
        for count in [1usize, 3, 16] {
            for acc in 0..8 {
                for sub in 0..count {
                    let tag = accumulator_tag(sub, count, acc);
                    assert!(control.iter().all(|c| c.tag() != tag));
                }
            }
            for c in control {
                assert_eq!(split_accumulator_tag(c.tag(), count), None);
            }
        }
    }

    #[test]
    fn known_values() {
        assert_eq!(accumulator_tag(0, 1, 0), 128);
        assert_eq!(accumulator_tag(3, 8, 2), 130 * 8 + 3);
    }
}
