use msim_types::Rank;

#[derive(Debug, thiserror::Error)]
pub enum MsgError {
    #[error("rank {rank} is outside of world of size {world_size}")]
    InvalidRank { rank: Rank, world_size: usize },

    #[error("rank {0} has left the world")]
    Disconnected(Rank),

    #[error("broadcast from a non-root rank must not carry a payload, root must")]
    BroadcastPayload,

    #[error("groups are not created: call create_groups first")]
    NoGroups,

    #[error("invalid group layout: {0}")]
    Group(String),

    #[error("encode error: {0}")]
    Encode(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("expected {expected} values, received {actual}")]
    SizeMismatch { expected: usize, actual: usize },
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, MsgError>;
