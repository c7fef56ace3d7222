// ── Module declarations ───────────────────────────────────────────────────────

pub mod codec;
pub mod error;
pub mod local;
pub mod tags;
pub mod transport;

// ── Public re-exports ─────────────────────────────────────────────────────────

pub use error::{MsgError, Result};
pub use local::{LocalEndpoint, LocalWorld};
pub use tags::{accumulator_tag, MsgTag, Tag};
pub use transport::{BroadcastScope, GroupLayout, Transport, TransportExt};
