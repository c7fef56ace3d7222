pub mod catalog;
pub mod config;
pub mod error;
pub mod messages;
pub mod params;
pub mod status;

pub use catalog::MetadataCatalog;
pub use config::RunConfig;
pub use error::TypesError;
pub use params::{ParamValues, ParameterSource, ValueKind};
pub use status::{ModelStatus, RunStatusCode};

// ── Identifiers ───────────────────────────────────────────────────────────────

/// Model run id. `0` means "no run" (idle group, no more work).
pub type RunId = u32;

/// Input working set id. `0` means "no set".
pub type SetId = u32;

/// Modeling task id.
pub type TaskId = u32;

/// Modeling task run id: one execution of a task.
pub type TaskRunId = u32;

/// Model id inside the metadata repository.
pub type ModelId = u32;

/// Process rank inside the transport world. Rank 0 is the root.
pub type Rank = usize;

/// Rank of the root process.
pub const ROOT_RANK: Rank = 0;
