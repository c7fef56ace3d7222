pub mod aggregate;
pub mod capability;
pub mod demo;
pub mod digest;
pub mod error;
pub mod lineage;
pub mod memory;
pub mod records;
pub mod snapshot;

pub use capability::{NewRun, NewRunRequest, OutputWriter, ParameterReader, ParameterWriter, RunStore};
pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use records::{RunRecord, TaskRunRecord, Workset, WorksetValue};
