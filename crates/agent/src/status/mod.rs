//! Status store — per-ID workload and checkpoint status with field-level
//! merge semantics.

pub mod model;
pub mod store;

pub use model::{CheckpointState, CheckpointStatus, StatusRecord, WorkloadState, WorkloadStatus};
pub use store::StatusStore;
