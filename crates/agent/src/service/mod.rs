//! gRPC services the agent serves.

pub mod checkpoint;

pub use checkpoint::CheckpointServiceImpl;
