//! Clients for the services the agent consumes.
//!
//! Every domain module reaches the container runtime through the
//! [`runtime::RuntimeOps`] trait and the platform through the
//! [`platform::ControlPlane`] / [`platform::ImagePush`] traits.
//! `live.rs` provides the real tonic-backed implementations.
//! `fake.rs` provides deterministic test doubles.

pub mod fake;
pub mod live;
pub mod platform;
pub mod runtime;

pub use platform::{ControlPlane, ImagePush, Instance, InstanceState, PlatformError, StatusReport};
pub use runtime::{AttachStream, RuntimeError, RuntimeOps};
