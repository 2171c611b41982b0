//! Runtime trait — abstract interface over the container runtime (CRI).
//!
//! Every domain module accesses the runtime through this trait.
//! `live.rs` provides the real CRI-backed implementation.
//! `fake.rs` provides a test double.

use std::collections::HashMap;
use std::pin::Pin;

use bytes::Bytes;
use thiserror::Error;
use tokio_stream::Stream;

use crate::proto::runtime::v1 as cri;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("runtime connection failed: {0}")]
    ConnectionFailed(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("attach stream closed")]
    StreamClosed,
    #[error("attach protocol error: {0}")]
    AttachProtocol(String),
    #[error("runtime restart failed: {0}")]
    RestartFailed(String),
    #[error("runtime call failed: {0}")]
    Rpc(#[from] tonic::Status),
}

impl RuntimeError {
    /// Deletion paths treat not-found as success; this folds the two ways a
    /// missing object can surface (local lookup miss, NOT_FOUND from the
    /// runtime) into one check.
    pub fn is_not_found(&self) -> bool {
        match self {
            RuntimeError::NotFound(_) => true,
            RuntimeError::Rpc(status) => status.code() == tonic::Code::NotFound,
            _ => false,
        }
    }
}

/// Raw container stdout, chunked as the runtime's streaming server emits it.
pub type AttachStream = Pin<Box<dyn Stream<Item = Result<Bytes, RuntimeError>> + Send>>;

/// Unified async interface over the container runtime.
///
/// Object-safe thanks to `Pin<Box<…>>` returns. Implementations must be
/// `Send + Sync` so they can live inside `Arc<AgentState>`.
pub trait RuntimeOps: Send + Sync {
    // ── Pod sandboxes ───────────────────────────────────────────

    fn run_pod_sandbox(
        &self,
        config: cri::PodSandboxConfig,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<String, RuntimeError>> + Send + '_>>;

    fn stop_pod_sandbox<'a>(
        &'a self,
        pod_id: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<(), RuntimeError>> + Send + 'a>>;

    fn remove_pod_sandbox<'a>(
        &'a self,
        pod_id: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<(), RuntimeError>> + Send + 'a>>;

    fn list_pod_sandbox(
        &self,
        label_selector: HashMap<String, String>,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<Vec<cri::PodSandbox>, RuntimeError>> + Send + '_>>;

    // ── Containers ──────────────────────────────────────────────

    fn create_container(
        &self,
        pod_id: String,
        config: cri::ContainerConfig,
        sandbox_config: cri::PodSandboxConfig,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<String, RuntimeError>> + Send + '_>>;

    fn start_container<'a>(
        &'a self,
        container_id: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<(), RuntimeError>> + Send + 'a>>;

    fn list_containers(
        &self,
        label_selector: HashMap<String, String>,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<Vec<cri::Container>, RuntimeError>> + Send + '_>>;

    // ── Streaming ───────────────────────────────────────────────

    fn attach<'a>(
        &'a self,
        container_id: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<String, RuntimeError>> + Send + 'a>>;

    fn open_attach_stream<'a>(
        &'a self,
        url: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<AttachStream, RuntimeError>> + Send + 'a>>;

    // ── Checkpoint ──────────────────────────────────────────────

    fn checkpoint_container<'a>(
        &'a self,
        container_id: &'a str,
        location: &'a str,
        timeout_secs: u64,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<(), RuntimeError>> + Send + 'a>>;

    // ── Images ──────────────────────────────────────────────────

    fn list_images(
        &self,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<Vec<cri::Image>, RuntimeError>> + Send + '_>>;

    fn pull_image<'a>(
        &'a self,
        image: &'a str,
        auth: Option<cri::AuthConfig>,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<String, RuntimeError>> + Send + 'a>>;

    // ── Runtime process ─────────────────────────────────────────

    /// Restart the runtime daemon itself. Only used by the
    /// pull-then-restore workaround; see `AgentConfig::restart_runtime_after_pull`.
    fn restart_runtime(
        &self,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<(), RuntimeError>> + Send + '_>>;
}
