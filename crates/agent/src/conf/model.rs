//! Model — AgentConfig and related structs.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Identifier reported to the control plane on every poll.
    pub node_id: String,
    /// Bind address of the agent's own gRPC server (checkpoint submissions).
    pub bind_address: String,
    /// CRI endpoint, e.g. "unix:///var/run/crio/crio.sock".
    pub cri_endpoint: String,
    /// Control-plane gRPC endpoint.
    pub control_plane_endpoint: String,
    /// Node-local image push service endpoint.
    pub image_push_endpoint: String,

    /// Reconciler tick period in seconds.
    pub sync_interval_secs: u64,
    /// Maximum create attempts per instance before CREATION_FAILED.
    pub max_attempts: u32,

    /// Port allocator range, half-open `[min_port, max_port)`.
    pub min_port: u16,
    pub max_port: u16,

    /// Namespace string used for all workload pods.
    pub workload_namespace: String,
    /// Base URL composed into image refs: `<registry>/<chunk>/<flavor>/base`.
    pub registry_endpoint: String,
    pub registry_user: Option<String>,
    pub registry_pass: Option<String>,

    /// Upstream DNS server handed to workload and checkpoint pods.
    pub dns_server: String,

    /// Resource limits applied to instance workload pods.
    pub workload_cpu_period: i64,
    pub workload_cpu_quota: i64,
    pub workload_memory_limit_bytes: i64,

    /// Resource limits applied to checkpoint pods.
    pub checkpoint_cpu_period: i64,
    pub checkpoint_cpu_quota: i64,
    pub checkpoint_memory_limit_bytes: i64,

    /// Directory for checkpoint tarballs; one file per job, named by job ID.
    pub checkpoint_file_dir: String,
    /// Timeout passed to the runtime's checkpoint RPC.
    pub checkpoint_timeout_seconds: u64,
    /// Timeout for the log-readiness watcher.
    pub checkpoint_container_ready_timeout_secs: u64,
    /// Regex matched against container stdout to detect readiness.
    pub checkpoint_ready_pattern: String,
    /// GC retention for terminal checkpoint statuses.
    pub checkpoint_status_retention_secs: u64,

    /// Garbage collector tick period in seconds.
    pub gc_interval_secs: u64,

    /// Restart the container runtime after a base-image pull. Workaround for
    /// a runtime bug where a freshly pulled base image fails to restore the
    /// subsequent checkpoint image; remove once the runtime is fixed.
    pub restart_runtime_after_pull: bool,
    /// Command used for the restart workaround.
    pub runtime_restart_command: String,

    /// System pods the agent must ensure exist at boot.
    pub system_pods: Vec<SystemPodConfig>,
}

/// A pod the node cannot operate without (e.g. the platform's node proxy).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemPodConfig {
    pub name: String,
    /// Stable UID; `ensure_pod` keys its at-most-once semantics on this.
    pub uid: String,
    pub namespace: String,
    pub image: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            bind_address: "0.0.0.0:50051".to_string(),
            cri_endpoint: "unix:///var/run/crio/crio.sock".to_string(),
            control_plane_endpoint: "http://127.0.0.1:9190".to_string(),
            image_push_endpoint: "http://127.0.0.1:9290".to_string(),
            sync_interval_secs: 10,
            max_attempts: 5,
            min_port: 20000,
            max_port: 30000,
            workload_namespace: "workload".to_string(),
            registry_endpoint: "registry.chunkhost.internal".to_string(),
            registry_user: None,
            registry_pass: None,
            dns_server: "1.1.1.1".to_string(),
            workload_cpu_period: 100_000,
            workload_cpu_quota: 400_000,
            workload_memory_limit_bytes: 4 * 1024 * 1024 * 1024,
            checkpoint_cpu_period: 100_000,
            checkpoint_cpu_quota: 400_000,
            checkpoint_memory_limit_bytes: 2 * 1024 * 1024 * 1024,
            checkpoint_file_dir: "/var/lib/chunkhost/checkpoints".to_string(),
            checkpoint_timeout_seconds: 60,
            checkpoint_container_ready_timeout_secs: 120,
            checkpoint_ready_pattern: r"Done \([0-9.]+s\)!".to_string(),
            checkpoint_status_retention_secs: 300,
            gc_interval_secs: 30,
            restart_runtime_after_pull: false,
            runtime_restart_command: "systemctl restart crio".to_string(),
            system_pods: Vec::new(),
        }
    }
}
