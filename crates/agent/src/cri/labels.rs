//! Label vocabulary shared by every pod and container the agent manages.

use std::collections::HashMap;

pub const LABEL_WORKLOAD_ID: &str = "workload-id";
pub const LABEL_WORKLOAD_TYPE: &str = "workload-type";
pub const LABEL_WORKLOAD_PORT: &str = "workload-port";
pub const LABEL_CHUNK_ID: &str = "chunk-id";
pub const LABEL_CHUNK_NAME: &str = "chunk-name";
pub const LABEL_FLAVOR_VERSION_ID: &str = "flavor-version-id";
/// Idempotency key for `ensure_pod`: at most one pod per value.
pub const LABEL_POD_UID: &str = "pod-uid";

pub const WORKLOAD_TYPE_INSTANCE: &str = "instance";
pub const WORKLOAD_TYPE_CHECKPOINT: &str = "checkpoint";
pub const WORKLOAD_TYPE_SYSTEM: &str = "system";

/// Single-label selector, the common lookup shape.
pub fn selector(key: &str, value: &str) -> HashMap<String, String> {
    let mut labels = HashMap::new();
    labels.insert(key.to_string(), value.to_string());
    labels
}
