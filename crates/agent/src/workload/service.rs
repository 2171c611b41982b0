//! Service — run, remove, and health-check instance workloads.
//!
//! Instance workloads differ from checkpoint pods in one crucial way: the
//! runtime must restore the checkpoint image, not run the base image, so
//! both images have to be present before the container starts.

use std::collections::HashMap;
use std::time::Duration;

use tracing::{debug, warn};

use crate::client::platform::Instance;
use crate::client::runtime::RuntimeError;
use crate::conf::AgentConfig;
use crate::cri::labels;
use crate::proto::runtime::v1 as cri;
use crate::state::SharedState;

/// Wait after a runtime restart before touching it again.
const RUNTIME_RESTART_SETTLE: Duration = Duration::from_secs(5);

/// The node-local realization of an instance: a pod plus its container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workload {
    pub id: String,
    pub name: String,
    pub base_image: String,
    pub checkpoint_image: String,
    pub namespace: String,
    pub hostname: String,
    pub labels: HashMap<String, String>,
    pub cpu_period: i64,
    pub cpu_quota: i64,
    pub memory_limit_bytes: i64,
    pub port: u16,
}

impl Workload {
    /// Compose the workload for an instance with an already-allocated port.
    pub fn build(instance: &Instance, port: u16, config: &AgentConfig) -> Self {
        let name = format!("{}_{}", instance.chunk_name, instance.flavor_version_name);
        let image_base = format!(
            "{}/{}/{}",
            config.registry_endpoint, instance.chunk_name, instance.flavor_version_name
        );

        let mut workload_labels = HashMap::new();
        workload_labels.insert(labels::LABEL_CHUNK_ID.to_string(), instance.chunk_id.clone());
        workload_labels.insert(
            labels::LABEL_CHUNK_NAME.to_string(),
            instance.chunk_name.clone(),
        );
        workload_labels.insert(
            labels::LABEL_FLAVOR_VERSION_ID.to_string(),
            instance.flavor_version_id.clone(),
        );
        workload_labels.insert(labels::LABEL_WORKLOAD_ID.to_string(), instance.id.clone());
        workload_labels.insert(
            labels::LABEL_WORKLOAD_TYPE.to_string(),
            labels::WORKLOAD_TYPE_INSTANCE.to_string(),
        );
        workload_labels.insert(labels::LABEL_WORKLOAD_PORT.to_string(), port.to_string());

        Self {
            id: instance.id.clone(),
            name: name.clone(),
            base_image: format!("{}/base", image_base),
            checkpoint_image: format!("{}/checkpoint", image_base),
            namespace: config.workload_namespace.clone(),
            hostname: name,
            labels: workload_labels,
            cpu_period: config.workload_cpu_period,
            cpu_quota: config.workload_cpu_quota,
            memory_limit_bytes: config.workload_memory_limit_bytes,
            port,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Healthy,
    Unhealthy,
}

pub struct WorkloadService {
    state: SharedState,
}

impl WorkloadService {
    pub fn new(state: SharedState) -> Self {
        Self { state }
    }

    /// Bring up the workload's pod and container.
    pub async fn run_workload(
        &self,
        workload: &Workload,
        attempt: u32,
    ) -> Result<(), RuntimeError> {
        let auth = self.state.registry_auth();
        let pulled = self
            .state
            .cri
            .ensure_image(&workload.base_image, auth.clone())
            .await?;
        if pulled && self.state.config.restart_runtime_after_pull {
            // A freshly pulled base image fails to restore the subsequent
            // checkpoint image until the runtime is restarted.
            warn!(workload_id = %workload.id, "restarting container runtime after base image pull");
            self.state.cri.restart_runtime().await?;
            tokio::time::sleep(RUNTIME_RESTART_SETTLE).await;
        }

        let pod_config = self.pod_config(workload, attempt);
        let pod_id = self.state.cri.run_pod_sandbox(pod_config.clone()).await?;

        self.state
            .cri
            .ensure_image(&workload.checkpoint_image, auth)
            .await?;

        let container_id = self
            .state
            .cri
            .run_container(pod_id, self.container_config(workload), pod_config)
            .await?;
        debug!(workload_id = %workload.id, container_id = %container_id, attempt, "workload running");
        Ok(())
    }

    /// Stop and remove the workload's pod. Surfaces `NotFound` when no pod
    /// carries the workload ID; callers treat that as already deleted.
    pub async fn remove_workload(&self, id: &str) -> Result<(), RuntimeError> {
        let pods = self
            .state
            .cri
            .list_pods(labels::selector(labels::LABEL_WORKLOAD_ID, id))
            .await?;
        if pods.is_empty() {
            return Err(RuntimeError::NotFound(id.to_string()));
        }
        for pod in pods {
            self.state.cri.stop_pod(&pod.id).await?;
            self.state.cri.remove_pod(&pod.id).await?;
        }
        Ok(())
    }

    /// Health by container state: no containers is unhealthy, anything but
    /// RUNNING is unhealthy.
    pub async fn workload_health(&self, id: &str) -> Result<Health, RuntimeError> {
        let containers = self
            .state
            .cri
            .list_containers(labels::selector(labels::LABEL_WORKLOAD_ID, id))
            .await?;
        if containers.is_empty() {
            return Ok(Health::Unhealthy);
        }
        let all_running = containers
            .iter()
            .all(|container| container.state == cri::ContainerState::ContainerRunning as i32);
        Ok(if all_running {
            Health::Healthy
        } else {
            Health::Unhealthy
        })
    }

    fn pod_config(&self, workload: &Workload, attempt: u32) -> cri::PodSandboxConfig {
        cri::PodSandboxConfig {
            metadata: Some(cri::PodSandboxMetadata {
                name: workload.name.clone(),
                uid: workload.id.clone(),
                namespace: workload.namespace.clone(),
                attempt,
            }),
            hostname: workload.hostname.clone(),
            log_directory: format!("/var/log/pods/{}", workload.id),
            dns_config: Some(cri::DnsConfig {
                servers: vec![self.state.config.dns_server.clone()],
                searches: vec![],
                options: vec![],
            }),
            labels: workload.labels.clone(),
            annotations: HashMap::new(),
            linux: Some(cri::LinuxPodSandboxConfig {
                cgroup_parent: String::new(),
                sysctls: HashMap::new(),
                resources: Some(cri::LinuxContainerResources {
                    cpu_period: workload.cpu_period,
                    cpu_quota: workload.cpu_quota,
                    memory_limit_in_bytes: workload.memory_limit_bytes,
                }),
            }),
        }
    }

    fn container_config(&self, workload: &Workload) -> cri::ContainerConfig {
        cri::ContainerConfig {
            metadata: Some(cri::ContainerMetadata {
                name: workload.name.clone(),
                attempt: 0,
            }),
            // Restore source, not the base image.
            image: Some(cri::ImageSpec {
                image: workload.checkpoint_image.clone(),
                ..Default::default()
            }),
            labels: workload.labels.clone(),
            log_path: format!("{}/0.log", workload.name),
            ..Default::default()
        }
    }
}
