//! Facade — pod/container lifecycle composites used by the workload service
//! and the checkpoint engine.
//!
//! Every step surfaces the underlying runtime error unchanged; retries are
//! the caller's concern.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::client::runtime::{AttachStream, RuntimeError, RuntimeOps};
use crate::cri::labels;
use crate::proto::runtime::v1 as cri;

#[derive(Clone)]
pub struct Cri {
    runtime: Arc<dyn RuntimeOps>,
}

impl Cri {
    pub fn new(runtime: Arc<dyn RuntimeOps>) -> Self {
        Self { runtime }
    }

    /// Create a pod with its single container, at most once per pod UID.
    ///
    /// Pods are looked up by the `pod-uid` label; if any exist the call
    /// succeeds without recreation. Container metadata and log path are
    /// synthesized from the pod metadata when the caller left them empty.
    pub async fn ensure_pod(
        &self,
        pod_config: cri::PodSandboxConfig,
        container_config: cri::ContainerConfig,
    ) -> Result<(), RuntimeError> {
        let uid = pod_config
            .metadata
            .as_ref()
            .map(|m| m.uid.clone())
            .unwrap_or_default();
        let existing = self
            .runtime
            .list_pod_sandbox(labels::selector(labels::LABEL_POD_UID, &uid))
            .await?;
        if !existing.is_empty() {
            debug!(uid, "pod already exists, skipping creation");
            return Ok(());
        }

        let pod_id = self.runtime.run_pod_sandbox(pod_config.clone()).await?;

        let image = container_config
            .image
            .as_ref()
            .map(|spec| spec.image.clone())
            .unwrap_or_default();
        self.ensure_image(&image, None).await?;

        let mut container_config = container_config;
        if container_config.metadata.is_none() {
            container_config.metadata =
                pod_config.metadata.as_ref().map(|m| cri::ContainerMetadata {
                    name: m.name.clone(),
                    attempt: 0,
                });
        }
        if container_config.log_path.is_empty() {
            if let Some(metadata) = &container_config.metadata {
                container_config.log_path = format!("{}.log", metadata.name);
            }
        }

        let container_id = self
            .runtime
            .create_container(pod_id, container_config, pod_config)
            .await?;
        self.runtime.start_container(&container_id).await?;
        Ok(())
    }

    /// Pull `url` only when no local image carries it as a repo tag.
    /// Returns whether a pull occurred.
    pub async fn ensure_image(
        &self,
        url: &str,
        auth: Option<cri::AuthConfig>,
    ) -> Result<bool, RuntimeError> {
        let images = self.runtime.list_images().await?;
        let present = images
            .iter()
            .any(|image| image.repo_tags.iter().any(|tag| tag == url));
        if present {
            return Ok(false);
        }
        debug!(url, "image not present, pulling");
        self.runtime.pull_image(url, auth).await?;
        Ok(true)
    }

    /// Create and start a container in an existing pod; returns the
    /// container ID.
    pub async fn run_container(
        &self,
        pod_id: String,
        config: cri::ContainerConfig,
        sandbox_config: cri::PodSandboxConfig,
    ) -> Result<String, RuntimeError> {
        let container_id = self
            .runtime
            .create_container(pod_id, config, sandbox_config)
            .await?;
        self.runtime.start_container(&container_id).await?;
        Ok(container_id)
    }

    // ── Passthroughs ────────────────────────────────────────────

    pub async fn run_pod_sandbox(
        &self,
        config: cri::PodSandboxConfig,
    ) -> Result<String, RuntimeError> {
        self.runtime.run_pod_sandbox(config).await
    }

    pub async fn list_pods(
        &self,
        label_selector: HashMap<String, String>,
    ) -> Result<Vec<cri::PodSandbox>, RuntimeError> {
        self.runtime.list_pod_sandbox(label_selector).await
    }

    pub async fn stop_pod(&self, pod_id: &str) -> Result<(), RuntimeError> {
        self.runtime.stop_pod_sandbox(pod_id).await
    }

    pub async fn remove_pod(&self, pod_id: &str) -> Result<(), RuntimeError> {
        self.runtime.remove_pod_sandbox(pod_id).await
    }

    pub async fn list_containers(
        &self,
        label_selector: HashMap<String, String>,
    ) -> Result<Vec<cri::Container>, RuntimeError> {
        self.runtime.list_containers(label_selector).await
    }

    pub async fn attach_container(&self, container_id: &str) -> Result<String, RuntimeError> {
        self.runtime.attach(container_id).await
    }

    pub async fn open_attach_stream(&self, url: &str) -> Result<AttachStream, RuntimeError> {
        self.runtime.open_attach_stream(url).await
    }

    pub async fn checkpoint_container(
        &self,
        container_id: &str,
        location: &str,
        timeout_secs: u64,
    ) -> Result<(), RuntimeError> {
        self.runtime
            .checkpoint_container(container_id, location, timeout_secs)
            .await
    }

    pub async fn restart_runtime(&self) -> Result<(), RuntimeError> {
        self.runtime.restart_runtime().await
    }
}
