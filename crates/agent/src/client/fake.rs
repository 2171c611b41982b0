//! Fake — test doubles for the runtime, control plane, and image push.
//!
//! Deterministic in-memory implementations of [`RuntimeOps`],
//! [`ControlPlane`], and [`ImagePush`]. Builder methods pre-populate state
//! and inject failures; accessor methods let tests assert on the calls the
//! code under test actually made. No container runtime or network required.

use std::collections::HashMap;
use std::path::Path;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Mutex;

use crate::checkpoint::image::CheckpointImage;
use crate::client::platform::{ControlPlane, ImagePush, Instance, PlatformError, StatusReport};
use crate::client::runtime::{AttachStream, RuntimeError, RuntimeOps};
use crate::proto::runtime::v1 as cri;

fn matches_selector(labels: &HashMap<String, String>, selector: &HashMap<String, String>) -> bool {
    selector
        .iter()
        .all(|(key, value)| labels.get(key) == Some(value))
}

// ── Fake runtime ────────────────────────────────────────────────

/// One canned stdout chunk emitted by the fake attach stream.
#[derive(Clone, Debug)]
pub struct AttachChunk {
    pub delay_ms: u64,
    pub data: String,
}

#[derive(Default)]
struct RuntimeInner {
    pods: Vec<cri::PodSandbox>,
    containers: Vec<cri::Container>,
    images: Vec<cri::Image>,
    next_pod: u32,
    next_container: u32,

    pull_requests: Vec<String>,
    run_pod_requests: Vec<String>,
    started_containers: Vec<String>,
    stopped_pods: Vec<String>,
    removed_pods: Vec<String>,
    checkpoint_requests: Vec<(String, String, u64)>,
    restarts: u32,

    attach_script: Vec<AttachChunk>,
    attach_script_repeat: bool,

    fail_pull: Option<String>,
    fail_run_pod: Option<String>,
    fail_create_container: Option<String>,
    fail_start_container: Option<String>,
    fail_attach: Option<String>,
    fail_checkpoint: Option<String>,
}

/// A fake container runtime for deterministic testing.
pub struct FakeRuntime {
    inner: Mutex<RuntimeInner>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RuntimeInner::default()),
        }
    }

    // ── Seeding ─────────────────────────────────────────────────

    /// Seed a pod into the fake store.
    pub async fn add_pod(&self, pod: cri::PodSandbox) {
        self.inner.lock().await.pods.push(pod);
    }

    /// Seed a container.
    pub async fn add_container(&self, container: cri::Container) {
        self.inner.lock().await.containers.push(container);
    }

    /// Seed an image by tag.
    pub async fn add_image(&self, tag: &str) {
        let mut state = self.inner.lock().await;
        let id = format!("sha256:{:08x}", state.images.len() + 1);
        state.images.push(cri::Image {
            id,
            repo_tags: vec![tag.to_string()],
            repo_digests: vec![],
            size: 1024,
        });
    }

    /// Script the stdout chunks the attach stream will emit.
    pub async fn set_attach_script(&self, chunks: Vec<AttachChunk>, repeat: bool) {
        let mut state = self.inner.lock().await;
        state.attach_script = chunks;
        state.attach_script_repeat = repeat;
    }

    // ── Failure injection ───────────────────────────────────────

    pub async fn fail_pull(&self, message: &str) {
        self.inner.lock().await.fail_pull = Some(message.to_string());
    }

    pub async fn fail_run_pod(&self, message: &str) {
        self.inner.lock().await.fail_run_pod = Some(message.to_string());
    }

    pub async fn fail_create_container(&self, message: &str) {
        self.inner.lock().await.fail_create_container = Some(message.to_string());
    }

    pub async fn fail_start_container(&self, message: &str) {
        self.inner.lock().await.fail_start_container = Some(message.to_string());
    }

    pub async fn fail_attach(&self, message: &str) {
        self.inner.lock().await.fail_attach = Some(message.to_string());
    }

    pub async fn fail_checkpoint(&self, message: &str) {
        self.inner.lock().await.fail_checkpoint = Some(message.to_string());
    }

    // ── Assertions ──────────────────────────────────────────────

    pub async fn pods(&self) -> Vec<cri::PodSandbox> {
        self.inner.lock().await.pods.clone()
    }

    pub async fn containers(&self) -> Vec<cri::Container> {
        self.inner.lock().await.containers.clone()
    }

    pub async fn pull_requests(&self) -> Vec<String> {
        self.inner.lock().await.pull_requests.clone()
    }

    /// Every `run_pod_sandbox` call (by pod UID), including failed ones.
    pub async fn run_pod_requests(&self) -> Vec<String> {
        self.inner.lock().await.run_pod_requests.clone()
    }

    pub async fn started_containers(&self) -> Vec<String> {
        self.inner.lock().await.started_containers.clone()
    }

    pub async fn stopped_pods(&self) -> Vec<String> {
        self.inner.lock().await.stopped_pods.clone()
    }

    pub async fn removed_pods(&self) -> Vec<String> {
        self.inner.lock().await.removed_pods.clone()
    }

    pub async fn checkpoint_requests(&self) -> Vec<(String, String, u64)> {
        self.inner.lock().await.checkpoint_requests.clone()
    }

    pub async fn restart_count(&self) -> u32 {
        self.inner.lock().await.restarts
    }

    /// Flip a seeded or created container into the given state.
    pub async fn set_container_state(&self, container_id: &str, state: cri::ContainerState) {
        let mut inner = self.inner.lock().await;
        for container in &mut inner.containers {
            if container.id == container_id {
                container.state = state as i32;
            }
        }
    }
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeOps for FakeRuntime {
    // ── Pod sandboxes ───────────────────────────────────────────

    fn run_pod_sandbox(
        &self,
        config: cri::PodSandboxConfig,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<String, RuntimeError>> + Send + '_>> {
        Box::pin(async move {
            let mut state = self.inner.lock().await;
            let uid = config
                .metadata
                .as_ref()
                .map(|m| m.uid.clone())
                .unwrap_or_default();
            state.run_pod_requests.push(uid);
            if let Some(message) = &state.fail_run_pod {
                return Err(RuntimeError::Rpc(tonic::Status::internal(message.clone())));
            }
            state.next_pod += 1;
            let id = format!("pod-{}", state.next_pod);
            state.pods.push(cri::PodSandbox {
                id: id.clone(),
                metadata: config.metadata.clone(),
                state: cri::PodSandboxState::SandboxReady as i32,
                created_at: 0,
                labels: config.labels.clone(),
                annotations: config.annotations.clone(),
            });
            Ok(id)
        })
    }

    fn stop_pod_sandbox<'a>(
        &'a self,
        pod_id: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<(), RuntimeError>> + Send + 'a>> {
        Box::pin(async move {
            let mut state = self.inner.lock().await;
            if !state.pods.iter().any(|p| p.id == pod_id) {
                return Err(RuntimeError::NotFound(pod_id.to_string()));
            }
            state.stopped_pods.push(pod_id.to_string());
            Ok(())
        })
    }

    fn remove_pod_sandbox<'a>(
        &'a self,
        pod_id: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<(), RuntimeError>> + Send + 'a>> {
        Box::pin(async move {
            let mut state = self.inner.lock().await;
            if !state.pods.iter().any(|p| p.id == pod_id) {
                return Err(RuntimeError::NotFound(pod_id.to_string()));
            }
            state.pods.retain(|p| p.id != pod_id);
            state.containers.retain(|c| c.pod_sandbox_id != pod_id);
            state.removed_pods.push(pod_id.to_string());
            Ok(())
        })
    }

    fn list_pod_sandbox(
        &self,
        label_selector: HashMap<String, String>,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<Vec<cri::PodSandbox>, RuntimeError>> + Send + '_>>
    {
        Box::pin(async move {
            let state = self.inner.lock().await;
            Ok(state
                .pods
                .iter()
                .filter(|pod| matches_selector(&pod.labels, &label_selector))
                .cloned()
                .collect())
        })
    }

    // ── Containers ──────────────────────────────────────────────

    fn create_container(
        &self,
        pod_id: String,
        config: cri::ContainerConfig,
        _sandbox_config: cri::PodSandboxConfig,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<String, RuntimeError>> + Send + '_>> {
        Box::pin(async move {
            let mut state = self.inner.lock().await;
            if let Some(message) = &state.fail_create_container {
                return Err(RuntimeError::Rpc(tonic::Status::internal(message.clone())));
            }
            state.next_container += 1;
            let id = format!("ctr-{}", state.next_container);
            state.containers.push(cri::Container {
                id: id.clone(),
                pod_sandbox_id: pod_id,
                metadata: config.metadata.clone(),
                image: config.image.clone(),
                image_ref: config.image.as_ref().map(|i| i.image.clone()).unwrap_or_default(),
                state: cri::ContainerState::ContainerCreated as i32,
                created_at: 0,
                labels: config.labels.clone(),
                annotations: config.annotations.clone(),
            });
            Ok(id)
        })
    }

    fn start_container<'a>(
        &'a self,
        container_id: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<(), RuntimeError>> + Send + 'a>> {
        Box::pin(async move {
            let mut state = self.inner.lock().await;
            if let Some(message) = &state.fail_start_container {
                return Err(RuntimeError::Rpc(tonic::Status::internal(message.clone())));
            }
            let Some(container) = state.containers.iter_mut().find(|c| c.id == container_id)
            else {
                return Err(RuntimeError::NotFound(container_id.to_string()));
            };
            container.state = cri::ContainerState::ContainerRunning as i32;
            state.started_containers.push(container_id.to_string());
            Ok(())
        })
    }

    fn list_containers(
        &self,
        label_selector: HashMap<String, String>,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<Vec<cri::Container>, RuntimeError>> + Send + '_>>
    {
        Box::pin(async move {
            let state = self.inner.lock().await;
            Ok(state
                .containers
                .iter()
                .filter(|container| matches_selector(&container.labels, &label_selector))
                .cloned()
                .collect())
        })
    }

    // ── Streaming ───────────────────────────────────────────────

    fn attach<'a>(
        &'a self,
        container_id: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<String, RuntimeError>> + Send + 'a>> {
        Box::pin(async move {
            let state = self.inner.lock().await;
            if let Some(message) = &state.fail_attach {
                return Err(RuntimeError::Rpc(tonic::Status::internal(message.clone())));
            }
            if !state.containers.iter().any(|c| c.id == container_id) {
                return Err(RuntimeError::NotFound(container_id.to_string()));
            }
            Ok(format!("http://127.0.0.1:10250/attach/{}", container_id))
        })
    }

    fn open_attach_stream<'a>(
        &'a self,
        _url: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<AttachStream, RuntimeError>> + Send + 'a>>
    {
        Box::pin(async move {
            let state = self.inner.lock().await;
            let script = state.attach_script.clone();
            let repeat = state.attach_script_repeat;
            drop(state);

            let stream = async_stream::try_stream! {
                loop {
                    for chunk in &script {
                        tokio::time::sleep(Duration::from_millis(chunk.delay_ms)).await;
                        yield Bytes::from(chunk.data.clone().into_bytes());
                    }
                    if !repeat {
                        break;
                    }
                }
            };
            Ok(Box::pin(stream) as AttachStream)
        })
    }

    // ── Checkpoint ──────────────────────────────────────────────

    fn checkpoint_container<'a>(
        &'a self,
        container_id: &'a str,
        location: &'a str,
        timeout_secs: u64,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<(), RuntimeError>> + Send + 'a>> {
        Box::pin(async move {
            let mut state = self.inner.lock().await;
            if let Some(message) = &state.fail_checkpoint {
                return Err(RuntimeError::Rpc(tonic::Status::internal(message.clone())));
            }
            // The real runtime writes the dump tarball to `location`.
            if let Some(parent) = Path::new(location).parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| RuntimeError::Rpc(tonic::Status::internal(e.to_string())))?;
            }
            tokio::fs::write(location, b"fake checkpoint tarball")
                .await
                .map_err(|e| RuntimeError::Rpc(tonic::Status::internal(e.to_string())))?;
            state
                .checkpoint_requests
                .push((container_id.to_string(), location.to_string(), timeout_secs));
            Ok(())
        })
    }

    // ── Images ──────────────────────────────────────────────────

    fn list_images(
        &self,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<Vec<cri::Image>, RuntimeError>> + Send + '_>>
    {
        Box::pin(async move { Ok(self.inner.lock().await.images.clone()) })
    }

    fn pull_image<'a>(
        &'a self,
        image: &'a str,
        _auth: Option<cri::AuthConfig>,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<String, RuntimeError>> + Send + 'a>> {
        Box::pin(async move {
            let mut state = self.inner.lock().await;
            if let Some(message) = &state.fail_pull {
                return Err(RuntimeError::Rpc(tonic::Status::internal(message.clone())));
            }
            state.pull_requests.push(image.to_string());
            let id = format!("sha256:{:08x}", state.images.len() + 1);
            state.images.push(cri::Image {
                id: id.clone(),
                repo_tags: vec![image.to_string()],
                repo_digests: vec![],
                size: 1024,
            });
            Ok(id)
        })
    }

    // ── Runtime process ─────────────────────────────────────────

    fn restart_runtime(
        &self,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<(), RuntimeError>> + Send + '_>> {
        Box::pin(async move {
            self.inner.lock().await.restarts += 1;
            Ok(())
        })
    }
}

// ── Fake control plane ──────────────────────────────────────────

#[derive(Default)]
struct ControlPlaneInner {
    instances: Vec<Instance>,
    discover_failures: u32,
    report_failures: u32,
    reports: Vec<Vec<StatusReport>>,
}

/// A fake control plane: serves a fixed instance list and records reports.
#[derive(Default)]
pub struct FakeControlPlane {
    inner: Mutex<ControlPlaneInner>,
}

impl FakeControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the instance list served to every subsequent discover call.
    pub async fn set_instances(&self, instances: Vec<Instance>) {
        self.inner.lock().await.instances = instances;
    }

    /// Fail the next `n` discover calls.
    pub async fn fail_discovers(&self, n: u32) {
        self.inner.lock().await.discover_failures = n;
    }

    /// Fail the next `n` report calls.
    pub async fn fail_reports(&self, n: u32) {
        self.inner.lock().await.report_failures = n;
    }

    /// Every batch of reports received, in call order.
    pub async fn reports(&self) -> Vec<Vec<StatusReport>> {
        self.inner.lock().await.reports.clone()
    }
}

impl ControlPlane for FakeControlPlane {
    fn discover_instances<'a>(
        &'a self,
        _node_id: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<Vec<Instance>, PlatformError>> + Send + 'a>>
    {
        Box::pin(async move {
            let mut state = self.inner.lock().await;
            if state.discover_failures > 0 {
                state.discover_failures -= 1;
                return Err(PlatformError::ConnectionFailed("injected".to_string()));
            }
            Ok(state.instances.clone())
        })
    }

    fn report_status<'a>(
        &'a self,
        _node_id: &'a str,
        reports: Vec<StatusReport>,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<(), PlatformError>> + Send + 'a>> {
        Box::pin(async move {
            let mut state = self.inner.lock().await;
            if state.report_failures > 0 {
                state.report_failures -= 1;
                return Err(PlatformError::ConnectionFailed("injected".to_string()));
            }
            state.reports.push(reports);
            Ok(())
        })
    }
}

// ── Fake image push ─────────────────────────────────────────────

#[derive(Default)]
struct PushInner {
    pushes: Vec<(String, CheckpointImage)>,
    fail: Option<String>,
}

/// Records pushed checkpoint images instead of talking to a registry.
#[derive(Default)]
pub struct FakePush {
    inner: Mutex<PushInner>,
}

impl FakePush {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn fail_push(&self, message: &str) {
        self.inner.lock().await.fail = Some(message.to_string());
    }

    pub async fn pushes(&self) -> Vec<(String, CheckpointImage)> {
        self.inner.lock().await.pushes.clone()
    }
}

impl ImagePush for FakePush {
    fn push_checkpoint_image<'a>(
        &'a self,
        reference: &'a str,
        image: &'a CheckpointImage,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<(), PlatformError>> + Send + 'a>> {
        Box::pin(async move {
            let mut state = self.inner.lock().await;
            if let Some(message) = &state.fail {
                return Err(PlatformError::ConnectionFailed(message.clone()));
            }
            state.pushes.push((reference.to_string(), image.clone()));
            Ok(())
        })
    }
}
