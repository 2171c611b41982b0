//! Engine — asynchronous checkpoint jobs.
//!
//! `create` returns a fresh job ID immediately; the job itself runs on its
//! own task and records progress in the status store. Each job runs exactly
//! once — retries belong to the platform's checkpoint queue, not the node.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::image::{self, ImageError};
use super::{CHECKPOINT_NAMESPACE, PAYLOAD_CONTAINER};
use crate::client::platform::{ImagePush, PlatformError};
use crate::client::runtime::RuntimeError;
use crate::cri::labels;
use crate::proto::runtime::v1 as cri;
use crate::state::SharedState;
use crate::status::{CheckpointState, CheckpointStatus, StatusRecord};
use crate::watch::{ReadyWatcher, WatchError};

/// Where a job failed; maps one-to-one onto the terminal status states so
/// operators can tell the failing step from the status alone.
#[derive(Error, Debug)]
enum StepFailure {
    #[error("pulling base image failed: {0}")]
    Pull(RuntimeError),
    #[error("starting payload container failed: {0}")]
    Setup(RuntimeError),
    #[error("waiting for container readiness failed: {0}")]
    WaitReady(WatchError),
    #[error("checkpointing container failed: {0}")]
    Dump(RuntimeError),
    #[error("packaging checkpoint image failed: {0}")]
    Package(ImageError),
    #[error("pushing checkpoint image failed: {0}")]
    Push(PlatformError),
}

impl StepFailure {
    fn state(&self) -> CheckpointState {
        match self {
            StepFailure::Pull(_) => CheckpointState::PullBaseImageFailed,
            StepFailure::Setup(_) | StepFailure::WaitReady(_) => {
                CheckpointState::ContainerWaitReadyFailed
            }
            StepFailure::Dump(_) => CheckpointState::ContainerCheckpointFailed,
            StepFailure::Package(_) | StepFailure::Push(_) => {
                CheckpointState::PushCheckpointFailed
            }
        }
    }
}

pub struct CheckpointEngine {
    state: SharedState,
    push: Arc<dyn ImagePush>,
}

impl CheckpointEngine {
    pub fn new(state: SharedState, push: Arc<dyn ImagePush>) -> Self {
        Self { state, push }
    }

    /// Submit a checkpoint job for `base_image`. Returns the job ID
    /// immediately; results land in the status store.
    pub fn create(self: &Arc<Self>, base_image: String) -> String {
        let id = Uuid::now_v7().to_string();
        let engine = Arc::clone(self);
        let job_id = id.clone();
        tokio::spawn(async move {
            engine.run_job(job_id, base_image).await;
        });
        id
    }

    /// Stored status for a job, if still retained.
    pub fn status(&self, id: &str) -> Option<CheckpointStatus> {
        self.state.store.get(id).and_then(|record| record.checkpoint)
    }

    pub(crate) async fn run_job(&self, id: String, base_image: String) {
        let port = match self.state.ports.allocate() {
            Ok(port) => port,
            Err(e) => {
                // No status was ever written for this ID; status lookups
                // answer NotFound, and the queue resubmits.
                error!(checkpoint_id = %id, "cannot start checkpoint job: {}", e);
                return;
            }
        };
        self.state.store.update(
            &id,
            StatusRecord::checkpoint(CheckpointStatus {
                state: Some(CheckpointState::Running),
                port: Some(port),
                ..Default::default()
            }),
        );
        info!(checkpoint_id = %id, base_image = %base_image, port, "checkpoint job started");

        let outcome = self.execute(&id, &base_image, port).await;

        // Exactly one terminal status write. The port is deliberately not
        // freed here: the CNI plugin reads it from the store during pod
        // teardown, so the GC collector frees it after retention.
        let (state, message) = match &outcome {
            Ok(()) => (CheckpointState::Completed, "checkpoint pushed".to_string()),
            Err(failure) => (failure.state(), failure.to_string()),
        };
        self.state.store.update(
            &id,
            StatusRecord::checkpoint(CheckpointStatus {
                state: Some(state),
                message: Some(message.clone()),
                completed_at: Some(Utc::now()),
                port: None,
            }),
        );
        match outcome {
            Ok(()) => info!(checkpoint_id = %id, "checkpoint job completed"),
            Err(_) => warn!(checkpoint_id = %id, "checkpoint job failed: {}", message),
        }
    }

    async fn execute(&self, id: &str, base_image: &str, port: u16) -> Result<(), StepFailure> {
        let config = &self.state.config;

        self.state
            .cri
            .ensure_image(base_image, self.state.registry_auth())
            .await
            .map_err(StepFailure::Pull)?;

        let pod_config = self.pod_config(id, port);
        let pod_id = self
            .state
            .cri
            .run_pod_sandbox(pod_config.clone())
            .await
            .map_err(StepFailure::Setup)?;

        let container_id = self
            .state
            .cri
            .run_container(pod_id, self.container_config(id, base_image, port), pod_config)
            .await
            .map_err(StepFailure::Setup)?;

        let attach_url = self
            .state
            .cri
            .attach_container(&container_id)
            .await
            .map_err(StepFailure::Setup)?;
        let stream = self
            .state
            .cri
            .open_attach_stream(&attach_url)
            .await
            .map_err(StepFailure::Setup)?;

        // Fresh timeout, not derived from the job context: a tight readiness
        // deadline must not abort the enclosing job early.
        let watcher = ReadyWatcher::new(stream, &config.checkpoint_ready_pattern)
            .map_err(StepFailure::WaitReady)?;
        watcher
            .wait_for_match(Duration::from_secs(
                config.checkpoint_container_ready_timeout_secs,
            ))
            .await
            .map_err(StepFailure::WaitReady)?;

        let location = Path::new(&config.checkpoint_file_dir).join(id);
        self.state
            .cri
            .checkpoint_container(
                &container_id,
                &location.to_string_lossy(),
                config.checkpoint_timeout_seconds,
            )
            .await
            .map_err(StepFailure::Dump)?;

        let checkpoint_image = image::package_tarball(&location, Utc::now())
            .await
            .map_err(StepFailure::Package)?;
        let reference = format!("{}:checkpoint", base_image);
        self.push
            .push_checkpoint_image(&reference, &checkpoint_image)
            .await
            .map_err(StepFailure::Push)?;
        Ok(())
    }

    fn checkpoint_labels(&self, id: &str, port: u16) -> HashMap<String, String> {
        let mut checkpoint_labels = HashMap::new();
        checkpoint_labels.insert(labels::LABEL_WORKLOAD_ID.to_string(), id.to_string());
        checkpoint_labels.insert(
            labels::LABEL_WORKLOAD_TYPE.to_string(),
            labels::WORKLOAD_TYPE_CHECKPOINT.to_string(),
        );
        checkpoint_labels.insert(labels::LABEL_WORKLOAD_PORT.to_string(), port.to_string());
        checkpoint_labels.insert(labels::LABEL_POD_UID.to_string(), id.to_string());
        checkpoint_labels
    }

    fn pod_config(&self, id: &str, port: u16) -> cri::PodSandboxConfig {
        let config = &self.state.config;
        cri::PodSandboxConfig {
            metadata: Some(cri::PodSandboxMetadata {
                name: id.to_string(),
                uid: id.to_string(),
                namespace: CHECKPOINT_NAMESPACE.to_string(),
                attempt: 0,
            }),
            hostname: String::new(),
            log_directory: format!("/var/log/pods/{}", id),
            dns_config: Some(cri::DnsConfig {
                servers: vec![config.dns_server.clone()],
                searches: vec![],
                options: vec![],
            }),
            labels: self.checkpoint_labels(id, port),
            annotations: HashMap::new(),
            linux: Some(cri::LinuxPodSandboxConfig {
                cgroup_parent: String::new(),
                sysctls: HashMap::new(),
                resources: Some(cri::LinuxContainerResources {
                    cpu_period: config.checkpoint_cpu_period,
                    cpu_quota: config.checkpoint_cpu_quota,
                    memory_limit_in_bytes: config.checkpoint_memory_limit_bytes,
                }),
            }),
        }
    }

    fn container_config(&self, id: &str, base_image: &str, port: u16) -> cri::ContainerConfig {
        cri::ContainerConfig {
            metadata: Some(cri::ContainerMetadata {
                name: PAYLOAD_CONTAINER.to_string(),
                attempt: 0,
            }),
            image: Some(cri::ImageSpec {
                image: base_image.to_string(),
                ..Default::default()
            }),
            labels: self.checkpoint_labels(id, port),
            log_path: format!("{}/0.log", PAYLOAD_CONTAINER),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::fake::{AttachChunk, FakePush, FakeRuntime};
    use crate::conf::AgentConfig;
    use crate::state::AgentState;

    const BASE_IMAGE: &str = "reg.example.com/c/f/base";

    struct Harness {
        engine: Arc<CheckpointEngine>,
        runtime: Arc<FakeRuntime>,
        push: Arc<FakePush>,
        state: SharedState,
        _dir: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        let push = Arc::new(FakePush::new());
        let config = AgentConfig {
            node_id: "node-test".to_string(),
            checkpoint_file_dir: dir.path().to_string_lossy().into_owned(),
            checkpoint_container_ready_timeout_secs: 1,
            checkpoint_timeout_seconds: 7,
            ..AgentConfig::default()
        };
        let state = Arc::new(AgentState::new(config, runtime.clone()));
        let engine = Arc::new(CheckpointEngine::new(state.clone(), push.clone()));
        Harness {
            engine,
            runtime,
            push,
            state,
            _dir: dir,
        }
    }

    async fn script_ready(runtime: &FakeRuntime) {
        runtime
            .set_attach_script(
                vec![
                    AttachChunk {
                        delay_ms: 5,
                        data: "Loading world...\n".to_string(),
                    },
                    AttachChunk {
                        delay_ms: 5,
                        data: "Done (30.0s)! For help, type \"help\"\n".to_string(),
                    },
                ],
                false,
            )
            .await;
    }

    #[tokio::test]
    async fn create_returns_immediately_with_distinct_ids() {
        let h = harness();
        script_ready(&h.runtime).await;

        let first = h.engine.create(BASE_IMAGE.to_string());
        let second = h.engine.create(BASE_IMAGE.to_string());

        assert_ne!(first, second);
        assert!(Uuid::parse_str(&first).is_ok());
    }

    #[tokio::test]
    async fn happy_path_completes_and_pushes() {
        let h = harness();
        script_ready(&h.runtime).await;

        h.engine
            .run_job("job-1".to_string(), BASE_IMAGE.to_string())
            .await;

        let status = h.engine.status("job-1").unwrap();
        assert_eq!(status.state, Some(CheckpointState::Completed));
        assert!(status.completed_at.is_some());
        let port = status.port.unwrap();
        assert!(h.state.ports.is_allocated(port));

        // Base image pulled, pod + payload container created, dump taken
        assert_eq!(h.runtime.pull_requests().await, vec![BASE_IMAGE]);
        let checkpoints = h.runtime.checkpoint_requests().await;
        assert_eq!(checkpoints.len(), 1);
        assert!(checkpoints[0].1.ends_with("job-1"));
        assert_eq!(checkpoints[0].2, 7);

        let pushes = h.push.pushes().await;
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0].0, format!("{}:checkpoint", BASE_IMAGE));
    }

    #[tokio::test]
    async fn checkpoint_pod_is_labelled_and_namespaced() {
        let h = harness();
        script_ready(&h.runtime).await;

        h.engine
            .run_job("job-1".to_string(), BASE_IMAGE.to_string())
            .await;

        let pods = h.runtime.pods().await;
        assert_eq!(pods.len(), 1);
        let metadata = pods[0].metadata.as_ref().unwrap();
        assert_eq!(metadata.uid, "job-1");
        assert_eq!(metadata.namespace, CHECKPOINT_NAMESPACE);
        assert_eq!(
            pods[0].labels.get(labels::LABEL_WORKLOAD_TYPE).unwrap(),
            labels::WORKLOAD_TYPE_CHECKPOINT
        );

        let containers = h.runtime.containers().await;
        assert_eq!(containers.len(), 1);
        assert_eq!(
            containers[0].metadata.as_ref().unwrap().name,
            PAYLOAD_CONTAINER
        );
    }

    #[tokio::test]
    async fn pull_failure_is_terminal() {
        let h = harness();
        h.runtime.fail_pull("registry unreachable").await;

        h.engine
            .run_job("job-1".to_string(), BASE_IMAGE.to_string())
            .await;

        let status = h.engine.status("job-1").unwrap();
        assert_eq!(status.state, Some(CheckpointState::PullBaseImageFailed));
        assert!(status.message.unwrap().contains("registry unreachable"));
        assert!(status.completed_at.is_some());
        assert!(h.runtime.pods().await.is_empty(), "no pod after pull failure");
    }

    #[tokio::test]
    async fn readiness_timeout_is_terminal_without_dump_or_push() {
        let h = harness();
        // Emits noise forever, never the readiness line
        h.runtime
            .set_attach_script(
                vec![AttachChunk {
                    delay_ms: 100,
                    data: "tick\n".to_string(),
                }],
                true,
            )
            .await;

        h.engine
            .run_job("job-1".to_string(), BASE_IMAGE.to_string())
            .await;

        let status = h.engine.status("job-1").unwrap();
        assert_eq!(
            status.state,
            Some(CheckpointState::ContainerWaitReadyFailed)
        );
        assert!(status.message.unwrap().contains("deadline exceeded"));
        assert!(h.runtime.checkpoint_requests().await.is_empty());
        assert!(h.push.pushes().await.is_empty());
    }

    #[tokio::test]
    async fn dump_failure_is_terminal_without_push() {
        let h = harness();
        script_ready(&h.runtime).await;
        h.runtime.fail_checkpoint("criu exploded").await;

        h.engine
            .run_job("job-1".to_string(), BASE_IMAGE.to_string())
            .await;

        let status = h.engine.status("job-1").unwrap();
        assert_eq!(
            status.state,
            Some(CheckpointState::ContainerCheckpointFailed)
        );
        assert!(status.message.unwrap().contains("criu exploded"));
        assert!(h.push.pushes().await.is_empty());
    }

    #[tokio::test]
    async fn push_failure_is_terminal() {
        let h = harness();
        script_ready(&h.runtime).await;
        h.push.fail_push("registry quota exceeded").await;

        h.engine
            .run_job("job-1".to_string(), BASE_IMAGE.to_string())
            .await;

        let status = h.engine.status("job-1").unwrap();
        assert_eq!(status.state, Some(CheckpointState::PushCheckpointFailed));
        assert!(status.message.unwrap().contains("registry quota exceeded"));
    }

    #[tokio::test]
    async fn port_stays_allocated_after_terminal_failure() {
        let h = harness();
        h.runtime.fail_pull("nope").await;

        h.engine
            .run_job("job-1".to_string(), BASE_IMAGE.to_string())
            .await;

        let status = h.engine.status("job-1").unwrap();
        let port = status.port.unwrap();
        assert!(
            h.state.ports.is_allocated(port),
            "terminal failure must not free the port; the GC does"
        );
    }
}
