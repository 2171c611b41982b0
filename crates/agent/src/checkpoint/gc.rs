//! GC — reap completed and failed checkpoint state.
//!
//! Terminal statuses are kept for the retention period so late status
//! readers still observe the outcome, then evicted together with their
//! port. Tarballs and pods are reaped as soon as their job is no longer
//! RUNNING; the image has been pushed (or never will be) by then.

use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::path::Path;
use std::pin::Pin;

use chrono::{Duration, Utc};
use tracing::{debug, warn};

use crate::cri::labels;
use crate::gc::executor::{CollectError, Collector};
use crate::state::SharedState;
use crate::status::{CheckpointState, StatusRecord};

pub struct CheckpointGc {
    state: SharedState,
}

impl CheckpointGc {
    pub fn new(state: SharedState) -> Self {
        Self { state }
    }

    async fn run(&self) -> Result<(), CollectError> {
        let snapshot = self.state.store.view();

        // Jobs still running keep their tarball and pod.
        let keep: HashSet<String> = snapshot
            .iter()
            .filter(|(_, record)| {
                record
                    .checkpoint
                    .as_ref()
                    .and_then(|checkpoint| checkpoint.state)
                    == Some(CheckpointState::Running)
            })
            .map(|(id, _)| id.clone())
            .collect();

        self.evict_expired(&snapshot).await;
        self.reap_tarballs(&keep).await?;
        self.reap_pods(&keep).await?;
        Ok(())
    }

    /// Evict terminal entries past retention and free their ports.
    async fn evict_expired(&self, snapshot: &HashMap<String, StatusRecord>) {
        let retention =
            Duration::seconds(self.state.config.checkpoint_status_retention_secs as i64);
        let now = Utc::now();

        for (id, record) in snapshot {
            let Some(checkpoint) = &record.checkpoint else {
                continue;
            };
            let Some(state) = checkpoint.state else {
                continue;
            };
            if !state.is_terminal() {
                continue;
            }
            let Some(completed_at) = checkpoint.completed_at else {
                continue;
            };
            if completed_at + retention < now {
                if let Some(port) = checkpoint.port {
                    self.state.ports.free(port);
                }
                self.state.store.delete(id);
                debug!(checkpoint_id = %id, "evicted expired checkpoint status");
            }
        }
    }

    /// Remove tarballs whose job is no longer running.
    async fn reap_tarballs(&self, keep: &HashSet<String>) -> Result<(), CollectError> {
        let dir = Path::new(&self.state.config.checkpoint_file_dir);
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            // A job may have failed before writing anything.
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if keep.contains(&name) {
                continue;
            }
            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => debug!(checkpoint_id = %name, "removed checkpoint tarball"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!("failed to remove tarball {}: {}", name, e),
            }
        }
        Ok(())
    }

    /// Stop and remove checkpoint pods whose job is no longer running.
    async fn reap_pods(&self, keep: &HashSet<String>) -> Result<(), CollectError> {
        let pods = self
            .state
            .cri
            .list_pods(labels::selector(
                labels::LABEL_WORKLOAD_TYPE,
                labels::WORKLOAD_TYPE_CHECKPOINT,
            ))
            .await?;

        for pod in pods {
            let uid = pod
                .metadata
                .as_ref()
                .map(|metadata| metadata.uid.clone())
                .unwrap_or_default();
            if keep.contains(&uid) {
                continue;
            }
            if let Err(e) = self.state.cri.stop_pod(&pod.id).await {
                if !e.is_not_found() {
                    warn!("failed to stop checkpoint pod {}: {}", pod.id, e);
                    continue;
                }
            }
            if let Err(e) = self.state.cri.remove_pod(&pod.id).await {
                if !e.is_not_found() {
                    warn!("failed to remove checkpoint pod {}: {}", pod.id, e);
                    continue;
                }
            }
            debug!(pod_id = %pod.id, uid = %uid, "removed zombie checkpoint pod");
        }
        Ok(())
    }
}

impl Collector for CheckpointGc {
    fn name(&self) -> &str {
        "checkpoint"
    }

    fn collect(
        &self,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<(), CollectError>> + Send + '_>> {
        Box::pin(self.run())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    use crate::client::fake::FakeRuntime;
    use crate::conf::AgentConfig;
    use crate::proto::runtime::v1 as cri;
    use crate::state::AgentState;
    use crate::status::{CheckpointStatus, StatusRecord};

    struct Harness {
        gc: CheckpointGc,
        runtime: Arc<FakeRuntime>,
        state: SharedState,
        dir: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        let config = AgentConfig {
            node_id: "node-test".to_string(),
            checkpoint_file_dir: dir.path().to_string_lossy().into_owned(),
            checkpoint_status_retention_secs: 300,
            ..AgentConfig::default()
        };
        let state = Arc::new(AgentState::new(config, runtime.clone()));
        Harness {
            gc: CheckpointGc::new(state.clone()),
            runtime,
            state,
            dir,
        }
    }

    fn checkpoint_record(state: CheckpointState, age_secs: i64, port: u16) -> StatusRecord {
        StatusRecord::checkpoint(CheckpointStatus {
            state: Some(state),
            message: Some("test".to_string()),
            completed_at: Some(Utc::now() - Duration::seconds(age_secs)),
            port: Some(port),
        })
    }

    fn checkpoint_pod(id: &str) -> cri::PodSandbox {
        let mut pod_labels = HashMap::new();
        pod_labels.insert(
            labels::LABEL_WORKLOAD_TYPE.to_string(),
            labels::WORKLOAD_TYPE_CHECKPOINT.to_string(),
        );
        cri::PodSandbox {
            id: format!("pod-{}", id),
            metadata: Some(cri::PodSandboxMetadata {
                name: id.to_string(),
                uid: id.to_string(),
                namespace: "checkpoint".to_string(),
                attempt: 0,
            }),
            state: cri::PodSandboxState::SandboxReady as i32,
            created_at: 0,
            labels: pod_labels,
            annotations: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn expired_terminal_entry_is_evicted_and_port_freed() {
        let h = harness();
        let port = h.state.ports.allocate().unwrap();
        h.state.store.update(
            "old",
            checkpoint_record(CheckpointState::Completed, 301, port),
        );

        h.gc.run().await.unwrap();

        assert!(h.state.store.get("old").is_none());
        assert!(!h.state.ports.is_allocated(port));
    }

    #[tokio::test]
    async fn recent_terminal_entry_is_retained() {
        let h = harness();
        let port = h.state.ports.allocate().unwrap();
        h.state.store.update(
            "recent",
            checkpoint_record(CheckpointState::ContainerWaitReadyFailed, 10, port),
        );

        h.gc.run().await.unwrap();

        assert!(h.state.store.get("recent").is_some());
        assert!(h.state.ports.is_allocated(port));
    }

    #[tokio::test]
    async fn running_entry_is_never_evicted() {
        let h = harness();
        h.state.store.update(
            "live",
            StatusRecord::checkpoint(CheckpointStatus {
                state: Some(CheckpointState::Running),
                port: Some(20001),
                ..Default::default()
            }),
        );

        h.gc.run().await.unwrap();

        assert!(h.state.store.get("live").is_some());
    }

    #[tokio::test]
    async fn tarballs_outside_keep_set_are_removed() {
        let h = harness();
        h.state.store.update(
            "live",
            StatusRecord::checkpoint(CheckpointStatus {
                state: Some(CheckpointState::Running),
                ..Default::default()
            }),
        );
        let live = h.dir.path().join("live");
        let stale = h.dir.path().join("stale");
        tokio::fs::write(&live, b"x").await.unwrap();
        tokio::fs::write(&stale, b"x").await.unwrap();

        h.gc.run().await.unwrap();

        assert!(live.exists(), "running job keeps its tarball");
        assert!(!stale.exists(), "stale tarball reaped");
    }

    #[tokio::test]
    async fn missing_tarball_dir_is_not_an_error() {
        let h = harness();
        tokio::fs::remove_dir_all(h.dir.path()).await.unwrap();

        h.gc.run().await.unwrap();
    }

    #[tokio::test]
    async fn zombie_checkpoint_pods_are_stopped_and_removed() {
        let h = harness();
        h.state.store.update(
            "live",
            StatusRecord::checkpoint(CheckpointStatus {
                state: Some(CheckpointState::Running),
                ..Default::default()
            }),
        );
        h.runtime.add_pod(checkpoint_pod("live")).await;
        h.runtime.add_pod(checkpoint_pod("zombie")).await;

        h.gc.run().await.unwrap();

        assert_eq!(h.runtime.stopped_pods().await, vec!["pod-zombie"]);
        assert_eq!(h.runtime.removed_pods().await, vec!["pod-zombie"]);
        let remaining = h.runtime.pods().await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, "pod-live");
    }
}
