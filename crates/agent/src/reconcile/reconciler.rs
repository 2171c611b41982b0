//! Reconciler — the periodic control loop driving instance lifecycle.
//!
//! Each tick has three strictly ordered phases: classify-and-drive the
//! desired instances, report observed status to the control plane, and only
//! then evict terminal entries. Terminal statuses are never dropped locally
//! before one successful report has acknowledged them, which gives
//! at-least-once delivery of terminal transitions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::client::platform::{ControlPlane, Instance, InstanceState, StatusReport};
use crate::client::runtime::RuntimeError;
use crate::ports::PortError;
use crate::state::SharedState;
use crate::status::{StatusRecord, WorkloadState};
use crate::workload::{Health, Workload, WorkloadService};

/// Flat backoff applied for one cycle after a control-plane error.
const BACKOFF: Duration = Duration::from_secs(3);

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("max creation attempts reached")]
    MaxAttemptsReached,
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    Port(#[from] PortError),
}

pub struct Reconciler {
    state: SharedState,
    control: Arc<dyn ControlPlane>,
    workloads: WorkloadService,
    /// Create attempts per instance ID. In-process only: a restart resets
    /// the counter and the control plane re-submits the instance.
    attempts: HashMap<String, u32>,
}

/// Handle to a running reconciler; `stop` drains the loop.
pub struct ReconcilerHandle {
    stop_tx: mpsc::Sender<oneshot::Sender<()>>,
}

impl Reconciler {
    pub fn new(state: SharedState, control: Arc<dyn ControlPlane>) -> Self {
        let workloads = WorkloadService::new(state.clone());
        Self {
            state,
            control,
            workloads,
            attempts: HashMap::new(),
        }
    }

    /// Spawn the tick loop.
    pub fn start(mut self) -> ReconcilerHandle {
        let (stop_tx, mut stop_rx) = mpsc::channel::<oneshot::Sender<()>>(1);
        let sync_interval = Duration::from_secs(self.state.config.sync_interval_secs);
        info!("starting reconciler (sync interval {:?})", sync_interval);

        tokio::spawn(async move {
            let mut period = sync_interval;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(period) => {
                        period = self.run_tick().await;
                    }
                    Some(ack) = stop_rx.recv() => {
                        let _ = ack.send(());
                        break;
                    }
                }
            }
            debug!("reconciler loop exited");
        });

        ReconcilerHandle { stop_tx }
    }

    /// One reconciliation pass. Returns the period until the next tick:
    /// the sync interval normally, a flat 3 s after a control-plane error.
    pub(crate) async fn run_tick(&mut self) -> Duration {
        let sync_interval = Duration::from_secs(self.state.config.sync_interval_secs);
        let node_id = self.state.config.node_id.clone();

        let instances = match self.control.discover_instances(&node_id).await {
            Ok(instances) => instances,
            Err(e) => {
                warn!("discovering instances failed: {}", e);
                return BACKOFF;
            }
        };
        debug!("discovered {} instances", instances.len());

        for instance in &instances {
            let result = match instance.state {
                InstanceState::Pending | InstanceState::Creating => {
                    self.handle_creation(instance).await
                }
                InstanceState::Deleting => self.handle_deleting(instance).await,
                InstanceState::Running => self.handle_running(instance).await,
                _ => Ok(()),
            };
            if let Err(e) = result {
                warn!(instance_id = %instance.id, "handling instance failed: {}", e);
            }
        }

        // Attempts for instances the control plane no longer lists are dead
        // weight; the counter only has to be monotonic while the instance
        // is still being submitted.
        self.attempts
            .retain(|id, _| instances.iter().any(|instance| &instance.id == id));

        let snapshot = self.state.store.view();
        let reports: Vec<StatusReport> = snapshot
            .iter()
            .filter_map(|(id, record)| {
                let workload = record.workload.as_ref()?;
                let state = workload.state?;
                // A failed creation holds no allocation anymore.
                let port = match state {
                    WorkloadState::CreationFailed => 0,
                    _ => workload.port.unwrap_or(0),
                };
                Some(StatusReport {
                    instance_id: id.clone(),
                    state,
                    port,
                })
            })
            .collect();

        if !reports.is_empty() {
            if let Err(e) = self.control.report_status(&node_id, reports).await {
                warn!("reporting status failed: {}", e);
                // Terminal entries stay until a successful report.
                return BACKOFF;
            }
        }

        for (id, record) in &snapshot {
            let Some(state) = record.workload.as_ref().and_then(|workload| workload.state)
            else {
                continue;
            };
            if state.is_terminal() {
                self.state.store.delete(id);
                debug!(instance_id = %id, ?state, "evicted reported terminal status");
            }
        }

        sync_interval
    }

    async fn handle_creation(&mut self, instance: &Instance) -> Result<(), ReconcileError> {
        // A status that is no longer CREATING means a prior tick already
        // finished this instance; the control plane has not caught up yet.
        if let Some(workload) = self
            .state
            .store
            .get(&instance.id)
            .and_then(|record| record.workload)
        {
            if workload.state != Some(WorkloadState::Creating) {
                return Ok(());
            }
        }

        let attempts = self.attempts.get(&instance.id).copied().unwrap_or(0);
        if attempts >= self.state.config.max_attempts {
            self.state.store.update(
                &instance.id,
                StatusRecord::workload_state(WorkloadState::CreationFailed),
            );
            return Err(ReconcileError::MaxAttemptsReached);
        }
        let attempt = attempts + 1;
        self.attempts.insert(instance.id.clone(), attempt);

        self.state.store.update(
            &instance.id,
            StatusRecord::workload_state(WorkloadState::Creating),
        );
        let port = self.state.ports.allocate()?;
        self.state
            .store
            .update(&instance.id, StatusRecord::workload_port(port));

        let workload = Workload::build(instance, port, &self.state.config);
        info!(
            instance_id = %instance.id,
            name = %workload.name,
            port,
            attempt,
            "creating workload"
        );

        if let Err(e) = self.workloads.run_workload(&workload, attempt).await {
            self.state.ports.free(port);
            // Best-effort cleanup of a partially created pod; the next tick
            // retries with the attempt counter already incremented.
            if let Err(cleanup) = self.workloads.remove_workload(&instance.id).await {
                if !cleanup.is_not_found() {
                    warn!(instance_id = %instance.id, "cleanup after failed create: {}", cleanup);
                }
            }
            return Err(e.into());
        }

        self.state.store.update(
            &instance.id,
            StatusRecord::workload_state(WorkloadState::Running),
        );
        Ok(())
    }

    async fn handle_deleting(&mut self, instance: &Instance) -> Result<(), ReconcileError> {
        match self.workloads.remove_workload(&instance.id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!(instance_id = %instance.id, "workload already gone");
            }
            Err(e) => return Err(e.into()),
        }

        // The pod is gone, so nothing can still route to the port.
        if let Some(port) = self
            .state
            .store
            .get(&instance.id)
            .and_then(|record| record.workload)
            .and_then(|workload| workload.port)
        {
            self.state.ports.free(port);
        }

        self.state.store.update(
            &instance.id,
            StatusRecord::workload_state(WorkloadState::Deleted),
        );
        Ok(())
    }

    async fn handle_running(&mut self, instance: &Instance) -> Result<(), ReconcileError> {
        match self.workloads.workload_health(&instance.id).await? {
            Health::Healthy => Ok(()),
            Health::Unhealthy => {
                warn!(instance_id = %instance.id, "workload unhealthy, removing");
                self.handle_deleting(instance).await
            }
        }
    }
}

impl ReconcilerHandle {
    /// Rendezvous stop: returns only once the loop has exited; any
    /// in-flight tick finishes first.
    pub async fn stop(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.stop_tx.send(ack_tx).await.is_ok() {
            let _ = ack_rx.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::fake::{FakeControlPlane, FakeRuntime};
    use crate::conf::AgentConfig;
    use crate::proto::runtime::v1 as cri;
    use crate::state::AgentState;

    struct Harness {
        reconciler: Reconciler,
        runtime: Arc<FakeRuntime>,
        control: Arc<FakeControlPlane>,
        state: SharedState,
    }

    fn harness() -> Harness {
        let runtime = Arc::new(FakeRuntime::new());
        let control = Arc::new(FakeControlPlane::new());
        let config = AgentConfig {
            node_id: "node-test".to_string(),
            registry_endpoint: "reg.example.com".to_string(),
            sync_interval_secs: 10,
            max_attempts: 5,
            ..AgentConfig::default()
        };
        let state = Arc::new(AgentState::new(config, runtime.clone()));
        Harness {
            reconciler: Reconciler::new(state.clone(), control.clone()),
            runtime,
            control,
            state,
        }
    }

    fn instance(id: &str, state: InstanceState) -> Instance {
        Instance {
            id: id.to_string(),
            chunk_id: "chunk-1".to_string(),
            chunk_name: "c".to_string(),
            flavor_version_id: "flavor-1".to_string(),
            flavor_version_name: "f".to_string(),
            state,
        }
    }

    const SYNC: Duration = Duration::from_secs(10);

    #[tokio::test]
    async fn happy_create_runs_workload_once_and_reports_running() {
        let mut h = harness();
        h.control
            .set_instances(vec![instance("i1", InstanceState::Pending)])
            .await;

        let period = h.reconciler.run_tick().await;
        assert_eq!(period, SYNC);

        // Workload side effects: both image refs composed from the registry
        assert_eq!(
            h.runtime.pull_requests().await,
            vec![
                "reg.example.com/c/f/base".to_string(),
                "reg.example.com/c/f/checkpoint".to_string(),
            ]
        );
        assert_eq!(h.runtime.run_pod_requests().await, vec!["i1"]);

        // Status: RUNNING with a port from the configured range
        let workload = h.state.store.get("i1").unwrap().workload.unwrap();
        assert_eq!(workload.state, Some(WorkloadState::Running));
        let port = workload.port.unwrap();
        assert!((20000..30000).contains(&port));
        assert!(h.state.ports.is_allocated(port));

        // Exactly one report carrying (i1, RUNNING, port)
        let reports = h.control.reports().await;
        assert_eq!(reports.len(), 1);
        assert_eq!(
            reports[0],
            vec![StatusReport {
                instance_id: "i1".to_string(),
                state: WorkloadState::Running,
                port,
            }]
        );
    }

    #[tokio::test]
    async fn replayed_pending_instance_does_not_recreate() {
        let mut h = harness();
        h.control
            .set_instances(vec![instance("i1", InstanceState::Pending)])
            .await;

        h.reconciler.run_tick().await;
        h.reconciler.run_tick().await;
        h.reconciler.run_tick().await;

        assert_eq!(
            h.runtime.run_pod_requests().await,
            vec!["i1"],
            "exactly one create across replays"
        );
    }

    #[tokio::test]
    async fn max_attempts_transitions_to_creation_failed() {
        let mut h = harness();
        h.runtime.fail_run_pod("sandbox boom").await;
        h.control
            .set_instances(vec![instance("i1", InstanceState::Pending)])
            .await;

        for _ in 0..5 {
            h.reconciler.run_tick().await;
        }
        // Five attempts, all failed, all ports returned
        assert_eq!(h.runtime.run_pod_requests().await.len(), 5);
        let creating = h.state.store.get("i1").unwrap().workload.unwrap();
        assert_eq!(creating.state, Some(WorkloadState::Creating));

        // Sixth tick: attempts exhausted, CREATION_FAILED reported with port
        // 0, entry evicted after the successful report
        h.reconciler.run_tick().await;
        assert_eq!(h.runtime.run_pod_requests().await.len(), 5, "no sixth create");
        let reports = h.control.reports().await;
        let last = reports.last().unwrap();
        assert_eq!(
            last,
            &vec![StatusReport {
                instance_id: "i1".to_string(),
                state: WorkloadState::CreationFailed,
                port: 0,
            }]
        );
        assert!(h.state.store.get("i1").is_none(), "evicted after report");
    }

    #[tokio::test]
    async fn failed_attempts_free_their_ports() {
        let mut h = harness();
        h.runtime.fail_run_pod("sandbox boom").await;
        h.control
            .set_instances(vec![instance("i1", InstanceState::Pending)])
            .await;

        h.reconciler.run_tick().await;

        let port = h.state.store.get("i1").unwrap().workload.unwrap().port.unwrap();
        assert!(
            !h.state.ports.is_allocated(port),
            "port freed on failed create"
        );
    }

    #[tokio::test]
    async fn delete_happy_path_reports_deleted_then_evicts() {
        let mut h = harness();
        h.control
            .set_instances(vec![instance("i1", InstanceState::Pending)])
            .await;
        h.reconciler.run_tick().await;
        let port = h.state.store.get("i1").unwrap().workload.unwrap().port.unwrap();
        let pod_id = h.runtime.pods().await[0].id.clone();

        h.control
            .set_instances(vec![instance("i1", InstanceState::Deleting)])
            .await;
        h.reconciler.run_tick().await;

        assert_eq!(h.runtime.stopped_pods().await, vec![pod_id.clone()]);
        assert_eq!(h.runtime.removed_pods().await, vec![pod_id]);
        assert!(!h.state.ports.is_allocated(port), "port freed on delete");

        let reports = h.control.reports().await;
        let last = reports.last().unwrap();
        assert_eq!(last[0].state, WorkloadState::Deleted);
        assert!(h.state.store.get("i1").is_none(), "evicted after report");
    }

    #[tokio::test]
    async fn delete_race_not_found_still_reports_deleted() {
        let mut h = harness();
        h.control
            .set_instances(vec![instance("i1", InstanceState::Deleting)])
            .await;

        h.reconciler.run_tick().await;

        let reports = h.control.reports().await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0][0].state, WorkloadState::Deleted);
        assert!(h.state.store.get("i1").is_none());
    }

    #[tokio::test]
    async fn unhealthy_running_instance_is_removed_and_reported_deleted() {
        let mut h = harness();
        h.control
            .set_instances(vec![instance("i1", InstanceState::Pending)])
            .await;
        h.reconciler.run_tick().await;
        let container_id = h.runtime.containers().await[0].id.clone();
        h.runtime
            .set_container_state(&container_id, cri::ContainerState::ContainerExited)
            .await;

        h.control
            .set_instances(vec![instance("i1", InstanceState::Running)])
            .await;
        h.reconciler.run_tick().await;

        assert_eq!(h.runtime.removed_pods().await.len(), 1);
        let reports = h.control.reports().await;
        assert_eq!(reports.last().unwrap()[0].state, WorkloadState::Deleted);
        assert!(h.state.store.get("i1").is_none());
    }

    #[tokio::test]
    async fn healthy_running_instance_is_left_alone() {
        let mut h = harness();
        h.control
            .set_instances(vec![instance("i1", InstanceState::Pending)])
            .await;
        h.reconciler.run_tick().await;

        h.control
            .set_instances(vec![instance("i1", InstanceState::Running)])
            .await;
        h.reconciler.run_tick().await;

        assert!(h.runtime.removed_pods().await.is_empty());
        let workload = h.state.store.get("i1").unwrap().workload.unwrap();
        assert_eq!(workload.state, Some(WorkloadState::Running));
    }

    #[tokio::test]
    async fn discover_failure_backs_off_and_touches_nothing() {
        let mut h = harness();
        h.control.fail_discovers(1).await;

        let period = h.reconciler.run_tick().await;

        assert_eq!(period, BACKOFF);
        assert!(h.control.reports().await.is_empty());
    }

    #[tokio::test]
    async fn report_failure_backs_off_and_keeps_terminal_entries() {
        let mut h = harness();
        h.control
            .set_instances(vec![instance("i1", InstanceState::Deleting)])
            .await;
        h.control.fail_reports(1).await;

        let period = h.reconciler.run_tick().await;
        assert_eq!(period, BACKOFF);
        assert!(
            h.state.store.get("i1").is_some(),
            "terminal entry survives failed report"
        );

        // Next tick reports successfully, then evicts
        let period = h.reconciler.run_tick().await;
        assert_eq!(period, SYNC);
        assert!(h.state.store.get("i1").is_none());
        let reports = h.control.reports().await;
        assert_eq!(reports.len(), 1);
    }

    #[tokio::test]
    async fn unknown_desired_state_is_ignored() {
        let mut h = harness();
        h.control
            .set_instances(vec![instance("i1", InstanceState::Unknown)])
            .await;

        h.reconciler.run_tick().await;

        assert!(h.runtime.run_pod_requests().await.is_empty());
        assert!(h.state.store.get("i1").is_none());
    }

    #[tokio::test]
    async fn checkpoint_only_entries_are_not_reported() {
        let mut h = harness();
        h.state.store.update(
            "job-1",
            crate::status::StatusRecord::checkpoint(crate::status::CheckpointStatus {
                state: Some(crate::status::CheckpointState::Running),
                port: Some(20001),
                ..Default::default()
            }),
        );

        h.reconciler.run_tick().await;

        assert!(
            h.control.reports().await.is_empty(),
            "checkpoint status flows through the agent API, not instance reports"
        );
        assert!(h.state.store.get("job-1").is_some());
    }

    #[tokio::test]
    async fn stop_is_rendezvous() {
        let h = harness();
        let handle = h.reconciler.start();
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.stop().await;
    }
}
