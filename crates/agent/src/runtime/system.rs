//! System pods — pods the node cannot operate without, ensured at boot.

use std::collections::HashMap;

use tracing::info;

use crate::client::runtime::RuntimeError;
use crate::cri::labels;
use crate::proto::runtime::v1 as cri;
use crate::state::SharedState;

/// Ensure every configured system pod exists. Safe to call repeatedly:
/// `ensure_pod` keys creation on the `pod-uid` label.
pub async fn ensure_system_pods(state: &SharedState) -> Result<(), RuntimeError> {
    for pod in &state.config.system_pods {
        let mut pod_labels = HashMap::new();
        pod_labels.insert(labels::LABEL_POD_UID.to_string(), pod.uid.clone());
        pod_labels.insert(
            labels::LABEL_WORKLOAD_TYPE.to_string(),
            labels::WORKLOAD_TYPE_SYSTEM.to_string(),
        );

        let pod_config = cri::PodSandboxConfig {
            metadata: Some(cri::PodSandboxMetadata {
                name: pod.name.clone(),
                uid: pod.uid.clone(),
                namespace: pod.namespace.clone(),
                attempt: 0,
            }),
            log_directory: format!("/var/log/pods/{}", pod.uid),
            dns_config: Some(cri::DnsConfig {
                servers: vec![state.config.dns_server.clone()],
                searches: vec![],
                options: vec![],
            }),
            labels: pod_labels.clone(),
            ..Default::default()
        };
        let container_config = cri::ContainerConfig {
            image: Some(cri::ImageSpec {
                image: pod.image.clone(),
                ..Default::default()
            }),
            labels: pod_labels,
            ..Default::default()
        };

        state.cri.ensure_pod(pod_config, container_config).await?;
        info!(name = %pod.name, uid = %pod.uid, "system pod ensured");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::client::fake::FakeRuntime;
    use crate::conf::{AgentConfig, SystemPodConfig};
    use crate::state::AgentState;

    fn system_pod(name: &str) -> SystemPodConfig {
        SystemPodConfig {
            name: name.to_string(),
            uid: format!("{}-uid", name),
            namespace: "system".to_string(),
            image: format!("reg/{}:v1", name),
        }
    }

    fn state_with_pods(
        pods: Vec<SystemPodConfig>,
        runtime: Arc<FakeRuntime>,
    ) -> SharedState {
        Arc::new(AgentState::new(
            AgentConfig {
                node_id: "node-test".to_string(),
                system_pods: pods,
                ..AgentConfig::default()
            },
            runtime,
        ))
    }

    #[tokio::test]
    async fn all_configured_pods_are_created() {
        let runtime = Arc::new(FakeRuntime::new());
        let state = state_with_pods(vec![system_pod("proxy"), system_pod("dns")], runtime.clone());

        ensure_system_pods(&state).await.unwrap();

        assert_eq!(runtime.pods().await.len(), 2);
    }

    #[tokio::test]
    async fn repeated_boot_does_not_recreate() {
        let runtime = Arc::new(FakeRuntime::new());
        let state = state_with_pods(vec![system_pod("proxy")], runtime.clone());

        ensure_system_pods(&state).await.unwrap();
        ensure_system_pods(&state).await.unwrap();

        assert_eq!(runtime.pods().await.len(), 1);
    }

    #[tokio::test]
    async fn empty_pod_list_is_fine() {
        let runtime = Arc::new(FakeRuntime::new());
        let state = state_with_pods(vec![], runtime.clone());

        ensure_system_pods(&state).await.unwrap();
        assert!(runtime.pods().await.is_empty());
    }
}
