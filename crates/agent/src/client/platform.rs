//! Platform clients — control plane polling/reporting and image push.
//!
//! Domain models for instances live here next to the trait, the way the
//! runtime client keeps its own view of pods and containers; the reconciler
//! never touches generated proto types directly.

use std::pin::Pin;

use thiserror::Error;
use tonic::transport::{Channel, Endpoint};

use crate::checkpoint::image::CheckpointImage;
use crate::proto::platform::v1 as pb;
use crate::proto::platform::v1::image_push_service_client::ImagePushServiceClient;
use crate::proto::platform::v1::node_service_client::NodeServiceClient;
use crate::status::WorkloadState;

#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("platform connection failed: {0}")]
    ConnectionFailed(String),
    #[error("platform call failed: {0}")]
    Rpc(#[from] tonic::Status),
}

// ── Domain model ────────────────────────────────────────────────

/// Desired state of an instance as declared by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Pending,
    Creating,
    Running,
    Deleting,
    Deleted,
    CreationFailed,
    /// Anything this agent version does not know; ignored by the reconciler.
    Unknown,
}

/// One desired instance. Instances are owned by the control plane; the node
/// agent never invents them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub id: String,
    pub chunk_id: String,
    pub chunk_name: String,
    pub flavor_version_id: String,
    pub flavor_version_name: String,
    pub state: InstanceState,
}

/// Observed status for one instance, sent back on every reconciler tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub instance_id: String,
    pub state: WorkloadState,
    pub port: u16,
}

impl From<pb::Instance> for Instance {
    fn from(proto: pb::Instance) -> Self {
        let chunk = proto.chunk.unwrap_or_default();
        let flavor = proto.flavor_version.unwrap_or_default();
        let state = match pb::InstanceState::try_from(proto.state) {
            Ok(pb::InstanceState::Pending) => InstanceState::Pending,
            Ok(pb::InstanceState::Creating) => InstanceState::Creating,
            Ok(pb::InstanceState::Running) => InstanceState::Running,
            Ok(pb::InstanceState::Deleting) => InstanceState::Deleting,
            Ok(pb::InstanceState::Deleted) => InstanceState::Deleted,
            Ok(pb::InstanceState::CreationFailed) => InstanceState::CreationFailed,
            _ => InstanceState::Unknown,
        };
        Self {
            id: proto.id,
            chunk_id: chunk.id,
            chunk_name: chunk.name,
            flavor_version_id: flavor.id,
            flavor_version_name: flavor.name,
            state,
        }
    }
}

fn report_state(state: WorkloadState) -> pb::InstanceState {
    match state {
        WorkloadState::Creating => pb::InstanceState::Creating,
        WorkloadState::Running => pb::InstanceState::Running,
        WorkloadState::Deleted => pb::InstanceState::Deleted,
        WorkloadState::CreationFailed => pb::InstanceState::CreationFailed,
    }
}

impl From<&StatusReport> for pb::InstanceStatusReport {
    fn from(report: &StatusReport) -> Self {
        Self {
            instance_id: report.instance_id.clone(),
            state: report_state(report.state) as i32,
            port: u32::from(report.port),
        }
    }
}

// ── Traits ──────────────────────────────────────────────────────

/// Control-plane interface used by the reconciler.
pub trait ControlPlane: Send + Sync {
    fn discover_instances<'a>(
        &'a self,
        node_id: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<Vec<Instance>, PlatformError>> + Send + 'a>>;

    fn report_status<'a>(
        &'a self,
        node_id: &'a str,
        reports: Vec<StatusReport>,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<(), PlatformError>> + Send + 'a>>;
}

/// Image push interface used by the checkpoint engine. The layer tarball
/// stays on the node's disk; the push service streams it to the registry.
pub trait ImagePush: Send + Sync {
    fn push_checkpoint_image<'a>(
        &'a self,
        reference: &'a str,
        image: &'a CheckpointImage,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<(), PlatformError>> + Send + 'a>>;
}

// ── Live implementations ────────────────────────────────────────

pub struct ControlPlaneClient {
    client: NodeServiceClient<Channel>,
}

impl ControlPlaneClient {
    pub async fn connect(endpoint: &str) -> Result<Self, PlatformError> {
        let channel = Endpoint::try_from(endpoint.to_string())
            .map_err(|e| PlatformError::ConnectionFailed(e.to_string()))?
            .connect()
            .await
            .map_err(|e| PlatformError::ConnectionFailed(e.to_string()))?;
        Ok(Self {
            client: NodeServiceClient::new(channel),
        })
    }
}

impl ControlPlane for ControlPlaneClient {
    fn discover_instances<'a>(
        &'a self,
        node_id: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<Vec<Instance>, PlatformError>> + Send + 'a>>
    {
        let mut client = self.client.clone();
        Box::pin(async move {
            let response = client
                .discover_instances(pb::DiscoverInstancesRequest {
                    node_id: node_id.to_string(),
                })
                .await?;
            Ok(response
                .into_inner()
                .instances
                .into_iter()
                .map(Instance::from)
                .collect())
        })
    }

    fn report_status<'a>(
        &'a self,
        node_id: &'a str,
        reports: Vec<StatusReport>,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<(), PlatformError>> + Send + 'a>> {
        let mut client = self.client.clone();
        Box::pin(async move {
            client
                .receive_instance_status_reports(pb::ReceiveInstanceStatusReportsRequest {
                    node_id: node_id.to_string(),
                    reports: reports.iter().map(pb::InstanceStatusReport::from).collect(),
                })
                .await?;
            Ok(())
        })
    }
}

pub struct ImagePushClient {
    client: ImagePushServiceClient<Channel>,
}

impl ImagePushClient {
    pub async fn connect(endpoint: &str) -> Result<Self, PlatformError> {
        let channel = Endpoint::try_from(endpoint.to_string())
            .map_err(|e| PlatformError::ConnectionFailed(e.to_string()))?
            .connect()
            .await
            .map_err(|e| PlatformError::ConnectionFailed(e.to_string()))?;
        Ok(Self {
            client: ImagePushServiceClient::new(channel),
        })
    }
}

impl ImagePush for ImagePushClient {
    fn push_checkpoint_image<'a>(
        &'a self,
        reference: &'a str,
        image: &'a CheckpointImage,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<(), PlatformError>> + Send + 'a>> {
        let mut client = self.client.clone();
        Box::pin(async move {
            client
                .push_checkpoint_image(pb::PushCheckpointImageRequest {
                    reference: reference.to_string(),
                    manifest_json: image.manifest_json.clone(),
                    config_json: image.config_json.clone(),
                    layer_path: image.layer_path.to_string_lossy().into_owned(),
                })
                .await?;
            Ok(())
        })
    }
}
