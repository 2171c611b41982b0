//! CheckpointService — submit checkpoint jobs, poll their status.

use std::sync::Arc;

use tonic::{Request, Response, Status};

use crate::checkpoint::CheckpointEngine;
use crate::proto::agent::v1::checkpoint_service_server::CheckpointService;
use crate::proto::agent::v1::{
    CheckpointState as ProtoCheckpointState, CreateCheckpointRequest, CreateCheckpointResponse,
    GetCheckpointStatusRequest, GetCheckpointStatusResponse,
};
use crate::status::{CheckpointState, CheckpointStatus};

pub struct CheckpointServiceImpl {
    engine: Arc<CheckpointEngine>,
}

impl CheckpointServiceImpl {
    pub fn new(engine: Arc<CheckpointEngine>) -> Self {
        Self { engine }
    }
}

#[tonic::async_trait]
impl CheckpointService for CheckpointServiceImpl {
    async fn create_checkpoint(
        &self,
        request: Request<CreateCheckpointRequest>,
    ) -> Result<Response<CreateCheckpointResponse>, Status> {
        let base_image = request.into_inner().base_image;
        if base_image.is_empty() {
            return Err(Status::invalid_argument("base_image must not be empty"));
        }
        let checkpoint_id = self.engine.create(base_image);
        Ok(Response::new(CreateCheckpointResponse { checkpoint_id }))
    }

    async fn get_checkpoint_status(
        &self,
        request: Request<GetCheckpointStatusRequest>,
    ) -> Result<Response<GetCheckpointStatusResponse>, Status> {
        let checkpoint_id = request.into_inner().checkpoint_id;
        match self.engine.status(&checkpoint_id) {
            Some(status) => Ok(Response::new(to_proto_status(status))),
            // Past the retention period (or never submitted)
            None => Err(Status::not_found(format!(
                "checkpoint not found: {}",
                checkpoint_id
            ))),
        }
    }
}

fn to_proto_status(status: CheckpointStatus) -> GetCheckpointStatusResponse {
    let state = match status.state {
        Some(CheckpointState::Running) => ProtoCheckpointState::Running,
        Some(CheckpointState::PullBaseImageFailed) => ProtoCheckpointState::PullBaseImageFailed,
        Some(CheckpointState::ContainerWaitReadyFailed) => {
            ProtoCheckpointState::ContainerWaitReadyFailed
        }
        Some(CheckpointState::ContainerCheckpointFailed) => {
            ProtoCheckpointState::ContainerCheckpointFailed
        }
        Some(CheckpointState::PushCheckpointFailed) => ProtoCheckpointState::PushCheckpointFailed,
        Some(CheckpointState::Completed) => ProtoCheckpointState::Completed,
        None => ProtoCheckpointState::Unspecified,
    };
    GetCheckpointStatusResponse {
        state: state as i32,
        message: status.message.unwrap_or_default(),
        completed_at: status.completed_at.map(|completed_at| prost_types::Timestamp {
            seconds: completed_at.timestamp(),
            nanos: completed_at.timestamp_subsec_nanos() as i32,
        }),
        port: u32::from(status.port.unwrap_or(0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::client::fake::{FakePush, FakeRuntime};
    use crate::conf::AgentConfig;
    use crate::state::AgentState;

    fn service() -> CheckpointServiceImpl {
        let runtime = Arc::new(FakeRuntime::new());
        let state = Arc::new(AgentState::new(
            AgentConfig {
                node_id: "node-test".to_string(),
                ..AgentConfig::default()
            },
            runtime,
        ));
        let engine = Arc::new(CheckpointEngine::new(state, Arc::new(FakePush::new())));
        CheckpointServiceImpl::new(engine)
    }

    #[tokio::test]
    async fn create_rejects_empty_base_image() {
        let service = service();
        let status = service
            .create_checkpoint(Request::new(CreateCheckpointRequest {
                base_image: String::new(),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn create_returns_a_job_id() {
        let service = service();
        let response = service
            .create_checkpoint(Request::new(CreateCheckpointRequest {
                base_image: "reg/c/f/base".to_string(),
            }))
            .await
            .unwrap();
        assert!(!response.into_inner().checkpoint_id.is_empty());
    }

    #[tokio::test]
    async fn unknown_checkpoint_is_not_found() {
        let service = service();
        let status = service
            .get_checkpoint_status(Request::new(GetCheckpointStatusRequest {
                checkpoint_id: "ghost".to_string(),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::NotFound);
    }

    #[test]
    fn proto_mapping_carries_all_fields() {
        let now = Utc::now();
        let response = to_proto_status(CheckpointStatus {
            state: Some(CheckpointState::Completed),
            message: Some("checkpoint pushed".to_string()),
            completed_at: Some(now),
            port: Some(20123),
        });

        assert_eq!(response.state, ProtoCheckpointState::Completed as i32);
        assert_eq!(response.message, "checkpoint pushed");
        assert_eq!(response.completed_at.unwrap().seconds, now.timestamp());
        assert_eq!(response.port, 20123);
    }

    #[test]
    fn proto_mapping_of_empty_status() {
        let response = to_proto_status(CheckpointStatus::default());
        assert_eq!(response.state, ProtoCheckpointState::Unspecified as i32);
        assert!(response.message.is_empty());
        assert!(response.completed_at.is_none());
        assert_eq!(response.port, 0);
    }
}
