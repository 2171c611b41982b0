//! Live — CRI-backed implementation of [`RuntimeOps`].
//!
//! gRPC over the runtime's unix socket; attach streaming over the
//! WebSocket endpoint the runtime's streaming server hands back.

use std::collections::HashMap;
use std::pin::Pin;

use futures_util::StreamExt;
use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;
use tokio_tungstenite::tungstenite::Message;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;
use tracing::debug;

use crate::client::runtime::{AttachStream, RuntimeError, RuntimeOps};
use crate::proto::runtime::v1 as cri;
use crate::proto::runtime::v1::image_service_client::ImageServiceClient;
use crate::proto::runtime::v1::runtime_service_client::RuntimeServiceClient;

/// Channel index of stdout in the streaming protocol; every frame carries
/// one channel byte followed by the payload.
const STDOUT_CHANNEL: u8 = 1;

#[derive(Clone)]
pub struct CriClient {
    runtime: RuntimeServiceClient<Channel>,
    image: ImageServiceClient<Channel>,
    restart_command: String,
}

impl CriClient {
    /// Connect to the runtime. `endpoint` accepts `unix://` socket paths
    /// (the common case) and plain HTTP endpoints (useful against a proxy).
    pub async fn connect(endpoint: &str, restart_command: &str) -> Result<Self, RuntimeError> {
        let channel = if let Some(path) = endpoint.strip_prefix("unix://") {
            let path = path.to_string();
            // The URI is required by the endpoint builder but unused for UDS.
            Endpoint::try_from("http://[::1]:50051")
                .map_err(|e| RuntimeError::ConnectionFailed(e.to_string()))?
                .connect_with_connector(service_fn(move |_: Uri| {
                    let path = path.clone();
                    async move {
                        let stream = UnixStream::connect(path).await?;
                        Ok::<_, std::io::Error>(TokioIo::new(stream))
                    }
                }))
                .await
                .map_err(|e| RuntimeError::ConnectionFailed(e.to_string()))?
        } else {
            Endpoint::try_from(endpoint.to_string())
                .map_err(|e| RuntimeError::ConnectionFailed(e.to_string()))?
                .connect()
                .await
                .map_err(|e| RuntimeError::ConnectionFailed(e.to_string()))?
        };

        Ok(Self {
            runtime: RuntimeServiceClient::new(channel.clone()),
            image: ImageServiceClient::new(channel),
            restart_command: restart_command.to_string(),
        })
    }
}

impl RuntimeOps for CriClient {
    // ── Pod sandboxes ───────────────────────────────────────────

    fn run_pod_sandbox(
        &self,
        config: cri::PodSandboxConfig,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<String, RuntimeError>> + Send + '_>> {
        let mut client = self.runtime.clone();
        Box::pin(async move {
            let response = client
                .run_pod_sandbox(cri::RunPodSandboxRequest {
                    config: Some(config),
                    runtime_handler: String::new(),
                })
                .await?;
            Ok(response.into_inner().pod_sandbox_id)
        })
    }

    fn stop_pod_sandbox<'a>(
        &'a self,
        pod_id: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<(), RuntimeError>> + Send + 'a>> {
        let mut client = self.runtime.clone();
        Box::pin(async move {
            client
                .stop_pod_sandbox(cri::StopPodSandboxRequest {
                    pod_sandbox_id: pod_id.to_string(),
                })
                .await?;
            Ok(())
        })
    }

    fn remove_pod_sandbox<'a>(
        &'a self,
        pod_id: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<(), RuntimeError>> + Send + 'a>> {
        let mut client = self.runtime.clone();
        Box::pin(async move {
            client
                .remove_pod_sandbox(cri::RemovePodSandboxRequest {
                    pod_sandbox_id: pod_id.to_string(),
                })
                .await?;
            Ok(())
        })
    }

    fn list_pod_sandbox(
        &self,
        label_selector: HashMap<String, String>,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<Vec<cri::PodSandbox>, RuntimeError>> + Send + '_>>
    {
        let mut client = self.runtime.clone();
        Box::pin(async move {
            let response = client
                .list_pod_sandbox(cri::ListPodSandboxRequest {
                    filter: Some(cri::PodSandboxFilter {
                        label_selector,
                        ..Default::default()
                    }),
                })
                .await?;
            Ok(response.into_inner().items)
        })
    }

    // ── Containers ──────────────────────────────────────────────

    fn create_container(
        &self,
        pod_id: String,
        config: cri::ContainerConfig,
        sandbox_config: cri::PodSandboxConfig,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<String, RuntimeError>> + Send + '_>> {
        let mut client = self.runtime.clone();
        Box::pin(async move {
            let response = client
                .create_container(cri::CreateContainerRequest {
                    pod_sandbox_id: pod_id,
                    config: Some(config),
                    sandbox_config: Some(sandbox_config),
                })
                .await?;
            Ok(response.into_inner().container_id)
        })
    }

    fn start_container<'a>(
        &'a self,
        container_id: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<(), RuntimeError>> + Send + 'a>> {
        let mut client = self.runtime.clone();
        Box::pin(async move {
            client
                .start_container(cri::StartContainerRequest {
                    container_id: container_id.to_string(),
                })
                .await?;
            Ok(())
        })
    }

    fn list_containers(
        &self,
        label_selector: HashMap<String, String>,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<Vec<cri::Container>, RuntimeError>> + Send + '_>>
    {
        let mut client = self.runtime.clone();
        Box::pin(async move {
            let response = client
                .list_containers(cri::ListContainersRequest {
                    filter: Some(cri::ContainerFilter {
                        label_selector,
                        ..Default::default()
                    }),
                })
                .await?;
            Ok(response.into_inner().containers)
        })
    }

    // ── Streaming ───────────────────────────────────────────────

    fn attach<'a>(
        &'a self,
        container_id: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<String, RuntimeError>> + Send + 'a>> {
        let mut client = self.runtime.clone();
        Box::pin(async move {
            let response = client
                .attach(cri::AttachRequest {
                    container_id: container_id.to_string(),
                    stdin: false,
                    tty: false,
                    stdout: true,
                    stderr: false,
                })
                .await?;
            Ok(response.into_inner().url)
        })
    }

    fn open_attach_stream<'a>(
        &'a self,
        url: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<AttachStream, RuntimeError>> + Send + 'a>>
    {
        Box::pin(async move {
            let ws_url = if let Some(rest) = url.strip_prefix("https://") {
                format!("wss://{}", rest)
            } else if let Some(rest) = url.strip_prefix("http://") {
                format!("ws://{}", rest)
            } else {
                url.to_string()
            };
            debug!("opening attach stream: {}", ws_url);

            let (ws, _) = tokio_tungstenite::connect_async(&ws_url)
                .await
                .map_err(|e| RuntimeError::AttachProtocol(e.to_string()))?;
            let (_write, mut read) = ws.split();

            let stream = async_stream::try_stream! {
                while let Some(frame) = read.next().await {
                    let frame = frame.map_err(|e| RuntimeError::AttachProtocol(e.to_string()))?;
                    match frame {
                        Message::Binary(data) if !data.is_empty() => {
                            if data[0] == STDOUT_CHANNEL {
                                yield data.slice(1..);
                            }
                        }
                        Message::Close(_) => break,
                        _ => {}
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
        let mut client = self.runtime.clone();
        Box::pin(async move {
            client
                .checkpoint_container(cri::CheckpointContainerRequest {
                    container_id: container_id.to_string(),
                    location: location.to_string(),
                    timeout: timeout_secs,
                })
                .await?;
            Ok(())
        })
    }

    // ── Images ──────────────────────────────────────────────────

    fn list_images(
        &self,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<Vec<cri::Image>, RuntimeError>> + Send + '_>>
    {
        let mut client = self.image.clone();
        Box::pin(async move {
            let response = client
                .list_images(cri::ListImagesRequest { filter: None })
                .await?;
            Ok(response.into_inner().images)
        })
    }

    fn pull_image<'a>(
        &'a self,
        image: &'a str,
        auth: Option<cri::AuthConfig>,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<String, RuntimeError>> + Send + 'a>> {
        let mut client = self.image.clone();
        Box::pin(async move {
            let response = client
                .pull_image(cri::PullImageRequest {
                    image: Some(cri::ImageSpec {
                        image: image.to_string(),
                        ..Default::default()
                    }),
                    auth,
                    sandbox_config: None,
                })
                .await?;
            Ok(response.into_inner().image_ref)
        })
    }

    // ── Runtime process ─────────────────────────────────────────

    fn restart_runtime(
        &self,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<(), RuntimeError>> + Send + '_>> {
        let command = self.restart_command.clone();
        Box::pin(async move {
            let mut parts = command.split_whitespace();
            let program = parts
                .next()
                .ok_or_else(|| RuntimeError::RestartFailed("empty restart command".to_string()))?;
            let args: Vec<&str> = parts.collect();
            let status = tokio::process::Command::new(program)
                .args(&args)
                .status()
                .await
                .map_err(|e| RuntimeError::RestartFailed(e.to_string()))?;
            if !status.success() {
                return Err(RuntimeError::RestartFailed(format!(
                    "{} exited with {}",
                    program, status
                )));
            }
            Ok(())
        })
    }
}
