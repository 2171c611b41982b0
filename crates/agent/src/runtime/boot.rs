//! Boot — logging init, config load, client connections, state creation.

use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::client::live::CriClient;
use crate::client::platform::{ControlPlane, ControlPlaneClient, ImagePush, ImagePushClient};
use crate::conf::AgentConfig;
use crate::state::{AgentState, SharedState};

/// Everything `serve` needs: shared state plus the platform clients.
pub struct Agent {
    pub state: SharedState,
    pub control: Arc<dyn ControlPlane>,
    pub push: Arc<dyn ImagePush>,
}

/// Initialise the tracing / logging subsystem.
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "agent=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Load config, connect to the runtime and the platform, build shared state.
pub async fn boot() -> Result<Agent, Box<dyn std::error::Error>> {
    info!("Starting Chunkhost Node Agent v0.0.1");

    let config = AgentConfig::load()?;
    config.validate().map_err(|e| {
        error!("Invalid configuration: {}", e);
        e
    })?;
    info!(
        "Loaded configuration: node_id={} sync_interval={}s max_attempts={}",
        config.node_id, config.sync_interval_secs, config.max_attempts
    );

    info!("Connecting to container runtime at: {}", config.cri_endpoint);
    let runtime = CriClient::connect(&config.cri_endpoint, &config.runtime_restart_command)
        .await
        .map_err(|e| {
            error!("Failed to connect to container runtime: {}", e);
            e
        })?;

    info!(
        "Connecting to control plane at: {}",
        config.control_plane_endpoint
    );
    let control = ControlPlaneClient::connect(&config.control_plane_endpoint)
        .await
        .map_err(|e| {
            error!("Failed to connect to control plane: {}", e);
            e
        })?;

    info!(
        "Connecting to image push service at: {}",
        config.image_push_endpoint
    );
    let push = ImagePushClient::connect(&config.image_push_endpoint)
        .await
        .map_err(|e| {
            error!("Failed to connect to image push service: {}", e);
            e
        })?;

    tokio::fs::create_dir_all(&config.checkpoint_file_dir).await?;

    let state = Arc::new(AgentState::new(config, Arc::new(runtime)));
    info!("Initialized shared agent state");

    Ok(Agent {
        state,
        control: Arc::new(control),
        push: Arc::new(push),
    })
}
