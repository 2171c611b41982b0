//! Serve — spawn the control loops and serve the gRPC API until shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tonic::transport::Server;
use tracing::{error, info};

use crate::checkpoint::{CheckpointEngine, CheckpointGc};
use crate::gc::{Collector, GcExecutor};
use crate::proto::agent::v1::checkpoint_service_server::CheckpointServiceServer;
use crate::reconcile::Reconciler;
use crate::runtime::boot::Agent;
use crate::runtime::system::ensure_system_pods;
use crate::service::CheckpointServiceImpl;

/// Wire up the subsystems, serve until SIGINT/SIGTERM, then drain the loops.
pub async fn serve(agent: Agent) -> Result<(), Box<dyn std::error::Error>> {
    let Agent {
        state,
        control,
        push,
    } = agent;

    ensure_system_pods(&state).await?;

    let engine = Arc::new(CheckpointEngine::new(state.clone(), push));
    let reconciler = Reconciler::new(state.clone(), control).start();
    let gc = GcExecutor::new(
        Duration::from_secs(state.config.gc_interval_secs),
        vec![Arc::new(CheckpointGc::new(state.clone())) as Arc<dyn Collector>],
    )
    .start();

    let addr: SocketAddr = state.config.bind_address.parse().map_err(|e| {
        error!("Invalid bind address: {}", e);
        e
    })?;

    let checkpoint_service = CheckpointServiceImpl::new(engine);

    info!("✓ Registered CheckpointService");
    info!("Chunkhost Node Agent is ready, listening on {}", addr);

    Server::builder()
        .add_service(CheckpointServiceServer::new(checkpoint_service))
        .serve_with_shutdown(addr, shutdown_signal())
        .await?;

    info!("Draining control loops...");
    reconciler.stop().await;
    gc.stop().await;
    info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
/// Listens for SIGINT (Ctrl+C) or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal, initiating graceful shutdown...");
        },
        _ = terminate => {
            info!("Received SIGTERM signal, initiating graceful shutdown...");
        },
    }
}
