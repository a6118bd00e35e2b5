use std::net::SocketAddr;
use std::sync::Arc;

use tower_http::cors::CorsLayer;

use app::{build_router, BridgeState};
use config::BridgeConfig;

pub mod app;
pub mod config;
pub mod connection;
pub mod events;
pub mod frame;
pub mod handshake;
pub mod mentions;
pub mod orchestrator;
pub mod responder;
pub mod session;
pub mod target;
pub mod turn;

pub async fn run_server(
    config: BridgeConfig,
    cors: Option<CorsLayer>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let state = Arc::new(BridgeState::new(&config)?);
    let mut app = build_router(state);
    if let Some(cors) = cors {
        app = app.layer(cors);
    }

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(
        addr = %addr,
        gateway_url_template = %config.target.template(),
        collaborators = ?config.collaborators,
        max_depth = config.max_depth,
        "gateway-bridge listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("gateway-bridge shutting down");
}
