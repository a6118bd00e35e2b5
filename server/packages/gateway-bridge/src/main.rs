use std::time::Duration;

use axum::http::HeaderValue;
use clap::Parser;
use gateway_bridge::config::{BridgeConfig, Timeouts, DEFAULT_MAX_DEPTH, DEFAULT_PRIMARY_AGENT};
use gateway_bridge::handshake::ClientIdentity;
use gateway_bridge::run_server;
use gateway_bridge::target::{GatewayTarget, TargetError, DEFAULT_URL_TEMPLATE};
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "gateway-bridge")]
#[command(about = "Bridges agent gateway WebSocket sessions to SSE chat streams", version)]
struct Cli {
    #[arg(long, short = 'H', env = "GATEWAY_BRIDGE_HOST", default_value = "127.0.0.1")]
    host: String,

    #[arg(long, short = 'p', env = "GATEWAY_BRIDGE_PORT", default_value_t = 7600)]
    port: u16,

    /// Bearer secret web clients must send on /v1/chat.
    #[arg(long, env = "GATEWAY_BRIDGE_SECRET", hide_env_values = true)]
    secret: String,

    #[arg(long, env = "GATEWAY_BRIDGE_GATEWAY_URL_TEMPLATE", default_value = DEFAULT_URL_TEMPLATE)]
    gateway_url_template: String,

    #[arg(
        long = "collaborator",
        env = "GATEWAY_BRIDGE_COLLABORATORS",
        value_delimiter = ',',
        default_values_t = ["researcher", "coder", "designer", "reviewer"].map(String::from)
    )]
    collaborators: Vec<String>,

    /// Reply template override, `id=template`; `{message}` is replaced.
    #[arg(long = "collaborator-template", value_parser = parse_template)]
    collaborator_templates: Vec<(String, String)>,

    #[arg(long, env = "GATEWAY_BRIDGE_PRIMARY_AGENT", default_value = DEFAULT_PRIMARY_AGENT)]
    primary_agent: String,

    #[arg(long, env = "GATEWAY_BRIDGE_MAX_DEPTH", default_value_t = DEFAULT_MAX_DEPTH)]
    max_depth: u32,

    #[arg(long, env = "GATEWAY_BRIDGE_THREAD_DELAY_MS", default_value_t = 0)]
    thread_delay_ms: u64,

    #[arg(long, env = "GATEWAY_BRIDGE_CONNECT_TIMEOUT_MS", default_value_t = 30_000)]
    connect_timeout_ms: u64,

    #[arg(long, env = "GATEWAY_BRIDGE_HANDSHAKE_TIMEOUT_MS", default_value_t = 10_000)]
    handshake_timeout_ms: u64,

    #[arg(long, env = "GATEWAY_BRIDGE_REQUEST_TIMEOUT_MS", default_value_t = 300_000)]
    request_timeout_ms: u64,

    #[arg(long, env = "GATEWAY_BRIDGE_CLIENT_ID")]
    client_id: Option<String>,

    #[arg(long, env = "GATEWAY_BRIDGE_CLIENT_MODE")]
    client_mode: Option<String>,

    #[arg(long, env = "GATEWAY_BRIDGE_ROLE")]
    role: Option<String>,

    #[arg(long = "scope", env = "GATEWAY_BRIDGE_SCOPES", value_delimiter = ',')]
    scopes: Vec<String>,

    #[arg(long = "cors-allow-origin", short = 'O', env = "GATEWAY_BRIDGE_CORS_ORIGINS", value_delimiter = ',')]
    cors_allow_origin: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("--secret must not be empty")]
    EmptySecret,
    #[error("invalid gateway url template: {0}")]
    Target(#[from] TargetError),
    #[error("invalid cors origin: {0}")]
    InvalidCorsOrigin(String),
    #[error("server error: {0}")]
    Server(String),
}

#[tokio::main]
async fn main() {
    init_logging();
    if let Err(err) = run().await {
        tracing::error!(error = %err, "gateway-bridge failed");
        std::process::exit(1);
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .init();
}

async fn run() -> Result<(), CliError> {
    let cli = Cli::parse();
    let cors = build_cors_layer(&cli.cors_allow_origin)?;
    let config = build_config(cli)?;
    run_server(config, cors)
        .await
        .map_err(|err| CliError::Server(err.to_string()))
}

fn build_config(cli: Cli) -> Result<BridgeConfig, CliError> {
    if cli.secret.trim().is_empty() {
        return Err(CliError::EmptySecret);
    }

    let mut identity = ClientIdentity::default();
    if let Some(id) = cli.client_id {
        identity.id = id;
    }
    if let Some(mode) = cli.client_mode {
        identity.mode = mode;
    }
    if let Some(role) = cli.role {
        identity.role = role;
    }
    if !cli.scopes.is_empty() {
        identity.scopes = cli.scopes;
    }

    Ok(BridgeConfig {
        host: cli.host,
        port: cli.port,
        secret: cli.secret,
        target: GatewayTarget::from_template(cli.gateway_url_template)?,
        identity,
        collaborators: cli.collaborators,
        responder_templates: cli.collaborator_templates,
        primary_agent: cli.primary_agent,
        max_depth: cli.max_depth,
        thread_delay: Duration::from_millis(cli.thread_delay_ms),
        timeouts: Timeouts {
            connect: Duration::from_millis(cli.connect_timeout_ms),
            handshake_step: Duration::from_millis(cli.handshake_timeout_ms),
            request_deadline: Duration::from_millis(cli.request_timeout_ms),
        },
        ..BridgeConfig::default()
    })
}

fn build_cors_layer(origins: &[String]) -> Result<Option<CorsLayer>, CliError> {
    if origins.is_empty() {
        return Ok(None);
    }
    let mut allowed: Vec<HeaderValue> = Vec::with_capacity(origins.len());
    for origin in origins {
        let value = origin
            .parse()
            .map_err(|_| CliError::InvalidCorsOrigin(origin.clone()))?;
        allowed.push(value);
    }
    Ok(Some(
        CorsLayer::new()
            .allow_origin(allowed)
            .allow_methods(Any)
            .allow_headers(Any),
    ))
}

fn parse_template(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((id, template)) if !id.trim().is_empty() => {
            Ok((id.trim().to_string(), template.to_string()))
        }
        _ => Err(format!("expected id=template, got {raw:?}")),
    }
}
