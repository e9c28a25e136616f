use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::anyhow;
use axum::http::{header::CONTENT_TYPE, Method};
use clap::Parser;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use voicebridge_gateway::{routes, AppState, ServerConfig};

/// Realtime voice-assistant gateway
#[derive(Parser, Debug)]
#[command(name = "voicebridge-gateway")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to an env file to load instead of ./.env
    #[arg(long = "env-file", value_name = "FILE")]
    env_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments first so --env-file applies before config loading
    let cli = Cli::parse();
    match cli.env_file {
        Some(path) => {
            dotenvy::from_path(&path)
                .map_err(|e| anyhow!("failed to load {}: {}", path.display(), e))?;
        }
        None => {
            let _ = dotenvy::dotenv();
        }
    }

    // Initialize tracing
    tracing_subscriber::fmt::init();

    // Load configuration from the environment
    let config = ServerConfig::from_env().map_err(|e| anyhow!(e.to_string()))?;
    let address = config.address();
    let cors_origins = config.cors_allowed_origins.clone();

    // Configure CORS. The gateway trusts localhost; default to permissive
    // unless the operator pins an origin list.
    let cors_layer = match cors_origins.as_deref() {
        None | Some("*") => CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers([CONTENT_TYPE]),
        Some(origins) => {
            let origins: Vec<_> = origins
                .split(',')
                .filter_map(|s| s.trim().parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                .allow_headers([CONTENT_TYPE])
        }
    };

    // Create application state and routes
    let app_state = Arc::new(AppState::new(config));
    let app = routes::app(app_state).layer(cors_layer);

    // Parse socket address and serve
    let socket_addr: SocketAddr = address
        .parse()
        .map_err(|e| anyhow!("Invalid server address '{}': {}", address, e))?;

    info!("Server listening on http://{}", socket_addr);

    let listener = TcpListener::bind(&socket_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
