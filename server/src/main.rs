//! Elevo Environment Server
//!
//! This server manages versioned container environments for source
//! repositories and exposes them over HTTP and MCP.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::signal;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use environment_server::api;
use environment_server::infra::backend::ContainerBackend;
use environment_server::infra::docker::{self, DockerBackend, DockerTunnel};
use environment_server::infra::git::GitTracker;
use environment_server::infra::memory::{MemoryBackend, MemoryStorage, MemoryTracker, MemoryTunnel};
use environment_server::infra::sqlite::SqliteStorage;
use environment_server::infra::storage::RemoteStorage;
use environment_server::infra::tracker::Tracker;
use environment_server::infra::tunnel::HostTunnel;
use environment_server::service::{EnvironmentRegistry, EnvironmentService};
use environment_server::{AppState, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration first to check MCP mode
    dotenvy::dotenv().ok();
    let config = Config::load()?;
    let config = Arc::new(config);

    // Initialize tracing - use stderr for MCP stdio mode to avoid polluting stdout
    if config.mcp_mode == "stdio" {
        tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(
                EnvFilter::builder()
                    .with_default_directive(Level::INFO.into())
                    .from_env_lossy(),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(
                EnvFilter::builder()
                    .with_default_directive(Level::INFO.into())
                    .from_env_lossy(),
            )
            .init();
    }

    info!("Starting Environment Server");
    info!("Backend: {}, tracker: {}", config.backend, config.tracker);

    // Initialize infrastructure
    let (backend, tunnel, storage): (
        Arc<dyn ContainerBackend>,
        Arc<dyn HostTunnel>,
        Arc<dyn RemoteStorage>,
    ) = match config.backend.as_str() {
        "memory" => (
            Arc::new(MemoryBackend::new()),
            Arc::new(MemoryTunnel::new()),
            Arc::new(MemoryStorage::new()),
        ),
        "docker" => {
            let client = docker::connect(config.docker_socket.as_deref())?;
            let backend = DockerBackend::new(
                client.clone(),
                config.docker_network.clone(),
                config.shell.clone(),
            );
            if let Err(e) = backend.ping().await {
                error!("Docker is not reachable: {}", e);
                return Err(e.into());
            }
            let tunnel = DockerTunnel::new(
                client,
                config.docker_network.clone(),
                config.tunnel_image.clone(),
            );
            let pool = SqliteStorage::init(&config.database_url).await?;
            (
                Arc::new(backend),
                Arc::new(tunnel),
                Arc::new(SqliteStorage::new(pool, config.database_url.clone())),
            )
        }
        other => anyhow::bail!("unknown ENVIRONMENT_BACKEND {other:?}"),
    };

    let tracker: Arc<dyn Tracker> = match config.tracker.as_str() {
        "memory" => Arc::new(MemoryTracker::new()),
        "git" => Arc::new(GitTracker::new()),
        other => anyhow::bail!("unknown ENVIRONMENT_TRACKER {other:?}"),
    };

    // Initialize services
    let environment_service = Arc::new(EnvironmentService::new(
        Arc::new(EnvironmentRegistry::new()),
        backend,
        tunnel,
        storage,
        tracker,
        config.clone(),
    ));

    // Create application state
    let state = AppState::new(config.clone(), environment_service);

    // MCP stdio mode runs exclusively
    if config.mcp_mode == "stdio" {
        info!("Running in MCP stdio mode");
        return api::mcp::serve_stdio(state).await;
    }

    let http_addr: SocketAddr = format!("{}:{}", config.http_host, config.http_port).parse()?;
    info!("HTTP listening on {}", http_addr);

    let app = api::http::create_router(state);
    let listener = tokio::net::TcpListener::bind(http_addr).await?;
    if let Err(e) = axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("HTTP server error: {}", e);
    }

    info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received shutdown signal");
}
