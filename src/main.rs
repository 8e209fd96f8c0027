//! Fleet service entry point.
//!
//! Startup sequence:
//! 1. Initialize structured logging (`RUST_LOG` controls the level).
//! 2. Load configuration from environment variables.
//! 3. Open the interval log and heal any crashed sessions.
//! 4. Build one backend client per configured provider and register it.
//! 5. Start the health monitor and serve the admin surface until SIGTERM
//!    or Ctrl+C, then shut everything down in reverse order.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ai_fleet::admin::{create_router, AppState};
use ai_fleet::client::{BackendClient, BackendClientConfig};
use ai_fleet::config::Config;
use ai_fleet::http_api::{HttpApiConfig, OpenAiCompatApi};
use ai_fleet::manager::ClientManager;
use ai_fleet::state_log::StateLog;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::from_env();
    info!(bind_address = %config.bind_address, backends = config.backends.len(), "starting ai-fleet");

    let manager = Arc::new(ClientManager::new(config.manager_config()));

    let state_log = if config.state_log_enabled {
        let log = Arc::new(
            StateLog::open(config.state_log_config()).context("failed to open state log")?,
        );
        log.start();
        info!(run_id = %log.run_id(), "state log session opened");
        Some(log)
    } else {
        None
    };

    for backend in &config.backends {
        let api = OpenAiCompatApi::new(HttpApiConfig {
            api_base_url: backend.base_url.clone(),
            token: Some(backend.api_key.clone()),
            default_model: backend.model.clone(),
            proxy: backend.proxy.clone(),
        })
        .with_context(|| format!("failed to build HTTP core for {}", backend.name))?;

        let client = Arc::new(BackendClient::new(
            BackendClientConfig {
                name: backend.name.clone(),
                priority: backend.priority,
                group_id: backend.group_id.clone(),
                default_available: backend.default_available,
            },
            Arc::new(api),
        ));
        if !backend.models.is_empty() {
            client.set_rotation_models(backend.models.clone(), 1);
        }
        if !backend.tokens.is_empty() {
            client.set_rotation_tokens(backend.tokens.clone(), 1);
        }

        if let Some(log) = &state_log {
            log.attach_client(&client);
        }
        manager.register_client(client);
    }

    manager.start_monitoring();

    let app = create_router(AppState {
        manager: Arc::clone(&manager),
        state_log: state_log.clone(),
    });

    let addr: SocketAddr = config
        .bind_address
        .parse()
        .context("invalid bind address")?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "admin surface listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Reverse order: stop probing before closing the session out.
    manager.stop_monitoring().await;
    if let Some(log) = state_log {
        log.stop();
    }
    info!("ai-fleet stopped");
    Ok(())
}

/// Resolves on SIGTERM (process managers) or Ctrl+C (terminals).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
