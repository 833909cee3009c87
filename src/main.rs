//! Process entry point: parses [`AppConfig`], resolves the master key, builds and starts the
//! service container, and serves the management HTTP surface until a shutdown signal arrives.

use std::process::ExitCode;
use std::sync::Arc;

use chatrelay::{AppConfig, ChatRelayError, ServiceContainer};
use clap::Parser;
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "chatrelay exiting");
            #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
            ExitCode::from(err.exit_code() as u8)
        }
    }
}

async fn run() -> Result<(), ChatRelayError> {
    let config = AppConfig::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&config.log_level)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .init();

    config
        .validate()
        .map_err(|e| ChatRelayError::Config(e.to_string()))?;

    let passphrase = config
        .resolve_master_key_passphrase()
        .map_err(|e| ChatRelayError::Config(e.to_string()))?;
    let master_key = chatrelay::crypto::MasterKey::from_passphrase(&passphrase);

    std::fs::create_dir_all(&config.data_dir)
        .map_err(|e| ChatRelayError::Config(format!("creating data dir: {e}")))?;

    let container = Arc::new(
        ServiceContainer::build(&config, master_key)
            .await
            .map_err(|e| match e {
                chatrelay::service::ServiceError::Database(db) => ChatRelayError::StoreOpen(db),
                other => ChatRelayError::Runtime(anyhow::anyhow!(other)),
            })?,
    );

    container.start();

    let app = chatrelay::rest_api::create_app(container.app_state());
    let bind_address = ServiceContainer::bind_address(&config);
    let listener = tokio::net::TcpListener::bind(bind_address)
        .await
        .map_err(|e| ChatRelayError::Runtime(anyhow::anyhow!(e)))?;
    info!(%bind_address, "management HTTP surface listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(Arc::clone(&container)))
        .await
        .map_err(|e| ChatRelayError::Runtime(anyhow::anyhow!(e)))?;

    info!("chatrelay shut down cleanly");
    Ok(())
}

/// Resolves once SIGINT or SIGTERM is received, cancelling the service container's root token
/// so every loop and worker winds down before the HTTP server finishes draining connections.
async fn shutdown_signal(container: Arc<ServiceContainer>) {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("shutdown signal received");
    container.shutdown();
}
