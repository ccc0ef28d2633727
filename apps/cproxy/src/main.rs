use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::info;

mod auth;
mod cli;

use cli::{AuthCommand, Cli, Command};
use cproxy_core::admission::{AdmissionConfig, AdmissionController};
use cproxy_core::credentials::CredentialStore;
use cproxy_core::telemetry::LogSink;
use cproxy_core::token::TokenAuthority;
use cproxy_core::upstream::UpstreamClient;
use cproxy_core::watcher::{ConfigWatcher, DEFAULT_POLL_INTERVAL};
use cproxy_core::{paths, watcher};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("cproxy=info")),
        )
        .init();

    let cli = Cli::parse();
    let config_dir = paths::config_dir();
    let store = CredentialStore::new(&config_dir);

    match cli.command {
        Some(Command::Auth { command }) => match command {
            AuthCommand::Login { console } => auth::login(&store, console).await,
            AuthCommand::Status => auth::status(&store),
            AuthCommand::Logout => auth::logout(&store),
        },
        Some(Command::Serve { host, port }) => serve(config_dir, store, host, port).await,
        None => serve(config_dir, store, None, None).await,
    }
}

async fn serve(
    config_dir: std::path::PathBuf,
    store: CredentialStore,
    host_override: Option<String>,
    port_override: Option<u16>,
) -> Result<()> {
    let tokens = Arc::new(TokenAuthority::new(store)?);
    if !tokens.is_authenticated() {
        bail!("not authenticated; run `cproxy auth login` first");
    }

    let config_watcher = ConfigWatcher::spawn(config_dir, DEFAULT_POLL_INTERVAL);
    let snapshot = config_watcher.snapshot();

    let admission = Arc::new(AdmissionController::new(AdmissionConfig::default()));
    let _sweeper = admission.spawn_sweeper();

    let state = cproxy_router::AppState {
        snapshot: snapshot.clone(),
        admission,
        upstream: Arc::new(UpstreamClient::new(tokens)?),
        telemetry: Arc::new(LogSink),
    };
    let app = cproxy_router::router(state);

    let server = {
        let loaded: Arc<watcher::Snapshot> = snapshot.load_full();
        let host = host_override.unwrap_or_else(|| loaded.config.server.host.clone());
        let port = port_override.unwrap_or(loaded.config.server.port);
        format!("{host}:{port}")
    };
    let listener = tokio::net::TcpListener::bind(&server)
        .await
        .with_context(|| format!("failed to bind {server}"))?;
    info!(address = %server, "cproxy listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("drained; goodbye");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received; draining");
}
