use anyhow::{Context, Result};
use clap::Parser;
use fence::LeaseProtocol;
use fencelock::{server, AppState, Cli, Config};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_filter()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::load(&cli)?;
    info!("fencelock starting...");
    info!("Bind address: {}", config.bind_addr);
    info!("Lease duration: {}s", config.lease_duration_secs);

    let store = config.backend.open().await?;
    info!("Using {} backend", store.backend());

    let state = AppState::new(LeaseProtocol::new(store), config.lease_duration());

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    info!("fencelock listening on {}", listener.local_addr()?);

    server::serve(listener, state, shutdown_signal())
        .await
        .context("server error")?;

    info!("Shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received SIGINT, shutting down..."),
        () = terminate => info!("Received SIGTERM, shutting down..."),
    }
}
