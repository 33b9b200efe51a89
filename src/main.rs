mod config;

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use buildlog_docker::DockerClient;
use buildlog_listener::Router;
use buildlog_sinks::build_sink;

use crate::config::{Args, Settings};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let settings = args.load_settings()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(settings.log_level())),
        )
        .with_writer(std::io::stderr)
        .init();

    let result = run(settings).await;

    if let Err(e) = &result {
        error!("buildlog stopped: {:#}", e);
    }

    result
}

async fn run(settings: Settings) -> Result<()> {
    let config = settings.resolve()?;

    let sink = build_sink(&config.sinks)?;
    let runtime = DockerClient::from_socket_or_default(config.docker_socket);
    info!(socket = %runtime.socket_path().display(), "Using docker socket");

    let mut router = Router::new(config.router, Arc::new(runtime), sink);
    router.validate()?;
    router.start().await;

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    router.run(shutdown).await?;
    Ok(())
}

/// Cancel `shutdown` on SIGINT or SIGTERM
async fn wait_for_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("Shutdown requested");
    shutdown.cancel();
}
