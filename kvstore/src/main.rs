mod config;
mod httpapi;
mod metrics;
mod raft;
mod raft_client;
mod raft_service;
mod server;
mod store;

use anyhow::Context;
use clap::Parser;
use tokio::signal;

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            log::error!("Failed to install Ctrl+C handler: {}", e);
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
                log::error!("Failed to install signal handler: {}", e);
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
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::try_init().unwrap_or_default();
    let args = config::Args::parse();
    let config = config::RuntimeConfig::from_toml(&args.config).with_args(&args);
    log::info!("starting node {} ({:?})", config.id, config);

    let mut server = server::Server::builder(config);
    let mut apply = server.start().await?;

    tokio::select! {
        _ = shutdown_signal() => {
            server.stop();
            // Closing the HTTP API drops the propose sink, which stops raft
            // and then the apply loop.
            apply.await.context("apply loop panicked")??;
        }
        result = &mut apply => {
            server.stop();
            result.context("apply loop panicked")??;
            anyhow::bail!("commit feed closed");
        }
    }
    Ok(())
}
