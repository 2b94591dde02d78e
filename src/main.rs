//! Bayeux Hub - real-time pub/sub server
//!
//! Serves WebSocket and long-polling Bayeux clients on one HTTP path.

use std::net::SocketAddr;

use bayeux_hub::{Config, Server, http};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info, info_span};

#[derive(Parser, Debug)]
#[command(name = "bayeux-hub")]
#[command(about = "Bayeux/CometD publish-subscribe server")]
#[command(version)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Listen address, overrides BAYEUX_LISTEN
    #[arg(long)]
    listen: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(&args.log_level)
        .init();

    info!("Bayeux Hub v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load config: {}", e);
            std::process::exit(1);
        }
    };
    if let Some(listen) = args.listen {
        config.listen = listen;
    }

    info!(
        listen = %config.listen,
        path = %config.path,
        workers = ?config.dispatch_workers,
        "Starting Bayeux Hub"
    );

    let listener = TcpListener::bind(config.listen).await?;
    let server = Server::new(config, info_span!("bayeux"));
    let app = http::router(server.clone());

    info!(addr = %listener.local_addr()?, "Listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    server.close();
    info!("Bayeux Hub stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
