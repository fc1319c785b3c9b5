//! reactive-net demo server.
//!
//! Serves the configured directory mounts over HTTP, a `/status` JSON route
//! and a `/ws/echo` WebSocket echo route until Ctrl+C or SIGTERM.

use std::path::PathBuf;
use std::time::Instant;

use clap::Parser;
use futures_util::StreamExt;
use hyper::header::{self, HeaderValue};
use reactive_net::config::{load_config, AppConfig};
use reactive_net::lifecycle::signals::shutdown_signal;
use reactive_net::observability::{logging, metrics};
use reactive_net::{HttpChannel, HttpServer, WebSocketSession};

#[derive(Parser)]
#[command(name = "reactive-net")]
#[command(about = "Demand-driven HTTP/WebSocket demo server", long_about = None)]
struct Cli {
    /// TOML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

async fn status(channel: HttpChannel, started: Instant) -> reactive_net::Result<()> {
    let body = serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": started.elapsed().as_secs(),
        "request_id": channel.id().to_string(),
    });
    channel.set_header(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))?;
    channel.send_string(body.to_string()).await
}

async fn echo(session: WebSocketSession) -> reactive_net::Result<()> {
    let mut frames = session.receive()?;
    while let Some(frame) = frames.next().await {
        session.send(frame?).await?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => AppConfig::default(),
    };

    logging::init(&config.observability.log_level);
    tracing::info!("reactive-net v{} starting", env!("CARGO_PKG_VERSION"));

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => {
                if let Err(e) = metrics::init_metrics(addr) {
                    tracing::error!(error = %e, "Failed to install metrics exporter");
                }
            }
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let started = Instant::now();
    let mut server = HttpServer::new(config.server.clone())
        .get("/status", move |channel| status(channel, started))
        .ws("/ws/echo", echo, None);
    for mount in &config.mounts {
        tracing::info!(prefix = %mount.prefix, root = %mount.root, "Mounting directory");
        server = server.directory(&mount.prefix, &mount.root);
    }

    let address = server.start().await?;
    tracing::info!(
        address = %address,
        io_threads = config.server.io_threads,
        prefetch = config.server.prefetch.get(),
        "Listening for connections"
    );

    shutdown_signal().await;
    server.shutdown().await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
