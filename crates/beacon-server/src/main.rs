use anyhow::{Context, Result};
use beacon_server::{AppConfig, AppCore, StaticAuthProvider, StaticDirectory};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "beacon-server", about = "Real-time event broadcasting core")]
struct Args {
    /// Listen address for the WebSocket surface.
    #[arg(long, env = "BEACON_BIND", default_value = "0.0.0.0:8080")]
    bind: SocketAddr,

    /// Static token table: comma-separated `token=user` or
    /// `token=user:admin` entries.
    #[arg(long, env = "BEACON_TOKENS", default_value = "")]
    tokens: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let auth = Arc::new(StaticAuthProvider::from_spec(&args.tokens));
    let admins: Vec<String> = args
        .tokens
        .split(',')
        .filter_map(|entry| entry.trim().split_once('='))
        .filter_map(|(_, rest)| {
            rest.split_once(':')
                .filter(|(_, flags)| *flags == "admin")
                .map(|(user_id, _)| user_id.to_string())
        })
        .collect();
    let directory = Arc::new(StaticDirectory::new(admins));

    let app = AppCore::new(AppConfig::from_env(), auth, directory);
    app.start().await.context("failed to start the beacon core")?;

    let router = beacon_server::routes::router(app.clone());
    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;
    info!(addr = %args.bind, "Beacon server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await
        .context("server error")?;

    app.shutdown().await;
    Ok(())
}
