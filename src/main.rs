use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ciphergate::config::{Config, ConfigFile, ConfigStore};
use ciphergate::gateway::{router, Gateway};

#[derive(Parser, Debug)]
#[command(name = "ciphergate")]
#[command(about = "Decrypting reverse-proxy gateway")]
struct Args {
    #[arg(short, long, default_value = "config.json")]
    config: String,

    #[arg(short, long, default_value = "0.0.0.0:8080")]
    listen: String,

    #[arg(long)]
    validate_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if args.validate_config {
        let file = ConfigFile::load(std::path::Path::new(&args.config))?;
        Config::try_from(file)?;
        info!("configuration is valid");
        return Ok(());
    }

    let store = ConfigStore::new(&args.config);
    let gateway = Arc::new(Gateway::new(store)?);

    // SIGHUP is the external "configuration source changed" trigger; the
    // admin surface provides the other one.
    #[cfg(unix)]
    {
        let gateway = gateway.clone();
        tokio::spawn(async move {
            let mut hangup = match tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::hangup(),
            ) {
                Ok(signal) => signal,
                Err(err) => {
                    error!(error = %err, "failed to install SIGHUP handler");
                    return;
                }
            };
            while hangup.recv().await.is_some() {
                info!("SIGHUP received, reloading configuration");
                gateway.reload().await;
            }
        });
    }

    let listener = TcpListener::bind(&args.listen).await?;
    info!("ciphergate listening on {}", args.listen);

    axum::serve(
        listener,
        router(gateway).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for shutdown signal");
        }
        info!("shutdown signal received");
    })
    .await?;

    info!("ciphergate shutdown complete");
    Ok(())
}
