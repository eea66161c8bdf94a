use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tokio::sync::watch;
use tracing::info;

use iap_tunnel::client::IapTunnelClient;
use iap_tunnel::config::Config;
use iap_tunnel::credentials::{AdcTokenSource, TokenSource};
use iap_tunnel::logging;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    let config = Config::parse();
    logging::init(&config.loglevel, config.log_json);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        project = %config.project,
        zone = %config.zone,
        instance = %config.instance,
        port = %config.port,
        "iap-tunnel starting"
    );

    let tokens: Arc<dyn TokenSource> = Arc::new(
        AdcTokenSource::discover(config.credentials_file.as_deref())
            .context("loading credentials")?,
    );

    let client = IapTunnelClient::new(config.target(), tokens, Some(config.local_port));

    client.dry_run().await.context("dry run failed")?;
    if config.dry_run_only {
        info!("dry run complete");
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_shutdown().await;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    client.serve(shutdown_rx).await.context("serve failed")?;
    info!("iap-tunnel stopped");
    Ok(())
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
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
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
