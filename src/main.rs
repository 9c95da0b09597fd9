//! zerobot broker daemon.
//!
//! Binds the broker channels from the environment, serves the HTTP status
//! endpoint and runs until Ctrl-C.

use anyhow::Context as _;
use tracing_subscriber::EnvFilter;

use zerobot::Context;
use zerobot::broker::Broker;
use zerobot::config::DaemonConfig;
use zerobot::status;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = DaemonConfig::from_env().context("loading configuration")?;

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if config.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting zerobot broker");

    let ctx = Context::with_settings(config.context);
    let broker = Broker::bind(&ctx, config.broker.clone())
        .await
        .context("binding broker channels")?;

    if let Some(addr) = config.status_addr {
        let (_, server) = status::bind(addr, broker.monitor(), ctx.child_token())
            .await
            .context("binding status endpoint")?;
        ctx.spawn(async move {
            if let Err(err) = server.await {
                tracing::error!(error = %err, "status endpoint failed");
            }
        });
    }

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("shutdown requested");

    broker.shutdown().await;
    ctx.shutdown().await;
    tracing::info!("bye");
    Ok(())
}
