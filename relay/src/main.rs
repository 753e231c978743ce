use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use tracing::info;
use tracing_subscriber::EnvFilter;

use webexpose_relay::{proxy, RelayConfig, RelayHub};

#[tokio::main]
async fn main() -> Result<()> {
    let config = RelayConfig::parse();

    let default_level = if config.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("webexpose_relay={0},webexpose_shared={0}", default_level))),
        )
        .init();

    config.validate()?;

    let hub = RelayHub::new(config.request_timeout());
    let app = proxy::router(hub.clone(), &config);

    let addr = config.listen_addr();
    info!(
        "WebExpose relay on {} (tunnel: {}, timeout: {:?})",
        addr,
        config.tunnel_path,
        config.request_timeout()
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down...");
            hub.shutdown().await;
        })
        .await?;

    Ok(())
}
