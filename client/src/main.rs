use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use webexpose::config::Cli;
use webexpose::{tunnel, ForwardingAgent, HttpService};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("webexpose={0},webexpose_shared={0}", default_level))),
        )
        .init();

    let config = cli.resolve()?;

    let service = HttpService::new(config.local_timeout())?;
    let agent = ForwardingAgent::new(
        service,
        config.local_server.clone(),
        config.local_scheme,
        config.concurrency,
    );

    info!(
        "Forwarding {} to {}://{}",
        config.remote_url,
        config.local_scheme.as_str(),
        config.local_server
    );

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            shutdown.cancel();
        });
    }

    tunnel::run_with_reconnect(&config.remote_url, &config.reconnect, &agent, shutdown).await?;
    Ok(())
}
