//! Tunnel connection to the relay
//!
//! Dials the relay's WebSocket, wraps it as a tunnel endpoint, and keeps it
//! alive: when the connection drops the agent re-dials with exponential
//! backoff until shutdown is requested.

use std::sync::Arc;

use futures_util::{future, SinkExt, StreamExt};
use tokio::time::Duration;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{protocol::WebSocketConfig, Message},
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use webexpose_shared::protocol::MAX_MESSAGE_SIZE;
use webexpose_shared::{Error, Result, TunnelEndpoint};

use crate::agent::ForwardingAgent;
use crate::config::ReconnectConfig;
use crate::proxy::LocalService;

/// Open the tunnel connection to the relay
pub async fn connect(remote_url: &str) -> Result<TunnelEndpoint> {
    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(MAX_MESSAGE_SIZE);
    ws_config.max_frame_size = Some(MAX_MESSAGE_SIZE);

    let (ws_stream, _) = connect_async_with_config(remote_url, Some(ws_config), false)
        .await
        .map_err(|e| Error::Connection(format!("failed to connect to {}: {}", remote_url, e)))?;

    let (write, read) = ws_stream.split();

    let sink = write
        .sink_map_err(|e| Error::SendFailure(e.to_string()))
        .with(|data: Vec<u8>| future::ready(Ok::<_, Error>(Message::Binary(data))));

    let stream = read.filter_map(|msg| {
        future::ready(match msg {
            Ok(Message::Binary(data)) => Some(Ok(data)),
            Ok(Message::Text(text)) => Some(Ok(text.into_bytes())),
            // pings are answered by tungstenite; close ends the stream
            Ok(_) => None,
            Err(e) => Some(Err(Error::ReceiveFailure(e.to_string()))),
        })
    });

    Ok(TunnelEndpoint::new(remote_url, sink, stream))
}

/// Exponential backoff between re-dials
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            next: initial,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.next = self.initial;
    }
}

/// Run the agent, re-dialing whenever the tunnel drops, until `shutdown`
pub async fn run_with_reconnect<S: LocalService>(
    remote_url: &str,
    reconnect: &ReconnectConfig,
    agent: &ForwardingAgent<S>,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut backoff = Backoff::new(reconnect.initial_backoff(), reconnect.max_backoff());

    loop {
        info!("Connecting to relay: {}", remote_url);

        let connected = tokio::select! {
            res = connect(remote_url) => res,
            _ = shutdown.cancelled() => return Ok(()),
        };

        match connected {
            Ok(endpoint) => {
                backoff.reset();
                info!(
                    "Tunnel active: {} -> {}",
                    remote_url,
                    agent.local_server()
                );

                let endpoint = Arc::new(endpoint);
                tokio::select! {
                    res = agent.run(endpoint.clone()) => {
                        if let Err(e) = res {
                            warn!("Tunnel lost: {}", e);
                        }
                    }
                    _ = shutdown.cancelled() => {
                        info!("Shutting down...");
                        endpoint.close().await;
                        return Ok(());
                    }
                }
                endpoint.close().await;
            }
            Err(e) => error!("{}", e),
        }

        let delay = backoff.next_delay();
        info!("Reconnecting in {:?}", delay);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.cancelled() => return Ok(()),
        }
    }
}
