//! Relay hub
//!
//! Holds the single active tunnel and runs the correlation protocol on it.
//! Each accepted connection gets its own registry and its own receive task,
//! so tearing down an old connection can never touch requests that were
//! registered against its replacement.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, info, warn};
use webexpose_shared::{Error, ForwardedRequest, Frame, Result, TunnelEndpoint, TunnelResponse};

use crate::registry::CorrelationRegistry;

pub const REASON_LOST: &str = "connection lost";
pub const REASON_SUPERSEDED: &str = "connection superseded";
pub const REASON_SHUTDOWN: &str = "relay shutting down";

/// One accepted tunnel connection
pub struct Tunnel {
    endpoint: TunnelEndpoint,
    registry: CorrelationRegistry,
    connected_at: DateTime<Utc>,
}

impl Tunnel {
    fn new(endpoint: TunnelEndpoint) -> Self {
        Self {
            endpoint,
            registry: CorrelationRegistry::new(),
            connected_at: Utc::now(),
        }
    }

    pub fn peer(&self) -> &str {
        self.endpoint.peer()
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn registry(&self) -> &CorrelationRegistry {
        &self.registry
    }

    /// Send one request down the tunnel and wait for its response.
    ///
    /// The registry entry is gone by the time this returns, whatever the
    /// outcome.
    pub async fn round_trip(
        &self,
        request: ForwardedRequest,
        limit: Duration,
    ) -> Result<TunnelResponse> {
        let id = request.id;
        let pending = self.registry.register(id)?;

        if let Err(e) = self.endpoint.send(&Frame::Request(request)).await {
            self.registry.remove(id);
            return Err(e);
        }
        debug!(%id, peer = %self.peer(), "Request sent, waiting for response");

        pending.wait(limit).await
    }
}

/// Public-side state shared by every HTTP task
#[derive(Clone)]
pub struct RelayHub {
    current: Arc<Mutex<Option<Arc<Tunnel>>>>,
    request_timeout: Duration,
}

impl RelayHub {
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            current: Arc::new(Mutex::new(None)),
            request_timeout,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    fn slot(&self) -> MutexGuard<'_, Option<Arc<Tunnel>>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The active tunnel, or `NoUpstream`
    pub fn current(&self) -> Result<Arc<Tunnel>> {
        self.slot().clone().ok_or(Error::NoUpstream)
    }

    pub fn is_connected(&self) -> bool {
        self.slot().is_some()
    }

    /// Forward a request over whatever tunnel is active right now
    pub async fn forward(&self, request: ForwardedRequest) -> Result<TunnelResponse> {
        let tunnel = self.current()?;
        tunnel.round_trip(request, self.request_timeout).await
    }

    /// Make `endpoint` the active tunnel.
    ///
    /// A previous tunnel is closed and its pending requests are cancelled
    /// before this returns. The returned handle is the new receive task.
    pub async fn attach(&self, endpoint: TunnelEndpoint) -> JoinHandle<()> {
        let tunnel = Arc::new(Tunnel::new(endpoint));
        let previous = self.slot().replace(tunnel.clone());

        match previous {
            Some(old) => {
                info!(old_peer = %old.peer(), peer = %tunnel.peer(), "Replacing active tunnel");
                let cancelled = old.registry.shutdown(REASON_SUPERSEDED);
                if cancelled > 0 {
                    warn!(peer = %old.peer(), cancelled, "Cancelled requests pending on replaced tunnel");
                }
                old.endpoint.close().await;
            }
            None => info!(peer = %tunnel.peer(), "Tunnel connected"),
        }

        tokio::spawn(self.clone().receive_loop(tunnel))
    }

    async fn receive_loop(self, tunnel: Arc<Tunnel>) {
        loop {
            match tunnel.endpoint.receive().await {
                Ok(Frame::Response(response)) => {
                    let id = response.id;
                    match tunnel.registry.resolve(id, response) {
                        Ok(()) => debug!(%id, "Delivered response"),
                        Err(e) => warn!(%id, peer = %tunnel.peer(), "Dropping response: {}", e),
                    }
                }
                Ok(Frame::Request(request)) => {
                    warn!(id = %request.id, peer = %tunnel.peer(), "Ignoring request frame from agent");
                }
                Err(Error::Protocol(e)) => {
                    warn!(peer = %tunnel.peer(), "Skipping malformed frame: {}", e);
                }
                Err(e) => {
                    info!(peer = %tunnel.peer(), "Tunnel receive ended: {}", e);
                    break;
                }
            }
        }

        let cancelled = tunnel.registry.shutdown(REASON_LOST);
        if cancelled > 0 {
            warn!(peer = %tunnel.peer(), cancelled, "Cancelled requests pending on lost tunnel");
        }
        if self.detach(&tunnel) {
            info!(peer = %tunnel.peer(), "Tunnel disconnected");
        }
        tunnel.endpoint.close().await;
    }

    /// Clear the slot if it still holds `tunnel`
    fn detach(&self, tunnel: &Arc<Tunnel>) -> bool {
        let mut slot = self.slot();
        if slot.as_ref().is_some_and(|t| Arc::ptr_eq(t, tunnel)) {
            *slot = None;
            true
        } else {
            false
        }
    }

    /// Close the active tunnel, failing its pending requests
    pub async fn shutdown(&self) {
        let tunnel = self.slot().take();
        if let Some(tunnel) = tunnel {
            info!(peer = %tunnel.peer(), "Closing tunnel for shutdown");
            tunnel.registry.shutdown(REASON_SHUTDOWN);
            tunnel.endpoint.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use webexpose_shared::protocol::new_correlation_id;
    use webexpose_shared::{memory_pair, HeaderMultimap, TargetUri};

    fn request(body: &str) -> ForwardedRequest {
        ForwardedRequest {
            id: new_correlation_id(),
            method: "GET".into(),
            target: TargetUri {
                scheme: "http".into(),
                host: "relay.test".into(),
                path: "/echo".into(),
                query: None,
            },
            headers: HeaderMultimap::new(),
            body: body.as_bytes().to_vec(),
        }
    }

    /// Answer every request with its own body
    fn spawn_echo_agent(endpoint: TunnelEndpoint) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Ok(frame) = endpoint.receive().await {
                if let Frame::Request(req) = frame {
                    let resp = TunnelResponse {
                        id: req.id,
                        status: 200,
                        headers: req.headers,
                        body: req.body,
                    };
                    if endpoint.send(&Frame::Response(resp)).await.is_err() {
                        break;
                    }
                }
            }
        })
    }

    #[tokio::test]
    async fn test_no_upstream() {
        let hub = RelayHub::new(Duration::from_secs(1));
        assert!(!hub.is_connected());
        assert!(matches!(hub.forward(request("x")).await, Err(Error::NoUpstream)));
    }

    #[tokio::test]
    async fn test_round_trip() {
        let hub = RelayHub::new(Duration::from_secs(5));
        let (relay_side, agent_side) = memory_pair(16);
        hub.attach(relay_side).await;
        spawn_echo_agent(agent_side);

        let resp = hub.forward(request("ping")).await.unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, b"ping");
        assert!(hub.current().unwrap().registry().is_empty());
    }

    #[tokio::test]
    async fn test_hundred_concurrent_requests_route_by_id() {
        let hub = RelayHub::new(Duration::from_secs(10));
        let (relay_side, agent_side) = memory_pair(16);
        hub.attach(relay_side).await;
        spawn_echo_agent(agent_side);

        let mut tasks = Vec::new();
        for i in 0..100 {
            let hub = hub.clone();
            tasks.push(tokio::spawn(async move {
                let mut req = request("");
                let tag = format!("{}-{}", i, req.id);
                req.body = tag.clone().into_bytes();
                let resp = hub.forward(req).await.unwrap();
                assert_eq!(resp.body, tag.into_bytes());
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert!(hub.current().unwrap().registry().is_empty());
    }

    #[tokio::test]
    async fn test_timeout_with_silent_agent() {
        let hub = RelayHub::new(Duration::from_millis(50));
        let (relay_side, agent_side) = memory_pair(16);
        hub.attach(relay_side).await;

        let started = Instant::now();
        let res = hub.forward(request("anyone?")).await;
        let elapsed = started.elapsed();

        assert!(matches!(res, Err(Error::Timeout)));
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_millis(500), "took {:?}", elapsed);
        assert!(hub.current().unwrap().registry().is_empty());

        // The agent answers late; the response is dropped and nothing breaks
        let Frame::Request(req) = agent_side.receive().await.unwrap() else {
            panic!("expected a request frame");
        };
        let late = TunnelResponse {
            id: req.id,
            status: 200,
            headers: HeaderMultimap::new(),
            body: b"late".to_vec(),
        };
        agent_side.send(&Frame::Response(late)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(hub.is_connected());
        assert!(hub.current().unwrap().registry().is_empty());
    }

    #[tokio::test]
    async fn test_replacing_tunnel_cancels_pending_once() {
        let hub = RelayHub::new(Duration::from_secs(10));
        let (old_relay, old_agent) = memory_pair(16);
        hub.attach(old_relay).await;
        let old_tunnel = hub.current().unwrap();

        let mut waiting = Vec::new();
        for i in 0..10 {
            let hub = hub.clone();
            waiting.push(tokio::spawn(async move { hub.forward(request(&i.to_string())).await }));
        }
        // all ten requests are on the wire before the swap
        for _ in 0..10 {
            old_agent.receive().await.unwrap();
        }
        assert_eq!(old_tunnel.registry().len(), 10);

        let (new_relay, new_agent) = memory_pair(16);
        hub.attach(new_relay).await;
        spawn_echo_agent(new_agent);

        for w in waiting {
            match w.await.unwrap() {
                Err(Error::Cancelled(reason)) => assert_eq!(reason, REASON_SUPERSEDED),
                other => panic!("expected cancellation, got {:?}", other),
            }
        }
        assert!(old_tunnel.registry().is_empty());

        // the replacement keeps working after the old receive task winds down
        tokio::time::sleep(Duration::from_millis(20)).await;
        let resp = hub.forward(request("fresh")).await.unwrap();
        assert_eq!(resp.body, b"fresh");
        assert!(!Arc::ptr_eq(&old_tunnel, &hub.current().unwrap()));
    }

    #[tokio::test]
    async fn test_lost_connection_cancels_and_detaches() {
        let hub = RelayHub::new(Duration::from_secs(10));
        let (relay_side, agent_side) = memory_pair(16);
        let receive_task = hub.attach(relay_side).await;

        let waiter = {
            let hub = hub.clone();
            tokio::spawn(async move { hub.forward(request("doomed")).await })
        };
        agent_side.receive().await.unwrap();
        agent_side.close().await;

        match waiter.await.unwrap() {
            Err(Error::Cancelled(reason)) => assert_eq!(reason, REASON_LOST),
            other => panic!("expected cancellation, got {:?}", other),
        }
        receive_task.await.unwrap();
        assert!(!hub.is_connected());
        assert!(matches!(hub.forward(request("x")).await, Err(Error::NoUpstream)));
    }

    /// Endpoint whose writes always fail while reads stay open
    fn broken_writer() -> TunnelEndpoint {
        let sink = futures_util::sink::unfold((), |(), _data: Vec<u8>| async {
            Err::<(), _>(Error::SendFailure("peer dropped".into()))
        });
        TunnelEndpoint::new("broken", sink, futures_util::stream::pending::<Result<Vec<u8>>>())
    }

    #[tokio::test]
    async fn test_send_failure_leaves_no_entry() {
        let hub = RelayHub::new(Duration::from_secs(10));
        hub.attach(broken_writer()).await;
        let tunnel = hub.current().unwrap();
        assert!(tunnel.registry().register(new_correlation_id()).is_ok());

        let res = hub.forward(request("x")).await;
        assert!(matches!(res, Err(Error::SendFailure(_))), "got {:?}", res);
        assert!(tunnel.registry().is_empty());
    }
}
