//! Forwarding agent
//!
//! Receives forwarded requests from the tunnel, points them at the local
//! service, and sends each answer back under the same correlation id.
//! Receiving is sequential; local calls run on their own tasks, bounded by a
//! semaphore. A failed request is logged and dropped so the relay side times
//! out; it never takes the tunnel down.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use webexpose_shared::{Error, ForwardedRequest, Frame, Result, TunnelEndpoint};

use crate::config::LocalScheme;
use crate::proxy::LocalService;

pub struct ForwardingAgent<S> {
    service: Arc<S>,
    local_server: String,
    local_scheme: LocalScheme,
    limiter: Arc<Semaphore>,
}

impl<S: LocalService> ForwardingAgent<S> {
    /// `concurrency` caps in-flight local calls; 1 handles requests strictly
    /// one at a time
    pub fn new(service: S, local_server: impl Into<String>, local_scheme: LocalScheme, concurrency: usize) -> Self {
        Self {
            service: Arc::new(service),
            local_server: local_server.into(),
            local_scheme,
            limiter: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    pub fn local_server(&self) -> &str {
        &self.local_server
    }

    /// Point the request at the local service, leaving everything else alone
    pub fn rewrite(&self, request: &mut ForwardedRequest) {
        request
            .target
            .rewrite_origin(self.local_scheme.as_str(), &self.local_server);
    }

    /// Serve requests until the tunnel is lost.
    ///
    /// Always ends with the error that stopped the loop; re-dialing is the
    /// caller's job.
    pub async fn run(&self, endpoint: Arc<TunnelEndpoint>) -> Result<()> {
        loop {
            let frame = match endpoint.receive().await {
                Ok(frame) => frame,
                Err(Error::Protocol(e)) => {
                    warn!("Skipping malformed frame: {}", e);
                    continue;
                }
                Err(e) => return Err(e),
            };

            let mut request = match frame {
                Frame::Request(request) => request,
                Frame::Response(response) => {
                    warn!(id = %response.id, "Ignoring response frame from relay");
                    continue;
                }
            };
            self.rewrite(&mut request);

            let permit = tokio::select! {
                permit = self.limiter.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return Err(Error::Connection("agent stopped".into())),
                },
                _ = endpoint.closed() => {
                    return Err(Error::ReceiveFailure("tunnel closed".into()));
                }
            };

            let service = self.service.clone();
            let endpoint = endpoint.clone();
            tokio::spawn(async move {
                let id = request.id;
                if let Err(e) = forward_one(&*service, &endpoint, request).await {
                    warn!(%id, "Failed to handle request: {}", e);
                }
                drop(permit);
            });
        }
    }
}

async fn forward_one<S: LocalService>(
    service: &S,
    endpoint: &TunnelEndpoint,
    request: ForwardedRequest,
) -> Result<()> {
    let id = request.id;
    let method = request.method.clone();
    let target = request.target.to_string();
    let started = Instant::now();

    debug!(%id, %method, %target, "Proxying request");
    let response = service.call(request).await?;
    let status = response.status;

    endpoint
        .send(&Frame::Response(response.into_tunnel_response(id)))
        .await?;

    info!(
        %id,
        %method,
        %target,
        status,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Proxied request"
    );
    Ok(())
}
