//! Local proxy for forwarding requests

use std::future::Future;

use reqwest::redirect::Policy;
use tokio::time::Duration;
use webexpose_shared::{CorrelationId, Error, ForwardedRequest, HeaderMultimap, Result, TunnelResponse};

/// Connection-scoped headers that never cross the proxy
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "te",
    "trailer",
    "upgrade",
];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// Headers the HTTP client derives from the rewritten URI and body
fn skip_request_header(name: &str) -> bool {
    is_hop_by_hop(name) || name.eq_ignore_ascii_case("host") || name.eq_ignore_ascii_case("content-length")
}

/// The body is delivered fully buffered, so framing headers are dropped.
/// A HEAD response has no body and its length describes the resource, so it
/// is kept there.
fn skip_response_header(name: &str, head: bool) -> bool {
    is_hop_by_hop(name) || (!head && name.eq_ignore_ascii_case("content-length"))
}

/// What the local service answered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalResponse {
    pub status: u16,
    pub headers: HeaderMultimap,
    pub body: Vec<u8>,
}

impl LocalResponse {
    pub fn into_tunnel_response(self, id: CorrelationId) -> TunnelResponse {
        TunnelResponse {
            id,
            status: self.status,
            headers: self.headers,
            body: self.body,
        }
    }
}

/// Executes a forwarded request whose target already points at the local
/// service
pub trait LocalService: Send + Sync + 'static {
    fn call(&self, request: ForwardedRequest) -> impl Future<Output = Result<LocalResponse>> + Send;
}

/// `LocalService` backed by a pooled reqwest client
#[derive(Clone)]
pub struct HttpService {
    client: reqwest::Client,
}

impl HttpService {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(Policy::none())
            .timeout(timeout)
            .build()
            .map_err(|e| Error::LocalCall(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

impl LocalService for HttpService {
    async fn call(&self, request: ForwardedRequest) -> Result<LocalResponse> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|_| Error::LocalCall(format!("invalid method: {}", request.method)))?;

        let head = method == reqwest::Method::HEAD;
        let mut builder = self.client.request(method, request.target.to_string());
        for (name, value) in request.headers.iter() {
            if !skip_request_header(name) {
                builder = builder.header(name, value);
            }
        }

        let response = builder
            .body(request.body)
            .send()
            .await
            .map_err(|e| Error::LocalCall(e.to_string()))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter(|(k, _)| !skip_response_header(k.as_str(), head))
            .filter_map(|(k, v)| v.to_str().ok().map(|val| (k.as_str(), val)))
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::LocalCall(format!("failed to read response body: {}", e)))?
            .to_vec();

        Ok(LocalResponse { status, headers, body })
    }
}
