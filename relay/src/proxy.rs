//! HTTP surface of the relay
//!
//! The tunnel path upgrades to a WebSocket and becomes the active tunnel.
//! Every other request is captured in full, forwarded to the agent, and the
//! agent's answer is rendered back to the public client.

use std::net::SocketAddr;

use axum::{
    body::Body,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    http::{header::CONTENT_LENGTH, header::HOST, request::Parts, HeaderMap, Request, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::{future, SinkExt, StreamExt};
use hyper::header::{HeaderName, HeaderValue};
use tracing::{debug, info, warn};
use webexpose_shared::protocol::{new_correlation_id, MAX_MESSAGE_SIZE};
use webexpose_shared::{
    Error, ForwardedRequest, HeaderMultimap, TargetUri, TunnelEndpoint, TunnelResponse,
};

use crate::config::RelayConfig;
use crate::hub::RelayHub;

#[derive(Clone)]
pub struct AppState {
    hub: RelayHub,
    max_body_bytes: usize,
}

/// Build the relay's router around `hub`
pub fn router(hub: RelayHub, config: &RelayConfig) -> Router {
    let state = AppState {
        hub,
        max_body_bytes: config.max_body_bytes,
    };

    Router::new()
        .route(&config.tunnel_path, get(ws_handler))
        .route(&config.health_path, get(health_handler))
        .fallback(proxy_handler)
        .with_state(state)
}

fn remote_label(remote: Option<ConnectInfo<SocketAddr>>) -> String {
    remote
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    remote: Option<ConnectInfo<SocketAddr>>,
) -> impl IntoResponse {
    let peer = remote_label(remote);
    info!(remote_ip = %peer, "New tunnel client");

    ws.max_message_size(MAX_MESSAGE_SIZE)
        .max_frame_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| async move {
            state.hub.attach(websocket_endpoint(peer, socket)).await;
        })
}

/// Adapt an upgraded axum WebSocket into a tunnel endpoint
pub fn websocket_endpoint(peer: String, socket: WebSocket) -> TunnelEndpoint {
    let (sender, receiver) = socket.split();

    let sink = sender
        .sink_map_err(|e| Error::SendFailure(e.to_string()))
        .with(|data: Vec<u8>| future::ready(Ok::<_, Error>(Message::Binary(data))));

    let stream = receiver.filter_map(|msg| {
        future::ready(match msg {
            Ok(Message::Binary(data)) => Some(Ok(data)),
            Ok(Message::Text(text)) => Some(Ok(text.into_bytes())),
            // ping/pong are answered by the socket; close ends the stream
            Ok(_) => None,
            Err(e) => Some(Err(Error::ReceiveFailure(e.to_string()))),
        })
    });

    TunnelEndpoint::new(peer, sink, stream)
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let body = match state.hub.current() {
        Ok(tunnel) => serde_json::json!({
            "tunnel_connected": true,
            "peer": tunnel.peer(),
            "connected_at": tunnel.connected_at().to_rfc3339(),
            "pending_requests": tunnel.registry().len(),
        }),
        Err(_) => serde_json::json!({
            "tunnel_connected": false,
            "peer": null,
            "connected_at": null,
            "pending_requests": 0,
        }),
    };
    Json(body)
}

async fn proxy_handler(
    State(state): State<AppState>,
    remote: Option<ConnectInfo<SocketAddr>>,
    req: Request<Body>,
) -> Response {
    let remote_ip = remote_label(remote);
    let method = req.method().to_string();
    let uri = req.uri().to_string();
    debug!(%remote_ip, %method, %uri, "Received request");

    // Nothing to forward to: fail before touching the body
    if let Err(e) = state.hub.current() {
        warn!(%remote_ip, %method, %uri, "There is no tunnel to forward to");
        return error_response(&e);
    }

    let (parts, body) = req.into_parts();
    if declared_length(&parts.headers).is_some_and(|len| len > state.max_body_bytes) {
        return (StatusCode::PAYLOAD_TOO_LARGE, "Request body too large").into_response();
    }
    let body = match axum::body::to_bytes(body, state.max_body_bytes).await {
        Ok(b) => b.to_vec(),
        Err(e) => {
            warn!(%remote_ip, %method, %uri, "Failed to read request body: {}", e);
            return (StatusCode::BAD_REQUEST, "Failed to read request body").into_response();
        }
    };

    let request = ForwardedRequest {
        id: new_correlation_id(),
        method,
        target: target_uri(&parts),
        headers: collect_headers(&parts.headers),
        body,
    };
    let id = request.id;

    // The tunnel may have been replaced while the body was uploading
    match state.hub.forward(request).await {
        Ok(resp) => {
            debug!(%id, %remote_ip, status = resp.status, "Received response");
            render_response(resp)
        }
        Err(e) => {
            warn!(%id, %remote_ip, %uri, "Forwarding failed: {}", e);
            error_response(&e)
        }
    }
}

fn declared_length(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// Absolute target of the public request; origin-form URIs take the host
/// from the `Host` header
fn target_uri(parts: &Parts) -> TargetUri {
    let uri = &parts.uri;
    let host = uri
        .authority()
        .map(|a| a.to_string())
        .or_else(|| {
            parts
                .headers
                .get(HOST)
                .and_then(|h| h.to_str().ok())
                .map(String::from)
        })
        .unwrap_or_default();

    TargetUri {
        scheme: uri.scheme_str().unwrap_or("http").to_string(),
        host,
        path: uri.path().to_string(),
        query: uri.query().map(String::from),
    }
}

fn collect_headers(headers: &HeaderMap) -> HeaderMultimap {
    headers
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|val| (k.as_str(), val)))
        .collect()
}

fn render_response(resp: TunnelResponse) -> Response {
    let status = match StatusCode::from_u16(resp.status) {
        Ok(status) => status,
        Err(_) => {
            warn!(id = %resp.id, status = resp.status, "Agent returned an invalid status");
            return (StatusCode::BAD_GATEWAY, "Invalid upstream status").into_response();
        }
    };

    let mut builder = hyper::Response::builder().status(status);
    if let Some(headers_mut) = builder.headers_mut() {
        for (k, v) in resp.headers.iter() {
            match (HeaderName::from_bytes(k.as_bytes()), HeaderValue::from_str(v)) {
                (Ok(hn), Ok(hv)) => {
                    headers_mut.append(hn, hv);
                }
                _ => debug!(id = %resp.id, header = %k, "Skipping invalid response header"),
            }
        }
    }

    match builder.body(Body::from(resp.body)) {
        Ok(r) => r.into_response(),
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Response build error").into_response(),
    }
}

pub fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::Timeout => StatusCode::GATEWAY_TIMEOUT,
        Error::NoUpstream
        | Error::SendFailure(_)
        | Error::ReceiveFailure(_)
        | Error::Cancelled(_)
        | Error::Connection(_)
        | Error::Protocol(_)
        | Error::LocalCall(_)
        | Error::UnknownCorrelation(_)
        | Error::Io(_) => StatusCode::BAD_GATEWAY,
        Error::DuplicateId(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: &Error) -> Response {
    let message = match err {
        Error::NoUpstream => "No upstream connected",
        Error::Timeout => "Timeout",
        Error::Cancelled(_) => "Upstream closed",
        Error::SendFailure(_) => "Upstream send failed",
        _ => "Bad gateway",
    };
    (status_for(err), message).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(&Error::NoUpstream), StatusCode::BAD_GATEWAY);
        assert_eq!(status_for(&Error::Timeout), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(status_for(&Error::Cancelled("connection lost".into())), StatusCode::BAD_GATEWAY);
        assert_eq!(status_for(&Error::SendFailure("closed".into())), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_target_from_origin_form() {
        let (parts, _) = Request::builder()
            .uri("/foo?bar=1")
            .header(HOST, "public.example.com")
            .body(())
            .unwrap()
            .into_parts();
        let target = target_uri(&parts);
        assert_eq!(target.to_string(), "http://public.example.com/foo?bar=1");
    }

    #[test]
    fn test_target_from_absolute_form() {
        let (parts, _) = Request::builder()
            .uri("https://other.example.com:8443/a/b")
            .header(HOST, "ignored")
            .body(())
            .unwrap()
            .into_parts();
        let target = target_uri(&parts);
        assert_eq!(target.scheme, "https");
        assert_eq!(target.host, "other.example.com:8443");
        assert_eq!(target.query, None);
    }

    #[test]
    fn test_collect_headers_keeps_every_value() {
        let mut headers = HeaderMap::new();
        headers.append("x-multi", HeaderValue::from_static("1"));
        headers.append("x-multi", HeaderValue::from_static("2"));
        headers.append("x-binary", HeaderValue::from_bytes(b"\xff").unwrap());
        let collected = collect_headers(&headers);
        assert_eq!(collected.get_all("X-Multi"), ["1", "2"]);
        assert!(!collected.contains("x-binary"));
    }

    #[test]
    fn test_render_response_with_repeated_headers() {
        let resp = TunnelResponse {
            id: new_correlation_id(),
            status: 201,
            headers: [("Set-Cookie", "a=1"), ("Set-Cookie", "b=2"), ("Bad Name", "x")]
                .into_iter()
                .collect(),
            body: b"created".to_vec(),
        };
        let rendered = render_response(resp);
        assert_eq!(rendered.status(), StatusCode::CREATED);
        let cookies: Vec<_> = rendered.headers().get_all("set-cookie").iter().collect();
        assert_eq!(cookies.len(), 2);
    }

    #[test]
    fn test_render_invalid_status() {
        let resp = TunnelResponse {
            id: new_correlation_id(),
            status: 42,
            headers: HeaderMultimap::new(),
            body: Vec::new(),
        };
        assert_eq!(render_response(resp).status(), StatusCode::BAD_GATEWAY);
    }
}
