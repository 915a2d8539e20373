//! # HTTP Ingress
//!
//! The router fallback: every request the edge proxy forwards for a
//! wildcard hostname lands here, carrying the authoritative
//! `X-Tunnel-Subdomain` / `X-Tunnel-Region` headers. The request is
//! resolved against the catalog and the connection registry, framed,
//! sent down the control channel, and answered from the correlated
//! `response` frame — or from the error taxonomy when anything on that
//! path gives out.

use std::sync::atomic::Ordering;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::{HeaderName, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::debug;
use tunlify_protocol::{
    decode_response_body, encode_body, is_hop_by_hop, sanitize_headers, WsMessage,
};
use uuid::Uuid;

use crate::catalog::Tunnel;
use crate::error::{FieldError, GatewayError};
use crate::pending::TunnelResponse;
use crate::state::AppState;
use crate::validate;

/// Per-request budget for the client's answer.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

/// Fallback handler for all proxied tunnel traffic: any method, any
/// path.
pub async fn handle(State(state): State<AppState>, req: Request) -> Response {
    let subdomain = trusted_header(&req, "x-tunnel-subdomain");
    let region = trusted_header(&req, "x-tunnel-region");
    let (Some(subdomain), Some(region)) = (subdomain, region) else {
        return GatewayError::Validation(vec![FieldError::new(
            "headers",
            "X-Tunnel-Subdomain and X-Tunnel-Region headers are required",
        )])
        .into_response();
    };
    if !validate::subdomain_ok(&subdomain) || !validate::region_ok(&region) {
        return GatewayError::Validation(vec![FieldError::new(
            "headers",
            "malformed X-Tunnel-Subdomain or X-Tunnel-Region header",
        )])
        .into_response();
    }

    let host = state.config.public_host(&subdomain, &region);
    match proxy(state, req, &subdomain, &region).await {
        Ok(response) => response,
        Err(err) => err.into_ingress_response(&host),
    }
}

fn trusted_header(req: &Request, name: &str) -> Option<String> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .filter(|v| !v.is_empty())
}

async fn proxy(
    state: AppState,
    req: Request,
    subdomain: &str,
    region: &str,
) -> Result<Response, GatewayError> {
    let tunnel = state
        .catalog
        .find_active(subdomain, region)
        .await
        .map_err(|_| GatewayError::NotFound)?;
    if !tunnel.client_connected {
        return Err(GatewayError::ClientDisconnected);
    }

    // The catalog and the registry can disagree across a gateway
    // restart; the registry is what actually carries traffic.
    let key = tunnel.key();
    let channel = state
        .registry
        .lookup(&key)
        .ok_or(GatewayError::WebSocketDisconnected)?;

    let method = req.method().clone();
    let url = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let headers = sanitize_headers(
        req.headers()
            .iter()
            .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str(), v))),
    );

    let body = if method == Method::GET || method == Method::HEAD {
        None
    } else {
        let bytes = to_bytes(req.into_body(), MAX_BODY_BYTES).await.map_err(|_| {
            GatewayError::Validation(vec![FieldError::new(
                "body",
                "unreadable or oversized request body",
            )])
        })?;
        if bytes.is_empty() {
            None
        } else {
            Some(encode_body(&bytes))
        }
    };

    let request_id = Uuid::new_v4().to_string();
    debug!(
        tunnel = %key,
        request_id = %request_id,
        method = %method,
        url = %url,
        "forwarding request over control channel"
    );

    // Registration must be visible before the frame is enqueued, so a
    // fast response can never beat its own waiter.
    let rx = state
        .pending
        .register(&request_id, key.clone(), method.as_str(), &url);

    let frame = WsMessage::Request {
        request_id: request_id.clone(),
        method: method.to_string(),
        url,
        headers,
        body,
    };
    if let Err(err) = channel.try_send(frame) {
        state.pending.abandon(&request_id);
        return Err(err);
    }
    channel.requests_sent.fetch_add(1, Ordering::Relaxed);

    match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
        Ok(Ok(Ok(response))) => build_response(&tunnel, response),
        Ok(Ok(Err(err))) => Err(err),
        // The sender was dropped without resolving; only teardown paths
        // do that.
        Ok(Err(_)) => Err(GatewayError::TunnelGone),
        Err(_elapsed) => {
            state.pending.abandon(&request_id);
            Err(GatewayError::Timeout)
        }
    }
}

/// Renders the client's `response` frame onto the ingress socket:
/// status fallback, response-side header filter, fixed tunnel headers,
/// body decoding.
fn build_response(tunnel: &Tunnel, response: TunnelResponse) -> Result<Response, GatewayError> {
    let status = effective_status(&response.status_code);
    let body = decode_response_body(response.encoding, &response.body)
        .map_err(|e| GatewayError::BadGateway(e.to_string()))?;

    let mut builder = Response::builder().status(status);
    for (name, value) in &response.headers {
        if is_hop_by_hop(name) || value.is_empty() {
            continue;
        }
        if let Ok(header_name) = HeaderName::from_bytes(name.as_bytes()) {
            builder = builder.header(header_name, value.as_str());
        }
    }
    builder = builder
        .header("x-tunnel-subdomain", tunnel.subdomain.as_str())
        .header("x-tunnel-region", tunnel.region.as_str())
        .header("x-powered-by", "Tunlify");

    builder
        .body(Body::from(body))
        .map_err(|e| GatewayError::BadGateway(e.to_string()))
}

/// The client's `statusCode` is untrusted JSON; anything that is not a
/// valid HTTP status becomes 200.
fn effective_status(value: &serde_json::Value) -> StatusCode {
    value
        .as_u64()
        .and_then(|code| u16::try_from(code).ok())
        .and_then(|code| StatusCode::from_u16(code).ok())
        .unwrap_or(StatusCode::OK)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::HashMap;
    use tunlify_protocol::BodyEncoding;

    use crate::catalog::{Protocol, TunnelStatus};

    fn tunnel() -> Tunnel {
        Tunnel {
            id: "t1".into(),
            user_id: "u1".into(),
            subdomain: "myapp".into(),
            region: "id".into(),
            service_type: "http".into(),
            protocol: Protocol::Http,
            local_port: 3000,
            remote_port: None,
            connection_token: "tok".into(),
            status: TunnelStatus::Active,
            client_connected: true,
            last_connected: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn status_falls_back_to_200() {
        assert_eq!(effective_status(&serde_json::json!(201)), StatusCode::CREATED);
        assert_eq!(effective_status(&serde_json::json!("teapot")), StatusCode::OK);
        assert_eq!(effective_status(&serde_json::Value::Null), StatusCode::OK);
        assert_eq!(effective_status(&serde_json::json!(42)), StatusCode::OK);
        assert_eq!(effective_status(&serde_json::json!(-1)), StatusCode::OK);
    }

    #[test]
    fn response_headers_are_filtered_and_branded() {
        let response = TunnelResponse {
            status_code: serde_json::json!(200),
            headers: HashMap::from([
                ("content-type".to_string(), "text/html".to_string()),
                ("transfer-encoding".to_string(), "chunked".to_string()),
                ("server".to_string(), "nginx".to_string()),
                ("x-powered-by".to_string(), "Express".to_string()),
            ]),
            encoding: BodyEncoding::Utf8,
            body: "hello".into(),
        };

        let built = build_response(&tunnel(), response).unwrap();
        let headers = built.headers();
        assert_eq!(headers.get("content-type").unwrap(), "text/html");
        assert!(headers.get("transfer-encoding").is_none());
        assert!(headers.get("server").is_none());
        assert_eq!(headers.get("x-powered-by").unwrap(), "Tunlify");
        assert_eq!(headers.get("x-tunnel-subdomain").unwrap(), "myapp");
        assert_eq!(headers.get("x-tunnel-region").unwrap(), "id");
    }

    #[test]
    fn base64_bodies_decode_to_bytes() {
        let raw = [0u8, 159, 146, 150];
        let response = TunnelResponse {
            status_code: serde_json::json!(200),
            headers: HashMap::new(),
            encoding: BodyEncoding::Base64,
            body: encode_body(&raw),
        };
        assert!(build_response(&tunnel(), response).is_ok());

        let malformed = TunnelResponse {
            status_code: serde_json::json!(200),
            headers: HashMap::new(),
            encoding: BodyEncoding::Base64,
            body: "not base64!!!".into(),
        };
        assert!(matches!(
            build_response(&tunnel(), malformed),
            Err(GatewayError::BadGateway(_))
        ));
    }
}
