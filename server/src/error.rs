//! # Gateway Error Model
//!
//! Every failure the core produces is one of the [`GatewayError`] kinds.
//! Errors bubble from the innermost originator to the ingress or REST
//! boundary, where they are translated exactly once into an HTTP status
//! plus a small JSON body. The ingress attaches the public tunnel host to
//! the body; the REST surface renders without it.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::catalog::CatalogError;

/// A single violated validation rule, reported as `{path, msg}`.
#[derive(Debug, Clone, Serialize)]
pub struct FieldError {
    pub path: String,
    pub msg: String,
}

impl FieldError {
    pub fn new(path: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            msg: msg.into(),
        }
    }
}

/// Error kinds produced by the gateway core.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("validation failed")]
    Validation(Vec<FieldError>),

    #[error("invalid or missing connection token")]
    Unauthorized,

    #[error("tunnel not found")]
    NotFound,

    #[error("subdomain '{subdomain}' is already taken in region '{region}'")]
    SubdomainTaken { subdomain: String, region: String },

    #[error("port {port} is already taken in region '{region}'")]
    PortTaken { region: String, port: u16 },

    /// The tunnel exists but its client has not connected.
    #[error("tunnel client is not connected")]
    ClientDisconnected,

    /// The catalog says connected but this gateway holds no registry
    /// entry — typically observed right after a gateway restart.
    #[error("no control channel registered for this tunnel")]
    WebSocketDisconnected,

    /// The control channel's send queue is saturated.
    #[error("control channel send queue is full")]
    QueueFull,

    /// The pending request exceeded its 30-second budget.
    #[error("request timed out waiting for the tunnel client")]
    Timeout,

    /// The client reported a failure or returned a malformed response.
    #[error("tunnel client error: {0}")]
    BadGateway(String),

    /// Delivered to pending waiters when the control channel closes
    /// underneath them.
    #[error("control channel closed while the request was in flight")]
    TunnelGone,

    #[error("no free port available in the allocation range")]
    ExhaustedPortSpace,

    #[error("{0}")]
    Internal(String),
}

/// JSON error body: `{message, error?, tunnel?}`, or `{message, errors}`
/// for validation failures.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tunnel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<FieldError>>,
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Validation(_) => StatusCode::BAD_REQUEST,
            GatewayError::Unauthorized => StatusCode::UNAUTHORIZED,
            GatewayError::NotFound => StatusCode::NOT_FOUND,
            GatewayError::SubdomainTaken { .. } | GatewayError::PortTaken { .. } => {
                StatusCode::CONFLICT
            }
            GatewayError::ClientDisconnected
            | GatewayError::WebSocketDisconnected
            | GatewayError::QueueFull => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::BadGateway(_) | GatewayError::TunnelGone => StatusCode::BAD_GATEWAY,
            GatewayError::ExhaustedPortSpace | GatewayError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// The short machine-readable `error` field, where one applies.
    fn error_code(&self) -> Option<String> {
        match self {
            GatewayError::ClientDisconnected => Some("client_disconnected".into()),
            GatewayError::WebSocketDisconnected => Some("websocket_disconnected".into()),
            GatewayError::QueueFull => Some("channel_busy".into()),
            GatewayError::TunnelGone => Some("tunnel_gone".into()),
            GatewayError::BadGateway(message) => Some(message.clone()),
            GatewayError::ExhaustedPortSpace => Some("exhausted_port_space".into()),
            _ => None,
        }
    }

    /// The human-facing `message` field.
    fn message(&self) -> String {
        match self {
            GatewayError::Validation(_) => "Validation failed".into(),
            GatewayError::Unauthorized => "Invalid or missing connection token".into(),
            GatewayError::NotFound => "Tunnel not found".into(),
            GatewayError::SubdomainTaken { subdomain, region } => {
                format!("Subdomain '{subdomain}' is already taken in region '{region}'")
            }
            GatewayError::PortTaken { region, port } => {
                format!("Port {port} is already taken in region '{region}'")
            }
            GatewayError::ClientDisconnected => {
                "Tunnel client is not connected. Start tunlify-client with your \
                 connection token to bring this tunnel online."
                    .into()
            }
            GatewayError::WebSocketDisconnected => {
                "Tunnel client connection was lost. Waiting for it to reconnect.".into()
            }
            GatewayError::QueueFull => "Tunnel is busy, try again shortly".into(),
            GatewayError::Timeout => "Gateway Timeout".into(),
            GatewayError::BadGateway(_) | GatewayError::TunnelGone => "Bad Gateway".into(),
            GatewayError::ExhaustedPortSpace => "No free port available".into(),
            GatewayError::Internal(msg) => msg.clone(),
        }
    }

    /// Renders the JSON body, optionally naming the public tunnel host.
    pub fn body(&self, tunnel: Option<&str>) -> ErrorBody {
        let errors = match self {
            GatewayError::Validation(list) => Some(list.clone()),
            _ => None,
        };
        ErrorBody {
            message: self.message(),
            error: self.error_code(),
            tunnel: tunnel.map(str::to_string),
            errors,
        }
    }

    /// Ingress-side rendering: status + body with the tunnel host attached.
    pub fn into_ingress_response(self, tunnel_host: &str) -> Response {
        let status = self.status();
        (status, Json(self.body(Some(tunnel_host)))).into_response()
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, Json(self.body(None))).into_response()
    }
}

impl From<CatalogError> for GatewayError {
    fn from(err: CatalogError) -> Self {
        match err {
            CatalogError::NotFound => GatewayError::NotFound,
            CatalogError::SubdomainTaken { subdomain, region } => {
                GatewayError::SubdomainTaken { subdomain, region }
            }
            CatalogError::PortTaken { region, port } => GatewayError::PortTaken { region, port },
            CatalogError::Invalid(msg) => GatewayError::Internal(msg),
        }
    }
}
