//! # Management REST Surface
//!
//! The minimal tunnel CRUD contract consumed by the dashboard and by
//! clients probing their token before opening a control channel. Caller
//! identity arrives in the `X-User-Id` header, injected by the account
//! layer in front of the gateway — the same trust model as the edge's
//! `X-Tunnel-*` headers.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::catalog::{generate_token, CatalogError, NewTunnel, Protocol, Tunnel, TunnelStatus};
use crate::error::{FieldError, GatewayError};
use crate::ports;
use crate::services::{self, ServicePreset, SERVICE_PRESETS};
use crate::state::AppState;
use crate::validate;

// ─── Views ──────────────────────────────────────────────────────

/// A tunnel as the API presents it: the row plus computed fields.
#[derive(Debug, Serialize)]
pub struct TunnelView {
    #[serde(flatten)]
    pub tunnel: Tunnel,
    pub tunnel_url: String,
    pub connection_info: ConnectionInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_info: Option<&'static ServicePreset>,
}

#[derive(Debug, Serialize)]
pub struct ConnectionInfo {
    pub host: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub example: String,
}

impl TunnelView {
    pub fn new(tunnel: Tunnel, base_domain: &str) -> Self {
        let host = tunnel.public_host(base_domain);
        let tunnel_url = tunnel.public_url(base_domain);
        let example = match (tunnel.service_type.as_str(), tunnel.remote_port) {
            (_, None) => format!("curl {}", tunnel_url),
            ("ssh", Some(port)) => format!("ssh -p {} user@{}", port, host),
            (_, Some(port)) => format!("{}:{}", host, port),
        };
        let connection_info = ConnectionInfo {
            host,
            port: tunnel.remote_port,
            example,
        };
        Self {
            service_info: services::preset(&tunnel.service_type),
            tunnel_url,
            connection_info,
            tunnel,
        }
    }
}

/// `POST /tunnels` response: the view plus how to bring it online.
#[derive(Debug, Serialize)]
pub struct CreatedTunnel {
    #[serde(flatten)]
    pub view: TunnelView,
    pub setup_instructions: Vec<String>,
}

// ─── Request bodies ─────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateTunnelRequest {
    pub subdomain: Option<String>,
    /// Region code; the dashboard calls this "location".
    pub location: Option<String>,
    pub service_type: Option<String>,
    // Ports are validated as u32 so out-of-range values produce a
    // field error instead of a deserialization failure.
    pub local_port: Option<u32>,
    pub remote_port: Option<u32>,
    pub protocol: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StatusPatch {
    pub status: String,
    pub client_connected: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct AuthRequest {
    pub connection_token: String,
}

fn caller(headers: &HeaderMap) -> Result<String, GatewayError> {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or(GatewayError::Unauthorized)
}

// ─── Handlers ───────────────────────────────────────────────────

/// `GET /tunnels` — the caller's tunnels with computed fields.
pub async fn list_tunnels(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<TunnelView>>, GatewayError> {
    let user_id = caller(&headers)?;
    let tunnels = state.catalog.list(&user_id).await;
    let views = tunnels
        .into_iter()
        .map(|t| TunnelView::new(t, &state.config.base_domain))
        .collect();
    Ok(Json(views))
}

/// `POST /tunnels` — validates, fills preset defaults, allocates a port
/// for TCP/UDP tunnels, and creates the row.
pub async fn create_tunnel(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateTunnelRequest>,
) -> Result<(StatusCode, Json<CreatedTunnel>), GatewayError> {
    let user_id = caller(&headers)?;
    let spec = validate_create(&req)?;

    // The probe-then-insert pair is racy by itself; the catalog's
    // uniqueness invariant is the arbiter, and allocation retries on an
    // insert conflict.
    let mut allocation_retries = 0;
    let tunnel = loop {
        let remote_port = match (spec.protocol, spec.remote_port) {
            (Protocol::Http, _) => None,
            (_, Some(port)) => Some(port),
            (_, None) => Some(ports::allocate(state.catalog.as_ref(), &spec.region).await?),
        };
        let attempt = state
            .catalog
            .create(NewTunnel {
                user_id: user_id.clone(),
                subdomain: spec.subdomain.clone(),
                region: spec.region.clone(),
                service_type: spec.service_type.clone(),
                protocol: spec.protocol,
                local_port: spec.local_port,
                remote_port,
                connection_token: generate_token(),
            })
            .await;
        match attempt {
            Ok(tunnel) => break tunnel,
            Err(CatalogError::PortTaken { .. })
                if spec.remote_port.is_none() && allocation_retries < 3 =>
            {
                allocation_retries += 1;
            }
            Err(e) => return Err(e.into()),
        }
    };

    info!(
        tunnel = %tunnel.key(),
        user = %user_id,
        protocol = %tunnel.protocol,
        "tunnel created"
    );

    let view = TunnelView::new(tunnel, &state.config.base_domain);
    let setup_instructions = vec![
        format!(
            "Run: tunlify-client --token {} --local {}",
            view.tunnel.connection_token, view.tunnel.local_port
        ),
        format!("Then reach your service at {}", view.tunnel_url),
    ];
    Ok((
        StatusCode::CREATED,
        Json(CreatedTunnel {
            view,
            setup_instructions,
        }),
    ))
}

/// `DELETE /tunnels/{id}` — removes the row; an open control channel
/// for the tunnel is closed along with it.
pub async fn delete_tunnel(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<StatusCode, GatewayError> {
    let user_id = caller(&headers)?;
    let tunnel = state.catalog.delete(&id, &user_id).await?;

    if let Some(channel) = state.registry.lookup(&tunnel.key()) {
        if channel.tunnel_id == tunnel.id {
            info!(tunnel = %tunnel.key(), "closing control channel of deleted tunnel");
            channel.close();
        }
    }
    Ok(StatusCode::NO_CONTENT)
}

/// `PATCH /tunnels/{id}/status`
pub async fn update_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(patch): Json<StatusPatch>,
) -> Result<StatusCode, GatewayError> {
    let user_id = caller(&headers)?;
    let status = match patch.status.as_str() {
        "active" => TunnelStatus::Active,
        "inactive" => TunnelStatus::Inactive,
        _ => {
            return Err(GatewayError::Validation(vec![FieldError::new(
                "status",
                "must be 'active' or 'inactive'",
            )]))
        }
    };

    let current = state.catalog.get(&id, &user_id).await?;
    let client_connected = patch.client_connected.unwrap_or(current.client_connected);
    state
        .catalog
        .update_status(&id, status, client_connected, None)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /tunnels/auth` — resolves a connection token to its tunnel.
/// Used by clients to learn their tunnel before holding a WebSocket.
pub async fn auth_tunnel(
    State(state): State<AppState>,
    Json(req): Json<AuthRequest>,
) -> Result<Json<TunnelView>, GatewayError> {
    if !validate::token_ok(&req.connection_token) {
        return Err(GatewayError::Validation(vec![FieldError::new(
            "connection_token",
            "must be 32-64 characters",
        )]));
    }
    let tunnel = state
        .catalog
        .find_by_token(&req.connection_token)
        .await
        .map_err(|_| GatewayError::Unauthorized)?;
    Ok(Json(TunnelView::new(tunnel, &state.config.base_domain)))
}

/// `GET /tunnels/presets` — the service-type catalog.
pub async fn presets() -> Json<&'static [ServicePreset]> {
    Json(SERVICE_PRESETS)
}

// ─── Validation ─────────────────────────────────────────────────

struct ValidatedCreate {
    subdomain: String,
    region: String,
    service_type: String,
    protocol: Protocol,
    local_port: u16,
    remote_port: Option<u16>,
}

/// Applies the validation rule table, collecting every violation into
/// one `{path, msg}` list, then resolves preset defaults.
fn validate_create(req: &CreateTunnelRequest) -> Result<ValidatedCreate, GatewayError> {
    let mut errors = Vec::new();

    let subdomain = match &req.subdomain {
        Some(s) if validate::subdomain_ok(s) => s.clone(),
        Some(_) => {
            errors.push(FieldError::new(
                "subdomain",
                "must be 3-50 lowercase letters, digits, or hyphens",
            ));
            String::new()
        }
        None => {
            errors.push(FieldError::new("subdomain", "is required"));
            String::new()
        }
    };

    let region = match &req.location {
        Some(r) if validate::region_ok(r) => r.clone(),
        Some(_) => {
            errors.push(FieldError::new("location", "must be a 2-10 char region code"));
            String::new()
        }
        None => {
            errors.push(FieldError::new("location", "is required"));
            String::new()
        }
    };

    let preset = match &req.service_type {
        Some(key) => match services::preset(key) {
            Some(preset) => Some(preset),
            None => {
                errors.push(FieldError::new("service_type", "unknown service type"));
                None
            }
        },
        None => {
            errors.push(FieldError::new("service_type", "is required"));
            None
        }
    };

    let protocol = match (&req.protocol, preset) {
        (Some(p), _) => match p.parse::<Protocol>() {
            Ok(protocol) => Some(protocol),
            Err(()) => {
                errors.push(FieldError::new("protocol", "must be http, tcp, or udp"));
                None
            }
        },
        (None, Some(preset)) => Some(preset.protocol),
        (None, None) => None,
    };

    let local_port = match (req.local_port, preset) {
        (Some(port), _) if validate::port_ok(port) => Some(port as u16),
        (Some(_), _) => {
            errors.push(FieldError::new("local_port", "must be 1-65535"));
            None
        }
        (None, Some(preset)) => match preset.default_port {
            Some(port) => Some(port),
            None => {
                errors.push(FieldError::new(
                    "local_port",
                    "is required for this service type",
                ));
                None
            }
        },
        (None, None) => None,
    };

    let remote_port = match req.remote_port {
        Some(port) if validate::port_ok(port) => Some(port as u16),
        Some(_) => {
            errors.push(FieldError::new("remote_port", "must be 1-65535"));
            None
        }
        None => None,
    };
    if protocol == Some(Protocol::Http) && remote_port.is_some() {
        errors.push(FieldError::new(
            "remote_port",
            "http tunnels do not take a remote port",
        ));
    }

    if !errors.is_empty() {
        return Err(GatewayError::Validation(errors));
    }

    // All Options are Some by now; a missing piece produced an error.
    Ok(ValidatedCreate {
        subdomain,
        region,
        service_type: req.service_type.clone().unwrap_or_default(),
        protocol: protocol.unwrap_or(Protocol::Tcp),
        local_port: local_port.unwrap_or(0),
        remote_port,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::catalog::MemoryCatalog;
    use crate::config::ServerConfig;

    fn app_state() -> AppState {
        AppState::new(
            ServerConfig {
                listen_addr: "127.0.0.1:0".parse().unwrap(),
                base_domain: "example".into(),
                l4_bind: "127.0.0.1".parse().unwrap(),
            },
            Arc::new(MemoryCatalog::new()),
        )
    }

    fn auth_headers(user: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-user-id", user.parse().unwrap());
        headers
    }

    fn create_req(subdomain: &str, service: &str) -> CreateTunnelRequest {
        CreateTunnelRequest {
            subdomain: Some(subdomain.into()),
            location: Some("id".into()),
            service_type: Some(service.into()),
            local_port: None,
            remote_port: None,
            protocol: None,
        }
    }

    #[tokio::test]
    async fn create_fills_preset_defaults_and_allocates_a_port() {
        let state = app_state();
        let (status, Json(created)) = create_tunnel(
            State(state.clone()),
            auth_headers("u1"),
            Json(create_req("shell", "ssh")),
        )
        .await
        .unwrap();

        assert_eq!(status, StatusCode::CREATED);
        let tunnel = &created.view.tunnel;
        assert_eq!(tunnel.protocol, Protocol::Tcp);
        assert_eq!(tunnel.local_port, 22);
        assert!(ports::PORT_RANGE.contains(&tunnel.remote_port.unwrap()));
        assert_eq!(tunnel.connection_token.len(), 64);
        assert_eq!(created.view.tunnel_url, format!("shell.id.example:{}", tunnel.remote_port.unwrap()));
    }

    #[tokio::test]
    async fn http_tunnels_get_no_remote_port() {
        let state = app_state();
        let (_, Json(created)) = create_tunnel(
            State(state.clone()),
            auth_headers("u1"),
            Json(create_req("myapp", "http")),
        )
        .await
        .unwrap();

        assert_eq!(created.view.tunnel.protocol, Protocol::Http);
        assert!(created.view.tunnel.remote_port.is_none());
        assert_eq!(created.view.tunnel_url, "https://myapp.id.example");
    }

    #[tokio::test]
    async fn validation_reports_every_violation() {
        let state = app_state();
        let err = create_tunnel(
            State(state),
            auth_headers("u1"),
            Json(CreateTunnelRequest {
                subdomain: Some("AB".into()),
                location: None,
                service_type: Some("gopher".into()),
                local_port: Some(0),
                remote_port: None,
                protocol: None,
            }),
        )
        .await
        .unwrap_err();

        match err {
            GatewayError::Validation(errors) => {
                let paths: Vec<&str> = errors.iter().map(|e| e.path.as_str()).collect();
                assert!(paths.contains(&"subdomain"));
                assert!(paths.contains(&"location"));
                assert!(paths.contains(&"service_type"));
                assert!(paths.contains(&"local_port"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn explicit_port_conflict_is_a_409() {
        let state = app_state();
        let mut req = create_req("first", "ssh");
        req.remote_port = Some(13000);
        create_tunnel(State(state.clone()), auth_headers("u1"), Json(req))
            .await
            .unwrap();

        let mut req = create_req("second", "ssh");
        req.remote_port = Some(13000);
        let err = create_tunnel(State(state), auth_headers("u1"), Json(req))
            .await
            .unwrap_err();

        assert_eq!(err.status(), StatusCode::CONFLICT);
        let body = err.body(None);
        assert!(body.message.contains("13000"));
        assert!(body.message.contains("id"));
    }

    #[tokio::test]
    async fn delete_is_idempotent_via_404() {
        let state = app_state();
        let (_, Json(created)) = create_tunnel(
            State(state.clone()),
            auth_headers("u1"),
            Json(create_req("myapp", "http")),
        )
        .await
        .unwrap();
        let id = created.view.tunnel.id.clone();

        let status = delete_tunnel(
            State(state.clone()),
            auth_headers("u1"),
            Path(id.clone()),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::NO_CONTENT);

        let err = delete_tunnel(State(state), auth_headers("u1"), Path(id))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn auth_resolves_tokens_and_rejects_garbage() {
        let state = app_state();
        let (_, Json(created)) = create_tunnel(
            State(state.clone()),
            auth_headers("u1"),
            Json(create_req("myapp", "http")),
        )
        .await
        .unwrap();

        let Json(view) = auth_tunnel(
            State(state.clone()),
            Json(AuthRequest {
                connection_token: created.view.tunnel.connection_token.clone(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(view.tunnel.subdomain, "myapp");

        let err = auth_tunnel(
            State(state.clone()),
            Json(AuthRequest {
                connection_token: "tooshort".into(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);

        let err = auth_tunnel(
            State(state),
            Json(AuthRequest {
                connection_token: "f".repeat(64),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn list_is_scoped_to_the_caller() {
        let state = app_state();
        create_tunnel(
            State(state.clone()),
            auth_headers("u1"),
            Json(create_req("mine", "http")),
        )
        .await
        .unwrap();
        create_tunnel(
            State(state.clone()),
            auth_headers("u2"),
            Json(create_req("theirs", "http")),
        )
        .await
        .unwrap();

        let Json(views) = list_tunnels(State(state), auth_headers("u1"))
            .await
            .unwrap();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].tunnel.subdomain, "mine");
    }
}
