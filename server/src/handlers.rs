//! # Control-Channel Handlers
//!
//! The WebSocket side of the gateway:
//! - Upgrading `/ws/tunnel?token=…` and authenticating the token once
//! - Registering the channel (last-writer-wins) and spawning its
//!   single-writer outbound task, heartbeat task, and L4 listeners
//! - Dispatching incoming frames to the pending table, TCP streams, and
//!   UDP sessions
//! - The close broadcast: registry compare-and-delete, pending
//!   cancellation, catalog flags

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message, Utf8Bytes, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::Utc;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tunlify_protocol::WsMessage;

use crate::catalog::{Tunnel, TunnelStatus};
use crate::error::GatewayError;
use crate::l4::{self, TcpStreamEvent};
use crate::pending::TunnelResponse;
use crate::registry::ControlChannel;
use crate::state::AppState;

/// How often the server probes a quiet channel.
const SERVER_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);

#[derive(Deserialize)]
pub struct ControlQuery {
    token: Option<String>,
}

// ─── WebSocket Upgrade Endpoint ─────────────────────────────────

/// `GET /ws/tunnel?token=…` — upgrades to the control channel.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<ControlQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_control(socket, state, query.token))
}

// ─── Connection Lifecycle ───────────────────────────────────────

/// Manages the full lifecycle of one control channel.
///
/// ## Flow:
/// 1. Authenticate the token against the catalog (once, on open)
/// 2. Mark the tunnel active, register the channel, spawn L4 listeners
/// 3. Send the `connected` greeting
/// 4. Spawn the single-writer outbound task and the heartbeat prober
/// 5. Dispatch inbound frames until close or cancellation
/// 6. Tear down: registry, pending requests, catalog flags
async fn handle_control(socket: WebSocket, state: AppState, token: Option<String>) {
    let tunnel = match authenticate(&state, token.as_deref()).await {
        Ok(tunnel) => tunnel,
        Err(reason) => {
            close_with_policy(socket, reason).await;
            return;
        }
    };

    let key = tunnel.key();
    info!(tunnel = %key, user = %tunnel.user_id, "control channel authenticated");

    if let Err(e) = state
        .catalog
        .update_status(&tunnel.id, TunnelStatus::Active, true, Some(Utc::now()))
        .await
    {
        warn!(tunnel = %key, "failed to mark tunnel active: {}", e);
    }

    let (channel, send_queue) =
        ControlChannel::new(tunnel.id.clone(), key.clone(), tunnel.user_id.clone());

    // Last-writer-wins: any previous holder of the key is closed by the
    // insert; its own cleanup path runs without touching our entry.
    state.registry.insert(channel.clone());
    l4::spawn_listeners(state.config.l4_bind, &channel, &tunnel);

    let _ = channel.try_send(WsMessage::Connected {
        tunnel_id: tunnel.id.clone(),
        subdomain: tunnel.subdomain.clone(),
        region: tunnel.region.clone(),
        public_url: tunnel.public_url(&state.config.base_domain),
    });

    let (ws_sink, mut ws_stream) = socket.split();

    // ── Outbound Task ──
    // The single writer: drains the bounded queue and performs the
    // socket writes. Everything else only enqueues.
    let writer = tokio::spawn(run_writer(ws_sink, send_queue, channel.cancel.clone()));

    // ── Heartbeat Task ──
    let heartbeat_channel = channel.clone();
    let heartbeat = tokio::spawn(async move {
        let mut tick = tokio::time::interval(SERVER_HEARTBEAT_INTERVAL);
        tick.tick().await; // the first tick fires immediately
        loop {
            tokio::select! {
                _ = heartbeat_channel.cancel.cancelled() => break,
                _ = tick.tick() => {
                    // A full queue means traffic is flowing anyway.
                    let _ = heartbeat_channel.try_send(WsMessage::Heartbeat);
                }
            }
        }
    });

    // ── Inbound Loop ──
    loop {
        let frame = tokio::select! {
            _ = channel.cancel.cancelled() => break,
            frame = ws_stream.next() => frame,
        };
        match frame {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<WsMessage>(&text) {
                Ok(msg) => dispatch(&state, &channel, msg).await,
                Err(e) => debug!(tunnel = %channel.key, "undecodable frame: {}", e),
            },
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {} // binary frames and websocket pings are ignored
            Some(Err(e)) => {
                debug!(tunnel = %channel.key, "control socket error: {}", e);
                break;
            }
        }
    }

    // ── Cleanup on Disconnect ──
    channel.close();
    heartbeat.abort();
    let _ = writer.await;
    teardown(&state, &channel, &tunnel).await;
}

/// Validates the token shape, then resolves it in the catalog.
async fn authenticate(state: &AppState, token: Option<&str>) -> Result<Tunnel, &'static str> {
    let token = token.ok_or("missing connection token")?;
    if token.len() < 32 || token.len() > 64 {
        return Err("malformed connection token");
    }
    state
        .catalog
        .find_by_token(token)
        .await
        .map_err(|_| "invalid connection token")
}

/// Closes an unauthenticated socket with a policy-violation code. No
/// further interaction happens on this connection.
async fn close_with_policy(mut socket: WebSocket, reason: &'static str) {
    warn!("rejecting control channel: {}", reason);
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::POLICY,
            reason: Utf8Bytes::from_static(reason),
        })))
        .await;
}

/// Serializes queued frames onto the socket until the queue or the
/// channel dies, then says goodbye.
async fn run_writer(
    mut sink: SplitSink<WebSocket, Message>,
    mut queue: mpsc::Receiver<WsMessage>,
    cancel: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = queue.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };
        let text = match serde_json::to_string(&msg) {
            Ok(text) => text,
            Err(e) => {
                error!("frame serialize error: {}", e);
                continue;
            }
        };
        if sink.send(Message::Text(text.into())).await.is_err() {
            cancel.cancel();
            break;
        }
    }
    let _ = sink.send(Message::Close(None)).await;
}

// ─── Message Dispatcher ─────────────────────────────────────────

/// Handles one inbound frame from the client.
async fn dispatch(state: &AppState, channel: &Arc<ControlChannel>, msg: WsMessage) {
    match msg {
        // ── HTTP correlation ──
        WsMessage::Response {
            request_id,
            status_code,
            headers,
            encoding,
            body,
        } => {
            channel.responses_received.fetch_add(1, Ordering::Relaxed);
            let delivered = state.pending.complete(
                &request_id,
                TunnelResponse {
                    status_code,
                    headers,
                    encoding,
                    body,
                },
            );
            if !delivered {
                debug!(
                    tunnel = %channel.key,
                    request_id = %request_id,
                    "response for unknown request id"
                );
            }
        }
        WsMessage::Error {
            request_id: Some(request_id),
            message,
        } => {
            if !state
                .pending
                .fail(&request_id, GatewayError::BadGateway(message))
            {
                debug!(
                    tunnel = %channel.key,
                    request_id = %request_id,
                    "error for unknown request id"
                );
            }
        }
        WsMessage::Error {
            request_id: None,
            message,
        } => {
            warn!(tunnel = %channel.key, "client reported: {}", message);
        }

        // ── TCP return path ──
        WsMessage::TcpConnectAck { connection_id } => {
            route_tcp(channel, &connection_id, TcpStreamEvent::Ack).await;
        }
        WsMessage::TcpData {
            connection_id,
            data,
        } => match BASE64.decode(&data) {
            Ok(bytes) => route_tcp(channel, &connection_id, TcpStreamEvent::Data(bytes)).await,
            Err(_) => debug!(connection_id = %connection_id, "undecodable tcp_data payload"),
        },
        WsMessage::TcpClose { connection_id } => {
            route_tcp(channel, &connection_id, TcpStreamEvent::Close).await;
        }
        WsMessage::TcpError {
            connection_id,
            message,
        } => {
            route_tcp(channel, &connection_id, TcpStreamEvent::Error(message)).await;
        }

        // ── UDP return path ──
        WsMessage::UdpResponse { session_id, data } => {
            let Some(route) = channel
                .udp_sessions
                .get(&session_id)
                .map(|e| e.value().clone())
            else {
                debug!(session_id = %session_id, "udp_response for unknown session");
                return;
            };
            match BASE64.decode(&data) {
                Ok(bytes) => {
                    if let Err(e) = route.socket.send_to(&bytes, route.peer).await {
                        debug!(session_id = %session_id, "udp reply send failed: {}", e);
                    }
                }
                Err(_) => debug!(session_id = %session_id, "undecodable udp_response payload"),
            }
        }

        // ── Liveness ──
        WsMessage::Heartbeat => {
            channel.touch_heartbeat();
            let _ = channel.try_send(WsMessage::HeartbeatAck);
        }
        WsMessage::HeartbeatAck => channel.touch_heartbeat(),

        // ── Advisory ──
        WsMessage::SetLocalAddress { address } => {
            info!(tunnel = %channel.key, "client forwards to local address {}", address);
        }

        WsMessage::Unknown => {
            debug!(tunnel = %channel.key, "dropping frame with unknown type");
        }
        other => {
            debug!(tunnel = %channel.key, "dropping server-only frame from client: {:?}", other);
        }
    }
}

/// Forwards an event to the task owning one logical TCP stream. Waiting
/// for queue space here propagates per-stream backpressure onto the
/// control channel's inbound loop.
async fn route_tcp(channel: &ControlChannel, connection_id: &str, event: TcpStreamEvent) {
    let Some(tx) = channel
        .tcp_streams
        .get(connection_id)
        .map(|e| e.value().clone())
    else {
        debug!(connection_id = %connection_id, "frame for unknown tcp stream");
        return;
    };
    let _ = tx.send(event).await;
}

// ─── Teardown ───────────────────────────────────────────────────

/// The close broadcast: runs once per channel, after the inbound loop
/// ends for any reason.
async fn teardown(state: &AppState, channel: &Arc<ControlChannel>, tunnel: &Tunnel) {
    let removed = state
        .registry
        .remove_if_current(&channel.key, channel.channel_id);
    let cancelled = state.pending.cancel_by_tunnel_key(&channel.key);

    channel.tcp_streams.clear();
    channel.udp_sessions.clear();

    // A displaced channel must not clobber the catalog flags its
    // replacement just set.
    if removed {
        if let Err(e) = state
            .catalog
            .update_status(&tunnel.id, TunnelStatus::Inactive, false, None)
            .await
        {
            warn!(tunnel = %channel.key, "failed to mark tunnel inactive: {}", e);
        }
    }

    info!(
        tunnel = %channel.key,
        channel_id = %channel.channel_id,
        user = %channel.peer,
        uptime = ?channel.opened_at.elapsed(),
        cancelled_requests = cancelled,
        requests = channel.requests_sent.load(Ordering::Relaxed),
        responses = channel.responses_received.load(Ordering::Relaxed),
        "control channel closed"
    );
}
