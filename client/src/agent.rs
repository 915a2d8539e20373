//! # Control-Channel Loop
//!
//! Maintains the persistent WebSocket session with the gateway:
//! connect, announce the local target, echo heartbeats, dispatch frames
//! to the HTTP / TCP / UDP forwarders, and reconnect forever with a
//! fixed delay. On disconnect, every in-flight piece of local work is
//! aborted immediately.

use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use tunlify_protocol::WsMessage;
use url::Url;

use crate::http;
use crate::relay;
use crate::state::{ClientState, StreamEvent, TunnelInfo};
use crate::target::LocalTarget;
use crate::udp;

/// Wait between reconnect attempts.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Unsolicited heartbeat cadence.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("could not reach the gateway: {0}")]
    Http(#[from] reqwest::Error),

    #[error("gateway rejected the connection token (HTTP {0})")]
    Rejected(u16),

    #[error("invalid server URL: {0}")]
    BadServerUrl(String),
}

/// Resolves the token to its tunnel via `POST /tunnels/auth`, before
/// any WebSocket is held.
pub async fn authenticate(
    client: &reqwest::Client,
    server: &str,
    token: &str,
) -> Result<TunnelInfo, AuthError> {
    let url = format!("{}/tunnels/auth", server.trim_end_matches('/'));
    let response = client
        .post(url)
        .json(&serde_json::json!({ "connection_token": token }))
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(AuthError::Rejected(response.status().as_u16()));
    }
    Ok(response.json::<TunnelInfo>().await?)
}

/// `https://api.… → wss://api.…/ws/tunnel?token=…`
pub fn control_url(server: &str, token: &str) -> Result<String, AuthError> {
    let mut url =
        Url::parse(server).map_err(|e| AuthError::BadServerUrl(e.to_string()))?;
    let scheme = if url.scheme() == "http" { "ws" } else { "wss" };
    url.set_scheme(scheme)
        .map_err(|_| AuthError::BadServerUrl(server.to_string()))?;
    url.set_path("/ws/tunnel");
    url.set_query(Some(&format!("token={}", token)));
    Ok(url.to_string())
}

// ─── Main Connection Loop ───────────────────────────────────────

/// Runs the control-channel loop forever: connect, serve, clean up,
/// wait, repeat.
pub async fn run_forever(
    ws_url: String,
    tunnel: TunnelInfo,
    target: LocalTarget,
    state: Arc<ClientState>,
    http_client: reqwest::Client,
) {
    loop {
        info!("connecting control channel for {}", tunnel.tunnel_url);
        match connect_async(ws_url.as_str()).await {
            Ok((ws_stream, _)) => {
                let (mut ws_sink, mut ws_rx) = ws_stream.split();

                // Outbound queue: everything in this process enqueues,
                // one task writes.
                let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
                *state.ws_tx.write().await = Some(tx.clone());

                let outbound = tokio::spawn(async move {
                    while let Some(msg) = rx.recv().await {
                        let text = match serde_json::to_string(&msg) {
                            Ok(text) => text,
                            Err(e) => {
                                error!("frame serialize error: {}", e);
                                continue;
                            }
                        };
                        if ws_sink.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                });

                let _ = tx.send(WsMessage::SetLocalAddress {
                    address: target.describe(),
                });

                // ── Heartbeat Task ──
                let heartbeat_tx = tx.clone();
                let heartbeat = tokio::spawn(async move {
                    loop {
                        tokio::time::sleep(HEARTBEAT_INTERVAL).await;
                        if heartbeat_tx.send(WsMessage::Heartbeat).is_err() {
                            break;
                        }
                    }
                });

                // ── Inbound Loop ──
                while let Some(Ok(msg)) = ws_rx.next().await {
                    match msg {
                        Message::Text(text) => match serde_json::from_str::<WsMessage>(&text) {
                            Ok(frame) => {
                                dispatch(&state, &tx, &target, &http_client, frame).await
                            }
                            Err(e) => debug!("undecodable frame: {}", e),
                        },
                        Message::Close(frame) => {
                            if let Some(frame) = frame {
                                warn!("gateway closed the channel: {}", frame.reason.as_str());
                            }
                            break;
                        }
                        _ => {}
                    }
                }

                // ── Disconnect Cleanup ──
                outbound.abort();
                heartbeat.abort();
                state.reset().await;
                warn!("control channel lost");
            }
            Err(e) => {
                error!("connection failed: {}", e);
            }
        }

        info!("reconnecting in {}s", RECONNECT_DELAY.as_secs());
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

// ─── Frame Dispatcher ───────────────────────────────────────────

/// Handles one frame from the gateway.
async fn dispatch(
    state: &Arc<ClientState>,
    tx: &mpsc::UnboundedSender<WsMessage>,
    target: &LocalTarget,
    http_client: &reqwest::Client,
    frame: WsMessage,
) {
    match frame {
        WsMessage::Connected {
            subdomain,
            region,
            public_url,
            ..
        } => {
            info!("tunnel {}.{} online at {}", subdomain, region, public_url);
        }

        // ── Proxied HTTP request ──
        WsMessage::Request {
            request_id,
            method,
            url,
            headers,
            body,
        } => {
            let tx = tx.clone();
            let target = target.clone();
            let client = http_client.clone();
            let handle = tokio::spawn(async move {
                let reply = http::forward_request(
                    &client, &target, request_id, method, url, headers, body,
                )
                .await;
                let _ = tx.send(reply);
            });
            state.track(handle).await;
        }

        // ── Raw TCP streams ──
        WsMessage::TcpConnect { connection_id } => {
            // Register the data channel before dialing, so frames that
            // race the dial are buffered rather than lost.
            let (data_tx, data_rx) = mpsc::unbounded_channel::<StreamEvent>();
            state
                .tcp_streams
                .write()
                .await
                .insert(connection_id.clone(), data_tx);

            let handle = tokio::spawn(relay::run_tcp_relay(
                connection_id,
                target.addr(),
                tx.clone(),
                state.clone(),
                data_rx,
            ));
            state.track(handle).await;
        }
        WsMessage::TcpData {
            connection_id,
            data,
        } => match BASE64.decode(&data) {
            Ok(bytes) => {
                let streams = state.tcp_streams.read().await;
                match streams.get(&connection_id) {
                    Some(sender) => {
                        let _ = sender.send(StreamEvent::Data(bytes));
                    }
                    None => debug!(connection_id = %connection_id, "data for unknown stream"),
                }
            }
            Err(_) => debug!(connection_id = %connection_id, "undecodable tcp_data payload"),
        },
        WsMessage::TcpClose { connection_id } => {
            let streams = state.tcp_streams.read().await;
            if let Some(sender) = streams.get(&connection_id) {
                let _ = sender.send(StreamEvent::Close);
            }
        }
        WsMessage::TcpError {
            connection_id,
            message,
        } => {
            warn!(connection_id = %connection_id, "gateway aborted stream: {}", message);
            // Dropping the sender ends the relay task's event loop.
            state.tcp_streams.write().await.remove(&connection_id);
        }

        // ── UDP sessions ──
        WsMessage::UdpData {
            session_id,
            data,
            source,
        } => {
            debug!(session_id = %session_id, %source, "datagram received");
            udp::handle_datagram(state, tx, target, session_id, data).await;
        }

        // ── Liveness ──
        WsMessage::Heartbeat => {
            let _ = tx.send(WsMessage::HeartbeatAck);
        }
        WsMessage::HeartbeatAck => {}

        WsMessage::Error {
            request_id,
            message,
        } => {
            warn!(?request_id, "gateway reported: {}", message);
        }

        WsMessage::Unknown => {
            debug!("dropping frame with unknown type");
        }
        other => {
            debug!("dropping client-only frame from gateway: {:?}", other);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_url_swaps_scheme_and_sets_path() {
        let url = control_url("https://api.tunlify.net", "deadbeef").unwrap();
        assert_eq!(url, "wss://api.tunlify.net/ws/tunnel?token=deadbeef");

        let url = control_url("http://localhost:7070/", "tok").unwrap();
        assert_eq!(url, "ws://localhost:7070/ws/tunnel?token=tok");
    }

    #[test]
    fn control_url_rejects_garbage() {
        assert!(control_url("not a url", "tok").is_err());
    }
}
