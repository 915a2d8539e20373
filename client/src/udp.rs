//! # UDP Session Forwarding
//!
//! Each `udp_data` session gets its own local socket connected to the
//! target. Datagrams from the gateway go out on it; anything the local
//! service sends back within the session window returns as
//! `udp_response` frames. Sessions end after 60 seconds of silence.

use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, error};
use tunlify_protocol::WsMessage;

use crate::state::ClientState;
use crate::target::LocalTarget;

/// Reply window: a session with no traffic for this long is dropped.
pub const SESSION_WINDOW: Duration = Duration::from_secs(60);

/// Routes one inbound datagram into its session, creating the session
/// task on first sight.
pub async fn handle_datagram(
    state: &Arc<ClientState>,
    ws_tx: &mpsc::UnboundedSender<WsMessage>,
    target: &LocalTarget,
    session_id: String,
    data: String,
) {
    let Ok(bytes) = BASE64.decode(&data) else {
        debug!(session_id = %session_id, "undecodable udp_data payload");
        return;
    };

    let existing = {
        let sessions = state.udp_sessions.read().await;
        sessions.get(&session_id).cloned()
    };
    let sender = match existing {
        Some(sender) => sender,
        None => {
            let (tx, rx) = mpsc::unbounded_channel();
            state
                .udp_sessions
                .write()
                .await
                .insert(session_id.clone(), tx.clone());
            let handle = tokio::spawn(run_session(
                session_id.clone(),
                target.addr(),
                ws_tx.clone(),
                state.clone(),
                rx,
            ));
            state.track(handle).await;
            tx
        }
    };
    let _ = sender.send(bytes);
}

async fn run_session(
    session_id: String,
    addr: String,
    ws_tx: mpsc::UnboundedSender<WsMessage>,
    state: Arc<ClientState>,
    mut outgoing: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    let socket = match bind_and_connect(&addr).await {
        Ok(socket) => socket,
        Err(e) => {
            error!(session_id = %session_id, "udp session setup failed for {}: {}", addr, e);
            state.udp_sessions.write().await.remove(&session_id);
            return;
        }
    };

    let mut buf = vec![0u8; 64 * 1024];
    loop {
        // The sleep restarts every iteration, so it fires only after a
        // full window of silence.
        tokio::select! {
            out = outgoing.recv() => match out {
                Some(bytes) => {
                    if let Err(e) = socket.send(&bytes).await {
                        debug!(session_id = %session_id, "udp send failed: {}", e);
                        break;
                    }
                }
                None => break,
            },
            reply = socket.recv(&mut buf) => match reply {
                Ok(n) => {
                    let frame = WsMessage::UdpResponse {
                        session_id: session_id.clone(),
                        data: BASE64.encode(&buf[..n]),
                    };
                    if ws_tx.send(frame).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!(session_id = %session_id, "udp recv failed: {}", e);
                    break;
                }
            },
            _ = tokio::time::sleep(SESSION_WINDOW) => {
                debug!(session_id = %session_id, "udp session idle, closing");
                break;
            }
        }
    }

    state.udp_sessions.write().await.remove(&session_id);
}

async fn bind_and_connect(addr: &str) -> std::io::Result<UdpSocket> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(addr).await?;
    Ok(socket)
}
