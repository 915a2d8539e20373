//! # L4 Ingress
//!
//! Public TCP/UDP listeners for tunnels with an allocated port. A
//! listener is spawned when the tunnel's control channel authenticates
//! and dies with the channel's cancellation token.
//!
//! TCP: every accepted socket becomes a logical stream on the control
//! channel (`tcp_connect` → ack → `tcp_data` shuttling → `tcp_close`).
//! Bytes are ordered per stream; frames for one stream travel through a
//! single queue, so a close is always observed after the data that
//! preceded it.
//!
//! UDP: one datagram socket per listener. Sessions are keyed by the
//! public `(ip, port)` and reused for 60 seconds of inactivity so
//! `udp_response` frames can route back.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tunlify_protocol::WsMessage;
use uuid::Uuid;

use crate::catalog::{Protocol, Tunnel};
use crate::error::GatewayError;
use crate::registry::ControlChannel;

/// How long the gateway waits for `tcp_connect_ack` / `tcp_error`.
pub const TCP_ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// UDP sessions with no traffic for this long are forgotten.
pub const UDP_SESSION_IDLE: Duration = Duration::from_secs(60);

const READ_BUFFER: usize = 8 * 1024;
const STREAM_QUEUE: usize = 64;

/// Events routed from the control-channel dispatcher to the task owning
/// one inbound TCP connection.
#[derive(Debug)]
pub enum TcpStreamEvent {
    Ack,
    Data(Vec<u8>),
    Close,
    Error(String),
}

/// Return path for one UDP session: the listener socket plus the public
/// peer the reply goes to.
#[derive(Clone)]
pub struct UdpReturnPath {
    pub socket: Arc<UdpSocket>,
    pub peer: SocketAddr,
}

/// Spawns the listener a tunnel needs, if any. HTTP tunnels have none.
pub fn spawn_listeners(bind: IpAddr, channel: &Arc<ControlChannel>, tunnel: &Tunnel) {
    let Some(port) = tunnel.remote_port else {
        return;
    };
    match tunnel.protocol {
        Protocol::Http => {}
        Protocol::Tcp => {
            tokio::spawn(run_tcp_listener(bind, port, channel.clone()));
        }
        Protocol::Udp => {
            tokio::spawn(run_udp_listener(bind, port, channel.clone()));
        }
    }
}

// ─── TCP path ───────────────────────────────────────────────────

async fn run_tcp_listener(bind: IpAddr, port: u16, channel: Arc<ControlChannel>) {
    let listener = match TcpListener::bind((bind, port)).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(tunnel = %channel.key, port, "failed to bind tunnel port: {}", e);
            return;
        }
    };
    info!(tunnel = %channel.key, port, "tcp tunnel listening");

    loop {
        tokio::select! {
            _ = channel.cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(handle_tcp_connection(stream, peer, channel.clone()));
                }
                Err(e) => {
                    warn!(tunnel = %channel.key, port, "accept error: {}", e);
                }
            }
        }
    }
    info!(tunnel = %channel.key, port, "tcp tunnel listener closed");
}

async fn handle_tcp_connection(stream: TcpStream, peer: SocketAddr, channel: Arc<ControlChannel>) {
    let connection_id = Uuid::new_v4().to_string();
    let (event_tx, events) = mpsc::channel(STREAM_QUEUE);
    channel.tcp_streams.insert(connection_id.clone(), event_tx);
    debug!(tunnel = %channel.key, connection_id = %connection_id, %peer, "tcp connection accepted");

    if let Err(e) = shuttle_tcp(stream, &connection_id, &channel, events).await {
        debug!(
            tunnel = %channel.key,
            connection_id = %connection_id,
            "tcp stream ended: {}", e
        );
    }
    channel.tcp_streams.remove(&connection_id);
}

/// Runs one logical stream: open, ack wait, then both shuttle halves.
async fn shuttle_tcp(
    stream: TcpStream,
    connection_id: &str,
    channel: &Arc<ControlChannel>,
    mut events: mpsc::Receiver<TcpStreamEvent>,
) -> Result<(), GatewayError> {
    channel
        .send(WsMessage::TcpConnect {
            connection_id: connection_id.to_string(),
        })
        .await?;

    // The client must confirm the local dial before any bytes move.
    let ack = tokio::select! {
        _ = channel.cancel.cancelled() => return Err(GatewayError::TunnelGone),
        _ = tokio::time::sleep(TCP_ACK_TIMEOUT) => return Err(GatewayError::Timeout),
        ev = events.recv() => ev,
    };
    match ack {
        Some(TcpStreamEvent::Ack) => {}
        Some(TcpStreamEvent::Error(message)) => return Err(GatewayError::BadGateway(message)),
        Some(TcpStreamEvent::Close) | None => return Err(GatewayError::TunnelGone),
        Some(TcpStreamEvent::Data(_)) => {
            return Err(GatewayError::BadGateway("data before connect ack".into()))
        }
    }

    let conn_cancel = channel.cancel.child_token();
    let (mut read_half, mut write_half) = stream.into_split();

    // Inbound socket → client. EOF turns into a tcp_close, through the
    // same queue as the data so ordering holds.
    let reader_cancel = conn_cancel.clone();
    let reader_channel = channel.clone();
    let reader_id = connection_id.to_string();
    let reader = tokio::spawn(async move {
        let mut buf = vec![0u8; READ_BUFFER];
        loop {
            let n = tokio::select! {
                _ = reader_cancel.cancelled() => return,
                r = read_half.read(&mut buf) => match r {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(_) => break,
                },
            };
            let frame = WsMessage::TcpData {
                connection_id: reader_id.clone(),
                data: BASE64.encode(&buf[..n]),
            };
            // A saturated send queue pauses this read loop.
            if reader_channel.send(frame).await.is_err() {
                return;
            }
        }
        let _ = reader_channel
            .send(WsMessage::TcpClose {
                connection_id: reader_id,
            })
            .await;
    });

    // Client → inbound socket. A tcp_close from the client half-closes
    // our write side; the read half keeps draining until its own EOF.
    let mut wait_for_reader = true;
    loop {
        let event = tokio::select! {
            _ = conn_cancel.cancelled() => None,
            ev = events.recv() => ev,
        };
        match event {
            Some(TcpStreamEvent::Data(bytes)) => {
                if write_half.write_all(&bytes).await.is_err() {
                    conn_cancel.cancel();
                    wait_for_reader = false;
                    break;
                }
            }
            Some(TcpStreamEvent::Close) => {
                let _ = write_half.shutdown().await;
                break;
            }
            Some(TcpStreamEvent::Error(message)) => {
                debug!(connection_id = %connection_id, "tcp stream aborted by client: {}", message);
                conn_cancel.cancel();
                wait_for_reader = false;
                break;
            }
            Some(TcpStreamEvent::Ack) => {}
            None => {
                conn_cancel.cancel();
                wait_for_reader = false;
                break;
            }
        }
    }

    if wait_for_reader {
        let _ = reader.await;
    } else {
        reader.abort();
    }
    Ok(())
}

// ─── UDP path ───────────────────────────────────────────────────

struct UdpSession {
    id: String,
    last_seen: Instant,
}

async fn run_udp_listener(bind: IpAddr, port: u16, channel: Arc<ControlChannel>) {
    let socket = match UdpSocket::bind((bind, port)).await {
        Ok(socket) => Arc::new(socket),
        Err(e) => {
            error!(tunnel = %channel.key, port, "failed to bind tunnel port: {}", e);
            return;
        }
    };
    info!(tunnel = %channel.key, port, "udp tunnel listening");

    let mut sessions: HashMap<SocketAddr, UdpSession> = HashMap::new();
    let mut sweep = tokio::time::interval(UDP_SESSION_IDLE);
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        tokio::select! {
            _ = channel.cancel.cancelled() => break,
            _ = sweep.tick() => {
                sessions.retain(|_, session| {
                    let live = session.last_seen.elapsed() < UDP_SESSION_IDLE;
                    if !live {
                        channel.udp_sessions.remove(&session.id);
                    }
                    live
                });
            }
            received = socket.recv_from(&mut buf) => match received {
                Ok((n, peer)) => {
                    let session = sessions.entry(peer).or_insert_with(|| {
                        let id = Uuid::new_v4().to_string();
                        channel.udp_sessions.insert(
                            id.clone(),
                            UdpReturnPath { socket: socket.clone(), peer },
                        );
                        debug!(tunnel = %channel.key, session_id = %id, %peer, "new udp session");
                        UdpSession { id, last_seen: Instant::now() }
                    });
                    session.last_seen = Instant::now();

                    let frame = WsMessage::UdpData {
                        session_id: session.id.clone(),
                        data: BASE64.encode(&buf[..n]),
                        source: peer.to_string(),
                    };
                    // Datagram semantics: a saturated queue drops, never blocks.
                    if channel.try_send(frame).is_err() {
                        debug!(tunnel = %channel.key, "dropping datagram, channel queue unavailable");
                    }
                }
                Err(e) => {
                    warn!(tunnel = %channel.key, port, "udp recv error: {}", e);
                }
            }
        }
    }

    for session in sessions.values() {
        channel.udp_sessions.remove(&session.id);
    }
    info!(tunnel = %channel.key, port, "udp tunnel listener closed");
}
