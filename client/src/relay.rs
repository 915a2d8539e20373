//! # TCP ↔ Control-Channel Relay
//!
//! One task per logical stream: dials the local endpoint in answer to a
//! `tcp_connect`, then shuttles bytes both ways. Local reads become
//! `tcp_data` frames; `tcp_data` from the gateway is written to the
//! local socket. EOF on either side turns into a `tcp_close`, which
//! half-closes the corresponding side.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use tunlify_protocol::WsMessage;

use crate::state::{ClientState, StreamEvent};

const READ_BUFFER: usize = 8 * 1024;

/// Runs one logical stream against the local endpoint.
///
/// The data channel must be registered in `state.tcp_streams` before
/// this task starts, so frames arriving while the dial is in progress
/// are buffered instead of dropped.
pub async fn run_tcp_relay(
    connection_id: String,
    addr: String,
    ws_tx: mpsc::UnboundedSender<WsMessage>,
    state: Arc<ClientState>,
    mut events: mpsc::UnboundedReceiver<StreamEvent>,
) {
    let stream = match TcpStream::connect(&addr).await {
        Ok(stream) => stream,
        Err(e) => {
            error!(connection_id = %connection_id, "failed to connect {}: {}", addr, e);
            state.tcp_streams.write().await.remove(&connection_id);
            let _ = ws_tx.send(WsMessage::TcpError {
                connection_id,
                message: e.to_string(),
            });
            return;
        }
    };
    info!(connection_id = %connection_id, "connected to local {}", addr);
    let _ = ws_tx.send(WsMessage::TcpConnectAck {
        connection_id: connection_id.clone(),
    });

    let (mut read_half, mut write_half) = stream.into_split();

    // ── Local → gateway ──
    // The close frame travels through the same queue as the data, after
    // it, so the gateway observes them in order.
    let reader_id = connection_id.clone();
    let reader_tx = ws_tx.clone();
    let reader = tokio::spawn(async move {
        let mut buf = vec![0u8; READ_BUFFER];
        loop {
            match read_half.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let frame = WsMessage::TcpData {
                        connection_id: reader_id.clone(),
                        data: BASE64.encode(&buf[..n]),
                    };
                    if reader_tx.send(frame).is_err() {
                        return;
                    }
                }
                Err(_) => break,
            }
        }
        let _ = reader_tx.send(WsMessage::TcpClose {
            connection_id: reader_id,
        });
    });

    // ── Gateway → local ──
    // A close from the gateway shuts down our write side only; the
    // reader keeps draining the local socket until its own EOF.
    let mut wait_for_reader = true;
    while let Some(event) = events.recv().await {
        match event {
            StreamEvent::Data(bytes) => {
                if write_half.write_all(&bytes).await.is_err() {
                    wait_for_reader = false;
                    break;
                }
            }
            StreamEvent::Close => {
                let _ = write_half.shutdown().await;
                break;
            }
        }
    }
    // A dropped channel means the stream was torn down remotely.
    if wait_for_reader {
        let _ = reader.await;
    } else {
        reader.abort();
    }

    state.tcp_streams.write().await.remove(&connection_id);
    debug!(connection_id = %connection_id, "tcp relay finished");
}
