//! # Client State
//!
//! Shared state of the relay process: the tunnel it serves, the
//! outbound frame queue, and the routing tables for in-flight TCP
//! streams and UDP sessions. Everything is torn down in one sweep when
//! the control channel drops.

use std::collections::HashMap;

use serde::Deserialize;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::info;
use tunlify_protocol::WsMessage;

/// Mirror of the gateway's protocol column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelProtocol {
    Http,
    Tcp,
    Udp,
}

/// What `POST /tunnels/auth` tells us about our tunnel.
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelInfo {
    pub subdomain: String,
    pub region: String,
    pub protocol: TunnelProtocol,
    pub tunnel_url: String,
}

/// Events routed to the task owning one local TCP connection.
#[derive(Debug)]
pub enum StreamEvent {
    Data(Vec<u8>),
    Close,
}

/// Central relay state, shared via `Arc<ClientState>`.
pub struct ClientState {
    /// Outbound frame queue of the current control channel. `None`
    /// while disconnected.
    pub ws_tx: RwLock<Option<mpsc::UnboundedSender<WsMessage>>>,

    /// Per-connection data channels for local TCP streams.
    pub tcp_streams: RwLock<HashMap<String, mpsc::UnboundedSender<StreamEvent>>>,

    /// Per-session datagram queues for local UDP forwarding.
    pub udp_sessions: RwLock<HashMap<String, mpsc::UnboundedSender<Vec<u8>>>>,

    /// Handles of all spawned relay work, for the disconnect sweep.
    tasks: RwLock<Vec<JoinHandle<()>>>,
}

impl ClientState {
    pub fn new() -> Self {
        Self {
            ws_tx: RwLock::new(None),
            tcp_streams: RwLock::new(HashMap::new()),
            udp_sessions: RwLock::new(HashMap::new()),
            tasks: RwLock::new(Vec::new()),
        }
    }

    /// Remembers a spawned relay task for the disconnect sweep.
    pub async fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.write().await;
        // Completed handles accumulate between disconnects; drop them.
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    /// Aborts all in-flight local work and clears the routing tables.
    /// Called on control-channel close.
    pub async fn reset(&self) {
        let mut tasks = self.tasks.write().await;
        let aborted = tasks.len();
        for task in tasks.drain(..) {
            task.abort();
        }
        self.tcp_streams.write().await.clear();
        self.udp_sessions.write().await.clear();
        *self.ws_tx.write().await = None;
        if aborted > 0 {
            info!("aborted {} in-flight relay tasks", aborted);
        }
    }
}
