//! # Connection Registry
//!
//! Holds the gateway-local mapping from tunnel key to the live control
//! channel, plus [`ControlChannel`] itself: the handle every other
//! component uses to reach a connected client.
//!
//! A channel has exactly one writer task draining its bounded send queue
//! (see `handlers`); everything else enqueues and returns. The registry
//! enforces the single-owner rule: inserting over an existing key closes
//! the previous channel (last-writer-wins), and removal is
//! compare-and-delete so a late cleanup of a displaced channel can never
//! evict its replacement.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tunlify_protocol::WsMessage;
use uuid::Uuid;

use crate::catalog::TunnelKey;
use crate::error::GatewayError;
use crate::l4::{TcpStreamEvent, UdpReturnPath};

/// Frames a channel's send queue can hold before producers feel it.
pub const SEND_QUEUE_CAPACITY: usize = 256;

/// One authenticated control channel.
pub struct ControlChannel {
    /// Identity used by compare-and-delete; unique per WebSocket session.
    pub channel_id: Uuid,
    pub tunnel_id: String,
    pub key: TunnelKey,
    /// Cached owner identity, for logging only.
    pub peer: String,

    tx: mpsc::Sender<WsMessage>,
    /// Cancelled exactly once, when the channel dies. Listener tasks and
    /// per-stream shuttles hang off child tokens.
    pub cancel: CancellationToken,

    pub opened_at: Instant,
    last_heartbeat: Mutex<Instant>,
    pub requests_sent: AtomicU64,
    pub responses_received: AtomicU64,

    /// Return-path routing for logical TCP streams, keyed by connection id.
    pub tcp_streams: DashMap<String, mpsc::Sender<TcpStreamEvent>>,
    /// Return-path routing for UDP sessions, keyed by session id.
    pub udp_sessions: DashMap<String, UdpReturnPath>,
}

impl ControlChannel {
    /// Builds a channel and hands back the receiving half of its send
    /// queue for the single writer task.
    pub fn new(
        tunnel_id: String,
        key: TunnelKey,
        peer: String,
    ) -> (Arc<Self>, mpsc::Receiver<WsMessage>) {
        let (tx, rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
        let channel = Arc::new(Self {
            channel_id: Uuid::new_v4(),
            tunnel_id,
            key,
            peer,
            tx,
            cancel: CancellationToken::new(),
            opened_at: Instant::now(),
            last_heartbeat: Mutex::new(Instant::now()),
            requests_sent: AtomicU64::new(0),
            responses_received: AtomicU64::new(0),
            tcp_streams: DashMap::new(),
            udp_sessions: DashMap::new(),
        });
        (channel, rx)
    }

    /// Enqueues a frame, waiting for queue space. This is the
    /// backpressure-propagating path used by the TCP ingress: when the
    /// queue is saturated, the caller's read loop pauses here.
    pub async fn send(&self, msg: WsMessage) -> Result<(), GatewayError> {
        self.tx.send(msg).await.map_err(|_| GatewayError::TunnelGone)
    }

    /// Enqueues a frame without waiting. The HTTP ingress fails fast on a
    /// full queue; the UDP ingress drops the datagram.
    pub fn try_send(&self, msg: WsMessage) -> Result<(), GatewayError> {
        use mpsc::error::TrySendError;
        self.tx.try_send(msg).map_err(|e| match e {
            TrySendError::Full(_) => GatewayError::QueueFull,
            TrySendError::Closed(_) => GatewayError::TunnelGone,
        })
    }

    /// Fires the close broadcast. Idempotent.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Advances the liveness clock. Called on heartbeat traffic.
    pub fn touch_heartbeat(&self) {
        *self.last_heartbeat.lock().unwrap() = Instant::now();
    }

    pub fn heartbeat_age(&self) -> Duration {
        self.last_heartbeat.lock().unwrap().elapsed()
    }
}

/// In-memory `(subdomain, region) → ControlChannel` map.
#[derive(Default)]
pub struct ConnectionRegistry {
    channels: DashMap<TunnelKey, Arc<ControlChannel>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a channel under its tunnel key. Any previous holder of
    /// the key is closed and returned (last-writer-wins).
    pub fn insert(&self, channel: Arc<ControlChannel>) -> Option<Arc<ControlChannel>> {
        let displaced = self.channels.insert(channel.key.clone(), channel);
        if let Some(previous) = &displaced {
            info!(
                tunnel = %previous.key,
                channel_id = %previous.channel_id,
                "displacing existing control channel for key"
            );
            previous.close();
        }
        displaced
    }

    pub fn lookup(&self, key: &TunnelKey) -> Option<Arc<ControlChannel>> {
        self.channels.get(key).map(|e| e.value().clone())
    }

    /// Removes the entry only if it still points at `channel_id`.
    /// Returns whether an entry was removed.
    pub fn remove_if_current(&self, key: &TunnelKey, channel_id: Uuid) -> bool {
        self.channels
            .remove_if(key, |_, ch| ch.channel_id == channel_id)
            .is_some()
    }

    /// Channels whose heartbeat clock has not advanced for `max_age`.
    pub fn stale_channels(&self, max_age: Duration) -> Vec<Arc<ControlChannel>> {
        self.channels
            .iter()
            .filter(|e| e.value().heartbeat_age() >= max_age)
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(sub: &str) -> Arc<ControlChannel> {
        let (ch, _rx) = ControlChannel::new(
            "t1".into(),
            TunnelKey::new(sub, "id"),
            "owner@example.com".into(),
        );
        ch
    }

    #[test]
    fn insert_displaces_and_closes_the_previous_holder() {
        let registry = ConnectionRegistry::new();
        let first = channel("myapp");
        let second = channel("myapp");

        assert!(registry.insert(first.clone()).is_none());
        let displaced = registry.insert(second.clone()).unwrap();

        assert_eq!(displaced.channel_id, first.channel_id);
        assert!(first.is_closed());
        assert!(!second.is_closed());
        assert_eq!(
            registry
                .lookup(&TunnelKey::new("myapp", "id"))
                .unwrap()
                .channel_id,
            second.channel_id
        );
    }

    #[test]
    fn remove_is_compare_and_delete() {
        let registry = ConnectionRegistry::new();
        let first = channel("myapp");
        let second = channel("myapp");
        registry.insert(first.clone());
        registry.insert(second.clone());

        // The displaced channel's late cleanup must not evict its
        // replacement.
        assert!(!registry.remove_if_current(&first.key, first.channel_id));
        assert_eq!(registry.len(), 1);

        assert!(registry.remove_if_current(&second.key, second.channel_id));
        assert!(registry.is_empty());
    }

    #[test]
    fn stale_scan_finds_quiet_channels() {
        let registry = ConnectionRegistry::new();
        let ch = channel("myapp");
        registry.insert(ch.clone());

        assert!(registry.stale_channels(Duration::from_secs(300)).is_empty());
        ch.touch_heartbeat();
        // With a zero threshold everything is stale.
        assert_eq!(registry.stale_channels(Duration::ZERO).len(), 1);
    }

    #[tokio::test]
    async fn try_send_reports_queue_state() {
        let (ch, mut rx) = ControlChannel::new(
            "t1".into(),
            TunnelKey::new("myapp", "id"),
            "owner@example.com".into(),
        );

        ch.try_send(WsMessage::Heartbeat).unwrap();
        assert!(matches!(rx.recv().await, Some(WsMessage::Heartbeat)));

        drop(rx);
        assert!(matches!(
            ch.try_send(WsMessage::Heartbeat),
            Err(GatewayError::TunnelGone)
        ));
    }
}
