//! # Pending-Request Table
//!
//! Correlates `request` frames sent down a control channel with the
//! `response` / `error` frames that come back. Each entry holds a one-shot
//! completion handle; the ingress registers the entry *before* sending the
//! frame, which rules out the response-beats-register race.
//!
//! An entry is removed exactly once: on completion, on failure, on the
//! caller's timeout, or by the janitor's retention sweep.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::debug;
use tunlify_protocol::BodyEncoding;

use crate::catalog::TunnelKey;
use crate::error::GatewayError;

/// Entries older than this are forcibly failed by the janitor.
pub const RETENTION_CAP: Duration = Duration::from_secs(120);

/// What the client answered, still in wire form. The ingress decodes the
/// body and validates the status code when it writes the HTTP response.
#[derive(Debug)]
pub struct TunnelResponse {
    pub status_code: serde_json::Value,
    pub headers: HashMap<String, String>,
    pub encoding: BodyEncoding,
    pub body: String,
}

type Completion = oneshot::Sender<Result<TunnelResponse, GatewayError>>;

struct PendingEntry {
    completion: Completion,
    tunnel_key: TunnelKey,
    method: String,
    path: String,
    registered_at: Instant,
}

/// Gateway-local correlation table keyed by request id.
#[derive(Default)]
pub struct PendingTable {
    entries: DashMap<String, PendingEntry>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a waiter and returns the receiving half. Must be called
    /// before the `request` frame is enqueued.
    pub fn register(
        &self,
        request_id: &str,
        tunnel_key: TunnelKey,
        method: &str,
        path: &str,
    ) -> oneshot::Receiver<Result<TunnelResponse, GatewayError>> {
        let (tx, rx) = oneshot::channel();
        self.entries.insert(
            request_id.to_string(),
            PendingEntry {
                completion: tx,
                tunnel_key,
                method: method.to_string(),
                path: path.to_string(),
                registered_at: Instant::now(),
            },
        );
        rx
    }

    /// Resolves a waiter with the client's response. Returns false when no
    /// entry exists (already completed, timed out, or never registered).
    pub fn complete(&self, request_id: &str, response: TunnelResponse) -> bool {
        match self.entries.remove(request_id) {
            Some((_, entry)) => {
                let _ = entry.completion.send(Ok(response));
                true
            }
            None => false,
        }
    }

    /// Resolves a waiter with an error.
    pub fn fail(&self, request_id: &str, error: GatewayError) -> bool {
        match self.entries.remove(request_id) {
            Some((_, entry)) => {
                let _ = entry.completion.send(Err(error));
                true
            }
            None => false,
        }
    }

    /// Drops the entry without resuming the waiter. Used by the waiter
    /// itself when its timeout fires; `None` means the entry was already
    /// taken by a concurrent completion.
    pub fn abandon(&self, request_id: &str) -> bool {
        self.entries.remove(request_id).is_some()
    }

    /// Fails every entry belonging to a tunnel key with `TunnelGone`.
    /// Called from the control-channel close path.
    pub fn cancel_by_tunnel_key(&self, key: &TunnelKey) -> usize {
        let ids: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.value().tunnel_key == *key)
            .map(|e| e.key().clone())
            .collect();

        let mut cancelled = 0;
        for id in ids {
            if let Some((_, entry)) = self.entries.remove(&id) {
                debug!(
                    request_id = %id,
                    method = %entry.method,
                    path = %entry.path,
                    "cancelling in-flight request, tunnel gone"
                );
                let _ = entry.completion.send(Err(GatewayError::TunnelGone));
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Retention sweep: fails entries older than `max_age` with `Timeout`.
    pub fn evict_older_than(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let ids: Vec<String> = self
            .entries
            .iter()
            .filter(|e| now.duration_since(e.value().registered_at) >= max_age)
            .map(|e| e.key().clone())
            .collect();

        let mut evicted = 0;
        for id in ids {
            if self.fail(&id, GatewayError::Timeout) {
                evicted += 1;
            }
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response() -> TunnelResponse {
        TunnelResponse {
            status_code: serde_json::json!(200),
            headers: HashMap::new(),
            encoding: BodyEncoding::Utf8,
            body: "hello".into(),
        }
    }

    #[tokio::test]
    async fn completes_a_waiter_exactly_once() {
        let table = PendingTable::new();
        let rx = table.register("r1", TunnelKey::new("myapp", "id"), "GET", "/");

        assert!(table.complete("r1", response()));
        // Second completion finds no entry.
        assert!(!table.complete("r1", response()));
        assert!(!table.fail("r1", GatewayError::Timeout));

        let got = rx.await.unwrap().unwrap();
        assert_eq!(got.body, "hello");
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn fail_resumes_with_the_error() {
        let table = PendingTable::new();
        let rx = table.register("r1", TunnelKey::new("myapp", "id"), "GET", "/");
        assert!(table.fail("r1", GatewayError::BadGateway("boom".into())));
        assert!(matches!(
            rx.await.unwrap(),
            Err(GatewayError::BadGateway(_))
        ));
    }

    #[tokio::test]
    async fn cancel_by_tunnel_key_only_hits_that_key() {
        let table = PendingTable::new();
        let rx1 = table.register("r1", TunnelKey::new("myapp", "id"), "GET", "/a");
        let rx2 = table.register("r2", TunnelKey::new("myapp", "id"), "GET", "/b");
        let rx3 = table.register("r3", TunnelKey::new("other", "id"), "GET", "/c");

        assert_eq!(table.cancel_by_tunnel_key(&TunnelKey::new("myapp", "id")), 2);

        assert!(matches!(rx1.await.unwrap(), Err(GatewayError::TunnelGone)));
        assert!(matches!(rx2.await.unwrap(), Err(GatewayError::TunnelGone)));
        assert_eq!(table.len(), 1);
        drop(rx3);
    }

    #[tokio::test]
    async fn retention_sweep_times_out_old_entries() {
        let table = PendingTable::new();
        let rx = table.register("r1", TunnelKey::new("myapp", "id"), "GET", "/");

        // Everything is younger than the cap, nothing to do.
        assert_eq!(table.evict_older_than(RETENTION_CAP), 0);
        // A zero cap makes every entry stale.
        assert_eq!(table.evict_older_than(Duration::ZERO), 1);
        assert!(matches!(rx.await.unwrap(), Err(GatewayError::Timeout)));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn abandon_drops_without_resuming() {
        let table = PendingTable::new();
        let rx = table.register("r1", TunnelKey::new("myapp", "id"), "GET", "/");
        assert!(table.abandon("r1"));
        assert!(!table.abandon("r1"));
        // The waiter sees a closed channel, not a value.
        assert!(rx.await.is_err());
    }
}
