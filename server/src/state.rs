//! # Gateway State
//!
//! The dependency bundle handed to every handler: catalog, connection
//! registry, pending-request table, and configuration. Constructed once
//! at startup and injected — no process globals.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::catalog::Catalog;
use crate::config::ServerConfig;
use crate::pending::{PendingTable, RETENTION_CAP};
use crate::registry::ConnectionRegistry;

/// Shared application state, cloned into each request handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub catalog: Arc<dyn Catalog>,
    pub registry: Arc<ConnectionRegistry>,
    pub pending: Arc<PendingTable>,
}

impl AppState {
    pub fn new(config: ServerConfig, catalog: Arc<dyn Catalog>) -> Self {
        Self {
            config: Arc::new(config),
            catalog,
            registry: Arc::new(ConnectionRegistry::new()),
            pending: Arc::new(PendingTable::new()),
        }
    }
}

/// Sweep cadence for the janitor.
pub const JANITOR_INTERVAL: Duration = Duration::from_secs(120);

/// Channels with no heartbeat activity for this long are evicted.
pub const CHANNEL_STALE_AFTER: Duration = Duration::from_secs(300);

/// Periodic cleanup: fails pending requests past the retention cap and
/// closes control channels that stopped answering heartbeats. Closing a
/// channel triggers its own teardown path, which handles the registry
/// entry, the catalog flags, and the per-channel streams.
pub async fn run_janitor(state: AppState) {
    let mut tick = tokio::time::interval(JANITOR_INTERVAL);
    loop {
        tick.tick().await;

        let evicted = state.pending.evict_older_than(RETENTION_CAP);
        if evicted > 0 {
            warn!(evicted, "janitor timed out stale pending requests");
        }

        for channel in state.registry.stale_channels(CHANNEL_STALE_AFTER) {
            warn!(
                tunnel = %channel.key,
                channel_id = %channel.channel_id,
                "evicting control channel with no heartbeat activity"
            );
            channel.close();
        }

        info!(
            channels = state.registry.len(),
            pending = state.pending.len(),
            "janitor sweep complete"
        );
    }
}
