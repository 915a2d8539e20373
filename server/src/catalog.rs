//! # Catalog Store
//!
//! The durable tunnel catalog behind a narrow interface. The rest of the
//! gateway only ever talks to [`Catalog`]; [`MemoryCatalog`] is the
//! in-process implementation and enforces the row invariants atomically:
//!
//! - `(subdomain, region)` unique
//! - `(region, remote_port)` unique among rows with a port
//! - `connection_token` globally unique
//! - `remote_port` is `NULL` exactly for HTTP tunnels
//!
//! A SQL-backed store slots in behind the same trait.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

// ─── Row model ──────────────────────────────────────────────────

/// Transport protocol of a tunnel's public side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Protocol::Http => "http",
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for Protocol {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(Protocol::Http),
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            _ => Err(()),
        }
    }
}

/// Tunnel lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelStatus {
    Inactive,
    Active,
}

/// `(subdomain, region)` — the lookup key the HTTP ingress resolves.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TunnelKey {
    pub subdomain: String,
    pub region: String,
}

impl TunnelKey {
    pub fn new(subdomain: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            subdomain: subdomain.into(),
            region: region.into(),
        }
    }
}

impl fmt::Display for TunnelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.subdomain, self.region)
    }
}

/// One durable tunnel row.
#[derive(Debug, Clone, Serialize)]
pub struct Tunnel {
    pub id: String,
    pub user_id: String,
    pub subdomain: String,
    pub region: String,
    pub service_type: String,
    pub protocol: Protocol,
    /// Advisory: the port the client is expected to dial locally.
    pub local_port: u16,
    /// Publicly bound port; `None` exactly for HTTP tunnels.
    pub remote_port: Option<u16>,
    pub connection_token: String,
    pub status: TunnelStatus,
    pub client_connected: bool,
    pub last_connected: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Tunnel {
    pub fn key(&self) -> TunnelKey {
        TunnelKey::new(self.subdomain.clone(), self.region.clone())
    }

    /// `{subdomain}.{region}.{base}` — the public hostname.
    pub fn public_host(&self, base_domain: &str) -> String {
        format!("{}.{}.{}", self.subdomain, self.region, base_domain)
    }

    /// What the owner points their tools at: an `https://` URL for HTTP
    /// tunnels, `host:port` for raw TCP/UDP.
    pub fn public_url(&self, base_domain: &str) -> String {
        let host = self.public_host(base_domain);
        match self.remote_port {
            None => format!("https://{}", host),
            Some(port) => format!("{}:{}", host, port),
        }
    }
}

/// Fields of a tunnel to be created. The id and timestamps are assigned
/// by the store.
#[derive(Debug, Clone)]
pub struct NewTunnel {
    pub user_id: String,
    pub subdomain: String,
    pub region: String,
    pub service_type: String,
    pub protocol: Protocol,
    pub local_port: u16,
    pub remote_port: Option<u16>,
    pub connection_token: String,
}

/// Generates a fresh connection token: 64 hex characters.
pub fn generate_token() -> String {
    format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}

// ─── Store interface ────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("tunnel not found")]
    NotFound,

    #[error("subdomain '{subdomain}' is already taken in region '{region}'")]
    SubdomainTaken { subdomain: String, region: String },

    #[error("port {port} is already taken in region '{region}'")]
    PortTaken { region: String, port: u16 },

    #[error("invalid tunnel row: {0}")]
    Invalid(String),
}

/// The narrow catalog interface every other component consumes.
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn find_by_token(&self, token: &str) -> Result<Tunnel, CatalogError>;

    /// Returns the tunnel only if its status is `active`.
    async fn find_active(&self, subdomain: &str, region: &str) -> Result<Tunnel, CatalogError>;

    /// Atomic with respect to the uniqueness invariants; on conflict the
    /// error names the conflicting field and no row is written.
    async fn create(&self, new: NewTunnel) -> Result<Tunnel, CatalogError>;

    async fn list(&self, user_id: &str) -> Vec<Tunnel>;

    async fn get(&self, id: &str, user_id: &str) -> Result<Tunnel, CatalogError>;

    /// Removes the row and returns it.
    async fn delete(&self, id: &str, user_id: &str) -> Result<Tunnel, CatalogError>;

    /// `last_connected: Some(_)` overwrites the stored timestamp; `None`
    /// leaves it untouched.
    async fn update_status(
        &self,
        id: &str,
        status: TunnelStatus,
        client_connected: bool,
        last_connected: Option<DateTime<Utc>>,
    ) -> Result<(), CatalogError>;

    async fn is_port_free(&self, region: &str, port: u16) -> bool;
}

// ─── In-memory implementation ───────────────────────────────────

/// Single-primary in-process store. All invariant checks and the insert
/// happen under one write lock, which is what makes `create` atomic.
#[derive(Default)]
pub struct MemoryCatalog {
    rows: RwLock<HashMap<String, Tunnel>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn find_by_token(&self, token: &str) -> Result<Tunnel, CatalogError> {
        let rows = self.rows.read().await;
        rows.values()
            .find(|t| t.connection_token == token)
            .cloned()
            .ok_or(CatalogError::NotFound)
    }

    async fn find_active(&self, subdomain: &str, region: &str) -> Result<Tunnel, CatalogError> {
        let rows = self.rows.read().await;
        rows.values()
            .find(|t| {
                t.subdomain == subdomain
                    && t.region == region
                    && t.status == TunnelStatus::Active
            })
            .cloned()
            .ok_or(CatalogError::NotFound)
    }

    async fn create(&self, new: NewTunnel) -> Result<Tunnel, CatalogError> {
        if new.remote_port.is_none() != (new.protocol == Protocol::Http) {
            return Err(CatalogError::Invalid(
                "remote_port must be set exactly for tcp/udp tunnels".into(),
            ));
        }

        let mut rows = self.rows.write().await;

        if rows
            .values()
            .any(|t| t.subdomain == new.subdomain && t.region == new.region)
        {
            return Err(CatalogError::SubdomainTaken {
                subdomain: new.subdomain,
                region: new.region,
            });
        }
        if let Some(port) = new.remote_port {
            if rows
                .values()
                .any(|t| t.region == new.region && t.remote_port == Some(port))
            {
                return Err(CatalogError::PortTaken {
                    region: new.region,
                    port,
                });
            }
        }
        if rows
            .values()
            .any(|t| t.connection_token == new.connection_token)
        {
            return Err(CatalogError::Invalid("connection token collision".into()));
        }

        let tunnel = Tunnel {
            id: Uuid::new_v4().to_string(),
            user_id: new.user_id,
            subdomain: new.subdomain,
            region: new.region,
            service_type: new.service_type,
            protocol: new.protocol,
            local_port: new.local_port,
            remote_port: new.remote_port,
            connection_token: new.connection_token,
            status: TunnelStatus::Inactive,
            client_connected: false,
            last_connected: None,
            created_at: Utc::now(),
        };
        rows.insert(tunnel.id.clone(), tunnel.clone());
        Ok(tunnel)
    }

    async fn list(&self, user_id: &str) -> Vec<Tunnel> {
        let rows = self.rows.read().await;
        let mut tunnels: Vec<Tunnel> = rows
            .values()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect();
        tunnels.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        tunnels
    }

    async fn get(&self, id: &str, user_id: &str) -> Result<Tunnel, CatalogError> {
        let rows = self.rows.read().await;
        rows.get(id)
            .filter(|t| t.user_id == user_id)
            .cloned()
            .ok_or(CatalogError::NotFound)
    }

    async fn delete(&self, id: &str, user_id: &str) -> Result<Tunnel, CatalogError> {
        let mut rows = self.rows.write().await;
        match rows.remove(id) {
            Some(tunnel) if tunnel.user_id == user_id => Ok(tunnel),
            Some(tunnel) => {
                // Not the owner's row; put it back untouched.
                rows.insert(tunnel.id.clone(), tunnel);
                Err(CatalogError::NotFound)
            }
            None => Err(CatalogError::NotFound),
        }
    }

    async fn update_status(
        &self,
        id: &str,
        status: TunnelStatus,
        client_connected: bool,
        last_connected: Option<DateTime<Utc>>,
    ) -> Result<(), CatalogError> {
        let mut rows = self.rows.write().await;
        let tunnel = rows.get_mut(id).ok_or(CatalogError::NotFound)?;
        tunnel.status = status;
        tunnel.client_connected = client_connected;
        if last_connected.is_some() {
            tunnel.last_connected = last_connected;
        }
        Ok(())
    }

    async fn is_port_free(&self, region: &str, port: u16) -> bool {
        let rows = self.rows.read().await;
        !rows
            .values()
            .any(|t| t.region == region && t.remote_port == Some(port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_row(subdomain: &str, region: &str, protocol: Protocol, port: Option<u16>) -> NewTunnel {
        NewTunnel {
            user_id: "u1".into(),
            subdomain: subdomain.into(),
            region: region.into(),
            service_type: if protocol == Protocol::Http {
                "http".into()
            } else {
                "ssh".into()
            },
            protocol,
            local_port: 3000,
            remote_port: port,
            connection_token: generate_token(),
        }
    }

    #[tokio::test]
    async fn subdomain_unique_per_region() {
        let catalog = MemoryCatalog::new();
        catalog
            .create(new_row("myapp", "id", Protocol::Http, None))
            .await
            .unwrap();

        // Same subdomain in another region is fine.
        catalog
            .create(new_row("myapp", "sg", Protocol::Http, None))
            .await
            .unwrap();

        let err = catalog
            .create(new_row("myapp", "id", Protocol::Http, None))
            .await
            .unwrap_err();
        assert!(matches!(err, CatalogError::SubdomainTaken { .. }));
    }

    #[tokio::test]
    async fn port_unique_per_region() {
        let catalog = MemoryCatalog::new();
        catalog
            .create(new_row("shell", "id", Protocol::Tcp, Some(13000)))
            .await
            .unwrap();

        let err = catalog
            .create(new_row("other", "id", Protocol::Tcp, Some(13000)))
            .await
            .unwrap_err();
        match err {
            CatalogError::PortTaken { region, port } => {
                assert_eq!(region, "id");
                assert_eq!(port, 13000);
            }
            other => panic!("unexpected error: {:?}", other),
        }

        // Same port in another region does not conflict.
        catalog
            .create(new_row("other", "sg", Protocol::Tcp, Some(13000)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn remote_port_is_coupled_to_protocol() {
        let catalog = MemoryCatalog::new();
        assert!(catalog
            .create(new_row("a", "id", Protocol::Http, Some(13000)))
            .await
            .is_err());
        assert!(catalog
            .create(new_row("b", "id", Protocol::Tcp, None))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn find_active_ignores_inactive_rows() {
        let catalog = MemoryCatalog::new();
        let t = catalog
            .create(new_row("myapp", "id", Protocol::Http, None))
            .await
            .unwrap();

        assert!(catalog.find_active("myapp", "id").await.is_err());

        catalog
            .update_status(&t.id, TunnelStatus::Active, true, Some(Utc::now()))
            .await
            .unwrap();
        let found = catalog.find_active("myapp", "id").await.unwrap();
        assert!(found.client_connected);
        assert!(found.last_connected.is_some());
    }

    #[tokio::test]
    async fn delete_is_owner_scoped_and_idempotent() {
        let catalog = MemoryCatalog::new();
        let t = catalog
            .create(new_row("myapp", "id", Protocol::Http, None))
            .await
            .unwrap();

        assert!(matches!(
            catalog.delete(&t.id, "someone-else").await,
            Err(CatalogError::NotFound)
        ));
        catalog.delete(&t.id, "u1").await.unwrap();
        assert!(matches!(
            catalog.delete(&t.id, "u1").await,
            Err(CatalogError::NotFound)
        ));
    }

    #[test]
    fn tokens_are_64_hex_chars() {
        let token = generate_token();
        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
