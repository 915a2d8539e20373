//! # Port Allocator
//!
//! Picks a public port for a TCP/UDP tunnel by probing random candidates
//! in the ephemeral range against the catalog. The probe itself is not
//! atomic; the `(region, remote_port)` uniqueness invariant on insert is
//! what makes allocation safe, and the creating caller retries through
//! here when an insert conflicts anyway.

use std::ops::RangeInclusive;

use rand::Rng;

use crate::catalog::Catalog;
use crate::error::GatewayError;

/// Allocatable public port range.
pub const PORT_RANGE: RangeInclusive<u16> = 10000..=60000;

/// Probe attempts before giving up with `ExhaustedPortSpace`.
const MAX_ATTEMPTS: usize = 20;

/// Picks a free port for `region`, or fails after [`MAX_ATTEMPTS`] probes.
pub async fn allocate(catalog: &dyn Catalog, region: &str) -> Result<u16, GatewayError> {
    for _ in 0..MAX_ATTEMPTS {
        let candidate = rand::thread_rng().gen_range(PORT_RANGE);
        if catalog.is_port_free(region, candidate).await {
            return Ok(candidate);
        }
    }
    Err(GatewayError::ExhaustedPortSpace)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{generate_token, MemoryCatalog, NewTunnel, Protocol};

    #[tokio::test]
    async fn allocates_inside_the_range() {
        let catalog = MemoryCatalog::new();
        let port = allocate(&catalog, "id").await.unwrap();
        assert!(PORT_RANGE.contains(&port));
    }

    #[tokio::test]
    async fn gives_up_when_no_port_is_free() {
        struct FullCatalog;

        #[async_trait::async_trait]
        impl Catalog for FullCatalog {
            async fn find_by_token(
                &self,
                _: &str,
            ) -> Result<crate::catalog::Tunnel, crate::catalog::CatalogError> {
                Err(crate::catalog::CatalogError::NotFound)
            }
            async fn find_active(
                &self,
                _: &str,
                _: &str,
            ) -> Result<crate::catalog::Tunnel, crate::catalog::CatalogError> {
                Err(crate::catalog::CatalogError::NotFound)
            }
            async fn create(
                &self,
                _: NewTunnel,
            ) -> Result<crate::catalog::Tunnel, crate::catalog::CatalogError> {
                Err(crate::catalog::CatalogError::NotFound)
            }
            async fn list(&self, _: &str) -> Vec<crate::catalog::Tunnel> {
                Vec::new()
            }
            async fn get(
                &self,
                _: &str,
                _: &str,
            ) -> Result<crate::catalog::Tunnel, crate::catalog::CatalogError> {
                Err(crate::catalog::CatalogError::NotFound)
            }
            async fn delete(
                &self,
                _: &str,
                _: &str,
            ) -> Result<crate::catalog::Tunnel, crate::catalog::CatalogError> {
                Err(crate::catalog::CatalogError::NotFound)
            }
            async fn update_status(
                &self,
                _: &str,
                _: crate::catalog::TunnelStatus,
                _: bool,
                _: Option<chrono::DateTime<chrono::Utc>>,
            ) -> Result<(), crate::catalog::CatalogError> {
                Ok(())
            }
            async fn is_port_free(&self, _: &str, _: u16) -> bool {
                false
            }
        }

        let err = allocate(&FullCatalog, "id").await.unwrap_err();
        assert!(matches!(err, GatewayError::ExhaustedPortSpace));
    }

    #[tokio::test]
    async fn skips_ports_already_in_the_catalog() {
        let catalog = MemoryCatalog::new();
        catalog
            .create(NewTunnel {
                user_id: "u1".into(),
                subdomain: "shell".into(),
                region: "id".into(),
                service_type: "ssh".into(),
                protocol: Protocol::Tcp,
                local_port: 22,
                remote_port: Some(13000),
                connection_token: generate_token(),
            })
            .await
            .unwrap();

        assert!(!catalog.is_port_free("id", 13000).await);
        let port = allocate(&catalog, "id").await.unwrap();
        assert_ne!(port, 13000);
    }
}
