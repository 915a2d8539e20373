//! # Server Configuration
//!
//! Read once from the environment at startup and injected everywhere via
//! [`crate::state::AppState`]. Every knob has a working default so a bare
//! `tunlify-server` starts locally.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use tracing::warn;

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the HTTP + WebSocket listener binds to.
    pub listen_addr: SocketAddr,

    /// Base of the public wildcard hostnames: `{subdomain}.{region}.{base}`.
    pub base_domain: String,

    /// Address allocated TCP/UDP tunnel ports bind to.
    pub l4_bind: IpAddr,
}

const DEFAULT_LISTEN: &str = "0.0.0.0:7070";
const DEFAULT_BASE_DOMAIN: &str = "tunlify.net";

impl ServerConfig {
    /// Builds the configuration from `TUNLIFY_*` environment variables,
    /// falling back to defaults (and logging) on absent or unparsable
    /// values.
    pub fn from_env() -> Self {
        let listen_addr = env_parsed("TUNLIFY_LISTEN", DEFAULT_LISTEN.parse().unwrap());
        let base_domain = std::env::var("TUNLIFY_BASE_DOMAIN")
            .unwrap_or_else(|_| DEFAULT_BASE_DOMAIN.to_string());
        let l4_bind = env_parsed("TUNLIFY_L4_BIND", IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        Self {
            listen_addr,
            base_domain,
            l4_bind,
        }
    }

    /// Public hostname for a tunnel key: `{subdomain}.{region}.{base}`.
    pub fn public_host(&self, subdomain: &str, region: &str) -> String {
        format!("{}.{}.{}", subdomain, region, self.base_domain)
    }
}

fn env_parsed<T: std::str::FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                warn!("ignoring unparsable {}={:?}", name, raw);
                default
            }
        },
        Err(_) => default,
    }
}
