//! # Local Target Parsing
//!
//! The `--local` argument accepts several shapes:
//!
//! - `host:port` — dial that address
//! - `:port` / `port` — shorthand for `127.0.0.1:port`
//! - `http://host:port/…` / `https://host:port/…` — fixes the local
//!   scheme for HTTP tunnels
//!
//! Bare forms default to plain TCP for tcp/udp tunnels and to HTTP for
//! http tunnels. Anything else is rejected.

use url::Url;

use crate::state::TunnelProtocol;

/// How the client speaks to the local endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalScheme {
    Http,
    Https,
    Raw,
}

/// The parsed local endpoint.
#[derive(Debug, Clone)]
pub struct LocalTarget {
    pub scheme: LocalScheme,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, thiserror::Error)]
pub enum TargetError {
    #[error("unsupported target '{0}': use host:port, :port, port, or an http(s):// URL")]
    Unsupported(String),

    #[error("invalid port in target '{0}'")]
    InvalidPort(String),

    #[error("unsupported URL scheme '{0}': only http and https are allowed")]
    UnsupportedScheme(String),
}

impl LocalTarget {
    pub fn parse(input: &str, protocol: TunnelProtocol) -> Result<Self, TargetError> {
        if input.contains("://") {
            return Self::parse_url(input);
        }

        let default_scheme = match protocol {
            TunnelProtocol::Http => LocalScheme::Http,
            TunnelProtocol::Tcp | TunnelProtocol::Udp => LocalScheme::Raw,
        };

        // Bare port: "3000"
        if input.chars().all(|c| c.is_ascii_digit()) && !input.is_empty() {
            let port = input
                .parse::<u16>()
                .ok()
                .filter(|p| *p != 0)
                .ok_or_else(|| TargetError::InvalidPort(input.to_string()))?;
            return Ok(Self {
                scheme: default_scheme,
                host: "127.0.0.1".to_string(),
                port,
            });
        }

        // ":3000"
        if let Some(rest) = input.strip_prefix(':') {
            let port = rest
                .parse::<u16>()
                .ok()
                .filter(|p| *p != 0)
                .ok_or_else(|| TargetError::InvalidPort(input.to_string()))?;
            return Ok(Self {
                scheme: default_scheme,
                host: "127.0.0.1".to_string(),
                port,
            });
        }

        // "host:3000"
        if let Some((host, port)) = input.rsplit_once(':') {
            if host.is_empty() {
                return Err(TargetError::Unsupported(input.to_string()));
            }
            let port = port
                .parse::<u16>()
                .ok()
                .filter(|p| *p != 0)
                .ok_or_else(|| TargetError::InvalidPort(input.to_string()))?;
            return Ok(Self {
                scheme: default_scheme,
                host: host.to_string(),
                port,
            });
        }

        Err(TargetError::Unsupported(input.to_string()))
    }

    fn parse_url(input: &str) -> Result<Self, TargetError> {
        let url = Url::parse(input).map_err(|_| TargetError::Unsupported(input.to_string()))?;
        let scheme = match url.scheme() {
            "http" => LocalScheme::Http,
            "https" => LocalScheme::Https,
            other => return Err(TargetError::UnsupportedScheme(other.to_string())),
        };
        let host = url
            .host_str()
            .ok_or_else(|| TargetError::Unsupported(input.to_string()))?
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| TargetError::InvalidPort(input.to_string()))?;
        Ok(Self { scheme, host, port })
    }

    /// `host:port`, for raw socket dials.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Base URL for local HTTP forwarding. Raw targets forward as plain
    /// HTTP when the tunnel protocol says so.
    pub fn base_url(&self) -> String {
        let scheme = match self.scheme {
            LocalScheme::Https => "https",
            LocalScheme::Http | LocalScheme::Raw => "http",
        };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }

    /// Human-readable form, sent as the advisory `set_local_address`.
    pub fn describe(&self) -> String {
        match self.scheme {
            LocalScheme::Raw => self.addr(),
            _ => self.base_url(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_port_defaults_to_loopback() {
        let t = LocalTarget::parse("3000", TunnelProtocol::Http).unwrap();
        assert_eq!(t.host, "127.0.0.1");
        assert_eq!(t.port, 3000);
        assert_eq!(t.scheme, LocalScheme::Http);
    }

    #[test]
    fn colon_port_form() {
        let t = LocalTarget::parse(":8080", TunnelProtocol::Tcp).unwrap();
        assert_eq!(t.addr(), "127.0.0.1:8080");
        assert_eq!(t.scheme, LocalScheme::Raw);
    }

    #[test]
    fn host_port_form() {
        let t = LocalTarget::parse("db.internal:5432", TunnelProtocol::Tcp).unwrap();
        assert_eq!(t.host, "db.internal");
        assert_eq!(t.port, 5432);
    }

    #[test]
    fn url_form_fixes_the_scheme() {
        let t = LocalTarget::parse("https://localhost:8443/app", TunnelProtocol::Http).unwrap();
        assert_eq!(t.scheme, LocalScheme::Https);
        assert_eq!(t.base_url(), "https://localhost:8443");

        let t = LocalTarget::parse("http://localhost/", TunnelProtocol::Http).unwrap();
        assert_eq!(t.port, 80); // scheme default
    }

    #[test]
    fn bare_forms_default_per_protocol() {
        let http = LocalTarget::parse("3000", TunnelProtocol::Http).unwrap();
        assert_eq!(http.scheme, LocalScheme::Http);
        let udp = LocalTarget::parse("3000", TunnelProtocol::Udp).unwrap();
        assert_eq!(udp.scheme, LocalScheme::Raw);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(
            LocalTarget::parse("not a target", TunnelProtocol::Http),
            Err(TargetError::Unsupported(_))
        ));
        assert!(matches!(
            LocalTarget::parse("host:99999", TunnelProtocol::Tcp),
            Err(TargetError::InvalidPort(_))
        ));
        assert!(matches!(
            LocalTarget::parse(":0", TunnelProtocol::Tcp),
            Err(TargetError::InvalidPort(_))
        ));
        assert!(matches!(
            LocalTarget::parse("ftp://files:21", TunnelProtocol::Tcp),
            Err(TargetError::UnsupportedScheme(_))
        ));
    }
}
