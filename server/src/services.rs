//! # Service-Type Catalog
//!
//! The closed set of service presets a tunnel can be created as. Presets
//! carry advisory defaults for clients (the local port they probably want
//! to dial) and drive the defaults applied by `POST /tunnels`.

use serde::Serialize;

use crate::catalog::Protocol;

/// One entry of the service-type catalog.
#[derive(Debug, Clone, Serialize)]
pub struct ServicePreset {
    /// Stable key, e.g. `"ssh"`.
    pub key: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    /// Default local port, absent for `custom`.
    pub default_port: Option<u16>,
    pub protocol: Protocol,
}

pub const SERVICE_PRESETS: &[ServicePreset] = &[
    ServicePreset {
        key: "ssh",
        name: "SSH",
        description: "Secure Shell remote login",
        default_port: Some(22),
        protocol: Protocol::Tcp,
    },
    ServicePreset {
        key: "rdp",
        name: "Remote Desktop",
        description: "Microsoft Remote Desktop Protocol",
        default_port: Some(3389),
        protocol: Protocol::Tcp,
    },
    ServicePreset {
        key: "ftp",
        name: "FTP",
        description: "File Transfer Protocol",
        default_port: Some(21),
        protocol: Protocol::Tcp,
    },
    ServicePreset {
        key: "smtp",
        name: "SMTP",
        description: "Mail submission",
        default_port: Some(25),
        protocol: Protocol::Tcp,
    },
    ServicePreset {
        key: "pop3",
        name: "POP3",
        description: "Mail retrieval (POP3)",
        default_port: Some(110),
        protocol: Protocol::Tcp,
    },
    ServicePreset {
        key: "imap",
        name: "IMAP",
        description: "Mail retrieval (IMAP)",
        default_port: Some(143),
        protocol: Protocol::Tcp,
    },
    ServicePreset {
        key: "mysql",
        name: "MySQL",
        description: "MySQL database",
        default_port: Some(3306),
        protocol: Protocol::Tcp,
    },
    ServicePreset {
        key: "postgresql",
        name: "PostgreSQL",
        description: "PostgreSQL database",
        default_port: Some(5432),
        protocol: Protocol::Tcp,
    },
    ServicePreset {
        key: "mongodb",
        name: "MongoDB",
        description: "MongoDB database",
        default_port: Some(27017),
        protocol: Protocol::Tcp,
    },
    ServicePreset {
        key: "redis",
        name: "Redis",
        description: "Redis key-value store",
        default_port: Some(6379),
        protocol: Protocol::Tcp,
    },
    ServicePreset {
        key: "vnc",
        name: "VNC",
        description: "VNC remote desktop",
        default_port: Some(5900),
        protocol: Protocol::Tcp,
    },
    ServicePreset {
        key: "teamviewer",
        name: "TeamViewer",
        description: "TeamViewer remote control",
        default_port: Some(5938),
        protocol: Protocol::Tcp,
    },
    ServicePreset {
        key: "minecraft",
        name: "Minecraft",
        description: "Minecraft game server",
        default_port: Some(25565),
        protocol: Protocol::Tcp,
    },
    ServicePreset {
        key: "http",
        name: "HTTP",
        description: "Plain HTTP web server",
        default_port: Some(80),
        protocol: Protocol::Http,
    },
    ServicePreset {
        key: "https",
        name: "HTTPS",
        description: "HTTPS web server",
        default_port: Some(443),
        protocol: Protocol::Http,
    },
    ServicePreset {
        key: "custom",
        name: "Custom",
        description: "Any other TCP service",
        default_port: None,
        protocol: Protocol::Tcp,
    },
];

/// Looks up a preset by key.
pub fn preset(key: &str) -> Option<&'static ServicePreset> {
    SERVICE_PRESETS.iter().find(|p| p.key == key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_presets_resolve() {
        assert_eq!(preset("ssh").unwrap().default_port, Some(22));
        assert_eq!(preset("http").unwrap().protocol, Protocol::Http);
        assert_eq!(preset("custom").unwrap().default_port, None);
        assert!(preset("gopher").is_none());
    }
}
