//! # Tunlify Client
//!
//! Runs next to the origin service. Resolves its connection token to a
//! tunnel, checks the local endpoint is reachable, then holds the
//! control channel open and relays whatever the gateway sends:
//! HTTP requests, raw TCP streams, or UDP datagrams.
//!
//! ## Modules
//!
//! - [`target`] — parsing of the `--local` argument
//! - [`agent`]  — control-channel loop and frame dispatch
//! - [`http`]   — local HTTP forwarding
//! - [`relay`]  — per-connection TCP shuttle
//! - [`udp`]    — per-session UDP forwarding
//! - [`state`]  — shared relay state

mod agent;
mod http;
mod relay;
mod state;
mod target;
mod udp;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};

use crate::state::{ClientState, TunnelProtocol};
use crate::target::{LocalScheme, LocalTarget};

#[derive(Debug, Parser)]
#[command(
    name = "tunlify-client",
    about = "Expose a local service through a Tunlify tunnel"
)]
struct Cli {
    /// Connection token of the tunnel (from the dashboard).
    #[arg(long, env = "TUNLIFY_TOKEN")]
    token: String,

    /// Base URL of the Tunlify API.
    #[arg(long, env = "TUNLIFY_SERVER", default_value = "https://api.tunlify.net")]
    server: String,

    /// Local target: host:port, :port, port, or an http(s):// URL.
    #[arg(long, short = 'l')]
    local: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tunlify_client=info".into()),
        )
        .init();

    let cli = Cli::parse();

    // Proxied responses must reach the browser untouched, so the local
    // forwarder never follows redirects itself.
    let http_client = match reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            error!("failed to build HTTP client: {}", e);
            std::process::exit(1);
        }
    };

    // Learn the tunnel (protocol, region, public URL) before holding a
    // WebSocket.
    let tunnel = match agent::authenticate(&http_client, &cli.server, &cli.token).await {
        Ok(tunnel) => tunnel,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };
    info!(
        "tunnel '{}' in region '{}' ({:?})",
        tunnel.subdomain, tunnel.region, tunnel.protocol
    );

    let target = match LocalTarget::parse(&cli.local, tunnel.protocol) {
        Ok(target) => target,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };
    info!("forwarding to {}", target.describe());

    preflight(&http_client, &target, tunnel.protocol).await;

    let ws_url = match agent::control_url(&cli.server, &cli.token) {
        Ok(url) => url,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    let state = Arc::new(ClientState::new());
    agent::run_forever(ws_url, tunnel, target, state, http_client).await;
}

/// Checks the local endpoint before connecting. Any TCP-level success
/// counts as reachable; failure is only a warning, the service may come
/// up later.
async fn preflight(client: &reqwest::Client, target: &LocalTarget, protocol: TunnelProtocol) {
    match (protocol, target.scheme) {
        (TunnelProtocol::Udp, _) => {}
        (TunnelProtocol::Http, _) | (_, LocalScheme::Http) | (_, LocalScheme::Https) => {
            let probe = client
                .get(target.base_url())
                .timeout(Duration::from_secs(3))
                .send()
                .await;
            match probe {
                Ok(response) => {
                    info!(
                        "local endpoint answered with HTTP {}",
                        response.status().as_u16()
                    );
                }
                Err(e) => {
                    warn!("local endpoint not reachable yet: {}", e);
                }
            }
        }
        (TunnelProtocol::Tcp, LocalScheme::Raw) => {
            let probe = tokio::time::timeout(
                Duration::from_secs(3),
                tokio::net::TcpStream::connect(target.addr()),
            )
            .await;
            match probe {
                Ok(Ok(_)) => info!("local endpoint accepts connections"),
                Ok(Err(e)) => warn!("local endpoint not reachable yet: {}", e),
                Err(_) => warn!("local endpoint did not answer within 3s"),
            }
        }
    }
}
