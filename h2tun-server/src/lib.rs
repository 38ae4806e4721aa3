//! h2tun proxy server.
//!
//! Accepts the tunnel HTTP surface on a single listener, dials targets on
//! `/connect`, and shuttles bytes between tunnel operations and the target
//! sockets it owns.

pub mod config;
pub mod http;
pub mod registry;
pub mod tls;

pub use config::ServerConfig;
pub use http::{router, serve_plain, serve_tls, ProxyState};
pub use registry::{ServerTunnel, TunnelRegistry};

use anyhow::{bail, Context, Result};
use tracing::info;

/// Bind and run the proxy server until the process is stopped.
pub async fn run(config: ServerConfig) -> Result<()> {
    let registry = TunnelRegistry::new();
    let state = ProxyState::new(&config.secret, registry);
    let app = http::router(state);

    let listener = tokio::net::TcpListener::bind(&config.addr)
        .await
        .with_context(|| format!("bind {}", config.addr))?;

    if config.https {
        let (cert, key) = match (&config.cert, &config.key) {
            (Some(cert), Some(key)) => (cert, key),
            _ => bail!("--https needs both --cert and --key"),
        };
        for path in [cert, key] {
            let meta = std::fs::metadata(path).with_context(|| format!("stat {path}"))?;
            if meta.is_dir() {
                bail!("{path} should be a file");
            }
        }
        let tls = tls::load_tls_config(cert, key)?;
        info!(addr = %config.addr, "starting the https/http2 server");
        serve_tls(listener, app, tls).await
    } else {
        info!(addr = %config.addr, "starting the http/http2 server (h2c)");
        serve_plain(listener, app).await
    }
}
