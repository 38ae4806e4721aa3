//! h2tun local proxy.
//!
//! Accepts SOCKS5 and HTTP proxy connections from local applications and
//! carries each one as a tunnel to the remote proxy server over HTTP/2.

pub mod config;
pub mod error;
pub mod frontend;
pub mod transport;
pub mod tunnel;

pub use config::ClientConfig;
pub use error::{FrontendError, TunnelError};
pub use frontend::LocalServer;
pub use transport::Transport;
pub use tunnel::{ClientTunnel, TunnelConnector, TunnelReader, TunnelWriter};

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

/// Run the local proxy until the process is stopped.
pub async fn run(config: ClientConfig) -> Result<()> {
    let interval = Duration::from_millis(config.interval);
    let connector = TunnelConnector::new(
        &config.raddr,
        &config.secret,
        interval,
        config.cert.as_deref(),
    )
    .context("building the tunnel connector")?;

    let mut server = LocalServer::new(Arc::new(connector));
    server.disable_socks5 = config.disable_socks5;
    server.disable_http = config.disable_http;
    server.disable_http_connect = config.disable_http_connect;

    server.listen(&config.addr).await?;
    Ok(())
}
