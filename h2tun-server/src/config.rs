//! Server configuration.

use clap::Args;

/// Remote proxy server flags.
#[derive(Args, Debug, Clone)]
pub struct ServerConfig {
    /// Listen address (host:port)
    #[arg(long, env = "H2TUN_ADDR", default_value = "0.0.0.0:8080")]
    pub addr: String,

    /// Shared secret for request signing
    #[arg(long, env = "H2TUN_SECRET", default_value = "")]
    pub secret: String,

    /// Serve TLS (h2 + http/1.1 via ALPN) instead of cleartext h2c
    #[arg(long, env = "H2TUN_HTTPS")]
    pub https: bool,

    /// TLS certificate file (PEM); required with --https
    #[arg(long, env = "H2TUN_CERT")]
    pub cert: Option<String>,

    /// TLS private key file (PEM); required with --https
    #[arg(long, env = "H2TUN_KEY")]
    pub key: Option<String>,
}
