//! Client configuration.

use clap::Args;

/// Local proxy client flags.
#[derive(Args, Debug, Clone)]
pub struct ClientConfig {
    /// Local listen address for the SOCKS5/HTTP frontend
    #[arg(long, env = "H2TUN_ADDR", default_value = "127.0.0.1:1080")]
    pub addr: String,

    /// Remote server base url (e.g. https://example.com)
    #[arg(long, env = "H2TUN_RADDR")]
    pub raddr: String,

    /// Shared secret for request signing
    #[arg(long, env = "H2TUN_SECRET", default_value = "")]
    pub secret: String,

    /// Polling interval in milliseconds; 0 means http chunked streaming
    #[arg(long, env = "H2TUN_INTERVAL", default_value = "0")]
    pub interval: u64,

    /// Extra CA certificate file (PEM) trusted for the remote server
    #[arg(long, env = "H2TUN_CERT")]
    pub cert: Option<String>,

    /// Refuse SOCKS5 connections
    #[arg(long, env = "H2TUN_DISABLE_SOCKS5")]
    pub disable_socks5: bool,

    /// Refuse HTTP proxy connections
    #[arg(long, env = "H2TUN_DISABLE_HTTP")]
    pub disable_http: bool,

    /// Refuse the HTTP CONNECT method
    #[arg(long, env = "H2TUN_DISABLE_HTTP_CONNECT")]
    pub disable_http_connect: bool,
}
