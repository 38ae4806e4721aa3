//! h2tun command line.
//!
//! Three modes: `client` runs the local SOCKS5/HTTP proxy, `server` runs
//! the remote proxy endpoint, `gencert` mints a self-signed certificate
//! pair for the TLS listener.

use anyhow::Result;
use clap::{Parser, Subcommand};
use h2tun_cli::gencert;
use h2tun_client::ClientConfig;
use h2tun_server::ServerConfig;

#[derive(Parser)]
#[command(name = "h2tun", version, about = "TCP tunnels over HTTP/2")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the local SOCKS5/HTTP proxy
    Client(ClientConfig),
    /// Run the remote proxy server
    Server(ServerConfig),
    /// Generate a self-signed certificate pair
    Gencert(gencert::GencertConfig),
}

#[tokio::main]
async fn main() -> Result<()> {
    h2tun_core::logging::init();

    match Cli::parse().command {
        Command::Client(config) => h2tun_client::run(config).await,
        Command::Server(config) => h2tun_server::run(config).await,
        Command::Gencert(config) => gencert::run(&config),
    }
}
