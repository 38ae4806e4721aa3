//! Server TLS configuration.

use anyhow::Result;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use rustls_pemfile::{certs, private_key};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// ALPN protocols offered on the TLS listener.
pub static ALPN_H2_H1: &[&[u8]] = &[b"h2", b"http/1.1"];

/// Load TLS configuration from certificate and key files, advertising
/// HTTP/2 and HTTP/1.1 via ALPN. The rustls defaults already floor the
/// protocol at TLS 1.2.
pub fn load_tls_config(cert_path: &str, key_path: &str) -> Result<Arc<ServerConfig>> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    config.alpn_protocols = ALPN_H2_H1.iter().map(|p| p.to_vec()).collect();

    Ok(Arc::new(config))
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(Path::new(path))?;
    let mut reader = BufReader::new(file);

    let certs: Vec<CertificateDer<'static>> =
        certs(&mut reader).filter_map(|cert| cert.ok()).collect();

    if certs.is_empty() {
        anyhow::bail!("no certificates found in {path}");
    }

    info!(count = certs.len(), %path, "loaded certificates");
    Ok(certs)
}

fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(Path::new(path))?;
    let mut reader = BufReader::new(file);

    let key = private_key(&mut reader)?
        .ok_or_else(|| anyhow::anyhow!("no private key found in {path}"))?;

    Ok(key)
}
