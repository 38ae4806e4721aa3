//! HTTP/2 transport to the proxy server.
//!
//! One multiplexed connection per client, established lazily and replaced
//! when it dies. Cleartext servers get HTTP/2 with prior knowledge; TLS
//! servers negotiate `h2` via ALPN. The TLS root store is built once at
//! construction and injected, never mutated afterwards.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use hyper::body::{Body as HttpBody, Frame, Incoming, SizeHint};
use hyper::client::conn::http2::{self, SendRequest};
use hyper::{Request, Response, Uri};
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::error::TunnelError;

/// Request body for tunnel operations: nothing, one buffer, or a feed of
/// chunks for the long-lived egress request.
pub enum OpBody {
    Empty,
    Full(Option<Bytes>),
    Channel(mpsc::Receiver<Bytes>),
}

impl OpBody {
    pub fn full(data: impl Into<Bytes>) -> Self {
        Self::Full(Some(data.into()))
    }

    /// A body fed through a channel. The request body ends when the sender
    /// side drops.
    pub fn channel(capacity: usize) -> (mpsc::Sender<Bytes>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self::Channel(rx))
    }
}

impl HttpBody for OpBody {
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, io::Error>>> {
        match self.get_mut() {
            OpBody::Empty => Poll::Ready(None),
            OpBody::Full(data) => Poll::Ready(data.take().map(|b| Ok(Frame::data(b)))),
            OpBody::Channel(rx) => rx
                .poll_recv(cx)
                .map(|chunk| chunk.map(|b| Ok(Frame::data(b)))),
        }
    }

    fn is_end_stream(&self) -> bool {
        match self {
            OpBody::Empty | OpBody::Full(None) => true,
            _ => false,
        }
    }

    fn size_hint(&self) -> SizeHint {
        match self {
            OpBody::Empty | OpBody::Full(None) => SizeHint::with_exact(0),
            // Exact size lets the transport put a content-length on pushes.
            OpBody::Full(Some(data)) => SizeHint::with_exact(data.len() as u64),
            OpBody::Channel(_) => SizeHint::default(),
        }
    }
}

/// Lazily-connected HTTP/2 client for one server base url.
pub struct Transport {
    base: String,
    host: String,
    port: u16,
    tls: Option<TlsConnector>,
    sender: Mutex<Option<SendRequest<OpBody>>>,
}

impl Transport {
    /// Parse the server base url and prepare the dialer. `ca_cert`, when
    /// given, is a PEM file appended to the root store.
    pub fn new(server_url: &str, ca_cert: Option<&str>) -> Result<Self, TunnelError> {
        let base = server_url.trim_end_matches('/').to_owned();
        let uri: Uri = base
            .parse()
            .map_err(|_| TunnelError::BadServerUrl(base.clone()))?;

        let https = match uri.scheme_str() {
            Some("https") => true,
            Some("http") => false,
            _ => return Err(TunnelError::BadServerUrl(base)),
        };
        let host = uri
            .host()
            .ok_or_else(|| TunnelError::BadServerUrl(base.clone()))?
            .to_owned();
        let port = uri.port_u16().unwrap_or(if https { 443 } else { 80 });

        let tls = if https {
            Some(build_tls_connector(ca_cert)?)
        } else {
            None
        };

        Ok(Self {
            base,
            host,
            port,
            tls,
            sender: Mutex::new(None),
        })
    }

    /// Absolute-form url for a route on the server.
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    /// Send one operation over the shared connection, dialing a fresh one
    /// if the previous connection is gone.
    pub async fn send(&self, req: Request<OpBody>) -> Result<Response<Incoming>, TunnelError> {
        let mut sender = self.sender_handle().await?;
        Ok(sender.send_request(req).await?)
    }

    async fn sender_handle(&self) -> Result<SendRequest<OpBody>, TunnelError> {
        let mut guard = self.sender.lock().await;
        if let Some(sender) = guard.as_ref() {
            if !sender.is_closed() {
                return Ok(sender.clone());
            }
        }
        let sender = self.connect().await?;
        *guard = Some(sender.clone());
        Ok(sender)
    }

    async fn connect(&self) -> Result<SendRequest<OpBody>, TunnelError> {
        let tcp = TcpStream::connect((self.host.as_str(), self.port)).await?;
        tcp.set_nodelay(true)?;

        let sender = match &self.tls {
            Some(connector) => {
                let name = ServerName::try_from(self.host.clone())
                    .map_err(|_| TunnelError::BadServerUrl(self.base.clone()))?;
                let stream = connector.connect(name, tcp).await?;
                let (sender, conn) =
                    http2::handshake(TokioExecutor::new(), TokioIo::new(stream)).await?;
                tokio::spawn(async move {
                    if let Err(e) = conn.await {
                        debug!(error = %e, "http2 connection ended");
                    }
                });
                sender
            }
            None => {
                let (sender, conn) =
                    http2::handshake(TokioExecutor::new(), TokioIo::new(tcp)).await?;
                tokio::spawn(async move {
                    if let Err(e) = conn.await {
                        debug!(error = %e, "http2 connection ended");
                    }
                });
                sender
            }
        };

        debug!(host = %self.host, port = self.port, "established http2 connection");
        Ok(sender)
    }
}

fn build_tls_connector(ca_cert: Option<&str>) -> Result<TlsConnector, TunnelError> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    if let Some(path) = ca_cert {
        let pem = std::fs::read(path)?;
        let mut reader = io::Cursor::new(pem);
        let mut added = 0usize;
        for cert in rustls_pemfile::certs(&mut reader) {
            roots.add(cert?)?;
            added += 1;
        }
        debug!(%path, added, "loaded extra root certificates");
    }

    let mut config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"h2".to_vec()];

    Ok(TlsConnector::from(Arc::new(config)))
}
