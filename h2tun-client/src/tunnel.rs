//! The client half of a tunnel.
//!
//! `open` performs `/connect`, wires up the ingress source (right away in
//! streaming mode, lazily per poll otherwise) and starts the heartbeat.
//! The reader and writer halves then move into the two copy directions of
//! the frontend.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use h2tun_core::proto::{self, header, CONNECT_TIMEOUT, HEART_TTL};
use h2tun_core::{Authenticator, TunnelId};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::CONTENT_TYPE;
use hyper::{Method, Request, Response, StatusCode};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::TunnelError;
use crate::transport::{OpBody, Transport};

/// Cover content type on push bodies; the server does not care.
const PUSH_CONTENT_TYPE: &str = "image/jpeg";

/// Egress chunks allowed in flight before writes push back.
const EGRESS_QUEUE: usize = 32;

/// State shared by the reader and writer halves of one tunnel.
pub struct TunnelShared {
    transport: Arc<Transport>,
    auth: Authenticator,
    id: TunnelId,
    interval: Duration,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl TunnelShared {
    pub fn id(&self) -> &TunnelId {
        &self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close the tunnel: the first call cancels the heartbeat and sends one
    /// best-effort quit push; later calls return quietly.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(uuid = %self.id, "close");
        self.cancel.cancel();
        if let Err(e) = self.push(Bytes::from_static(b"quit"), proto::QUIT_TYP).await {
            debug!(uuid = %self.id, error = %e, "quit push failed");
        }
    }

    fn request(&self, method: Method, path: &str) -> http::request::Builder {
        let ts = proto::unix_now().to_string();
        let sign = self.auth.sign(&ts);
        Request::builder()
            .method(method)
            .uri(self.transport.url(path))
            .header(header::UUID, self.id.as_str())
            .header(header::TIMESTAMP, ts)
            .header(header::SIGN, sign)
    }

    /// One short `/push` round-trip: heartbeats, quits, and polled data.
    async fn push(&self, data: Bytes, typ: &str) -> Result<(), TunnelError> {
        debug!(uuid = %self.id, typ, len = data.len(), "push");
        let req = self
            .request(Method::POST, proto::PUSH)
            .header(header::TYP, typ)
            .header(CONTENT_TYPE, PUSH_CONTENT_TYPE)
            .body(OpBody::full(data))?;
        let resp = timeout(CONNECT_TIMEOUT, self.transport.send(req))
            .await
            .map_err(|_| TunnelError::Timeout)??;
        expect_ok(resp).await
    }

    /// One `/pull`; the response body becomes the ingress source. Polling
    /// mode bounds the round-trip, the streaming response is open-ended.
    async fn pull(&self) -> Result<Incoming, TunnelError> {
        debug!(uuid = %self.id, interval = ?self.interval, "pull");
        let req = self
            .request(Method::GET, proto::PULL)
            .header(header::INTERVAL, self.interval.as_nanos().to_string())
            .body(OpBody::Empty)?;

        let send = self.transport.send(req);
        let resp = if self.interval.is_zero() {
            send.await?
        } else {
            timeout(CONNECT_TIMEOUT, send)
                .await
                .map_err(|_| TunnelError::Timeout)??
        };

        let status = resp.status();
        if status != StatusCode::OK {
            let body = read_body(resp).await?;
            return Err(TunnelError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp.into_body())
    }
}

/// A live tunnel, ready to split into its two copy directions.
pub struct ClientTunnel {
    reader: TunnelReader,
    writer: TunnelWriter,
}

impl std::fmt::Debug for ClientTunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientTunnel").field("id", self.id()).finish()
    }
}

impl ClientTunnel {
    pub fn id(&self) -> &TunnelId {
        self.reader.shared.id()
    }

    /// Handle for closing the tunnel from outside the copy tasks.
    pub fn shared(&self) -> Arc<TunnelShared> {
        self.reader.shared.clone()
    }

    pub fn split(self) -> (TunnelReader, TunnelWriter) {
        (self.reader, self.writer)
    }
}

/// Open a tunnel to `addr` (`host:port`) through the proxy.
pub async fn open(
    transport: Arc<Transport>,
    auth: Authenticator,
    interval: Duration,
    addr: &str,
) -> Result<ClientTunnel, TunnelError> {
    let (host, port) = split_addr(addr)?;

    let ts = proto::unix_now().to_string();
    let sign = auth.sign(&ts);
    let req = Request::builder()
        .method(Method::GET)
        .uri(transport.url(proto::CONNECT))
        .header(header::UUID, "")
        .header(header::TIMESTAMP, ts)
        .header(header::SIGN, sign)
        .header(header::DSTHOST, host)
        .header(header::DSTPORT, port)
        .body(OpBody::Empty)?;
    let resp = timeout(CONNECT_TIMEOUT, transport.send(req))
        .await
        .map_err(|_| TunnelError::Timeout)??;

    let status = resp.status();
    let body = read_body(resp).await?;
    if status != StatusCode::OK {
        return Err(TunnelError::Status {
            status: status.as_u16(),
            body,
        });
    }

    let shared = Arc::new(TunnelShared {
        transport,
        auth,
        id: TunnelId::from(body),
        interval,
        closed: AtomicBool::new(false),
        cancel: CancellationToken::new(),
    });
    debug!(uuid = %shared.id, %addr, "tunnel open");

    // Streaming mode holds its single long-lived ingress from the start.
    let source = if interval.is_zero() {
        Some(shared.pull().await?)
    } else {
        None
    };

    spawn_heartbeat(shared.clone());

    Ok(ClientTunnel {
        reader: TunnelReader {
            shared: shared.clone(),
            source,
            pending: Bytes::new(),
        },
        writer: TunnelWriter { shared, sink: None },
    })
}

fn split_addr(addr: &str) -> Result<(&str, &str), TunnelError> {
    addr.rsplit_once(':')
        .filter(|(host, port)| !host.is_empty() && !port.is_empty())
        .ok_or_else(|| TunnelError::BadAddress(addr.to_owned()))
}

fn spawn_heartbeat(shared: Arc<TunnelShared>) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shared.cancel.cancelled() => return,
                _ = tokio::time::sleep(HEART_TTL / 2) => {
                    if let Err(e) = shared
                        .push(Bytes::from_static(b"alive"), proto::HEART_TYP)
                        .await
                    {
                        debug!(uuid = %shared.id, error = %e, "heartbeat failed");
                        return;
                    }
                }
            }
        }
    });
}

/// Ingress half: bytes coming back from the target.
pub struct TunnelReader {
    shared: Arc<TunnelShared>,
    source: Option<Incoming>,
    pending: Bytes,
}

impl TunnelReader {
    /// Read target bytes into `buf`.
    ///
    /// Polling mode swallows ingress EOF and pulls again; streaming mode
    /// returns EOF verbatim, and a missing source there means the single
    /// ingress response is already spent.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TunnelError> {
        let polling = !self.shared.interval.is_zero();
        loop {
            if !self.pending.is_empty() {
                let n = buf.len().min(self.pending.len());
                buf[..n].copy_from_slice(&self.pending.split_to(n));
                return Ok(n);
            }

            if self.source.is_none() {
                if polling {
                    self.source = Some(self.shared.pull().await?);
                } else {
                    return Err(TunnelError::PullNotReady);
                }
            }

            let frame = match self.source.as_mut() {
                Some(source) => source.frame().await,
                None => continue,
            };
            match frame {
                None => {
                    self.source = None;
                    if !polling {
                        return Ok(0);
                    }
                }
                Some(Ok(frame)) => {
                    if let Ok(data) = frame.into_data() {
                        self.pending = data;
                    }
                }
                Some(Err(e)) => {
                    self.source = None;
                    return Err(e.into());
                }
            }
        }
    }

    pub async fn close(&self) {
        self.shared.close().await
    }
}

/// Egress half: bytes heading for the target.
pub struct TunnelWriter {
    shared: Arc<TunnelShared>,
    sink: Option<mpsc::Sender<Bytes>>,
}

impl TunnelWriter {
    /// Ship `data` to the target: one `/push` per write in polling mode,
    /// a feed into the single chunked `/push` in streaming mode.
    pub async fn write(&mut self, data: &[u8]) -> Result<usize, TunnelError> {
        let n = data.len();
        let data = Bytes::copy_from_slice(data);
        if self.shared.interval.is_zero() {
            self.chunk_push(data).await?;
        } else {
            self.shared.push(data, proto::DATA_TYP).await?;
        }
        Ok(n)
    }

    async fn chunk_push(&mut self, data: Bytes) -> Result<(), TunnelError> {
        if self.sink.is_none() {
            let (tx, body) = OpBody::channel(EGRESS_QUEUE);
            let req = self
                .shared
                .request(Method::POST, proto::PUSH)
                .header(header::TYP, proto::DATA_TYP)
                .header(CONTENT_TYPE, PUSH_CONTENT_TYPE)
                .body(body)?;

            // The upstream request runs until the sink drops. A failure
            // shows up on the next write once the body is orphaned.
            let shared = self.shared.clone();
            tokio::spawn(async move {
                match shared.transport.send(req).await {
                    Ok(resp) => {
                        debug!(uuid = %shared.id, status = %resp.status(), "chunked push done")
                    }
                    Err(e) => debug!(uuid = %shared.id, error = %e, "chunked push ended"),
                }
            });
            self.sink = Some(tx);
        }

        match &self.sink {
            Some(sink) => sink.send(data).await.map_err(|_| TunnelError::Closed),
            None => Err(TunnelError::Closed),
        }
    }

    pub async fn close(&self) {
        self.shared.close().await
    }
}

/// Opens client tunnels against one remote proxy server.
///
/// Holds the shared HTTP/2 transport and authenticator; every accepted
/// frontend connection goes through [`TunnelConnector::connect`].
pub struct TunnelConnector {
    transport: Arc<Transport>,
    auth: Authenticator,
    interval: Duration,
}

impl TunnelConnector {
    /// `interval` of zero selects streaming mode; `ca_cert` optionally
    /// extends the TLS root store with a PEM file.
    pub fn new(
        server_url: &str,
        secret: &str,
        interval: Duration,
        ca_cert: Option<&str>,
    ) -> Result<Self, TunnelError> {
        Ok(Self {
            transport: Arc::new(Transport::new(server_url, ca_cert)?),
            auth: Authenticator::new(secret),
            interval,
        })
    }

    /// Open a tunnel to `addr` (`host:port`) through the remote proxy.
    pub async fn connect(&self, addr: &str) -> Result<ClientTunnel, TunnelError> {
        open(
            self.transport.clone(),
            self.auth.clone(),
            self.interval,
            addr,
        )
        .await
    }
}

async fn read_body(resp: Response<Incoming>) -> Result<String, TunnelError> {
    let bytes = resp.into_body().collect().await?.to_bytes();
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

async fn expect_ok(resp: Response<Incoming>) -> Result<(), TunnelError> {
    let status = resp.status();
    let body = read_body(resp).await?;
    if status == StatusCode::OK {
        Ok(())
    } else {
        Err(TunnelError::Status {
            status: status.as_u16(),
            body,
        })
    }
}
