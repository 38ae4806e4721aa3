//! The HTTP tunnel surface.
//!
//! Six routes on one listener. `/ping` is open; the rest pass the `before`
//! check, which validates the signed timestamp headers and answers a flat
//! `404` on any failure without saying which check tripped. Status codes
//! double as application signaling: `200` success, `500` tunnel error,
//! `404` auth error.

use std::io;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Request, StatusCode},
    response::Response,
    routing::{any, get, post},
    Router,
};
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use h2tun_core::proto::{self, errbody, header, BUF_SIZE, CONNECT_TIMEOUT, SIGN_TTL};
use h2tun_core::{Authenticator, TunnelId};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tracing::{debug, info, warn};

use crate::registry::{ServerTunnel, TunnelRegistry};

/// Shared state behind the router.
pub struct ProxyState {
    pub registry: Arc<TunnelRegistry>,
    auth: Authenticator,
}

impl ProxyState {
    pub fn new(secret: &str, registry: Arc<TunnelRegistry>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            auth: Authenticator::new(secret),
        })
    }
}

#[derive(Debug, thiserror::Error)]
enum VerifyError {
    #[error("timestamp is empty")]
    MissingTimestamp,
    #[error("timestamp invalid")]
    BadTimestamp,
    #[error("timestamp expired")]
    Expired,
    #[error("sign invalid")]
    BadSignature,
}

/// Build the tunnel router.
pub fn router(state: Arc<ProxyState>) -> Router {
    Router::new()
        .route(proto::PING, get(ping))
        .route(proto::CONNECT, get(connect))
        .route(proto::PULL, get(pull))
        .route(proto::PUSH, post(push))
        .route(proto::CHUNK_PULL, any(chunk_pull))
        .route(proto::CHUNK_PUSH, any(chunk_push))
        .with_state(state)
}

/// Serve cleartext. The connection builder under `axum::serve` speaks both
/// HTTP/1.1 and prior-knowledge HTTP/2 (h2c).
pub async fn serve_plain(listener: TcpListener, app: Router) -> anyhow::Result<()> {
    axum::serve(listener, app).await?;
    Ok(())
}

/// Serve TLS with ALPN `h2, http/1.1`.
pub async fn serve_tls(
    listener: TcpListener,
    app: Router,
    tls: Arc<rustls::ServerConfig>,
) -> anyhow::Result<()> {
    let acceptor = TlsAcceptor::from(tls);

    loop {
        let (tcp, remote_addr) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "failed to accept connection");
                continue;
            }
        };

        let acceptor = acceptor.clone();
        let app = app.clone();

        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(tcp).await {
                Ok(stream) => stream,
                Err(e) => {
                    debug!(remote = %remote_addr, error = %e, "tls handshake failed");
                    return;
                }
            };

            if let Some(proto) = tls_stream.get_ref().1.alpn_protocol() {
                debug!(
                    remote = %remote_addr,
                    proto = %String::from_utf8_lossy(proto),
                    "negotiated protocol"
                );
            }

            let io = TokioIo::new(tls_stream);
            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                let (parts, body) = req.into_parts();
                let req = Request::from_parts(parts, Body::new(body));
                let app = app.clone();
                async move { app.oneshot(req).await }
            });

            // Protocol picked by ALPN during the handshake.
            let builder = AutoBuilder::new(TokioExecutor::new());
            if let Err(e) = builder.serve_connection(io, service).await {
                debug!(remote = %remote_addr, error = %e, "connection error");
            }
        });
    }
}

impl ProxyState {
    fn verify(&self, headers: &HeaderMap) -> Result<(), VerifyError> {
        let ts = header_str(headers, header::TIMESTAMP);
        if ts.is_empty() {
            return Err(VerifyError::MissingTimestamp);
        }
        let tm: i64 = ts.parse().map_err(|_| VerifyError::BadTimestamp)?;
        if proto::unix_now() - tm > SIGN_TTL.as_secs() as i64 {
            return Err(VerifyError::Expired);
        }
        let sign = header_str(headers, header::SIGN);
        if !self.auth.verify(ts, sign) {
            return Err(VerifyError::BadSignature);
        }
        Ok(())
    }

    /// Auth pre-check for every protected route. The response never reveals
    /// which check failed.
    fn before(&self, headers: &HeaderMap) -> Result<(), Response> {
        self.verify(headers).map_err(|e| {
            warn!(reason = %e, "request failed verification");
            respond(StatusCode::NOT_FOUND, "404")
        })
    }

    fn lookup(&self, headers: &HeaderMap) -> Result<Arc<ServerTunnel>, Response> {
        let id = TunnelId::from(header_str(headers, header::UUID));
        match self.registry.get(&id) {
            Some(tunnel) => Ok(tunnel),
            None => {
                warn!(uuid = %id, "no tunnel for this uuid");
                Err(respond(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    errbody::UUID_NOT_FOUND,
                ))
            }
        }
    }
}

async fn ping() -> Response {
    Response::builder()
        .header(header::VERSION, proto::VERSION)
        .body(Body::from("pong"))
        .unwrap_or_else(|_| respond(StatusCode::OK, "pong"))
}

async fn connect(State(state): State<Arc<ProxyState>>, headers: HeaderMap) -> Response {
    if let Err(resp) = state.before(&headers) {
        return resp;
    }

    let host = header_str(&headers, header::DSTHOST);
    let addr = format!("{host}:{}", header_str(&headers, header::DSTPORT));
    let port: u16 = match header_str(&headers, header::DSTPORT).parse() {
        Ok(port) => port,
        Err(_) => {
            return respond(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("connect {addr} invalid port"),
            )
        }
    };

    let stream = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port))).await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            return respond(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("connect {addr} {e}"),
            )
        }
        Err(_) => {
            return respond(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("connect {addr} timed out"),
            )
        }
    };

    let id = state.registry.insert(stream);
    info!(%addr, uuid = %id, "connect success");
    respond(StatusCode::OK, id.as_str().to_owned())
}

async fn pull(State(state): State<Arc<ProxyState>>, headers: HeaderMap) -> Response {
    if let Err(resp) = state.before(&headers) {
        return resp;
    }
    let tunnel = match state.lookup(&headers) {
        Ok(tunnel) => tunnel,
        Err(resp) => return resp,
    };
    if tunnel.is_closed() {
        return respond(StatusCode::INTERNAL_SERVER_ERROR, errbody::CONN_CLOSED);
    }

    let interval = parse_interval(&headers);
    if interval > 0 {
        poll_pull(tunnel, std::time::Duration::from_nanos(interval as u64)).await
    } else {
        stream_pull(tunnel).await
    }
}

/// One bounded read from the target; a deadline expiry is a successful
/// empty response, anything terminal closes the tunnel.
async fn poll_pull(tunnel: Arc<ServerTunnel>, deadline: std::time::Duration) -> Response {
    let mut guard = tunnel.reader().await;
    let Some(reader) = guard.as_mut() else {
        // A streaming pull owns the read half; nothing to poll.
        return octets(Bytes::new());
    };

    let mut buf = BytesMut::with_capacity(BUF_SIZE);
    match tokio::time::timeout(deadline, reader.read_buf(&mut buf)).await {
        Err(_) => octets(Bytes::new()),
        Ok(Ok(0)) => {
            debug!(uuid = %tunnel.id, "target closed, closing the tunnel");
            tunnel.close();
            octets(buf.freeze())
        }
        Ok(Ok(_)) => octets(buf.freeze()),
        Ok(Err(e)) => {
            if !tunnel.is_closed() {
                warn!(uuid = %tunnel.id, error = %e, "target read failed");
            }
            tunnel.close();
            octets(Bytes::new())
        }
    }
}

/// Closes the tunnel when the streaming response winds down, however that
/// happens: target EOF, tunnel close, or the client going away.
struct PullGuard(Arc<ServerTunnel>);

impl Drop for PullGuard {
    fn drop(&mut self) {
        self.0.close();
    }
}

struct PullState {
    reader: OwnedReadHalf,
    token: CancellationToken,
    _guard: PullGuard,
}

/// Long-lived response: copy target bytes into the body until the target
/// ends or the tunnel closes. Each yielded chunk is flushed by the
/// transport as its own frame.
async fn stream_pull(tunnel: Arc<ServerTunnel>) -> Response {
    let Some(reader) = tunnel.take_reader().await else {
        return respond(StatusCode::INTERNAL_SERVER_ERROR, errbody::CONN_CLOSED);
    };

    let state = PullState {
        reader,
        token: tunnel.closing(),
        _guard: PullGuard(tunnel),
    };

    let stream = futures_util::stream::unfold(state, |mut st| async move {
        let mut buf = BytesMut::with_capacity(BUF_SIZE);
        tokio::select! {
            _ = st.token.cancelled() => None,
            res = st.reader.read_buf(&mut buf) => match res {
                Ok(0) => None,
                Ok(_) => Some((Ok::<Bytes, io::Error>(buf.freeze()), st)),
                Err(_) => None,
            },
        }
    });

    Response::builder()
        .header("content-type", "application/octet-stream")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| respond(StatusCode::OK, ""))
}

async fn push(
    State(state): State<Arc<ProxyState>>,
    headers: HeaderMap,
    request: Request<Body>,
) -> Response {
    if let Err(resp) = state.before(&headers) {
        return resp;
    }
    let tunnel = match state.lookup(&headers) {
        Ok(tunnel) => tunnel,
        Err(resp) => return resp,
    };
    if tunnel.is_closed() {
        return respond(StatusCode::INTERNAL_SERVER_ERROR, errbody::CONN_CLOSED);
    }

    match header_str(&headers, header::TYP) {
        proto::HEART_TYP => tunnel.heart(),
        proto::QUIT_TYP => {
            debug!(uuid = %tunnel.id, "quit, closing the tunnel");
            tunnel.close();
        }
        proto::DATA_TYP => push_data(&tunnel, request.into_body()).await,
        _ => {}
    }

    respond(StatusCode::OK, "")
}

/// Copy the request body to the target. In streaming mode this request
/// lives as long as the tunnel, so it also watches the close token.
async fn push_data(tunnel: &Arc<ServerTunnel>, body: Body) {
    let token = tunnel.closing();
    let mut frames = body.into_data_stream();
    let mut writer = tunnel.writer().await;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            chunk = frames.next() => match chunk {
                None => break,
                Some(Ok(bytes)) => {
                    if let Err(e) = writer.write_all(&bytes).await {
                        if !tunnel.is_closed() {
                            warn!(uuid = %tunnel.id, error = %e, "target write failed");
                        }
                        tunnel.close();
                        break;
                    }
                }
                Some(Err(e)) => {
                    debug!(uuid = %tunnel.id, error = %e, "push body ended early");
                    tunnel.close();
                    break;
                }
            },
        }
    }
}

/// Reserved endpoint; verified no-op.
async fn chunk_pull(State(state): State<Arc<ProxyState>>, headers: HeaderMap) -> Response {
    if let Err(resp) = state.before(&headers) {
        return resp;
    }
    respond(StatusCode::OK, "")
}

/// Reserved endpoint; verified no-op.
async fn chunk_push(State(state): State<Arc<ProxyState>>, headers: HeaderMap) -> Response {
    if let Err(resp) = state.before(&headers) {
        return resp;
    }
    respond(StatusCode::OK, "")
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

fn parse_interval(headers: &HeaderMap) -> i64 {
    let raw = header_str(headers, header::INTERVAL);
    if raw.is_empty() {
        return 0;
    }
    match raw.parse() {
        Ok(n) => n,
        Err(e) => {
            warn!(interval = raw, error = %e, "bad interval header");
            0
        }
    }
}

fn respond(status: StatusCode, body: impl Into<Body>) -> Response {
    Response::builder()
        .status(status)
        .body(body.into())
        .unwrap_or_else(|_| {
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Body::empty())
                .expect("static response parts")
        })
}

fn octets(bytes: Bytes) -> Response {
    Response::builder()
        .header("content-type", "application/octet-stream")
        .body(Body::from(bytes))
        .unwrap_or_else(|_| respond(StatusCode::OK, ""))
}
