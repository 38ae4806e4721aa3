//! Local SOCKS5 / HTTP proxy frontend.
//!
//! One accept loop, one task per connection. The first byte decides the
//! protocol: `0x05` is SOCKS5, anything else is treated as HTTP/1 with the
//! already-read bytes re-fed to the parser. Either way the decoded target
//! address seeds a tunnel, and the rest is two byte copies.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use h2tun_core::proto::BUF_SIZE;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::error::FrontendError;
use crate::tunnel::{TunnelConnector, TunnelReader, TunnelShared, TunnelWriter};

const SOCKS_VER: u8 = 0x05;
const SOCKS_CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Fixed success reply: bind address 0.0.0.0, bind port 0x0843.
const SOCKS_REPLY: [u8; 10] = [0x05, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x08, 0x43];

/// Upper bound on an HTTP request head read from an application.
const MAX_HEAD: usize = 64 * 1024;

/// Local proxy server accepting SOCKS5 and HTTP connections.
#[derive(Clone)]
pub struct LocalServer {
    pub connector: Arc<TunnelConnector>,
    pub disable_socks5: bool,
    pub disable_http: bool,
    pub disable_http_connect: bool,
}

impl LocalServer {
    pub fn new(connector: Arc<TunnelConnector>) -> Self {
        Self {
            connector,
            disable_socks5: false,
            disable_http: false,
            disable_http_connect: false,
        }
    }

    /// Bind `addr` and run the accept loop.
    pub async fn listen(self, addr: &str) -> Result<(), FrontendError> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Run the accept loop on an already-bound listener.
    pub async fn serve(self, listener: TcpListener) -> Result<(), FrontendError> {
        info!(addr = %listener.local_addr()?, "socks5/http proxy started");
        loop {
            match listener.accept().await {
                Ok((conn, peer)) => {
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_conn(conn, &peer.to_string()).await {
                            error!(from = %peer, error = %e, "handle conn");
                        }
                    });
                }
                Err(e) => error!(error = %e, "accept"),
            }
        }
    }

    async fn handle_conn<S>(&self, mut conn: S, peer: &str) -> Result<(), FrontendError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut buf = vec![0u8; 258];
        let n = read_at_least(&mut conn, &mut buf, 2).await?;

        if buf[0] == SOCKS_VER {
            if self.disable_socks5 {
                return Err(FrontendError::NotSupportedProtocol);
            }
            let addr = socks5_handshake(&mut conn, &mut buf, n).await?;
            info!(%peer, %addr, "socks5");
            let tunnel = self.connector.connect(&addr).await?;
            conn.write_all(&SOCKS_REPLY).await?;

            let shared = tunnel.shared();
            let (reader, writer) = tunnel.split();
            copy_bidi(conn, shared, reader, writer).await
        } else {
            if self.disable_http {
                return Err(FrontendError::NotSupportedProtocol);
            }
            buf.truncate(n);
            self.handle_http(conn, buf, peer).await
        }
    }

    async fn handle_http<S>(
        &self,
        mut conn: S,
        mut buf: Vec<u8>,
        peer: &str,
    ) -> Result<(), FrontendError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        // Grow the buffer until the request head parses.
        let (head, parsed_len) = loop {
            // No HTTP/2 prior knowledge on the frontend.
            if buf.len() >= 4 && buf.starts_with(b"PRI ") {
                conn.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await?;
                return Err(FrontendError::NotSupportedNow);
            }
            match try_parse(&buf)? {
                Some(parsed) => break parsed,
                None => {
                    if buf.len() > MAX_HEAD {
                        return Err(FrontendError::BadRequest("header too large".into()));
                    }
                    let mut chunk = [0u8; 1024];
                    let m = conn.read(&mut chunk).await?;
                    if m == 0 {
                        return Err(FrontendError::BadRequest(
                            "connection closed mid-request".into(),
                        ));
                    }
                    buf.extend_from_slice(&chunk[..m]);
                }
            }
        };

        let is_connect = head.method.eq_ignore_ascii_case("CONNECT");
        let host = if is_connect {
            head.path.clone()
        } else {
            match absolute_host(&head.path) {
                Some(h) => h.to_owned(),
                None => head
                    .header("host")
                    .map(str::to_owned)
                    .ok_or(FrontendError::MissingHost)?,
            }
        };
        info!(%peer, method = %head.method, %host, "http");

        if is_connect && self.disable_http_connect {
            conn.write_all(b"HTTP/1.1 502 Connection refused\r\n\r\n")
                .await?;
            return Err(FrontendError::NotSupportedProtocol);
        }

        let mut addr = host.clone();
        if !addr.contains(':') {
            addr.push_str(":80");
        }
        let tunnel = self.connector.connect(&addr).await?;
        let shared = tunnel.shared();
        let (reader, mut writer) = tunnel.split();

        if is_connect {
            conn.write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                .await?;
        } else {
            writer.write(&serialize_head(&head, &host)).await?;
        }
        // Bytes read past the head already belong to the target.
        if parsed_len < buf.len() {
            writer.write(&buf[parsed_len..]).await?;
        }

        copy_bidi(conn, shared, reader, writer).await
    }
}

/// Run the two copy directions; the first to finish tears both down.
async fn copy_bidi<S>(
    conn: S,
    shared: Arc<TunnelShared>,
    mut reader: TunnelReader,
    mut writer: TunnelWriter,
) -> Result<(), FrontendError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut rd, mut wr) = tokio::io::split(conn);

    let up = async {
        let mut buf = vec![0u8; BUF_SIZE];
        loop {
            let n = rd.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            writer.write(&buf[..n]).await?;
        }
        Ok::<_, FrontendError>(())
    };

    let down = async {
        let mut buf = vec![0u8; BUF_SIZE];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            wr.write_all(&buf[..n]).await?;
        }
        let _ = wr.shutdown().await;
        Ok::<_, FrontendError>(())
    };

    let result = tokio::select! {
        r = up => r,
        r = down => r,
    };

    shared.close().await;
    if let Err(ref e) = result {
        debug!(uuid = %shared.id(), error = %e, "copy finished with error");
    }
    result
}

/// Decode the SOCKS5 greeting and CONNECT request, answering the no-auth
/// method choice in between. `buf` holds the `n` bytes already read.
async fn socks5_handshake<S>(
    conn: &mut S,
    buf: &mut [u8],
    n: usize,
) -> Result<String, FrontendError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let nmethods = buf[1] as usize;
    let msg_len = nmethods + 2;
    if n < msg_len {
        conn.read_exact(&mut buf[n..msg_len]).await?;
    } else if n > msg_len {
        return Err(FrontendError::AuthExtraData);
    }
    // Version 5, no authentication required.
    conn.write_all(&[0x05, 0x00]).await?;

    let mut req = [0u8; 263];
    let n = read_at_least(conn, &mut req, 5).await?;
    if req[0] != SOCKS_VER {
        return Err(FrontendError::Version);
    }
    if req[1] != SOCKS_CMD_CONNECT {
        return Err(FrontendError::Command);
    }
    let req_len = match req[3] {
        ATYP_IPV4 => 4 + 6,
        ATYP_IPV6 => 16 + 6,
        ATYP_DOMAIN => req[4] as usize + 7,
        _ => return Err(FrontendError::AddrType),
    };
    if n < req_len {
        conn.read_exact(&mut req[n..req_len]).await?;
    } else if n > req_len {
        return Err(FrontendError::ReqExtraData);
    }

    let host = match req[3] {
        ATYP_IPV4 => Ipv4Addr::new(req[4], req[5], req[6], req[7]).to_string(),
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&req[4..20]);
            Ipv6Addr::from(octets).to_string()
        }
        _ => String::from_utf8_lossy(&req[5..5 + req[4] as usize]).into_owned(),
    };
    let port = u16::from_be_bytes([req[req_len - 2], req[req_len - 1]]);
    Ok(format!("{host}:{port}"))
}

async fn read_at_least<S>(conn: &mut S, buf: &mut [u8], min: usize) -> Result<usize, FrontendError>
where
    S: AsyncRead + Unpin,
{
    let mut n = 0;
    while n < min {
        let m = conn.read(&mut buf[n..]).await?;
        if m == 0 {
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
        }
        n += m;
    }
    Ok(n)
}

struct RequestHead {
    method: String,
    path: String,
    headers: Vec<(String, String)>,
}

impl RequestHead {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Parse a request head out of `buf`; `None` means more bytes are needed.
fn try_parse(buf: &[u8]) -> Result<Option<(RequestHead, usize)>, FrontendError> {
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut req = httparse::Request::new(&mut headers);
    match req.parse(buf) {
        Ok(httparse::Status::Complete(parsed_len)) => {
            let head = RequestHead {
                method: req.method.unwrap_or("").to_owned(),
                path: req.path.unwrap_or("").to_owned(),
                headers: req
                    .headers
                    .iter()
                    .filter(|h| !h.name.is_empty())
                    .map(|h| {
                        (
                            h.name.to_owned(),
                            String::from_utf8_lossy(h.value).into_owned(),
                        )
                    })
                    .collect(),
            };
            Ok(Some((head, parsed_len)))
        }
        Ok(httparse::Status::Partial) => Ok(None),
        Err(e) => Err(FrontendError::BadRequest(e.to_string())),
    }
}

/// Authority of an absolute-form request target, if it has one.
fn absolute_host(path: &str) -> Option<&str> {
    let (_, rest) = path.split_once("://")?;
    Some(match rest.find('/') {
        Some(i) => &rest[..i],
        None => rest,
    })
}

/// Request target reduced to origin form.
fn origin_form(path: &str) -> &str {
    if let Some((_, rest)) = path.split_once("://") {
        match rest.find('/') {
            Some(i) => &rest[i..],
            None => "/",
        }
    } else if path.is_empty() {
        "/"
    } else {
        path
    }
}

/// Re-serialize the request head for the target: origin-form target,
/// `Proxy-Connection` stripped, `Connection: Keep-Alive` forced.
fn serialize_head(head: &RequestHead, host: &str) -> Vec<u8> {
    let mut out = format!("{} {} HTTP/1.1\r\n", head.method, origin_form(&head.path)).into_bytes();
    let mut has_host = false;
    for (name, value) in &head.headers {
        if name.eq_ignore_ascii_case("proxy-connection") || name.eq_ignore_ascii_case("connection")
        {
            continue;
        }
        if name.eq_ignore_ascii_case("host") {
            has_host = true;
        }
        out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    if !has_host {
        out.extend_from_slice(format!("Host: {host}\r\n").as_bytes());
    }
    out.extend_from_slice(b"Connection: Keep-Alive\r\n\r\n");
    out
}
