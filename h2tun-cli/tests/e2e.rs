//! End-to-end scenarios over loopback: real server, real frontend, real
//! sockets in between.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use h2tun_client::{LocalServer, TunnelConnector, TunnelError};
use h2tun_core::proto;
use h2tun_core::Authenticator;
use h2tun_server::{ProxyState, TunnelRegistry};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const SECRET: &str = "12345";

async fn start_server() -> (SocketAddr, Arc<TunnelRegistry>) {
    let registry = TunnelRegistry::new();
    let state = ProxyState::new(SECRET, registry.clone());
    let app = h2tun_server::router(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = h2tun_server::serve_plain(listener, app).await;
    });
    (addr, registry)
}

fn connector(server: SocketAddr, interval: Duration) -> TunnelConnector {
    TunnelConnector::new(&format!("http://{server}"), SECRET, interval, None).unwrap()
}

async fn start_frontend(server: SocketAddr, interval: Duration) -> SocketAddr {
    let frontend = LocalServer::new(Arc::new(connector(server, interval)));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = frontend.serve(listener).await;
    });
    addr
}

async fn spawn_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let (mut rd, mut wr) = socket.split();
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
            });
        }
    });
    addr
}

/// Read until `needle` shows up in the collected bytes, or EOF.
async fn read_until(conn: &mut TcpStream, needle: &str) -> String {
    let mut collected = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), async {
        let mut buf = [0u8; 4096];
        loop {
            let n = conn.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            collected.extend_from_slice(&buf[..n]);
            if String::from_utf8_lossy(&collected).contains(needle) {
                break;
            }
        }
    })
    .await
    .expect("timed out waiting for response");
    String::from_utf8_lossy(&collected).into_owned()
}

#[tokio::test]
async fn ping_answers_with_version() {
    let (server, _registry) = start_server().await;
    let mut conn = TcpStream::connect(server).await.unwrap();
    conn.write_all(b"GET /ping HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();

    let text = read_until(&mut conn, "pong").await;
    assert!(text.starts_with("HTTP/1.1 200"));
    assert!(text.to_ascii_lowercase().contains("version:"));
    assert!(text.ends_with("pong"));
}

#[tokio::test]
async fn unauthenticated_connect_is_flat_404() {
    let (server, _registry) = start_server().await;
    let mut conn = TcpStream::connect(server).await.unwrap();
    conn.write_all(b"GET /connect HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();

    let text = read_until(&mut conn, "404").await;
    assert!(text.starts_with("HTTP/1.1 404"));
    assert!(text.ends_with("404"));
}

#[tokio::test]
async fn pull_with_empty_uuid_reports_the_fixed_body() {
    let (server, _registry) = start_server().await;
    let auth = Authenticator::new(SECRET);
    let ts = proto::unix_now().to_string();
    let sign = auth.sign(&ts);

    let mut conn = TcpStream::connect(server).await.unwrap();
    let req = format!(
        "GET /pull HTTP/1.1\r\nHost: {server}\r\ntimestamp: {ts}\r\nsign: {sign}\r\nuuid: \r\nConnection: close\r\n\r\n"
    );
    conn.write_all(req.as_bytes()).await.unwrap();

    let text = read_until(&mut conn, "uuid don't exist").await;
    assert!(text.starts_with("HTTP/1.1 500"));
    assert!(text.contains("uuid don't exist"));
}

#[tokio::test]
async fn http_proxy_get_streaming_mode() {
    let (server, _registry) = start_server().await;
    let frontend = start_frontend(server, Duration::ZERO).await;

    let mut conn = TcpStream::connect(frontend).await.unwrap();
    let req = format!("GET /ping HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n", server.port());
    conn.write_all(req.as_bytes()).await.unwrap();

    let text = read_until(&mut conn, "pong").await;
    assert!(text.contains("pong"));
}

#[tokio::test]
async fn http_proxy_get_polling_mode() {
    let (server, _registry) = start_server().await;
    let frontend = start_frontend(server, Duration::from_millis(50)).await;

    let mut conn = TcpStream::connect(frontend).await.unwrap();
    let req = format!("GET /ping HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n", server.port());
    conn.write_all(req.as_bytes()).await.unwrap();

    let text = read_until(&mut conn, "pong").await;
    assert!(text.contains("pong"));
}

#[tokio::test]
async fn socks5_proxy_get() {
    let (server, _registry) = start_server().await;
    let frontend = start_frontend(server, Duration::ZERO).await;

    let mut conn = TcpStream::connect(frontend).await.unwrap();
    conn.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut reply = [0u8; 2];
    conn.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0x00]);

    let mut request = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
    request.extend_from_slice(&server.port().to_be_bytes());
    conn.write_all(&request).await.unwrap();
    let mut reply = [0u8; 10];
    conn.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x08, 0x43]);

    conn.write_all(b"GET /ping HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();
    let text = read_until(&mut conn, "pong").await;
    assert!(text.contains("pong"));
}

#[tokio::test]
async fn connect_method_tunnels_raw_bytes() {
    let (server, _registry) = start_server().await;
    let frontend = start_frontend(server, Duration::ZERO).await;

    let mut conn = TcpStream::connect(frontend).await.unwrap();
    let req = format!(
        "CONNECT 127.0.0.1:{port} HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\r\n",
        port = server.port()
    );
    conn.write_all(req.as_bytes()).await.unwrap();
    let text = read_until(&mut conn, "Connection established").await;
    assert!(text.starts_with("HTTP/1.1 200"));

    conn.write_all(b"GET /ping HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let text = read_until(&mut conn, "pong").await;
    assert!(text.contains("pong"));
}

#[tokio::test]
async fn connect_method_can_be_disabled() {
    let (server, _registry) = start_server().await;
    let mut frontend = LocalServer::new(Arc::new(connector(server, Duration::ZERO)));
    frontend.disable_http_connect = true;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = frontend.serve(listener).await;
    });

    let mut conn = TcpStream::connect(addr).await.unwrap();
    conn.write_all(b"CONNECT 127.0.0.1:9 HTTP/1.1\r\nHost: 127.0.0.1:9\r\n\r\n")
        .await
        .unwrap();
    let text = read_until(&mut conn, "refused").await;
    assert!(text.starts_with("HTTP/1.1 502 Connection refused"));
}

#[tokio::test]
async fn socks5_can_be_disabled() {
    let (server, _registry) = start_server().await;
    let mut frontend = LocalServer::new(Arc::new(connector(server, Duration::ZERO)));
    frontend.disable_socks5 = true;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = frontend.serve(listener).await;
    });

    let mut conn = TcpStream::connect(addr).await.unwrap();
    conn.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let n = tokio::time::timeout(Duration::from_secs(10), conn.read(&mut [0u8; 16]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0, "connection should be refused without a reply");
}

#[tokio::test]
async fn frontend_rejects_http2_preface() {
    let (server, _registry) = start_server().await;
    let frontend = start_frontend(server, Duration::ZERO).await;

    let mut conn = TcpStream::connect(frontend).await.unwrap();
    conn.write_all(b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n").await.unwrap();
    let text = read_until(&mut conn, "400").await;
    assert!(text.starts_with("HTTP/1.1 400 Bad Request"));
}

#[tokio::test]
async fn streaming_bytes_arrive_in_order() {
    let (server, _registry) = start_server().await;
    let echo = spawn_echo().await;

    let tunnel = connector(server, Duration::ZERO)
        .connect(&echo.to_string())
        .await
        .unwrap();
    let shared = tunnel.shared();
    let (mut reader, mut writer) = tunnel.split();

    let payload: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();
    let write_task = tokio::spawn(async move {
        for chunk in payload.chunks(1024) {
            writer.write(chunk).await.unwrap();
        }
        // Keep the writer (and its egress sink) alive until the test ends.
        writer
    });

    let mut received = Vec::with_capacity(expected.len());
    let mut buf = [0u8; 4096];
    while received.len() < expected.len() {
        let n = tokio::time::timeout(Duration::from_secs(10), reader.read(&mut buf))
            .await
            .expect("timed out reading ingress")
            .unwrap();
        assert!(n > 0, "ingress ended early");
        received.extend_from_slice(&buf[..n]);
    }
    assert_eq!(received, expected);

    let _writer = write_task.await.unwrap();
    shared.close().await;
}

#[tokio::test]
async fn close_is_idempotent_and_drains_the_registry() {
    let (server, registry) = start_server().await;
    let echo = spawn_echo().await;

    let tunnel = connector(server, Duration::ZERO)
        .connect(&echo.to_string())
        .await
        .unwrap();
    assert_eq!(registry.len(), 1);

    let shared = tunnel.shared();
    shared.close().await;
    shared.close().await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(registry.is_empty());
}

#[tokio::test]
async fn dial_failure_surfaces_through_open() {
    let (server, _registry) = start_server().await;
    let err = connector(server, Duration::ZERO)
        .connect("127.0.0.1:1")
        .await
        .unwrap_err();

    match err {
        TunnelError::Status { status, body } => {
            assert_eq!(status, 500);
            assert!(body.starts_with("connect 127.0.0.1:1"));
        }
        other => panic!("expected a status error, got {other}"),
    }
}

#[tokio::test]
async fn tls_tunnel_end_to_end() {
    let dir = std::env::temp_dir().join(format!("h2tun-e2e-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let cert_path = dir.join("cert.pem");
    let key_path = dir.join("key.pem");
    let (cert_pem, key_pem) = h2tun_cli::gencert::generate(&["127.0.0.1".to_string()], 7).unwrap();
    std::fs::write(&cert_path, cert_pem).unwrap();
    std::fs::write(&key_path, key_pem).unwrap();

    let registry = TunnelRegistry::new();
    let state = ProxyState::new(SECRET, registry.clone());
    let app = h2tun_server::router(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let tls = h2tun_server::tls::load_tls_config(
        cert_path.to_str().unwrap(),
        key_path.to_str().unwrap(),
    )
    .unwrap();
    tokio::spawn(async move {
        let _ = h2tun_server::serve_tls(listener, app, tls).await;
    });

    let echo = spawn_echo().await;
    let connector = TunnelConnector::new(
        &format!("https://{addr}"),
        SECRET,
        Duration::ZERO,
        cert_path.to_str(),
    )
    .unwrap();
    let tunnel = connector.connect(&echo.to_string()).await.unwrap();
    let shared = tunnel.shared();
    let (mut reader, mut writer) = tunnel.split();

    writer.write(b"over tls").await.unwrap();
    let mut received = Vec::new();
    let mut buf = [0u8; 64];
    while received.len() < 8 {
        let n = tokio::time::timeout(Duration::from_secs(10), reader.read(&mut buf))
            .await
            .expect("timed out reading ingress")
            .unwrap();
        assert!(n > 0, "ingress ended early");
        received.extend_from_slice(&buf[..n]);
    }
    assert_eq!(&received, b"over tls");

    shared.close().await;
}
