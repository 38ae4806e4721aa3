//! Tunnel registry and per-tunnel lifecycle.
//!
//! Every successful `/connect` puts one [`ServerTunnel`] into the registry
//! and spawns its lifecycle task. The task waits on three signals: a
//! heartbeat resets the idle timer, a close request ends the tunnel, and an
//! idle timer expiry ends it too. On exit the id is removed from the map
//! before the target socket is released.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use h2tun_core::proto::HEART_TTL;
use h2tun_core::TunnelId;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A live tunnel on the server: the target TCP connection plus the signals
/// that keep it alive.
pub struct ServerTunnel {
    pub id: TunnelId,
    /// Read half of the target connection. A streaming `/pull` takes it for
    /// the rest of the tunnel's life; polling `/pull`s borrow it in turn.
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: Mutex<OwnedWriteHalf>,
    closed: AtomicBool,
    heart_tx: mpsc::Sender<()>,
    cancel: CancellationToken,
    created_at: Instant,
}

impl ServerTunnel {
    fn new(id: TunnelId, stream: TcpStream) -> (Arc<Self>, mpsc::Receiver<()>) {
        let (heart_tx, heart_rx) = mpsc::channel(1);
        let (rd, wr) = stream.into_split();
        let tunnel = Arc::new(Self {
            id,
            reader: Mutex::new(Some(rd)),
            writer: Mutex::new(wr),
            closed: AtomicBool::new(false),
            heart_tx,
            cancel: CancellationToken::new(),
            created_at: Instant::now(),
        });
        (tunnel, heart_rx)
    }

    /// Mark the tunnel closed and wake its lifecycle task. Idempotent.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Reset the idle timer. Lossy; a full signal slot already holds a
    /// pending reset.
    pub fn heart(&self) {
        let _ = self.heart_tx.try_send(());
    }

    /// Token that fires when the tunnel closes; in-flight `/pull` and
    /// `/push` streams select on it.
    pub fn closing(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Take the target read half out for a streaming `/pull`.
    pub async fn take_reader(&self) -> Option<OwnedReadHalf> {
        self.reader.lock().await.take()
    }

    /// Borrow the target read half for one polled read.
    pub async fn reader(&self) -> MutexGuard<'_, Option<OwnedReadHalf>> {
        self.reader.lock().await
    }

    /// Borrow the target write half; `/push` data holds it for the whole
    /// request body so writes stay ordered.
    pub async fn writer(&self) -> MutexGuard<'_, OwnedWriteHalf> {
        self.writer.lock().await
    }

    fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

/// All live tunnels, keyed by id.
pub struct TunnelRegistry {
    tunnels: DashMap<TunnelId, Arc<ServerTunnel>>,
    heart_ttl: Duration,
}

impl TunnelRegistry {
    pub fn new() -> Arc<Self> {
        Self::with_heart_ttl(HEART_TTL)
    }

    /// Registry with a custom idle lifetime; tests shrink it.
    pub fn with_heart_ttl(heart_ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            tunnels: DashMap::new(),
            heart_ttl,
        })
    }

    /// Admit a freshly dialed target connection: mint an id, register the
    /// tunnel and start its lifecycle task.
    pub fn insert(self: &Arc<Self>, stream: TcpStream) -> TunnelId {
        let id = TunnelId::mint();
        let (tunnel, heart_rx) = ServerTunnel::new(id.clone(), stream);
        self.tunnels.insert(id.clone(), tunnel.clone());

        let registry = self.clone();
        tokio::spawn(async move {
            registry.run_lifecycle(tunnel, heart_rx).await;
        });

        id
    }

    pub fn get(&self, id: &TunnelId) -> Option<Arc<ServerTunnel>> {
        self.tunnels.get(id).map(|t| t.clone())
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }

    async fn run_lifecycle(&self, tunnel: Arc<ServerTunnel>, mut heart_rx: mpsc::Receiver<()>) {
        loop {
            tokio::select! {
                _ = tunnel.cancel.cancelled() => break,
                beat = heart_rx.recv() => match beat {
                    Some(()) => continue,
                    None => break,
                },
                _ = tokio::time::sleep(self.heart_ttl) => {
                    debug!(uuid = %tunnel.id, "tunnel idle past heart ttl");
                    break;
                }
            }
        }

        // Remove the id first, then cancel: in-flight streams finish and the
        // socket drops with the last reference.
        tunnel.closed.store(true, Ordering::SeqCst);
        self.tunnels.remove(&tunnel.id);
        tunnel.cancel.cancel();
        debug!(uuid = %tunnel.id, age = ?tunnel.age(), "tunnel closed");
    }
}
