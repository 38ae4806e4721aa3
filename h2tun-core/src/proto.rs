//! Wire surface shared by both tunnel endpoints.
//!
//! A tunnel is carried over four logical HTTP operations: `/connect` opens
//! it, a long-lived or polled `/pull` moves target-to-client bytes, `/push`
//! moves client-to-target bytes and control messages, and heartbeats ride
//! `/push` with their own message type.

use std::fmt;
use std::time::Duration;

use uuid::Uuid;

/// Route paths on the proxy server.
pub const CONNECT: &str = "/connect";
pub const PING: &str = "/ping";
pub const PULL: &str = "/pull";
pub const PUSH: &str = "/push";
pub const CHUNK_PULL: &str = "/chunk_pull";
pub const CHUNK_PUSH: &str = "/chunk_push";

/// `typ` header values on `/push`.
pub const DATA_TYP: &str = "data";
pub const QUIT_TYP: &str = "quit";
pub const HEART_TYP: &str = "heart";

/// Freshness window for signed timestamps.
pub const SIGN_TTL: Duration = Duration::from_secs(10);

/// Deadline for target dials and short client round-trips.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a server tunnel survives without a heartbeat.
pub const HEART_TTL: Duration = Duration::from_secs(60);

/// Copy buffer unit on both endpoints.
pub const BUF_SIZE: usize = 8 * 1024;

/// Value of the `version` response header on `/ping`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Header names used by the tunnel protocol.
///
/// Kept lowercase: HTTP/2 lowercases field names on the wire and lookups
/// are case-insensitive on both sides.
pub mod header {
    /// Unix timestamp (decimal seconds) the request was signed at.
    pub const TIMESTAMP: &str = "timestamp";
    /// HMAC-SHA1 of the timestamp, 40 hex characters.
    pub const SIGN: &str = "sign";
    /// Tunnel id; empty on `/connect`.
    pub const UUID: &str = "uuid";
    /// Target host, on `/connect`.
    pub const DSTHOST: &str = "dsthost";
    /// Target port, on `/connect`.
    pub const DSTPORT: &str = "dstport";
    /// Poll read deadline in nanoseconds on `/pull`; `0` or absent selects
    /// the streaming response.
    pub const INTERVAL: &str = "interval";
    /// Message type on `/push`: `data`, `heart` or `quit`.
    pub const TYP: &str = "typ";
    /// Server version, on `/ping` responses.
    pub const VERSION: &str = "version";
}

/// Fixed error bodies the server answers with on tunnel lookups.
///
/// Both ship with status 500; clients tell them apart by substring.
pub mod errbody {
    pub const UUID_NOT_FOUND: &str = "uuid don't exist";
    pub const CONN_CLOSED: &str = "remote conn is closed";
}

/// Opaque tunnel identifier, minted by the server at open time and echoed
/// by the client in the `uuid` header of every later operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TunnelId(String);

impl TunnelId {
    /// Mint a fresh, collision-free id.
    pub fn mint() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for TunnelId {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

impl From<&str> for TunnelId {
    fn from(raw: &str) -> Self {
        Self(raw.to_owned())
    }
}

impl fmt::Display for TunnelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Current unix time in whole seconds, as sent in the `timestamp` header.
pub fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}
