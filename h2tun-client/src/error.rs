//! Client-side error types.

use thiserror::Error;

/// Errors from tunnel operations against the remote server.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("invalid server url: {0}")]
    BadServerUrl(String),

    #[error("invalid address format: {0}")]
    BadAddress(String),

    /// The server answered with an application-level status. The body keeps
    /// the server's fixed error strings, so callers can match on them.
    #[error("status code is {status}, body is: {body}")]
    Status { status: u16, body: String },

    #[error("pull http connection is not ready")]
    PullNotReady,

    #[error("tunnel is closed")]
    Closed,

    #[error("request timed out")]
    Timeout,

    #[error("http transport: {0}")]
    Transport(#[from] hyper::Error),

    #[error("http request: {0}")]
    Http(#[from] http::Error),

    #[error("tls: {0}")]
    Tls(#[from] rustls::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Decode failures on connections accepted by the local frontend.
#[derive(Debug, Error)]
pub enum FrontendError {
    #[error("protocol not supported")]
    NotSupportedProtocol,

    #[error("not supported now")]
    NotSupportedNow,

    #[error("socks authentication get extra data")]
    AuthExtraData,

    #[error("socks command not supported")]
    Command,

    #[error("socks addr type not supported")]
    AddrType,

    #[error("socks version not supported")]
    Version,

    #[error("socks request get extra data")]
    ReqExtraData,

    #[error("bad http request: {0}")]
    BadRequest(String),

    #[error("request has no host")]
    MissingHost,

    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
