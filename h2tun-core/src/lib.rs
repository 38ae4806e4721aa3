//! Shared building blocks for the h2tun tunnel client and server.
//!
//! This crate carries the pieces both endpoints agree on: the HTTP wire
//! surface (routes, header names, message types, timing constants), the
//! HMAC request authenticator, and the logging bootstrap.

pub mod auth;
pub mod logging;
pub mod proto;

pub use auth::Authenticator;
pub use proto::TunnelId;
