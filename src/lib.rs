//! # AetherTunnel
//!
//! A reverse tunneling gateway that exposes services living behind NAT or
//! firewalled networks. An always-on client dials out to a public server;
//! the server accepts public traffic on allocated remote ports and relays
//! it, byte-for-byte, through a single authenticated control channel back
//! to the client, which connects to the real upstream service.
//!
//! ## Features
//!
//! - **Authenticated control sessions** with Ed25519 login signatures and
//!   HMAC-signed heartbeats
//! - **Dynamic remote listeners** (tcp, http, https, udp) registered and
//!   torn down over the control channel
//! - **Per-connection work streams** paired with end-user connections and
//!   spliced bidirectionally with optional bandwidth caps
//! - **Optional data-plane encryption** using a ChaCha20-Poly1305 record
//!   envelope with HKDF-derived keys
//! - **TCP or TLS transport** for control and work connections
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                       Server                         │
//! │   accept loop ─▶ control session ─▶ proxy registry   │
//! │        │               │                 │           │
//! │   work conns      auth/heartbeat   remote listeners  │
//! │        └───────────── broker ◀───────────┘           │
//! │                        │                             │
//! │                     splicer                          │
//! ├──────────────────────────────────────────────────────┤
//! │                Framed wire protocol                  │
//! │        (type byte + u32 length + JSON payload)       │
//! ├──────────────────────────────────────────────────────┤
//! │                 Transport (TCP / TLS)                │
//! └──────────────────────────────────────────────────────┘
//! ```

pub mod auth;
pub mod client;
pub mod config;
pub mod crypto;
pub mod protocol;
pub mod relay;
pub mod server;
pub mod transport;

pub use config::Config;

/// Crate version, carried in Login and LoginResp.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("Auth error: {0}")]
    Auth(#[from] auth::AuthError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Relay error: {0}")]
    Relay(#[from] relay::RelayError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("login rejected: {0}")]
    LoginRejected(String),

    #[error("work connection rejected: {0}")]
    WorkConnRejected(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timeout")]
    Timeout,
}
