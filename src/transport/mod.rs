//! Transport layer
//!
//! Pluggable adapters producing byte streams for the core: plain TCP and
//! rustls-based TLS. The control session, broker, and splicer all operate
//! on [`BoxedStream`] and stay unaware of the underlying transport.

mod tcp;
mod tls;

pub use tcp::{TcpDialer, TcpListenerAdapter};
pub use tls::{TlsDialer, TlsListenerAdapter};

use async_trait::async_trait;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("timeout")]
    Timeout,
}

/// Object-safe byte stream
pub trait IoStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T> IoStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// A transport-agnostic byte stream
pub type BoxedStream = Box<dyn IoStream>;

/// Dials outbound byte streams (client side and work connections).
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Open a byte stream to `addr`, completing any transport handshake.
    async fn open(&self, addr: &str) -> Result<BoxedStream, TransportError>;
}

/// Accepts inbound byte streams (server side).
///
/// Accepting is split in two stages so a slow TLS handshake never stalls
/// the accept loop: `accept` yields the raw connection, `handshake`
/// upgrades it on the connection's own task.
#[async_trait]
pub trait Listener: Send + Sync {
    /// Wait for the next raw connection.
    async fn accept(&self) -> Result<(TcpStream, SocketAddr), TransportError>;

    /// Upgrade a raw connection into a byte stream.
    async fn handshake(&self, stream: TcpStream) -> Result<BoxedStream, TransportError>;

    /// The bound local address.
    fn local_addr(&self) -> Result<SocketAddr, TransportError>;
}
