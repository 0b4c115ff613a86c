//! Wire protocol definitions
//!
//! All control traffic is carried as typed, length-prefixed messages:
//!
//! ```text
//! +------+--------------------+----------------------+
//! | type |  payload length    |     payload          |
//! |  1 B | 4 B little-endian  |    N bytes of JSON   |
//! +------+--------------------+----------------------+
//! ```
//!
//! The codec is oblivious to TLS; it operates on any byte stream.

mod codec;
mod msg;

pub use codec::{decode_message, encode_message, read_message, write_message};
pub use msg::{
    CloseProxy, Login, LoginResp, Message, NewProxy, NewProxyResp, NewWorkConn, Ping, Pong,
    ProxyType, ReqWorkConn, StartWorkConn, UdpPacket,
};

use thiserror::Error;

/// Maximum payload size (10 MiB); larger messages are protocol errors.
pub const MAX_PAYLOAD_SIZE: usize = 10 * 1024 * 1024;

/// Size of the frame header: type byte plus little-endian u32 length.
pub const HEADER_SIZE: usize = 5;

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown message type: 0x{0:02x}")]
    UnknownType(u8),

    #[error("message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("truncated message")]
    Truncated,

    #[error("invalid payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    #[error("unexpected message: {0}")]
    UnexpectedMessage(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
