//! Framed message encoding/decoding
//!
//! Writers emit the header and payload as a single write so framing can
//! never interleave between concurrent messages on the same stream (the
//! write path is additionally serialized by a single writer task per
//! session). Readers fail with a protocol error on unknown type bytes,
//! oversized lengths, or short reads.

use super::msg::*;
use super::{Message, ProtocolError, HEADER_SIZE, MAX_PAYLOAD_SIZE};
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Encode a message into a freshly allocated wire buffer.
pub fn encode_message(msg: &Message) -> Result<Vec<u8>, ProtocolError> {
    let payload = match msg {
        Message::Login(m) => serde_json::to_vec(m)?,
        Message::LoginResp(m) => serde_json::to_vec(m)?,
        Message::NewProxy(m) => serde_json::to_vec(m)?,
        Message::NewProxyResp(m) => serde_json::to_vec(m)?,
        Message::CloseProxy(m) => serde_json::to_vec(m)?,
        Message::ReqWorkConn(m) => serde_json::to_vec(m)?,
        Message::NewWorkConn(m) => serde_json::to_vec(m)?,
        Message::StartWorkConn(m) => serde_json::to_vec(m)?,
        Message::Ping(m) => serde_json::to_vec(m)?,
        Message::Pong(m) => serde_json::to_vec(m)?,
        Message::UdpPacket(m) => serde_json::to_vec(m)?,
    };

    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::MessageTooLarge(payload.len()));
    }

    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    buf.put_u8(msg.type_byte());
    buf.put_u32_le(payload.len() as u32);
    buf.extend_from_slice(&payload);
    Ok(buf.to_vec())
}

/// Decode one message from the front of `buf`.
///
/// Returns the message and the number of bytes consumed. A buffer shorter
/// than the framed length is a [`ProtocolError::Truncated`]; no input past
/// the reported consumption is examined.
pub fn decode_message(buf: &[u8]) -> Result<(Message, usize), ProtocolError> {
    if buf.len() < HEADER_SIZE {
        return Err(ProtocolError::Truncated);
    }

    let type_byte = buf[0];
    let len = u32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
    if len > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::MessageTooLarge(len));
    }
    if buf.len() < HEADER_SIZE + len {
        return Err(ProtocolError::Truncated);
    }

    let payload = &buf[HEADER_SIZE..HEADER_SIZE + len];
    let msg = decode_payload(type_byte, payload)?;
    Ok((msg, HEADER_SIZE + len))
}

/// Read exactly one framed message from an async byte stream.
pub async fn read_message<R>(reader: &mut R) -> Result<Message, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header).await.map_err(map_eof)?;

    let type_byte = header[0];
    let len = u32::from_le_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if len > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::MessageTooLarge(len));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await.map_err(map_eof)?;

    decode_payload(type_byte, &payload)
}

/// Write one framed message to an async byte stream as a single write.
pub async fn write_message<W>(writer: &mut W, msg: &Message) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let buf = encode_message(msg)?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

fn decode_payload(type_byte: u8, payload: &[u8]) -> Result<Message, ProtocolError> {
    let msg = match type_byte {
        TYPE_LOGIN => Message::Login(serde_json::from_slice(payload)?),
        TYPE_LOGIN_RESP => Message::LoginResp(serde_json::from_slice(payload)?),
        TYPE_NEW_PROXY => Message::NewProxy(serde_json::from_slice(payload)?),
        TYPE_NEW_PROXY_RESP => Message::NewProxyResp(serde_json::from_slice(payload)?),
        TYPE_CLOSE_PROXY => Message::CloseProxy(serde_json::from_slice(payload)?),
        TYPE_REQ_WORK_CONN => Message::ReqWorkConn(serde_json::from_slice(payload)?),
        TYPE_NEW_WORK_CONN => Message::NewWorkConn(serde_json::from_slice(payload)?),
        TYPE_START_WORK_CONN => Message::StartWorkConn(serde_json::from_slice(payload)?),
        TYPE_PING => Message::Ping(serde_json::from_slice(payload)?),
        TYPE_PONG => Message::Pong(serde_json::from_slice(payload)?),
        TYPE_UDP_PACKET => Message::UdpPacket(serde_json::from_slice(payload)?),
        other => return Err(ProtocolError::UnknownType(other)),
    };
    Ok(msg)
}

fn map_eof(e: std::io::Error) -> ProtocolError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        ProtocolError::Truncated
    } else {
        ProtocolError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_messages() -> Vec<Message> {
        vec![
            Message::Login(Login {
                version: "0.4.0".into(),
                hostname: "build-box".into(),
                os: "linux".into(),
                arch: "x86_64".into(),
                user: "ops".into(),
                token: "secret".into(),
                timestamp: 1_700_000_000,
                run_id: String::new(),
                client_id: "client-1".into(),
                pool_count: 1,
                metas: Default::default(),
                signature: vec![1, 2, 3],
                public_key: vec![4, 5, 6],
            }),
            Message::LoginResp(LoginResp {
                version: "0.4.0".into(),
                run_id: "deadbeefdeadbeefdeadbeefdeadbeef".into(),
                server_time: 1_700_000_001,
                error: String::new(),
                nonce: vec![9; 16],
            }),
            Message::NewProxy(NewProxy::stream("ssh", ProxyType::Tcp, 2222)),
            Message::NewProxyResp(NewProxyResp {
                proxy_name: "ssh".into(),
                remote_addr: "127.0.0.1:2222".into(),
                error: String::new(),
            }),
            Message::CloseProxy(CloseProxy {
                proxy_name: "ssh".into(),
            }),
            Message::ReqWorkConn(ReqWorkConn {
                proxy_name: "ssh".into(),
                request_id: 42,
            }),
            Message::NewWorkConn(NewWorkConn {
                run_id: "deadbeef".into(),
                request_id: 42,
                timestamp: 1_700_000_002,
                signature: vec![7; 64],
            }),
            Message::StartWorkConn(StartWorkConn {
                proxy_name: "ssh".into(),
                src_addr: "203.0.113.9".into(),
                src_port: 50123,
                dst_addr: "127.0.0.1".into(),
                dst_port: 2222,
                error: String::new(),
            }),
            Message::Ping(Ping {
                timestamp: 1_700_000_003,
                signature: vec![8; 32],
            }),
            Message::Pong(Pong {
                server_time: 1_700_000_004,
                signature: vec![9; 32],
                error: String::new(),
            }),
            Message::UdpPacket(UdpPacket {
                content: b"datagram".to_vec(),
                local_addr: "127.0.0.1:5353".into(),
                remote_addr: "203.0.113.9:40000".into(),
            }),
        ]
    }

    #[test]
    fn test_roundtrip_all_variants() {
        for msg in sample_messages() {
            let encoded = encode_message(&msg).unwrap();
            let (decoded, consumed) = decode_message(&encoded).unwrap();
            assert_eq!(consumed, encoded.len());
            assert_eq!(decoded, msg, "variant {}", msg.type_name());
        }
    }

    #[test]
    fn test_truncated_buffer_is_protocol_error() {
        let encoded = encode_message(&Message::Ping(Ping {
            timestamp: 1,
            signature: vec![0; 32],
        }))
        .unwrap();

        for cut in [0, 1, HEADER_SIZE - 1, HEADER_SIZE, encoded.len() - 1] {
            let result = decode_message(&encoded[..cut]);
            assert!(matches!(result, Err(ProtocolError::Truncated)), "cut {}", cut);
        }
    }

    #[test]
    fn test_unknown_type_byte() {
        let mut encoded = encode_message(&Message::CloseProxy(CloseProxy {
            proxy_name: "x".into(),
        }))
        .unwrap();
        encoded[0] = 0xFF;
        assert!(matches!(
            decode_message(&encoded),
            Err(ProtocolError::UnknownType(0xFF))
        ));
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut buf = vec![TYPE_PING];
        buf.extend_from_slice(&((MAX_PAYLOAD_SIZE as u32) + 1).to_le_bytes());
        assert!(matches!(
            decode_message(&buf),
            Err(ProtocolError::MessageTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn test_async_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(1 << 16);

        for msg in sample_messages() {
            write_message(&mut a, &msg).await.unwrap();
            let decoded = read_message(&mut b).await.unwrap();
            assert_eq!(decoded, msg);
        }
    }

    #[tokio::test]
    async fn test_async_short_read() {
        let (mut a, mut b) = tokio::io::duplex(1 << 16);

        let encoded = encode_message(&Message::CloseProxy(CloseProxy {
            proxy_name: "ssh".into(),
        }))
        .unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut a, &encoded[..encoded.len() - 2])
            .await
            .unwrap();
        drop(a);

        assert!(matches!(
            read_message(&mut b).await,
            Err(ProtocolError::Truncated)
        ));
    }
}
