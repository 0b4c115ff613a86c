//! AEAD data-plane envelope
//!
//! Data messages on encrypted proxies are sealed with ChaCha20-Poly1305.
//! Each record is `u32-LE length || 12-byte random nonce || ciphertext+tag`.
//! Decryption fails closed: an authentication failure surfaces as
//! [`CryptoError::DecryptionFailed`] and no recovery is attempted.
//!
//! [`SealedStream`] wraps any byte stream in this record layer and exposes
//! plain `AsyncRead`/`AsyncWrite`, so the splicer and the rest of the core
//! stay oblivious to whether a proxy is encrypted.

use super::{random_bytes, CryptoError, KEY_LEN, NONCE_LEN, TAG_LEN};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, CHACHA20_POLY1305};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Maximum plaintext bytes per sealed record.
pub const MAX_RECORD_SIZE: usize = 16 * 1024;

/// Maximum wire size of a record body (nonce + ciphertext + tag).
const MAX_RECORD_WIRE: usize = MAX_RECORD_SIZE + NONCE_LEN + TAG_LEN;

/// One-direction AEAD sealer/opener.
pub struct Envelope {
    key: LessSafeKey,
}

impl Envelope {
    /// Create from a 32-byte key.
    pub fn new(key: &[u8; KEY_LEN]) -> Result<Self, CryptoError> {
        let unbound =
            UnboundKey::new(&CHACHA20_POLY1305, key).map_err(|_| CryptoError::InvalidKeyLength)?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
        })
    }

    /// Seal a plaintext into `nonce || ciphertext+tag`.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if plaintext.len() > MAX_RECORD_SIZE {
            return Err(CryptoError::RecordTooLarge(plaintext.len()));
        }

        let mut nonce_bytes = [0u8; NONCE_LEN];
        random_bytes(&mut nonce_bytes);

        let mut in_out = plaintext.to_vec();
        self.key
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::empty(),
                &mut in_out,
            )
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + in_out.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&in_out);
        Ok(blob)
    }

    /// Open a `nonce || ciphertext+tag` blob.
    pub fn open(&self, blob: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if blob.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptoError::DecryptionFailed);
        }

        let nonce = Nonce::try_assume_unique_for_key(&blob[..NONCE_LEN])
            .map_err(|_| CryptoError::DecryptionFailed)?;

        let mut in_out = blob[NONCE_LEN..].to_vec();
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| CryptoError::DecryptionFailed)?;

        Ok(plaintext.to_vec())
    }
}

enum ReadState {
    Header { buf: [u8; 4], filled: usize },
    Body { buf: Vec<u8>, filled: usize },
    Emit { plain: Vec<u8>, offset: usize },
}

/// Byte stream wrapped in the AEAD record layer.
///
/// Writes are chunked into records of at most [`MAX_RECORD_SIZE`] plaintext
/// bytes, sealed with the send key; reads reassemble and open records with
/// the receive key. A clean EOF is only reported on a record boundary.
pub struct SealedStream<S> {
    inner: S,
    seal: Envelope,
    open: Envelope,
    read_state: ReadState,
    write_buf: Vec<u8>,
    write_pos: usize,
}

impl<S> SealedStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap `inner`, sealing outbound records with `send_key` and opening
    /// inbound records with `recv_key`.
    pub fn new(
        inner: S,
        send_key: &[u8; KEY_LEN],
        recv_key: &[u8; KEY_LEN],
    ) -> Result<Self, CryptoError> {
        Ok(Self {
            inner,
            seal: Envelope::new(send_key)?,
            open: Envelope::new(recv_key)?,
            read_state: ReadState::Header {
                buf: [0u8; 4],
                filled: 0,
            },
            write_buf: Vec::new(),
            write_pos: 0,
        })
    }

    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.write_pos < self.write_buf.len() {
            let n = match Pin::new(&mut self.inner).poll_write(cx, &self.write_buf[self.write_pos..])
            {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Ready(Ok(n)) => n,
            };
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.write_pos += n;
        }
        self.write_buf.clear();
        self.write_pos = 0;
        Poll::Ready(Ok(()))
    }
}

impl<S> AsyncRead for SealedStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            match &mut this.read_state {
                ReadState::Emit { plain, offset } => {
                    if *offset == plain.len() {
                        // Empty record: keep reading, do not report EOF
                        this.read_state = ReadState::Header {
                            buf: [0u8; 4],
                            filled: 0,
                        };
                        continue;
                    }
                    let n = (plain.len() - *offset).min(out.remaining());
                    out.put_slice(&plain[*offset..*offset + n]);
                    *offset += n;
                    if *offset == plain.len() {
                        this.read_state = ReadState::Header {
                            buf: [0u8; 4],
                            filled: 0,
                        };
                    }
                    return Poll::Ready(Ok(()));
                }
                ReadState::Header { buf, filled } => {
                    let mut rb = ReadBuf::new(&mut buf[*filled..]);
                    match Pin::new(&mut this.inner).poll_read(cx, &mut rb) {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Ready(Ok(())) => {}
                    }
                    let n = rb.filled().len();
                    if n == 0 {
                        // EOF between records is a clean close; inside a
                        // header it is truncation
                        return if *filled == 0 {
                            Poll::Ready(Ok(()))
                        } else {
                            Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()))
                        };
                    }
                    *filled += n;
                    if *filled == 4 {
                        let len = u32::from_le_bytes(*buf) as usize;
                        if len < NONCE_LEN + TAG_LEN || len > MAX_RECORD_WIRE {
                            return Poll::Ready(Err(io::Error::new(
                                io::ErrorKind::InvalidData,
                                format!("invalid sealed record length: {}", len),
                            )));
                        }
                        this.read_state = ReadState::Body {
                            buf: vec![0u8; len],
                            filled: 0,
                        };
                    }
                }
                ReadState::Body { buf, filled } => {
                    let mut rb = ReadBuf::new(&mut buf[*filled..]);
                    match Pin::new(&mut this.inner).poll_read(cx, &mut rb) {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Ready(Ok(())) => {}
                    }
                    let n = rb.filled().len();
                    if n == 0 {
                        return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
                    }
                    *filled += n;
                    if *filled == buf.len() {
                        let plain = this.open.open(buf).map_err(|_| {
                            io::Error::new(io::ErrorKind::InvalidData, "record decryption failed")
                        })?;
                        this.read_state = ReadState::Emit { plain, offset: 0 };
                    }
                }
            }
        }
    }
}

impl<S> AsyncWrite for SealedStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        // Finish any record buffered by a previous call first.
        match this.poll_drain(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Ready(Ok(())) => {}
        }

        if data.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let chunk = &data[..data.len().min(MAX_RECORD_SIZE)];
        let record = this
            .seal
            .seal(chunk)
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "record encryption failed"))?;

        this.write_buf
            .extend_from_slice(&(record.len() as u32).to_le_bytes());
        this.write_buf.extend_from_slice(&record);

        // Best-effort eager drain; the record is accepted either way.
        let _ = this.poll_drain(cx);
        Poll::Ready(Ok(chunk.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.poll_drain(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Ready(Ok(())) => {}
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.poll_drain(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Ready(Ok(())) => {}
        }
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn key(byte: u8) -> [u8; KEY_LEN] {
        [byte; KEY_LEN]
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let envelope = Envelope::new(&key(0x42)).unwrap();
        let blob = envelope.seal(b"hello world").unwrap();
        assert_eq!(envelope.open(&blob).unwrap(), b"hello world");
    }

    #[test]
    fn test_tamper_detection() {
        let envelope = Envelope::new(&key(0x42)).unwrap();
        let mut blob = envelope.seal(b"hello world").unwrap();
        blob[NONCE_LEN] ^= 0xFF;
        assert!(matches!(
            envelope.open(&blob),
            Err(CryptoError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_wrong_key_fails() {
        let a = Envelope::new(&key(0x01)).unwrap();
        let b = Envelope::new(&key(0x02)).unwrap();
        let blob = a.seal(b"secret").unwrap();
        assert!(b.open(&blob).is_err());
    }

    #[test]
    fn test_nonces_are_random() {
        let envelope = Envelope::new(&key(0x42)).unwrap();
        let blob1 = envelope.seal(b"same plaintext").unwrap();
        let blob2 = envelope.seal(b"same plaintext").unwrap();
        assert_ne!(blob1[..NONCE_LEN], blob2[..NONCE_LEN]);
    }

    #[test]
    fn test_oversized_record_rejected() {
        let envelope = Envelope::new(&key(0x42)).unwrap();
        let big = vec![0u8; MAX_RECORD_SIZE + 1];
        assert!(matches!(
            envelope.seal(&big),
            Err(CryptoError::RecordTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn test_sealed_stream_roundtrip() {
        let (a, b) = tokio::io::duplex(1 << 20);
        let mut alice = SealedStream::new(a, &key(0x11), &key(0x22)).unwrap();
        let mut bob = SealedStream::new(b, &key(0x22), &key(0x11)).unwrap();

        alice.write_all(b"ping over sealed stream").await.unwrap();
        alice.flush().await.unwrap();

        let mut buf = vec![0u8; 23];
        bob.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping over sealed stream");

        bob.write_all(b"pong").await.unwrap();
        bob.flush().await.unwrap();

        let mut buf = vec![0u8; 4];
        alice.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn test_sealed_stream_large_transfer() {
        let (a, b) = tokio::io::duplex(1 << 20);
        let mut tx = SealedStream::new(a, &key(0x11), &key(0x22)).unwrap();
        let mut rx = SealedStream::new(b, &key(0x22), &key(0x11)).unwrap();

        // Crosses several record boundaries
        let data: Vec<u8> = (0..MAX_RECORD_SIZE * 3 + 777).map(|i| (i % 251) as u8).collect();
        let expected = data.clone();

        let writer = tokio::spawn(async move {
            tx.write_all(&data).await.unwrap();
            tx.shutdown().await.unwrap();
        });

        let mut received = Vec::new();
        rx.read_to_end(&mut received).await.unwrap();
        writer.await.unwrap();

        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn test_sealed_stream_mismatched_keys_error() {
        let (a, b) = tokio::io::duplex(1 << 16);
        let mut tx = SealedStream::new(a, &key(0x11), &key(0x22)).unwrap();
        let mut rx = SealedStream::new(b, &key(0x22), &key(0x33)).unwrap();

        tx.write_all(b"garbled").await.unwrap();
        tx.flush().await.unwrap();

        let mut buf = [0u8; 7];
        let err = rx.read_exact(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
