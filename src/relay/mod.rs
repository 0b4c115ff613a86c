//! Data-plane relay engine
//!
//! [`splice`] copies bytes between two streams in both directions with
//! pooled buffers, independent half-close propagation, optional per-direction
//! token-bucket rate limits, and atomic byte accounting. The first direction
//! to fail closes the whole splice; the peer direction observes the
//! cancellation and exits.

pub mod limiter;
pub mod pool;

pub use limiter::RateLimiter;
pub use pool::{BufferPool, BUFFER_SIZE};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;

/// Relay errors
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Bytes moved by one splice, per direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyStats {
    /// Bytes copied from stream `a` to stream `b`.
    pub a_to_b: u64,
    /// Bytes copied from stream `b` to stream `a`.
    pub b_to_a: u64,
}

/// Shared in/out byte counters, attached to proxies and sessions.
#[derive(Debug, Default)]
pub struct TrafficCounters {
    /// Bytes received from end users (a → b direction of the splice).
    pub bytes_in: AtomicU64,
    /// Bytes sent back to end users (b → a direction of the splice).
    pub bytes_out: AtomicU64,
}

impl TrafficCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_in(&self, n: u64) {
        self.bytes_in.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_out(&self, n: u64) {
        self.bytes_out.fetch_add(n, Ordering::Relaxed);
    }

    /// Snapshot as (in, out).
    pub fn totals(&self) -> (u64, u64) {
        (
            self.bytes_in.load(Ordering::Relaxed),
            self.bytes_out.load(Ordering::Relaxed),
        )
    }
}

/// Knobs for one splice.
pub struct SpliceOptions {
    /// Bytes per second per direction; 0 disables the cap.
    pub bandwidth_limit: u64,
    /// Shared buffer pool.
    pub pool: Arc<BufferPool>,
    /// Counter sets to update (typically the owning proxy's and session's).
    pub counters: Vec<Arc<TrafficCounters>>,
}

impl SpliceOptions {
    /// Uncapped splice over the given pool with no external accounting.
    pub fn plain(pool: Arc<BufferPool>) -> Self {
        Self {
            bandwidth_limit: 0,
            pool,
            counters: Vec::new(),
        }
    }
}

/// Copy bytes between `a` and `b` in both directions until both directions
/// reach EOF or one fails.
///
/// EOF on one direction half-closes the peer's write side and lets the other
/// direction continue draining. Stream `a` is accounted as the end-user side:
/// `a → b` updates `bytes_in`, `b → a` updates `bytes_out`.
pub async fn splice<A, B>(a: A, b: B, options: SpliceOptions) -> Result<CopyStats, RelayError>
where
    A: AsyncRead + AsyncWrite + Unpin + Send,
    B: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);

    let (cancel_tx, cancel_rx) = watch::channel(false);

    let forward = copy_direction(
        a_read,
        b_write,
        RateLimiter::new(options.bandwidth_limit),
        Direction::In,
        &options,
        &cancel_tx,
        cancel_rx.clone(),
    );
    let backward = copy_direction(
        b_read,
        a_write,
        RateLimiter::new(options.bandwidth_limit),
        Direction::Out,
        &options,
        &cancel_tx,
        cancel_rx,
    );

    let (forward, backward) = tokio::join!(forward, backward);

    let stats = CopyStats {
        a_to_b: *forward.as_ref().unwrap_or_else(|(_, n)| n),
        b_to_a: *backward.as_ref().unwrap_or_else(|(_, n)| n),
    };

    // First error wins
    if let Err((e, _)) = forward {
        return Err(e.into());
    }
    if let Err((e, _)) = backward {
        return Err(e.into());
    }
    Ok(stats)
}

#[derive(Clone, Copy)]
enum Direction {
    In,
    Out,
}

async fn copy_direction<R, W>(
    mut reader: R,
    mut writer: W,
    mut limiter: RateLimiter,
    direction: Direction,
    options: &SpliceOptions,
    cancel_tx: &watch::Sender<bool>,
    mut cancel_rx: watch::Receiver<bool>,
) -> Result<u64, (std::io::Error, u64)>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = options.pool.get();
    let mut total: u64 = 0;

    let result = loop {
        let n = tokio::select! {
            // Peer direction failed; stop without reporting our own error
            _ = cancel_rx.changed() => break Ok(total),
            read = reader.read(&mut buf) => match read {
                Ok(0) => {
                    // EOF: propagate the half-close and let the other
                    // direction keep draining
                    let _ = writer.shutdown().await;
                    break Ok(total);
                }
                Ok(n) => n,
                Err(e) => {
                    let _ = cancel_tx.send(true);
                    break Err((e, total));
                }
            },
        };

        limiter.acquire(n).await;

        // Flush so record-framed wrappers never sit on a buffered tail
        let written = async {
            writer.write_all(&buf[..n]).await?;
            writer.flush().await
        };
        if let Err(e) = written.await {
            let _ = cancel_tx.send(true);
            break Err((e, total));
        }

        total += n as u64;
        for counters in &options.counters {
            match direction {
                Direction::In => counters.add_in(n as u64),
                Direction::Out => counters.add_out(n as u64),
            }
        }
    };

    options.pool.put(buf);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_splice_echo_roundtrip() {
        // user <-> (u_far, w_far spliced) <-> upstream echo
        let (mut user, u_far) = tcp_pair().await;
        let (w_far, mut upstream) = tcp_pair().await;

        let pool = Arc::new(BufferPool::default());
        let splice_task = tokio::spawn(async move {
            splice(u_far, w_far, SpliceOptions::plain(pool)).await
        });

        let echo = tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            loop {
                let n = upstream.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                upstream.write_all(&buf[..n]).await.unwrap();
            }
        });

        user.write_all(b"hello through the splice").await.unwrap();
        let mut buf = vec![0u8; 24];
        user.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello through the splice");

        drop(user);
        echo.await.unwrap();
        splice_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_splice_large_transfer_byte_exact() {
        let (mut user, u_far) = tcp_pair().await;
        let (w_far, mut upstream) = tcp_pair().await;

        let pool = Arc::new(BufferPool::default());
        let counters = Arc::new(TrafficCounters::new());
        let options = SpliceOptions {
            bandwidth_limit: 0,
            pool,
            counters: vec![counters.clone()],
        };
        let splice_task = tokio::spawn(async move { splice(u_far, w_far, options).await });

        // 4 MiB of patterned data, user -> upstream
        let data: Vec<u8> = (0..4 * 1024 * 1024).map(|i| (i % 253) as u8).collect();
        let expected = data.clone();

        let writer = tokio::spawn(async move {
            user.write_all(&data).await.unwrap();
            user.shutdown().await.unwrap();
            user
        });

        let mut received = Vec::with_capacity(expected.len());
        upstream.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, expected);

        // Half-close propagated: upstream can still answer
        upstream.write_all(b"done").await.unwrap();
        upstream.shutdown().await.unwrap();

        let mut user = writer.await.unwrap();
        let mut tail = Vec::new();
        user.read_to_end(&mut tail).await.unwrap();
        assert_eq!(&tail, b"done");

        splice_task.await.unwrap().unwrap();
        let (bytes_in, bytes_out) = counters.totals();
        assert_eq!(bytes_in, expected.len() as u64);
        assert_eq!(bytes_out, 4);
    }

    #[tokio::test]
    async fn test_splice_peer_close_terminates() {
        let (user, u_far) = tcp_pair().await;
        let (w_far, upstream) = tcp_pair().await;

        let pool = Arc::new(BufferPool::default());
        let splice_task = tokio::spawn(async move {
            splice(u_far, w_far, SpliceOptions::plain(pool)).await
        });

        drop(user);
        drop(upstream);
        // Both sides gone; the splice must finish promptly
        tokio::time::timeout(std::time::Duration::from_secs(5), splice_task)
            .await
            .expect("splice did not terminate")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_splice_respects_bandwidth_cap() {
        let (mut user, u_far) = tcp_pair().await;
        let (w_far, mut upstream) = tcp_pair().await;

        let pool = Arc::new(BufferPool::default());
        let options = SpliceOptions {
            bandwidth_limit: 128 * 1024,
            pool,
            counters: Vec::new(),
        };
        tokio::spawn(async move { splice(u_far, w_far, options).await });

        // 256 KiB at 128 KiB/s with a 32 KiB burst floor: at least a second
        let data = vec![0u8; 256 * 1024];
        let start = std::time::Instant::now();

        let writer = tokio::spawn(async move {
            user.write_all(&data).await.unwrap();
            user.shutdown().await.unwrap();
        });

        let mut sink = Vec::new();
        upstream.read_to_end(&mut sink).await.unwrap();
        writer.await.unwrap();

        assert_eq!(sink.len(), 256 * 1024);
        assert!(
            start.elapsed() >= std::time::Duration::from_millis(900),
            "cap not enforced: {:?}",
            start.elapsed()
        );
    }
}
