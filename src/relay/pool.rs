//! Shared buffer pool for splice copy loops

use std::sync::Mutex;

/// Size of each pooled copy buffer (32 KiB).
pub const BUFFER_SIZE: usize = 32 * 1024;

/// Pool of fixed-size copy buffers shared across all splices.
///
/// A miss allocates; buffers return to the pool when a splice direction
/// finishes, up to `max_pooled` retained buffers.
pub struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
    max_pooled: usize,
}

impl BufferPool {
    /// Create a pool retaining at most `max_pooled` idle buffers.
    pub fn new(max_pooled: usize) -> Self {
        Self {
            buffers: Mutex::new(Vec::new()),
            max_pooled,
        }
    }

    /// Take a buffer, allocating on a pool miss.
    pub fn get(&self) -> Vec<u8> {
        self.buffers
            .lock()
            .expect("pool lock")
            .pop()
            .unwrap_or_else(|| vec![0u8; BUFFER_SIZE])
    }

    /// Return a buffer to the pool.
    pub fn put(&self, buf: Vec<u8>) {
        if buf.len() != BUFFER_SIZE {
            return;
        }
        let mut buffers = self.buffers.lock().expect("pool lock");
        if buffers.len() < self.max_pooled {
            buffers.push(buf);
        }
    }

    /// Number of idle buffers currently pooled.
    pub fn idle(&self) -> usize {
        self.buffers.lock().expect("pool lock").len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_put_reuses() {
        let pool = BufferPool::new(4);
        let buf = pool.get();
        assert_eq!(buf.len(), BUFFER_SIZE);
        assert_eq!(pool.idle(), 0);

        pool.put(buf);
        assert_eq!(pool.idle(), 1);

        let _ = pool.get();
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn test_pool_bounds_retention() {
        let pool = BufferPool::new(2);
        for _ in 0..5 {
            pool.put(vec![0u8; BUFFER_SIZE]);
        }
        assert_eq!(pool.idle(), 2);
    }

    #[test]
    fn test_foreign_sizes_dropped() {
        let pool = BufferPool::new(2);
        pool.put(vec![0u8; 16]);
        assert_eq!(pool.idle(), 0);
    }
}
