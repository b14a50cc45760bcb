use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

/// Size of every relay buffer handed out by the default pool
pub const DEFAULT_BUFFER_SIZE: usize = 2 * 1024;

/// BufferPool hands out fixed-size byte buffers for relay copies and takes
/// them back when the borrower drops them
#[derive(Debug)]
pub struct BufferPool {
    size: usize,
    free: Mutex<Vec<Box<[u8]>>>,
}

impl BufferPool {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            free: Mutex::new(Vec::new()),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.size
    }

    /// get borrows a buffer; it returns to the pool when the guard drops
    pub fn get(self: &Arc<Self>) -> PooledBuffer {
        let buf = self
            .free
            .lock()
            .ok()
            .and_then(|mut free| free.pop())
            .unwrap_or_else(|| vec![0u8; self.size].into_boxed_slice());

        PooledBuffer {
            buf: Some(buf),
            pool: Arc::clone(self),
        }
    }

    /// number of idle buffers currently held by the pool
    pub fn idle(&self) -> usize {
        self.free.lock().map(|free| free.len()).unwrap_or(0)
    }

    fn put(&self, buf: Box<[u8]>) {
        if buf.len() != self.size {
            return;
        }
        if let Ok(mut free) = self.free.lock() {
            free.push(buf);
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE)
    }
}

/// PooledBuffer is a borrowed buffer
pub struct PooledBuffer {
    buf: Option<Box<[u8]>>,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or_default()
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or_default()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.put(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn returned_buffer_keeps_capacity() {
        let pool = Arc::new(BufferPool::default());
        {
            let mut buf = pool.get();
            assert_eq!(buf.len(), DEFAULT_BUFFER_SIZE);
            buf[0] = 0xAB;
        }
        assert_eq!(pool.idle(), 1);

        let buf = pool.get();
        assert_eq!(buf.len(), DEFAULT_BUFFER_SIZE);
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn concurrent_borrowers_never_share() {
        let pool = Arc::new(BufferPool::new(64));
        let held: Vec<_> = (0..8).map(|_| pool.get()).collect();
        let distinct: HashSet<*const u8> = held.iter().map(|b| b.as_ptr()).collect();
        assert_eq!(distinct.len(), held.len());

        drop(held);
        assert_eq!(pool.idle(), 8);
    }

    #[test]
    fn buffers_come_back_from_threads() {
        let pool = Arc::new(BufferPool::new(128));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let mut buf = pool.get();
                        buf.fill(1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(pool.idle() >= 1 && pool.idle() <= 4);
    }
}
