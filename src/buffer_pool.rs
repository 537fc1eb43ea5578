use std::sync::Mutex;

use bytes::BytesMut;
use tracing::trace;

/// Freelist of reusable marshaling buffers, one pool per connection.
///
/// Every outbound frame is marshaled into one of these: acquire a buffer, write the
///  envelope and body, hand it to the transceiver, return it. Recycled buffers keep
///  their grown capacity, so a connection's steady-state sends stop allocating once
///  the pool is warm. Returned buffers are wiped so no message data leaks between uses.
pub struct MessagePool {
    initial_capacity: usize,
    max_pooled: usize,
    free: Mutex<Vec<BytesMut>>,
}

impl MessagePool {
    pub fn new(initial_capacity: usize, max_pooled: usize) -> MessagePool {
        MessagePool {
            initial_capacity,
            max_pooled,
            free: Mutex::new(Vec::new()),
        }
    }

    /// An empty buffer, recycled when one is available.
    pub fn acquire(&self) -> BytesMut {
        match self.free.lock().unwrap().pop() {
            Some(buf) => buf,
            None => BytesMut::with_capacity(self.initial_capacity),
        }
    }

    pub fn release(&self, mut buf: BytesMut) {
        buf.clear();

        let mut free = self.free.lock().unwrap();
        if free.len() < self.max_pooled {
            free.push(buf);
        } else {
            trace!("marshaling buffer pool at capacity, dropping surplus buffer");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    #[test]
    fn test_released_buffer_is_cleared() {
        let pool = MessagePool::new(64, 4);

        let mut buf = pool.acquire();
        buf.put_slice(&[1, 2, 3]);
        pool.release(buf);

        assert!(pool.acquire().is_empty());
    }

    #[test]
    fn test_reuses_released_buffer() {
        let pool = MessagePool::new(64, 4);

        let mut buf = pool.acquire();
        buf.put_slice(&[9; 40]);
        let capacity = buf.capacity();
        pool.release(buf);

        // the recycled buffer keeps its grown capacity
        assert!(pool.acquire().capacity() >= capacity.min(64));
    }

    #[test]
    fn test_discards_beyond_max_pool_size() {
        let pool = MessagePool::new(16, 2);

        pool.release(BytesMut::with_capacity(16));
        pool.release(BytesMut::with_capacity(16));
        pool.release(BytesMut::with_capacity(16));

        assert_eq!(pool.free.lock().unwrap().len(), 2);
    }
}
