use std::sync::OnceLock;

use tokio::sync::Mutex;

/// Relay copy buffer size. One buffer per relay direction.
const BUFFER_SIZE: usize = 16_384;
const MAX_POOL_SIZE: usize = 64;

/// Buffer pool for memory optimization backed by an async-aware mutex
struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    fn new() -> Self {
        Self {
            buffers: Mutex::new(Vec::with_capacity(MAX_POOL_SIZE)),
        }
    }

    async fn get(&self) -> Vec<u8> {
        let mut pool = self.buffers.lock().await;
        match pool.pop() {
            Some(buffer) => {
                debug_assert_eq!(buffer.len(), BUFFER_SIZE);
                buffer
            }
            None => vec![0u8; BUFFER_SIZE],
        }
    }

    async fn put(&self, mut buffer: Vec<u8>) {
        // Reject buffers with wrong capacity to avoid memory bloat
        if buffer.capacity() < BUFFER_SIZE || buffer.capacity() > BUFFER_SIZE * 2 {
            return;
        }

        // Zero the buffer on return to avoid leaking data between connections
        buffer.clear();
        buffer.resize(BUFFER_SIZE, 0);

        let mut pool = self.buffers.lock().await;
        if pool.len() < MAX_POOL_SIZE {
            pool.push(buffer);
        }
    }
}

static POOL: OnceLock<BufferPool> = OnceLock::new();

fn pool() -> &'static BufferPool {
    POOL.get_or_init(BufferPool::new)
}

/// Get a zeroed relay buffer from the pool or allocate a fresh one
pub(crate) async fn get_buffer() -> Vec<u8> {
    pool().get().await
}

/// Return a buffer to the pool for reuse
pub(crate) async fn return_buffer(buffer: Vec<u8>) {
    pool().put(buffer).await
}
