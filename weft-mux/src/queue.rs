use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::{Notify, OwnedSemaphorePermit};

use crate::pool::PooledBuf;

/// One inbound message as queued for a stream's reader.
///
/// A non-empty chunk owns a pooled buffer and the inbound slot permit that
/// was acquired for it; both are released when the chunk is dropped, on
/// whichever path drops it. Zero-length messages carry neither.
pub(crate) struct InboundChunk {
    data: Option<PooledBuf>,
    _permit: Option<OwnedSemaphorePermit>,
}

impl InboundChunk {
    pub(crate) fn new(data: PooledBuf, permit: OwnedSemaphorePermit) -> Self {
        Self {
            data: Some(data),
            _permit: Some(permit),
        }
    }

    pub(crate) fn empty() -> Self {
        Self {
            data: None,
            _permit: None,
        }
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        self.data.as_deref().unwrap_or(&[])
    }

    pub(crate) fn len(&self) -> usize {
        self.bytes().len()
    }
}

struct QueueState {
    chunks: VecDeque<InboundChunk>,
    /// EOF mark: set at most once, by remote close or session cleanup.
    closed: bool,
    /// Cancellation mark: queued chunks were discarded and no more are
    /// accepted.
    purged: bool,
}

/// Bounded single-producer single-consumer queue of inbound chunks.
///
/// The receive loop pushes, the stream's reader pops. Unlike a plain
/// channel, the producer side can purge it: cancellation must drop the
/// queued chunks so their slot permits return to the session's inbound
/// budget instead of being pinned by a reader that will never come back.
pub(crate) struct DataQueue {
    capacity: usize,
    state: Mutex<QueueState>,
    readable: Notify,
    writable: Notify,
}

impl DataQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(QueueState {
                chunks: VecDeque::new(),
                closed: false,
                purged: false,
            }),
            readable: Notify::new(),
            writable: Notify::new(),
        }
    }

    /// Hand a chunk to the reader, waiting for queue space.
    ///
    /// Returns `Err` when the queue is closed or purged; the chunk is
    /// dropped (releasing its buffer and permit) in that case.
    pub(crate) async fn push(&self, chunk: InboundChunk) -> Result<(), ()> {
        let mut chunk = Some(chunk);
        loop {
            let full = {
                let mut state = self.state.lock().unwrap();
                if state.closed || state.purged {
                    return Err(());
                }
                if state.chunks.len() < self.capacity {
                    state.chunks.push_back(chunk.take().unwrap_or_else(InboundChunk::empty));
                    None
                } else {
                    Some(self.writable.notified())
                }
            };
            match full {
                None => {
                    self.readable.notify_one();
                    return Ok(());
                }
                Some(notified) => notified.await,
            }
        }
    }

    /// Next chunk in arrival order; `None` once the queue is closed and
    /// drained, or purged.
    pub(crate) async fn pop(&self) -> Option<InboundChunk> {
        loop {
            let empty = {
                let mut state = self.state.lock().unwrap();
                if let Some(chunk) = state.chunks.pop_front() {
                    drop(state);
                    self.writable.notify_one();
                    return Some(chunk);
                }
                if state.closed || state.purged {
                    return None;
                }
                self.readable.notified()
            };
            empty.await;
        }
    }

    /// Number of chunks currently queued.
    pub(crate) fn len(&self) -> usize {
        self.state.lock().unwrap().chunks.len()
    }

    /// Mark EOF. Queued chunks stay readable; `push` fails afterwards.
    /// Returns true only on the first call.
    pub(crate) fn close(&self) -> bool {
        let transitioned = {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                false
            } else {
                state.closed = true;
                true
            }
        };
        if transitioned {
            self.readable.notify_one();
        }
        transitioned
    }

    /// Discard everything queued and refuse further pushes.
    ///
    /// Dropping the chunks returns their buffers and slot permits.
    pub(crate) fn purge(&self) {
        let discarded: Vec<InboundChunk> = {
            let mut state = self.state.lock().unwrap();
            state.purged = true;
            state.chunks.drain(..).collect()
        };
        drop(discarded);
        self.readable.notify_one();
        self.writable.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{BufferPool, SlabPool};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Semaphore;

    fn chunk(pool: &Arc<dyn BufferPool>, semaphore: &Arc<Semaphore>, byte: u8) -> InboundChunk {
        let permit = semaphore.clone().try_acquire_owned().unwrap();
        let mut data = PooledBuf::get(pool, 1);
        data[0] = byte;
        InboundChunk::new(data, permit)
    }

    fn test_pool() -> Arc<dyn BufferPool> {
        Arc::new(SlabPool::new())
    }

    #[tokio::test]
    async fn delivers_chunks_in_order() {
        let pool = test_pool();
        let semaphore = Arc::new(Semaphore::new(4));
        let queue = DataQueue::new(4);

        for byte in [1u8, 2, 3] {
            queue.push(chunk(&pool, &semaphore, byte)).await.unwrap();
        }
        for byte in [1u8, 2, 3] {
            let got = queue.pop().await.unwrap();
            assert_eq!(got.bytes(), &[byte]);
        }
    }

    #[tokio::test]
    async fn close_signals_eof_after_drain() {
        let pool = test_pool();
        let semaphore = Arc::new(Semaphore::new(4));
        let queue = DataQueue::new(4);

        queue.push(chunk(&pool, &semaphore, 9)).await.unwrap();
        assert!(queue.close());
        assert!(!queue.close());

        // Buffered data still readable, then EOF.
        assert_eq!(queue.pop().await.unwrap().bytes(), &[9]);
        assert!(queue.pop().await.is_none());

        // Pushes after close are refused.
        assert!(queue.push(chunk(&pool, &semaphore, 1)).await.is_err());
    }

    #[tokio::test]
    async fn push_blocks_at_capacity_until_pop() {
        let pool = test_pool();
        let semaphore = Arc::new(Semaphore::new(4));
        let queue = Arc::new(DataQueue::new(2));

        queue.push(chunk(&pool, &semaphore, 1)).await.unwrap();
        queue.push(chunk(&pool, &semaphore, 2)).await.unwrap();

        let blocked = {
            let queue = queue.clone();
            let third = chunk(&pool, &semaphore, 3);
            tokio::spawn(async move { queue.push(third).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished(), "push past capacity must wait");

        assert_eq!(queue.pop().await.unwrap().bytes(), &[1]);
        tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .expect("push should proceed after pop")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn purge_returns_slot_permits() {
        let pool = test_pool();
        let semaphore = Arc::new(Semaphore::new(4));
        let queue = DataQueue::new(4);

        for byte in 0..4u8 {
            queue.push(chunk(&pool, &semaphore, byte)).await.unwrap();
        }
        assert_eq!(semaphore.available_permits(), 0);

        queue.purge();
        assert_eq!(semaphore.available_permits(), 4);

        assert!(queue.pop().await.is_none());
        assert!(queue.push(chunk(&pool, &semaphore, 1)).await.is_err());
    }
}
