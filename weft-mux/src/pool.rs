use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::Mutex;

/// External capability that hands out and takes back byte buffers.
///
/// `get` returns a buffer of length exactly `len` whose capacity may
/// exceed it; `put` accepts any buffer back, including ones the pool did
/// not create. Neither call blocks.
pub trait BufferPool: Send + Sync {
    fn get(&self, len: usize) -> Vec<u8>;
    fn put(&self, buf: Vec<u8>);
}

const POOLED_PER_CLASS: usize = 8;

/// Power-of-two size-classed buffer pool.
///
/// Buffers are binned by capacity; `get` serves a request from the
/// smallest class that fits, so a recycled buffer never reallocates when
/// resized to the requested length. Each class keeps a handful of buffers
/// and drops the rest, bounding idle memory.
pub struct SlabPool {
    classes: [Mutex<Vec<Vec<u8>>>; usize::BITS as usize],
}

impl SlabPool {
    pub fn new() -> Self {
        Self {
            classes: std::array::from_fn(|_| Mutex::new(Vec::new())),
        }
    }

    fn class_for_request(len: usize) -> usize {
        len.max(1).next_power_of_two().trailing_zeros() as usize
    }

    fn class_for_capacity(capacity: usize) -> usize {
        (usize::BITS - 1 - capacity.leading_zeros()) as usize
    }
}

impl Default for SlabPool {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferPool for SlabPool {
    fn get(&self, len: usize) -> Vec<u8> {
        let class = Self::class_for_request(len);
        let recycled = self.classes[class].lock().unwrap().pop();
        let mut buf = recycled.unwrap_or_else(|| Vec::with_capacity(1 << class));
        buf.resize(len, 0);
        buf
    }

    fn put(&self, mut buf: Vec<u8>) {
        if buf.capacity() == 0 {
            return;
        }
        let class = Self::class_for_capacity(buf.capacity());
        let mut shelf = self.classes[class].lock().unwrap();
        if shelf.len() < POOLED_PER_CLASS {
            buf.clear();
            shelf.push(buf);
        }
    }
}

/// A buffer borrowed from a [`BufferPool`], returned to it on drop.
pub(crate) struct PooledBuf {
    buf: Vec<u8>,
    pool: Arc<dyn BufferPool>,
}

impl PooledBuf {
    pub(crate) fn get(pool: &Arc<dyn BufferPool>, len: usize) -> Self {
        Self {
            buf: pool.get(len),
            pool: pool.clone(),
        }
    }

    pub(crate) fn vec_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }
}

impl Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        self.pool.put(std::mem::take(&mut self.buf));
    }
}

impl std::fmt::Debug for PooledBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuf").field("len", &self.buf.len()).finish()
    }
}
