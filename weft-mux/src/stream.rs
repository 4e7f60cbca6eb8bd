use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::Mutex as AsyncMutex;

use weft_wire::{StreamId, Tag};

use crate::deadline::Deadline;
use crate::error::Error;
use crate::queue::{DataQueue, InboundChunk};
use crate::session::SessionInner;
use crate::signal::Cancel;

/// Which halves of the stream have been shut, from the local perspective.
///
/// `local` covers our write half (set by `close`, `reset`, or a write
/// cancel); `remote` covers our read half (set by a peer Close or Reset,
/// or by `reset`). A stream with both halves shut is finished: no frame
/// is ever sent for it again.
#[derive(Debug, Default)]
pub(crate) struct Halves {
    pub(crate) local_closed: bool,
    pub(crate) remote_closed: bool,
}

/// Session-side state of one stream, registered in the session map.
pub(crate) struct StreamEntry {
    pub(crate) id: StreamId,
    pub(crate) name: String,
    pub(crate) queue: DataQueue,
    pub(crate) read_cancel: Cancel,
    pub(crate) write_cancel: Cancel,
    pub(crate) read_deadline: Deadline,
    pub(crate) write_deadline: Deadline,
    pub(crate) halves: Mutex<Halves>,
}

impl StreamEntry {
    pub(crate) fn new(id: StreamId, name: String, queue_capacity: usize) -> Self {
        Self {
            id,
            name,
            queue: DataQueue::new(queue_capacity),
            read_cancel: Cancel::new(),
            write_cancel: Cancel::new(),
            read_deadline: Deadline::new(),
            write_deadline: Deadline::new(),
            halves: Mutex::new(Halves::default()),
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        let halves = self.halves.lock().unwrap();
        halves.local_closed && halves.remote_closed
    }
}

struct ReadCursor {
    /// Chunk dequeued but not yet fully handed to the caller.
    chunk: Option<InboundChunk>,
    offset: usize,
}

/// One bidirectional byte stream inside a session.
///
/// Reads consume messages from the peer in wire order; a message larger
/// than the caller's buffer is handed out across several calls. Writes
/// are split into frames of at most the configured maximum message size.
///
/// Dropping a stream that is not fully closed resets it, so an abandoned
/// stream does not pin inbound buffer credit.
pub struct Stream {
    entry: Arc<StreamEntry>,
    session: Arc<SessionInner>,
    cursor: AsyncMutex<ReadCursor>,
}

impl Stream {
    pub(crate) fn new(entry: Arc<StreamEntry>, session: Arc<SessionInner>) -> Self {
        Self {
            entry,
            session,
            cursor: AsyncMutex::new(ReadCursor {
                chunk: None,
                offset: 0,
            }),
        }
    }

    /// The stream's identifier within its session.
    pub fn id(&self) -> StreamId {
        self.entry.id
    }

    /// The stream's name: the one given at open, or the decimal id.
    pub fn name(&self) -> &str {
        &self.entry.name
    }

    /// Read the next chunk of bytes into `buf`.
    ///
    /// Blocks while the stream is open and no data is queued. Returns
    /// `Ok(0)` at end of stream, once the peer's Close has been observed
    /// and all queued data consumed. A zero-length message, which the
    /// protocol permits, also reads as `Ok(0)`.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, Error> {
        let mut cursor = self.cursor.lock().await;
        if let Some(err) = self.entry.read_cancel.get() {
            // Give back the slot held by a partially consumed chunk.
            cursor.chunk = None;
            return Err(err);
        }

        let (chunk, offset) = match cursor.chunk.take() {
            Some(chunk) => (chunk, cursor.offset),
            None => {
                let chunk = tokio::select! {
                    biased;
                    err = self.entry.read_cancel.fired() => return Err(err),
                    chunk = self.entry.queue.pop() => match chunk {
                        Some(chunk) => chunk,
                        None => return Ok(0),
                    },
                    _ = self.entry.read_deadline.expired() => return Err(Error::Timeout),
                    _ = self.session.shutdown.wait() => return Err(Error::Shutdown),
                };
                (chunk, 0)
            }
        };

        let n = {
            let data = chunk.bytes();
            let n = (data.len() - offset).min(buf.len());
            buf[..n].copy_from_slice(&data[offset..offset + n]);
            n
        };
        let consumed = offset + n;
        if consumed < chunk.len() {
            cursor.chunk = Some(chunk);
            cursor.offset = consumed;
        }
        Ok(n)
    }

    /// Write `buf` to the stream.
    ///
    /// The buffer is sent as one or more Message frames of at most the
    /// configured maximum size. When a terminal condition interrupts a
    /// multi-frame write after some frames were sent, the bytes already
    /// sent are reported as `Ok(n)`; the condition is sticky and surfaces
    /// on the next call. A zero-length write sends nothing.
    pub async fn write(&self, buf: &[u8]) -> Result<usize, Error> {
        let max = self.session.config.max_message_size;
        let mut written = 0;
        while written < buf.len() {
            let end = (written + max).min(buf.len());
            if let Err(err) = self.write_chunk(&buf[written..end]).await {
                if written > 0 {
                    tracing::debug!(
                        stream = %self.entry.id,
                        error = %err,
                        written,
                        "write interrupted after partial progress"
                    );
                    return Ok(written);
                }
                return Err(err);
            }
            written = end;
        }
        Ok(written)
    }

    async fn write_chunk(&self, data: &[u8]) -> Result<(), Error> {
        if let Some(err) = self.entry.write_cancel.get() {
            return Err(err);
        }
        if self.entry.halves.lock().unwrap().local_closed {
            return Err(Error::StreamClosed);
        }
        self.session
            .send_frame(
                self.entry.id.header(Tag::Message),
                data,
                Some(&self.entry.write_deadline),
                Some(&self.entry.write_cancel),
            )
            .await
    }

    /// Close the write half of the stream.
    ///
    /// Idempotent. Sends one Close frame, cancels pending writes with
    /// [`Error::StreamClosed`], and leaves the read half untouched: the
    /// peer may keep sending until it closes its own write half. The
    /// frame send is bounded by the configured reset-stream timeout.
    pub async fn close(&self) -> Result<(), Error> {
        let remote_closed = {
            let mut halves = self.entry.halves.lock().unwrap();
            if halves.local_closed {
                return Ok(());
            }
            halves.local_closed = true;
            halves.remote_closed
        };
        self.entry.write_cancel.raise(Error::StreamClosed);
        if remote_closed {
            // Both halves are now shut; the map entry has no further use.
            self.session.remove_stream(self.entry.id);
        }

        let send = self
            .session
            .send_frame(self.entry.id.header(Tag::Close), &[], None, None);
        match tokio::time::timeout(self.session.config.reset_stream_timeout, send).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout),
        }
    }

    /// Tear the stream down in both directions.
    ///
    /// Idempotent. Cancels pending reads and writes with
    /// [`Error::StreamReset`], unregisters the stream, and emits a Reset
    /// frame best-effort in the background.
    pub fn reset(&self) {
        self.session.reset_stream(&self.entry);
    }

    /// Set the absolute deadline for blocked and future reads.
    /// `None` disables it.
    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.entry.read_deadline.set(deadline);
    }

    /// Set the absolute deadline for blocked and future writes.
    /// `None` disables it.
    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        self.entry.write_deadline.set(deadline);
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if !self.entry.is_finished() {
            self.session.reset_stream(&self.entry);
        }
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.entry.id)
            .field("name", &self.entry.name)
            .finish()
    }
}
