use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::{mpsc, Mutex as AsyncMutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use weft_wire::{Header, HeaderError, StreamId, Tag};

use crate::config::Config;
use crate::deadline::Deadline;
use crate::error::Error;
use crate::framing::{encode_frame, FrameReader, FRAME_OVERHEAD};
use crate::memory::{MemoryManager, NullMemoryManager};
use crate::pool::{BufferPool, PooledBuf, SlabPool};
use crate::queue::InboundChunk;
use crate::signal::{Cancel, Event};
use crate::stream::{Stream, StreamEntry};

/// Outbound frames queued ahead of the send loop.
const WRITE_QUEUE_CAPACITY: usize = 16;
/// Streams announced by the peer awaiting `accept_stream`.
const ACCEPT_QUEUE_CAPACITY: usize = 16;

/// One encoded frame travelling to the send loop.
///
/// Carries its outbound slot permit; dropping the frame on any path
/// returns both the buffer and the slot.
struct OutboundFrame {
    bytes: PooledBuf,
    _permit: OwnedSemaphorePermit,
}

struct StreamMap {
    /// Live streams; `None` once the session has been cleaned up.
    entries: Option<HashMap<StreamId, Arc<StreamEntry>>>,
    /// Next id for a locally opened stream. Strictly monotonic from 0.
    next_id: u64,
}

pub(crate) struct SessionInner {
    pub(crate) config: Config,
    initiator: bool,
    memory: Arc<dyn MemoryManager>,
    pub(crate) pool: Arc<dyn BufferPool>,
    reserved_memory: usize,
    /// Granted buffer budget per direction; also the per-stream inbound
    /// queue capacity.
    pub(crate) buf_max: usize,
    buf_in: Arc<Semaphore>,
    buf_out: Arc<Semaphore>,
    write_tx: mpsc::Sender<OutboundFrame>,
    streams: Mutex<StreamMap>,
    /// Fired when teardown starts. Every blocking operation selects on it.
    pub(crate) shutdown: Event,
    /// Fired when the receive loop has finished cleanup.
    closed: Event,
    shutdown_cause: Mutex<Option<Error>>,
}

async fn deadline_expired(deadline: Option<&Deadline>) {
    match deadline {
        Some(deadline) => deadline.expired().await,
        None => std::future::pending().await,
    }
}

async fn cancel_fired(cancel: Option<&Cancel>) -> Error {
    match cancel {
        Some(cancel) => cancel.fired().await,
        None => std::future::pending().await,
    }
}

impl SessionInner {
    /// Acquire an outbound slot, encode the frame, and queue it for the
    /// send loop.
    ///
    /// Both waits race the caller's cancel cell, the caller's deadline and
    /// session shutdown, in that order of preference. The slot and buffer
    /// ride with the frame and are released wherever it is dropped.
    pub(crate) async fn send_frame(
        &self,
        header: Header,
        payload: &[u8],
        deadline: Option<&Deadline>,
        cancel: Option<&Cancel>,
    ) -> Result<(), Error> {
        let permit = tokio::select! {
            biased;
            err = cancel_fired(cancel) => return Err(err),
            _ = deadline_expired(deadline) => return Err(Error::Timeout),
            _ = self.shutdown.wait() => return Err(Error::Shutdown),
            permit = self.buf_out.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return Err(Error::Shutdown),
            },
        };

        let mut bytes = PooledBuf::get(&self.pool, payload.len() + FRAME_OVERHEAD);
        encode_frame(bytes.vec_mut(), header.encode(), payload);
        let frame = OutboundFrame {
            bytes,
            _permit: permit,
        };

        tokio::select! {
            biased;
            err = cancel_fired(cancel) => Err(err),
            _ = deadline_expired(deadline) => Err(Error::Timeout),
            _ = self.shutdown.wait() => Err(Error::Shutdown),
            sent = self.write_tx.send(frame) => sent.map_err(|_| Error::Shutdown),
        }
    }

    fn stream_entry(&self, id: StreamId) -> Option<Arc<StreamEntry>> {
        self.streams
            .lock()
            .unwrap()
            .entries
            .as_ref()?
            .get(&id)
            .cloned()
    }

    /// The stream pinning the most inbound slots in its queue, if any.
    fn most_queued_stream(&self) -> Option<Arc<StreamEntry>> {
        let guard = self.streams.lock().unwrap();
        let entries = guard.entries.as_ref()?;
        entries
            .values()
            .max_by_key(|entry| entry.queue.len())
            .filter(|entry| entry.queue.len() > 0)
            .cloned()
    }

    pub(crate) fn remove_stream(&self, id: StreamId) {
        if let Some(entries) = self.streams.lock().unwrap().entries.as_mut() {
            entries.remove(&id);
        }
    }

    /// Terminate a stream in both directions.
    ///
    /// Idempotent: a stream whose halves are both already shut (a prior
    /// reset, a remote Reset, or close + EOF) is left alone, so repeated
    /// resets emit nothing. Otherwise the reads and writes are cancelled,
    /// the queued credit reclaimed, and one Reset frame emitted; a remote
    /// Close does not suppress the frame, since the peer's read half is
    /// still open and must learn the stream is gone. The state
    /// transitions happen synchronously; only the frame send runs in the
    /// background, bounded by `reset_stream_timeout` and escalating to
    /// session teardown when it fails for any reason other than shutdown.
    pub(crate) fn reset_stream(self: &Arc<Self>, entry: &Arc<StreamEntry>) {
        {
            let mut halves = entry.halves.lock().unwrap();
            if halves.local_closed && halves.remote_closed {
                return;
            }
            halves.local_closed = true;
            halves.remote_closed = true;
        }
        entry.read_cancel.raise(Error::StreamReset);
        entry.queue.purge();
        entry.write_cancel.raise(Error::StreamReset);
        let session = self.clone();
        let header = entry.id.header(Tag::Reset);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move { session.send_reset(header).await });
        }
        self.remove_stream(entry.id);
    }

    async fn send_reset(self: Arc<Self>, header: Header) {
        let send = self.send_frame(header, &[], None, None);
        let result = match tokio::time::timeout(self.config.reset_stream_timeout, send).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout),
        };
        if let Err(err) = result {
            if self.shutdown.is_fired() {
                debug!(error = %err, "error sending reset message");
            } else {
                // The peer must not keep observing live traffic on a
                // stream we consider reset.
                warn!(error = %err, "error sending reset message; killing connection");
                self.close_no_wait();
            }
        }
    }

    /// Begin teardown without waiting for cleanup. Idempotent.
    pub(crate) fn close_no_wait(&self) {
        if self.shutdown.fire() {
            self.memory.release_memory(self.reserved_memory);
        }
    }

    fn set_shutdown_cause(&self, err: Error) {
        let mut cause = self.shutdown_cause.lock().unwrap();
        if cause.is_none() {
            *cause = Some(err);
        }
    }

    pub(crate) fn close_reason(&self) -> Option<Error> {
        self.shutdown_cause.lock().unwrap().clone()
    }

    /// Final teardown, run exactly once by the receive loop on exit.
    fn cleanup(&self, cause: Option<Error>) {
        if let Some(err) = cause {
            self.set_shutdown_cause(err);
        }
        self.close_no_wait();

        // Empty the map before signalling closure so no stream keeps the
        // session alive through its back-reference.
        let entries = self.streams.lock().unwrap().entries.take();
        if let Some(entries) = entries {
            for entry in entries.into_values() {
                {
                    let mut halves = entry.halves.lock().unwrap();
                    halves.local_closed = true;
                    halves.remote_closed = true;
                }
                entry.read_cancel.raise(Error::StreamReset);
                entry.queue.purge();
                entry.write_cancel.raise(Error::StreamReset);
            }
        }

        self.set_shutdown_cause(Error::Shutdown);
        self.closed.fire();
    }
}

/// A multiplexed session over one reliable ordered byte transport.
///
/// Cloning is cheap; all clones drive the same session. The session spawns
/// two background tasks (a receive loop and a send loop) and must be
/// created inside a tokio runtime.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
    accept_rx: Arc<AsyncMutex<mpsc::Receiver<Stream>>>,
}

impl Session {
    /// Create a session over `transport` with default configuration.
    ///
    /// `initiator` records which side dialled; the protocol itself is
    /// symmetric. Without a memory manager every buffer reservation is
    /// granted.
    pub fn new<T>(
        transport: T,
        initiator: bool,
        memory: Option<Arc<dyn MemoryManager>>,
    ) -> Result<Self, Error>
    where
        T: AsyncRead + AsyncWrite + Send + Sync + Unpin + 'static,
    {
        Self::with_config(transport, initiator, memory, Config::default())
    }

    /// Create a session with explicit tunables.
    pub fn with_config<T>(
        transport: T,
        initiator: bool,
        memory: Option<Arc<dyn MemoryManager>>,
        config: Config,
    ) -> Result<Self, Error>
    where
        T: AsyncRead + AsyncWrite + Send + Sync + Unpin + 'static,
    {
        Self::with_allocator(transport, initiator, memory, Arc::new(SlabPool::new()), config)
    }

    /// Create a session with an explicit buffer allocator.
    pub fn with_allocator<T>(
        transport: T,
        initiator: bool,
        memory: Option<Arc<dyn MemoryManager>>,
        pool: Arc<dyn BufferPool>,
        config: Config,
    ) -> Result<Self, Error>
    where
        T: AsyncRead + AsyncWrite + Send + Sync + Unpin + 'static,
    {
        let memory = memory.unwrap_or_else(|| Arc::new(NullMemoryManager));

        // Reserve the buffer budget up front: first slot at priority 255,
        // second at 192, the rest at 128. A declined reservation caps the
        // budget at whatever was granted.
        let mut buf_max = 0;
        let mut reserved_memory = 0;
        let mut declined: Option<io::Error> = None;
        for _ in 0..config.max_buffers {
            let priority = match buf_max {
                0 => 255,
                1 => 192,
                _ => 128,
            };
            match memory.reserve_memory(2 * config.max_message_size, priority) {
                Ok(()) => {
                    reserved_memory += 2 * config.max_message_size;
                    buf_max += 1;
                }
                Err(err) => {
                    declined = Some(err);
                    break;
                }
            }
        }
        if buf_max == 0 {
            let err = declined.unwrap_or_else(|| {
                io::Error::new(io::ErrorKind::OutOfMemory, "no buffer slots granted")
            });
            return Err(Error::from(err));
        }

        let (write_tx, write_rx) = mpsc::channel(WRITE_QUEUE_CAPACITY);
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_QUEUE_CAPACITY);
        let inner = Arc::new(SessionInner {
            config,
            initiator,
            memory,
            pool,
            reserved_memory,
            buf_max,
            buf_in: Arc::new(Semaphore::new(buf_max)),
            buf_out: Arc::new(Semaphore::new(buf_max)),
            write_tx,
            streams: Mutex::new(StreamMap {
                entries: Some(HashMap::new()),
                next_id: 0,
            }),
            shutdown: Event::new(),
            closed: Event::new(),
            shutdown_cause: Mutex::new(None),
        });

        let (read_half, write_half) = tokio::io::split(transport);
        tokio::spawn(
            ReceiveLoop {
                inner: inner.clone(),
                io: FrameReader::new(read_half),
                accept_tx,
            }
            .run(),
        );
        tokio::spawn(
            SendLoop {
                inner: inner.clone(),
                io: BufWriter::new(write_half),
                write_rx,
            }
            .run(),
        );

        Ok(Session {
            inner,
            accept_rx: Arc::new(AsyncMutex::new(accept_rx)),
        })
    }

    /// True iff this side dialled the connection.
    pub fn is_initiator(&self) -> bool {
        self.inner.initiator
    }

    /// Open a new stream named after its decimal id.
    pub async fn open_stream(&self) -> Result<Stream, Error> {
        self.open_named_stream("").await
    }

    /// Open a new named stream.
    ///
    /// The stream is announced to the peer with a NewStream frame carrying
    /// the name (or the decimal id when `name` is empty). The stream stays
    /// registered only if the announcement goes out; on failure, or if
    /// this future is dropped mid-send, the registration is rolled back.
    pub async fn open_named_stream(&self, name: &str) -> Result<Stream, Error> {
        let entry = {
            let mut map = self.inner.streams.lock().unwrap();
            let StreamMap { entries, next_id } = &mut *map;
            let Some(entries) = entries.as_mut() else {
                return Err(Error::Shutdown);
            };
            let id = StreamId::new(*next_id, true);
            *next_id += 1;
            let name = if name.is_empty() {
                id.id.to_string()
            } else {
                name.to_owned()
            };
            let entry = Arc::new(StreamEntry::new(id, name, self.inner.buf_max));
            entries.insert(id, entry.clone());
            entry
        };

        let mut registration = Registration {
            inner: &self.inner,
            id: entry.id,
            armed: true,
        };
        self.inner
            .send_frame(
                entry.id.header(Tag::NewStream),
                entry.name.as_bytes(),
                None,
                None,
            )
            .await?;
        registration.armed = false;

        Ok(Stream::new(entry, self.inner.clone()))
    }

    /// Accept the next stream opened by the peer, in announcement order.
    ///
    /// Fails with the session's shutdown cause once the session has
    /// closed and the queue of already-announced streams is drained.
    pub async fn accept_stream(&self) -> Result<Stream, Error> {
        let mut accept_rx = self.accept_rx.lock().await;
        tokio::select! {
            biased;
            stream = accept_rx.recv() => stream.ok_or_else(|| self.error_cause()),
            _ = self.inner.closed.wait() => Err(self.error_cause()),
        }
    }

    fn error_cause(&self) -> Error {
        self.inner.close_reason().unwrap_or(Error::Shutdown)
    }

    /// Close the session and wait for the receive loop to finish cleanup,
    /// so all derived stream cancellations are observable on return.
    pub async fn close(&self) {
        self.inner.close_no_wait();
        self.inner.closed.wait().await;
    }

    /// True once the session has fully shut down.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_fired()
    }

    /// Resolves when the session has fully shut down.
    pub async fn closed(&self) {
        self.inner.closed.wait().await;
    }

    /// Why the session shut down, once it has.
    pub fn close_reason(&self) -> Option<Error> {
        self.inner.close_reason()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("initiator", &self.inner.initiator)
            .field("closed", &self.inner.closed.is_fired())
            .finish()
    }
}

/// Rolls back a stream registration unless disarmed.
struct Registration<'a> {
    inner: &'a SessionInner,
    id: StreamId,
    armed: bool,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.remove_stream(self.id);
        }
    }
}

/// The single reader of the transport.
struct ReceiveLoop<R> {
    inner: Arc<SessionInner>,
    io: FrameReader<R>,
    accept_tx: mpsc::Sender<Stream>,
}

impl<R> ReceiveLoop<R>
where
    R: AsyncRead + Unpin,
{
    async fn run(mut self) {
        let inner = self.inner.clone();
        let cause = tokio::select! {
            biased;
            _ = inner.shutdown.wait() => None,
            err = self.recv() => Some(err),
        };
        inner.cleanup(cause);
    }

    /// Read and dispatch frames until a decode or protocol error.
    async fn recv(&mut self) -> Error {
        loop {
            if let Err(err) = self.recv_frame().await {
                return err;
            }
        }
    }

    async fn recv_frame(&mut self) -> Result<(), Error> {
        let raw = self.io.read_uvarint().await?;
        let header = match Header::decode(raw) {
            Ok(header) => header,
            Err(HeaderError::UnknownTag {
                stream_id,
                initiator,
                tag,
            }) => {
                let len = self.read_length().await?;
                self.io.discard(len).await?;
                let id = StreamId::new(stream_id, !initiator);
                match self.inner.stream_entry(id) {
                    Some(entry) => {
                        debug!(stream = %id, tag, "resetting stream with unknown tag");
                        self.inner.reset_stream(&entry);
                    }
                    None => debug!(stream = %id, tag, "message with unknown header"),
                }
                return Ok(());
            }
        };

        let len = self.read_length().await?;
        // The tag's parity says whether the *sender* originated the
        // stream; our map keys carry our own perspective.
        let id = StreamId::new(header.stream_id, !header.initiator);
        match header.tag {
            Tag::NewStream => self.on_new_stream(id, len).await,
            Tag::Message => self.on_message(id, len).await,
            Tag::Close => self.on_close(id, len).await,
            Tag::Reset => self.on_reset(id, len).await,
        }
    }

    async fn read_length(&mut self) -> Result<u64, Error> {
        let len = self.io.read_uvarint().await?;
        if len > self.inner.config.max_message_size as u64 {
            return Err(Error::MessageTooLarge);
        }
        Ok(len)
    }

    async fn acquire_inbound(&self) -> Result<OwnedSemaphorePermit, Error> {
        self.inner
            .buf_in
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Shutdown)
    }

    async fn on_new_stream(&mut self, id: StreamId, len: u64) -> Result<(), Error> {
        // The name buffer and its slot are returned as soon as the name
        // is copied out.
        let name = if len > 0 {
            let permit = self.acquire_inbound().await?;
            let mut data = PooledBuf::get(&self.inner.pool, len as usize);
            self.io.read_exact(&mut data).await?;
            let name = String::from_utf8_lossy(&data).into_owned();
            drop((data, permit));
            name
        } else {
            id.id.to_string()
        };

        if self.inner.stream_entry(id).is_some() {
            debug!(stream = %id, "received NewStream message for existing stream");
            return Err(Error::InvalidState);
        }

        let entry = Arc::new(StreamEntry::new(id, name, self.inner.buf_max));
        {
            let mut map = self.inner.streams.lock().unwrap();
            match map.entries.as_mut() {
                Some(entries) => {
                    entries.insert(id, entry.clone());
                }
                None => return Ok(()),
            }
        }

        let stream = Stream::new(entry, self.inner.clone());
        if self.accept_tx.send(stream).await.is_err() {
            // Every session handle is gone; dropping the stream resets it.
            debug!(stream = %id, "no acceptor for new stream");
        }
        Ok(())
    }

    async fn on_message(&mut self, id: StreamId, len: u64) -> Result<(), Error> {
        let Some(entry) = self.inner.stream_entry(id) else {
            // Not accepting data on this stream; likely reset locally.
            self.io.discard(len).await?;
            return Ok(());
        };

        // Zero-length messages occupy a queue entry but no buffer slot.
        let chunk = if len > 0 {
            let permit = loop {
                let stalled = tokio::select! {
                    biased;
                    _ = entry.read_cancel.fired() => {
                        self.io.discard(len).await?;
                        return Ok(());
                    }
                    permit = self.acquire_inbound() => break permit?,
                    _ = tokio::time::sleep(self.inner.config.receive_timeout) => {
                        self.inner.most_queued_stream()
                    }
                };
                // Every slot is pinned. Reset the stream hoarding the
                // most of them and retry; its purge returns the credit.
                // When no queue holds any (the slots sit with readers mid
                // chunk), the current stream takes the reset instead.
                match stalled {
                    Some(hog) => {
                        warn!(stream = %hog.id, "inbound slots exhausted; resetting slowest stream");
                        self.inner.reset_stream(&hog);
                    }
                    None => {
                        warn!(stream = %id, "timed out waiting for an inbound slot");
                        self.inner.reset_stream(&entry);
                        self.io.discard(len).await?;
                        return Ok(());
                    }
                }
            };
            let mut data = PooledBuf::get(&self.inner.pool, len as usize);
            self.io.read_exact(&mut data).await?;
            InboundChunk::new(data, permit)
        } else {
            InboundChunk::empty()
        };

        tokio::select! {
            biased;
            // The reader walked away; the chunk is dropped either way.
            _ = entry.read_cancel.fired() => {}
            result = entry.queue.push(chunk) => {
                let _ = result;
            }
            _ = tokio::time::sleep(self.inner.config.receive_timeout) => {
                warn!(stream = %id, "timed out receiving message into stream queue");
                // Synchronous, so the peer never observes a dropped
                // message followed by delivered ones on a stream it must
                // consider reset.
                self.inner.reset_stream(&entry);
            }
        }
        Ok(())
    }

    async fn on_close(&mut self, id: StreamId, len: u64) -> Result<(), Error> {
        if len > 0 {
            self.io.discard(len).await?;
        }
        let Some(entry) = self.inner.stream_entry(id) else {
            // Already torn down locally.
            return Ok(());
        };

        // Unregister so later data for this id is thrown away, and
        // deliver EOF once the queue drains. Reads, writes and deadlines
        // are deliberately untouched: the user still closes or resets.
        self.inner.remove_stream(id);
        entry.halves.lock().unwrap().remote_closed = true;
        entry.queue.close();
        Ok(())
    }

    async fn on_reset(&mut self, id: StreamId, len: u64) -> Result<(), Error> {
        if len > 0 {
            self.io.discard(len).await?;
        }
        let Some(entry) = self.inner.stream_entry(id) else {
            // We forget streams on reset; a late Reset frame is normal.
            return Ok(());
        };

        self.inner.remove_stream(id);
        {
            let mut halves = entry.halves.lock().unwrap();
            halves.local_closed = true;
            halves.remote_closed = true;
        }
        entry.read_cancel.raise(Error::StreamReset);
        entry.queue.purge();
        entry.write_cancel.raise(Error::StreamReset);
        Ok(())
    }
}

/// The single writer of the transport.
struct SendLoop<W> {
    inner: Arc<SessionInner>,
    /// Buffered so a gathered batch reaches the transport in one write.
    io: BufWriter<W>,
    write_rx: mpsc::Receiver<OutboundFrame>,
}

impl<W> SendLoop<W>
where
    W: AsyncWrite + Unpin,
{
    async fn run(mut self) {
        loop {
            let frame = tokio::select! {
                biased;
                _ = self.inner.shutdown.wait() => break,
                frame = self.write_rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };
            if let Err(err) = self.write_coalesced(frame).await {
                warn!(error = %err, "error writing data");
                self.inner.set_shutdown_cause(Error::from(err));
                self.inner.close_no_wait();
                break;
            }
        }
        // Best-effort FIN so the peer's reader observes EOF promptly.
        let _ = self.io.shutdown().await;
    }

    /// Write `first` plus whatever queued behind it, in one flush.
    ///
    /// An isolated frame goes out immediately. When a burst is forming,
    /// a single bounded pause lets the rest of it join the same flush.
    /// Queue order is preserved and no frame waits longer than the delay
    /// bound.
    async fn write_coalesced(&mut self, first: OutboundFrame) -> io::Result<()> {
        let mut frames = vec![first];
        while let Ok(frame) = self.write_rx.try_recv() {
            frames.push(frame);
        }
        let delay = self.inner.config.write_coalesce_delay;
        if frames.len() > 1 && !delay.is_zero() {
            tokio::time::sleep(delay).await;
            while let Ok(frame) = self.write_rx.try_recv() {
                frames.push(frame);
            }
        }
        for frame in &frames {
            self.io.write_all(&frame.bytes).await?;
        }
        self.io.flush().await
        // Dropping the frames returns their buffers and slots.
    }
}
