#![deny(unsafe_code)]

//! Stream multiplexer over one reliable ordered byte transport.
//!
//! A [`Session`] wraps any `AsyncRead + AsyncWrite` connection and carries
//! an arbitrary number of independent bidirectional byte [`Stream`]s over
//! it. Streams have their own open/close lifecycle, cancellation and
//! deadlines; backpressure is per message slot, bounded by a buffer budget
//! granted by a [`MemoryManager`] at session construction.
//!
//! ```no_run
//! use weft_mux::Session;
//!
//! # async fn run() -> Result<(), weft_mux::Error> {
//! # let (conn, _peer) = tokio::io::duplex(4096);
//! let session = Session::new(conn, true, None)?;
//! let stream = session.open_named_stream("echo").await?;
//! stream.write(b"hi").await?;
//! let mut buf = [0u8; 16];
//! let _n = stream.read(&mut buf).await?;
//! stream.close().await?;
//! # Ok(()) }
//! ```

mod config;
mod deadline;
mod error;
mod framing;
mod memory;
mod pool;
mod queue;
mod session;
mod signal;
mod stream;

pub use config::Config;
pub use error::Error;
pub use memory::{MemoryManager, NullMemoryManager};
pub use pool::{BufferPool, SlabPool};
pub use session::Session;
pub use stream::Stream;

pub use weft_wire::StreamId;
