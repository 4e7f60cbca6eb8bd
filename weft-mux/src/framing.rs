use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, BufReader};

use weft_wire::{put_uvarint, MAX_VARINT_LEN};

/// Worst-case bytes of framing around one payload: two maximal varints.
pub(crate) const FRAME_OVERHEAD: usize = 2 * MAX_VARINT_LEN;

/// Encode one frame into `buf`: header varint, length varint, payload.
///
/// `buf` is cleared first; with capacity of at least
/// `payload.len() + FRAME_OVERHEAD` no reallocation occurs.
pub(crate) fn encode_frame(buf: &mut Vec<u8>, header: u64, payload: &[u8]) {
    buf.clear();
    put_uvarint(buf, header);
    put_uvarint(buf, payload.len() as u64);
    buf.extend_from_slice(payload);
}

/// Buffered frame reader over the transport's read half.
///
/// Varints are decoded byte-at-a-time; the `BufReader` underneath keeps
/// that from turning into per-byte reads on the transport.
pub(crate) struct FrameReader<R> {
    inner: BufReader<R>,
}

impl<R> FrameReader<R>
where
    R: AsyncRead + Unpin,
{
    pub(crate) fn new(transport: R) -> Self {
        Self {
            inner: BufReader::new(transport),
        }
    }

    /// Read one unsigned varint.
    pub(crate) async fn read_uvarint(&mut self) -> io::Result<u64> {
        let mut value = 0u64;
        let mut shift = 0u32;
        for i in 0..MAX_VARINT_LEN {
            let byte = self.inner.read_u8().await?;
            if i == MAX_VARINT_LEN - 1 && byte > 1 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "varint overflows a 64-bit integer",
                ));
            }
            if byte < 0x80 {
                return Ok(value | (byte as u64) << shift);
            }
            value |= ((byte & 0x7f) as u64) << shift;
            shift += 7;
        }
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "varint overflows a 64-bit integer",
        ))
    }

    /// Fill `buf` exactly.
    pub(crate) async fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        self.inner.read_exact(buf).await?;
        Ok(())
    }

    /// Consume and drop `len` bytes, keeping the frame boundary intact.
    pub(crate) async fn discard(&mut self, len: u64) -> io::Result<()> {
        let mut remaining = len;
        let mut scratch = [0u8; 4096];
        while remaining > 0 {
            let take = remaining.min(scratch.len() as u64) as usize;
            self.inner.read_exact(&mut scratch[..take]).await?;
            remaining -= take as u64;
        }
        Ok(())
    }
}
