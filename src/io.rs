//! Datagram framing over byte streams.
//!
//! Writing goes through a buffered sink that tracks its offset; reading works
//! on an in-memory or memory-mapped image of the whole stream. Both sides use
//! the same framing: the magic bytes, then datagrams prefixed by their length
//! as a little-endian `u32`.

use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::ops::{Deref, Range};
use std::path::Path;
use std::sync::Arc;

use memmap2::Mmap;
use tracing::trace;

use crate::datagram::Datagram;
use crate::error::{BamError, Result};
use crate::format::{FRAME_PREFIX_SIZE, MAGIC_BYTES};

/// A buffered writer that appends framed datagrams and tracks the offset.
pub struct DatagramSink<'w> {
    writer: BufWriter<Box<dyn Write + 'w>>,
    current_offset: u64,
}

impl fmt::Debug for DatagramSink<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatagramSink")
            .field("current_offset", &self.current_offset)
            .finish_non_exhaustive()
    }
}

impl<'w> DatagramSink<'w> {
    /// Wraps any writer.
    pub fn new<W: Write + 'w>(target: W) -> Self {
        Self {
            writer: BufWriter::new(Box::new(target)),
            current_offset: 0,
        }
    }

    /// Creates (truncating) a file and wraps it.
    pub fn create(path: &Path) -> Result<DatagramSink<'static>> {
        let file = File::create(path)?;
        Ok(DatagramSink::new(file))
    }

    /// Writes the magic bytes. Must come before any datagram.
    pub fn write_magic(&mut self) -> Result<()> {
        self.write_raw(&MAGIC_BYTES).map(|_| ())
    }

    /// Writes one framed datagram and returns the offset of its length prefix.
    pub fn put_datagram(&mut self, dg: &Datagram) -> Result<u64> {
        let len = u32::try_from(dg.len()).map_err(|_| {
            BamError::Logic(format!("datagram of {} bytes exceeds u32 framing", dg.len()))
        })?;
        let start = self.write_raw(&len.to_le_bytes())?;
        self.write_raw(dg.as_bytes())?;
        trace!(offset = start, len, "wrote datagram");
        Ok(start)
    }

    fn write_raw(&mut self, bytes: &[u8]) -> Result<u64> {
        let start = self.current_offset;
        self.writer.write_all(bytes)?;
        self.current_offset += bytes.len() as u64;
        Ok(start)
    }

    /// Flushes buffered bytes to the underlying writer.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Number of bytes written so far.
    pub fn current_offset(&self) -> u64 {
        self.current_offset
    }
}

/// The bytes of a whole stream.
#[derive(Debug)]
pub enum DataSource {
    /// A memory-mapped file.
    Mapped(Mmap),
    /// An owned buffer.
    Memory(Vec<u8>),
}

impl DataSource {
    /// Memory-maps a file.
    pub fn map_file(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        // SAFETY: the map is read-only; a file truncated by another process
        // while mapped is outside what this library can defend against.
        #[allow(unsafe_code)]
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(Self::Mapped(mmap))
    }
}

impl Deref for DataSource {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            Self::Mapped(mmap) => mmap,
            Self::Memory(bytes) => bytes,
        }
    }
}

/// One datagram located in a [`DataSource`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Offset of the length prefix.
    pub offset: u64,
    /// Byte range of the payload.
    pub payload: Range<usize>,
}

/// Splits a stream image into framed datagrams.
#[derive(Debug, Clone)]
pub struct DatagramSource {
    data: Arc<DataSource>,
    position: usize,
}

impl DatagramSource {
    /// Checks the magic bytes and positions the cursor at the first datagram.
    pub fn open(data: DataSource) -> Result<Self> {
        if data.len() < MAGIC_BYTES.len() || data[..MAGIC_BYTES.len()] != MAGIC_BYTES {
            return Err(BamError::Format("not a BAM stream (bad magic bytes)".into()));
        }
        Ok(Self {
            data: Arc::new(data),
            position: MAGIC_BYTES.len(),
        })
    }

    /// Locates the next datagram, or `None` at a clean end of stream.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        let remaining = self.data.len() - self.position;
        if remaining == 0 {
            return Ok(None);
        }
        if remaining < FRAME_PREFIX_SIZE {
            return Err(BamError::Format(format!(
                "truncated datagram length at offset {}",
                self.position
            )));
        }
        let mut prefix = [0u8; FRAME_PREFIX_SIZE];
        prefix.copy_from_slice(&self.data[self.position..self.position + FRAME_PREFIX_SIZE]);
        let len = u32::from_le_bytes(prefix) as usize;

        let start = self.position + FRAME_PREFIX_SIZE;
        if len > self.data.len() - start {
            return Err(BamError::Format(format!(
                "datagram at offset {} claims {len} bytes but only {} remain",
                self.position,
                self.data.len() - start
            )));
        }
        let frame = Frame {
            offset: self.position as u64,
            payload: start..start + len,
        };
        self.position = start + len;
        Ok(Some(frame))
    }

    /// A shared handle on the stream image, to slice frames out of.
    pub fn data(&self) -> Arc<DataSource> {
        Arc::clone(&self.data)
    }

    /// Returns true once every datagram has been consumed.
    pub fn is_exhausted(&self) -> bool {
        self.position == self.data.len()
    }

    /// Total size of the stream image.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true for an empty image (never the case after `open`).
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::BamEndian;

    fn framed(payloads: &[&[u8]]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        {
            let mut sink = DatagramSink::new(&mut out);
            sink.write_magic()?;
            for payload in payloads {
                let mut dg = Datagram::new(BamEndian::Little, false);
                dg.append_data(payload);
                sink.put_datagram(&dg)?;
            }
            sink.flush()?;
        }
        Ok(out)
    }

    #[test]
    fn frames_come_back_in_order() -> Result<()> {
        let bytes = framed(&[b"one", b"", b"three"])?;
        let mut source = DatagramSource::open(DataSource::Memory(bytes))?;
        let data = source.data();

        let mut seen = Vec::new();
        while let Some(frame) = source.next_frame()? {
            seen.push(data[frame.payload].to_vec());
        }
        assert_eq!(seen, vec![b"one".to_vec(), Vec::new(), b"three".to_vec()]);
        assert!(source.is_exhausted());
        Ok(())
    }

    #[test]
    fn sink_reports_offsets() -> Result<()> {
        let mut out = Vec::new();
        let mut sink = DatagramSink::new(&mut out);
        sink.write_magic()?;
        let mut dg = Datagram::new(BamEndian::Little, false);
        dg.add_u32(5);
        assert_eq!(sink.put_datagram(&dg)?, 6);
        assert_eq!(sink.put_datagram(&dg)?, 14);
        assert_eq!(sink.current_offset(), 22);
        Ok(())
    }

    #[test]
    fn bad_magic_is_rejected() {
        let err = DatagramSource::open(DataSource::Memory(b"PK\x03\x04zip".to_vec())).err();
        assert!(matches!(err, Some(BamError::Format(_))));
    }

    #[test]
    fn truncated_frames_are_format_errors() -> Result<()> {
        let mut bytes = framed(&[b"payload"])?;
        bytes.truncate(bytes.len() - 2);
        let mut source = DatagramSource::open(DataSource::Memory(bytes))?;
        assert!(matches!(source.next_frame(), Err(BamError::Format(_))));

        let mut short = MAGIC_BYTES.to_vec();
        short.extend_from_slice(&[1, 0]);
        let mut source = DatagramSource::open(DataSource::Memory(short))?;
        assert!(matches!(source.next_frame(), Err(BamError::Format(_))));
        Ok(())
    }
}
