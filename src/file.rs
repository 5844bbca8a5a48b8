//! A file-level façade over [`BamReader`] and [`BamWriter`].

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::api::BamOptions;
use crate::error::{BamError, Result};
use crate::io::{DataSource, DatagramSink};
use crate::reader::BamReader;
use crate::types::Registry;
use crate::writable::WritableRef;
use crate::writer::BamWriter;

#[derive(Debug, Default)]
enum FileState {
    #[default]
    Closed,
    Reading(BamReader),
    Writing(BamWriter<'static>),
}

/// An open BAM file, either being read or being written.
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use bamcode::{BamFile, BamObject, Registry};
///
/// #[derive(Debug, Default, BamObject)]
/// struct Note {
///     text: String,
/// }
///
/// # fn main() -> bamcode::Result<()> {
/// let mut registry = Registry::new();
/// registry.register::<Note>();
/// let registry = Arc::new(registry);
///
/// let mut file = BamFile::new(Arc::clone(&registry));
/// file.open_read("notes.bam")?;
/// while let Some(note) = file.read_root()? {
///     if let Some(note) = note.downcast_ref::<Note>() {
///         println!("{}", note.text);
///     }
/// }
/// file.close()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct BamFile {
    registry: Arc<Registry>,
    options: BamOptions,
    state: FileState,
}

impl BamFile {
    /// Creates a closed file handle with default options.
    pub fn new(registry: Arc<Registry>) -> Self {
        Self::with_options(registry, BamOptions::default())
    }

    /// Creates a closed file handle with the given options.
    pub fn with_options(registry: Arc<Registry>, options: BamOptions) -> Self {
        Self {
            registry,
            options,
            state: FileState::Closed,
        }
    }

    /// Opens a file for reading through a memory map.
    pub fn open_read<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        self.close()?;
        let path = path.as_ref();
        let reader = self.make_reader(DataSource::map_file(path)?)?;
        debug!(path = %path.display(), "opened BAM file for reading");
        self.state = FileState::Reading(reader);
        Ok(())
    }

    /// Opens an in-memory stream for reading.
    pub fn open_read_bytes(&mut self, bytes: Vec<u8>) -> Result<()> {
        self.close()?;
        let reader = self.make_reader(DataSource::Memory(bytes))?;
        self.state = FileState::Reading(reader);
        Ok(())
    }

    /// Creates (or truncates) a file for writing.
    pub fn open_write<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        self.close()?;
        let path = path.as_ref();
        let header = self.options.header()?;
        let sink = DatagramSink::create(path)?;
        debug!(path = %path.display(), minor = header.minor, "opened BAM file for writing");
        self.state = FileState::Writing(BamWriter::with_header(
            Arc::clone(&self.registry),
            sink,
            header,
        ));
        Ok(())
    }

    fn make_reader(&self, data: DataSource) -> Result<BamReader> {
        Ok(BamReader::new(Arc::clone(&self.registry), data)?
            .with_unknown_types(self.options.unknown_types))
    }

    /// Reads the next top-level object; its pointers may still be pending.
    pub fn read_object(&mut self) -> Result<Option<WritableRef>> {
        self.reader_mut()?.read_object()
    }

    /// Reads the next top-level object and resolves it completely, reading
    /// further records if its pointers refer forward into them.
    pub fn read_root(&mut self) -> Result<Option<WritableRef>> {
        let reader = self.reader_mut()?;
        let Some(root) = reader.read_object()? else {
            return Ok(None);
        };
        while !reader.resolve()? {
            reader.read_object()?;
        }
        Ok(Some(root))
    }

    /// Writes a top-level object and everything it reaches.
    pub fn write_object(&mut self, object: &WritableRef) -> Result<()> {
        self.writer_mut()?.write_object(object)
    }

    /// Resolves pending pointers; see [`BamReader::resolve`].
    pub fn resolve(&mut self) -> Result<bool> {
        self.reader_mut()?.resolve()
    }

    /// Returns true if no more records can be read.
    pub fn is_eof(&self) -> bool {
        match &self.state {
            FileState::Reading(reader) => reader.is_eof(),
            _ => true,
        }
    }

    /// `(major, minor)` of the open stream.
    pub fn file_version(&self) -> Option<(u16, u16)> {
        match &self.state {
            FileState::Reading(reader) => Some((reader.file_major_ver(), reader.file_minor_ver())),
            FileState::Writing(writer) => Some((writer.file_major_ver(), writer.file_minor_ver())),
            FileState::Closed => None,
        }
    }

    /// The reader, while reading.
    pub fn reader_mut(&mut self) -> Result<&mut BamReader> {
        match &mut self.state {
            FileState::Reading(reader) => Ok(reader),
            _ => Err(BamError::Logic("BAM file is not open for reading".into())),
        }
    }

    /// The writer, while writing.
    pub fn writer_mut(&mut self) -> Result<&mut BamWriter<'static>> {
        match &mut self.state {
            FileState::Writing(writer) => Ok(writer),
            _ => Err(BamError::Logic("BAM file is not open for writing".into())),
        }
    }

    /// Finishes a written stream, or drops a reader. Closing a closed file is
    /// a no-op.
    pub fn close(&mut self) -> Result<()> {
        match std::mem::take(&mut self.state) {
            FileState::Closed => Ok(()),
            FileState::Reading(reader) => {
                if reader.pending_count() > 0 {
                    warn!(
                        pending = reader.pending_count(),
                        "closing BAM file with unresolved objects"
                    );
                }
                Ok(())
            }
            FileState::Writing(writer) => writer.finish(),
        }
    }
}

impl Drop for BamFile {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(%err, "failed to close BAM file");
        }
    }
}
