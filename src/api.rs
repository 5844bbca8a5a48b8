//! One-call save and load.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{BamError, Result};
use crate::file::BamFile;
use crate::format::{BAM_MINOR_VER, BamEndian, BamHeader};
use crate::inspector::{BamInspector, InspectionReport};
use crate::io::{DataSource, DatagramSink};
use crate::reader::{BamReader, UnknownTypePolicy};
use crate::types::Registry;
use crate::writable::WritableRef;
use crate::writer::BamWriter;

/// The main entry point for saving and loading object graphs.
#[derive(Debug)]
pub struct Bam;

impl Bam {
    /// Options for streams that differ from the defaults.
    pub fn builder() -> BamOptions {
        BamOptions::default()
    }

    /// Writes `root` and everything it reaches to `path`.
    ///
    /// A file left behind by a failed save is removed.
    pub fn save<P: AsRef<Path>>(path: P, registry: &Arc<Registry>, root: &WritableRef) -> Result<()> {
        BamOptions::default().save(path, registry, std::slice::from_ref(root))
    }

    /// Reads and fully resolves the first object in `path`.
    pub fn load<P: AsRef<Path>>(path: P, registry: &Arc<Registry>) -> Result<WritableRef> {
        BamOptions::default().load(path, registry)
    }

    /// Encodes `root` and everything it reaches as an in-memory stream.
    pub fn serialize(registry: &Arc<Registry>, root: &WritableRef) -> Result<Vec<u8>> {
        BamOptions::default().serialize(registry, std::slice::from_ref(root))
    }

    /// Decodes and fully resolves the first object of an in-memory stream.
    pub fn deserialize(registry: &Arc<Registry>, bytes: &[u8]) -> Result<WritableRef> {
        BamOptions::default().deserialize(registry, bytes)
    }

    /// Reports the record structure of `path` without building any object.
    pub fn inspect<P: AsRef<Path>>(path: P) -> Result<InspectionReport> {
        BamInspector::inspect(path)
    }
}

/// Stream settings, usable as a builder and as serde configuration.
///
/// ```rust
/// use bamcode::{Bam, BamEndian, UnknownTypePolicy};
///
/// let options = Bam::builder()
///     .minor_version(30)
///     .endian(BamEndian::Big)
///     .unknown_types(UnknownTypePolicy::Abort);
/// assert_eq!(options.minor_version, 30);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BamOptions {
    /// Minor version to write.
    pub minor_version: u16,
    /// Byte order of written records.
    pub endian: BamEndian,
    /// Write `stdfloat` fields as `f64` (needs minor version 27 or later).
    pub stdfloat_double: bool,
    /// What readers do with records they cannot construct.
    pub unknown_types: UnknownTypePolicy,
}

impl Default for BamOptions {
    fn default() -> Self {
        Self {
            minor_version: BAM_MINOR_VER,
            endian: BamEndian::Little,
            stdfloat_double: false,
            unknown_types: UnknownTypePolicy::Skip,
        }
    }
}

impl BamOptions {
    /// Sets the minor version to write.
    pub fn minor_version(mut self, minor: u16) -> Self {
        self.minor_version = minor;
        self
    }

    /// Sets the byte order to write.
    pub fn endian(mut self, endian: BamEndian) -> Self {
        self.endian = endian;
        self
    }

    /// Sets the width of `stdfloat` fields.
    pub fn stdfloat_double(mut self, double: bool) -> Self {
        self.stdfloat_double = double;
        self
    }

    /// Sets the unknown-type policy for reading.
    pub fn unknown_types(mut self, policy: UnknownTypePolicy) -> Self {
        self.unknown_types = policy;
        self
    }

    /// The header these options produce, validated.
    pub fn header(&self) -> Result<BamHeader> {
        BamHeader::new(self.minor_version, self.endian, self.stdfloat_double)
    }

    /// Writes `roots`, in order, to `path`.
    pub fn save<P: AsRef<Path>>(
        &self,
        path: P,
        registry: &Arc<Registry>,
        roots: &[WritableRef],
    ) -> Result<()> {
        let path = path.as_ref();
        let result = self.save_inner(path, registry, roots);
        if let Err(err) = &result {
            warn!(path = %path.display(), %err, "save failed; removing partial file");
            if let Err(io) = std::fs::remove_file(path) {
                warn!(path = %path.display(), %io, "could not remove partial file");
            }
        }
        result
    }

    fn save_inner(&self, path: &Path, registry: &Arc<Registry>, roots: &[WritableRef]) -> Result<()> {
        let mut file = BamFile::with_options(Arc::clone(registry), *self);
        file.open_write(path)?;
        for root in roots {
            file.write_object(root)?;
        }
        file.close()
    }

    /// Reads and resolves the first object in `path`.
    pub fn load<P: AsRef<Path>>(&self, path: P, registry: &Arc<Registry>) -> Result<WritableRef> {
        let mut file = BamFile::with_options(Arc::clone(registry), *self);
        file.open_read(path)?;
        file.read_root()?
            .ok_or_else(|| BamError::Format("BAM stream contains no objects".into()))
    }

    /// Reads and resolves every top-level object in `path`.
    pub fn load_all<P: AsRef<Path>>(
        &self,
        path: P,
        registry: &Arc<Registry>,
    ) -> Result<Vec<WritableRef>> {
        let mut file = BamFile::with_options(Arc::clone(registry), *self);
        file.open_read(path)?;
        read_all(file.reader_mut()?)
    }

    /// Encodes `roots`, in order, as an in-memory stream.
    pub fn serialize(&self, registry: &Arc<Registry>, roots: &[WritableRef]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut writer =
            BamWriter::with_header(Arc::clone(registry), DatagramSink::new(&mut out), self.header()?);
        for root in roots {
            writer.write_object(root)?;
        }
        writer.finish()?;
        Ok(out)
    }

    /// Decodes and resolves the first object of an in-memory stream.
    pub fn deserialize(&self, registry: &Arc<Registry>, bytes: &[u8]) -> Result<WritableRef> {
        let mut file = BamFile::with_options(Arc::clone(registry), *self);
        file.open_read_bytes(bytes.to_vec())?;
        file.read_root()?
            .ok_or_else(|| BamError::Format("BAM stream contains no objects".into()))
    }

    /// Decodes and resolves every top-level object of an in-memory stream.
    pub fn deserialize_all(&self, registry: &Arc<Registry>, bytes: &[u8]) -> Result<Vec<WritableRef>> {
        let mut reader = BamReader::new(Arc::clone(registry), DataSource::Memory(bytes.to_vec()))?
            .with_unknown_types(self.unknown_types);
        read_all(&mut reader)
    }
}

fn read_all(reader: &mut BamReader) -> Result<Vec<WritableRef>> {
    let mut roots = Vec::new();
    while let Some(root) = reader.read_object()? {
        roots.push(root);
    }
    reader.resolve()?;
    Ok(roots)
}
