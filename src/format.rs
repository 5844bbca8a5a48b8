//! Defines the physical binary layout of BAM streams.
//!
//! # Layout
//! A stream is a magic marker followed by a sequence of length-framed
//! datagrams. The first datagram is the header; every following one is an
//! object record.
//!
//! File: `[Magic] [len|Header] [len|Record] [len|Record] ...`
//!
//! ## Record Anatomy
//! `[ObjectCode u8] [TypeIndex u16 (+ definition)] [ObjectId u32] [Fields]`
//!
//! `Pop` records carry only the code; `Remove` records carry a list of IDs.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::datagram::{Datagram, DatagramIterator};
use crate::error::{BamError, Result};

/// Magic bytes identifying a BAM stream.
pub const MAGIC_BYTES: [u8; 6] = *b"pbj\0\n\r";

/// The only major version this build reads and writes.
pub const BAM_MAJOR_VER: u16 = 6;

/// The newest minor version this build understands (and writes by default).
pub const BAM_MINOR_VER: u16 = 45;

/// The oldest minor version this build can read or produce.
pub const BAM_FIRST_MINOR_VER: u16 = 21;

/// First minor version whose header records the `stdfloat_double` flag.
pub const STDFLOAT_HEADER_MINOR_VER: u16 = 27;

/// Size of the little-endian length prefix framing each datagram.
pub const FRAME_PREFIX_SIZE: usize = 4;

/// Byte order of the numeric fields inside object records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BamEndian {
    /// Least significant byte first (the conventional order).
    #[default]
    Little,
    /// Most significant byte first.
    Big,
}

impl BamEndian {
    /// Decodes the header byte.
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(Self::Big),
            1 => Ok(Self::Little),
            other => Err(BamError::Format(format!("invalid endian flag {other}"))),
        }
    }

    /// Returns the header byte.
    pub fn as_u8(&self) -> u8 {
        match self {
            Self::Big => 0,
            Self::Little => 1,
        }
    }
}

/// The leading byte of every object record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BamObjectCode {
    /// Starts a new top-level object group.
    Push,
    /// Closes the current object group.
    Pop,
    /// An object written on behalf of a pointer inside the current group.
    Adjunct,
    /// Lists object IDs the writer will never refer to again.
    Remove,
}

impl BamObjectCode {
    /// Decodes a record's leading byte.
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(Self::Push),
            1 => Ok(Self::Pop),
            2 => Ok(Self::Adjunct),
            3 => Ok(Self::Remove),
            other => Err(BamError::Format(format!(
                "invalid object code 0x{other:02x}"
            ))),
        }
    }

    /// Returns the raw byte representation.
    pub fn as_u8(&self) -> u8 {
        match self {
            Self::Push => 0,
            Self::Pop => 1,
            Self::Adjunct => 2,
            Self::Remove => 3,
        }
    }
}

/// The stream header, stored in the first datagram.
///
/// It is always encoded little-endian because it is what announces the byte
/// order of everything after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BamHeader {
    /// Major format version.
    pub major: u16,
    /// Minor format version; gates optional fields per type.
    pub minor: u16,
    /// Byte order of the object records.
    pub endian: BamEndian,
    /// Whether `stdfloat` fields are 64-bit.
    pub stdfloat_double: bool,
}

impl Default for BamHeader {
    /// The current version, little-endian, single-precision `stdfloat`.
    fn default() -> Self {
        Self {
            major: BAM_MAJOR_VER,
            minor: BAM_MINOR_VER,
            endian: BamEndian::Little,
            stdfloat_double: false,
        }
    }
}

impl BamHeader {
    /// Creates a header, validating that this build can produce that version.
    pub fn new(minor: u16, endian: BamEndian, stdfloat_double: bool) -> Result<Self> {
        check_version(BAM_MAJOR_VER, minor)?;
        Ok(Self {
            major: BAM_MAJOR_VER,
            minor,
            endian,
            // Older headers cannot carry the flag, so those files are single precision.
            stdfloat_double: stdfloat_double && minor >= STDFLOAT_HEADER_MINOR_VER,
        })
    }

    /// Serializes the header to a datagram.
    pub fn to_datagram(&self) -> Datagram {
        let mut dg = Datagram::new(BamEndian::Little, false);
        dg.add_u16(self.major);
        dg.add_u16(self.minor);
        dg.add_u8(self.endian.as_u8());
        if self.minor >= STDFLOAT_HEADER_MINOR_VER {
            dg.add_bool(self.stdfloat_double);
        }
        dg
    }

    /// Parses and validates a header datagram.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut scan = DatagramIterator::new(bytes, BamEndian::Little, false);
        let short = |_| BamError::Format("BAM header is too short".into());

        let major = scan.get_u16().map_err(short)?;
        let minor = scan.get_u16().map_err(short)?;
        check_version(major, minor)?;

        let endian = BamEndian::from_byte(scan.get_u8().map_err(short)?)?;
        let stdfloat_double = if minor >= STDFLOAT_HEADER_MINOR_VER {
            scan.get_bool().map_err(short)?
        } else {
            false
        };

        Ok(Self {
            major,
            minor,
            endian,
            stdfloat_double,
        })
    }
}

/// Rejects versions outside `6.[FIRST..=CURRENT]`.
pub fn check_version(major: u16, minor: u16) -> Result<()> {
    if major != BAM_MAJOR_VER || !(BAM_FIRST_MINOR_VER..=BAM_MINOR_VER).contains(&minor) {
        return Err(BamError::Format(format!(
            "BAM stream is version {major}.{minor}; this build handles \
             {BAM_MAJOR_VER}.{BAM_FIRST_MINOR_VER} through {BAM_MAJOR_VER}.{BAM_MINOR_VER}"
        )));
    }
    Ok(())
}

/// A type the stream defined at its first use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TypeDefinition {
    pub index: u16,
    pub name: String,
    pub parents: Vec<u16>,
}

struct OpenDefinition {
    index: u16,
    name: String,
    remaining: u8,
    parents: Vec<u16>,
}

impl OpenDefinition {
    fn read(index: u16, scan: &mut DatagramIterator<'_>) -> Result<Self> {
        let name = scan.get_string()?;
        let remaining = scan.get_u8()?;
        Ok(Self {
            index,
            name,
            remaining,
            parents: Vec::with_capacity(remaining as usize),
        })
    }
}

/// Reads a type index and, when `known` has not seen it, the definitions it
/// brings along: its name, then each parent index, each followed by its own
/// definition on first sight.
///
/// Definitions come back in the order their parents lists were closed, so
/// parents precede their children. The chain is walked with an explicit
/// stack; its length is bounded by the record, not by the call stack.
pub(crate) fn read_type_index(
    scan: &mut DatagramIterator<'_>,
    known: impl Fn(u16) -> bool,
) -> Result<(u16, Vec<TypeDefinition>)> {
    let index = scan.get_u16()?;
    if index == 0 || known(index) {
        return Ok((index, Vec::new()));
    }

    let mut opened = HashSet::from([index]);
    let mut stack = vec![OpenDefinition::read(index, scan)?];
    let mut defined = Vec::new();
    while let Some(open) = stack.last_mut() {
        if open.remaining == 0 {
            if let Some(done) = stack.pop() {
                defined.push(TypeDefinition {
                    index: done.index,
                    name: done.name,
                    parents: done.parents,
                });
            }
            continue;
        }
        open.remaining -= 1;
        let parent = scan.get_u16()?;
        open.parents.push(parent);
        if parent != 0 && !known(parent) && opened.insert(parent) {
            stack.push(OpenDefinition::read(parent, scan)?);
        }
    }
    Ok((index, defined))
}
