//! Tools for inspecting the record structure of BAM streams without
//! constructing any objects. Useful for debugging version skew and type
//! substitution.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::Serialize;

use crate::datagram::DatagramIterator;
use crate::error::{BamError, Result};
use crate::format::{BamHeader, BamObjectCode, read_type_index};
use crate::io::{DataSource, DatagramSource};

/// A structural report of a BAM stream.
#[derive(Debug, Serialize)]
pub struct InspectionReport {
    /// Total size of the stream in bytes.
    pub file_size: u64,
    /// The decoded stream header.
    pub header: BamHeader,
    /// Every type the stream defines, by file index.
    pub types: Vec<TypeInfo>,
    /// Object groups in stream order.
    pub groups: Vec<GroupInfo>,
    /// `Remove` records in stream order.
    pub removals: Vec<RemovalInfo>,
}

/// A type definition found in the stream.
#[derive(Debug, Serialize)]
pub struct TypeInfo {
    /// The stream-local type index.
    pub index: u16,
    /// Type name as written.
    pub name: String,
    /// Parent indices as written.
    pub parents: Vec<u16>,
}

/// One object record.
#[derive(Debug, Serialize)]
pub struct RecordInfo {
    /// Absolute offset of the record's length prefix.
    pub offset: u64,
    /// `Push` or `Adjunct`.
    pub code: BamObjectCode,
    /// Stream-local type index; 0 marks a back-reference.
    pub type_index: u16,
    /// Type name, if the index was defined.
    pub type_name: Option<String>,
    /// The object ID the record defines or refers to.
    pub object_id: u32,
    /// Bytes of field data after the ID.
    pub payload_size: usize,
}

/// A top-level object and the records written on its behalf.
#[derive(Debug, Serialize)]
pub struct GroupInfo {
    /// The `Push` record.
    pub root: RecordInfo,
    /// `Adjunct` records, in stream order.
    pub adjuncts: Vec<RecordInfo>,
    /// Whether the group was closed by a `Pop` record.
    pub closed: bool,
}

/// A `Remove` record.
#[derive(Debug, Serialize)]
pub struct RemovalInfo {
    /// Absolute offset of the record's length prefix.
    pub offset: u64,
    /// The released object IDs.
    pub ids: Vec<u32>,
}

/// The BAM inspector tool.
#[derive(Debug)]
pub struct BamInspector;

impl BamInspector {
    /// Analyzes a file and returns a structural report.
    pub fn inspect<P: AsRef<Path>>(path: P) -> Result<InspectionReport> {
        Self::inspect_source(DataSource::map_file(path.as_ref())?)
    }

    /// Analyzes an in-memory stream.
    pub fn inspect_bytes(bytes: &[u8]) -> Result<InspectionReport> {
        Self::inspect_source(DataSource::Memory(bytes.to_vec()))
    }

    fn inspect_source(data: DataSource) -> Result<InspectionReport> {
        let file_size = data.len() as u64;
        let mut source = DatagramSource::open(data)?;
        let bytes = source.data();
        let frame = source
            .next_frame()?
            .ok_or_else(|| BamError::Format("BAM stream has no header".into()))?;
        let header = BamHeader::from_bytes(&bytes[frame.payload])?;

        let mut types = BTreeMap::new();
        let mut groups: Vec<GroupInfo> = Vec::new();
        let mut removals = Vec::new();

        while let Some(frame) = source.next_frame()? {
            let mut scan =
                DatagramIterator::new(&bytes[frame.payload], header.endian, header.stdfloat_double);
            let code = BamObjectCode::from_byte(scan.get_u8()?)?;
            match code {
                BamObjectCode::Pop => match groups.last_mut() {
                    Some(group) if !group.closed => group.closed = true,
                    _ => {
                        return Err(BamError::Format(format!(
                            "unbalanced pop record at offset {}",
                            frame.offset
                        )));
                    }
                },
                BamObjectCode::Remove => {
                    let mut ids = Vec::with_capacity(scan.get_remaining_size() / 4);
                    while scan.get_remaining_size() > 0 {
                        ids.push(scan.get_u32()?);
                    }
                    removals.push(RemovalInfo {
                        offset: frame.offset,
                        ids,
                    });
                }
                BamObjectCode::Push | BamObjectCode::Adjunct => {
                    let type_index = read_type(&mut scan, &mut types)?;
                    let object_id = scan.get_u32()?;
                    let record = RecordInfo {
                        offset: frame.offset,
                        code,
                        type_index,
                        type_name: types.get(&type_index).map(|t: &TypeInfo| t.name.clone()),
                        object_id,
                        payload_size: scan.get_remaining_size(),
                    };
                    if code == BamObjectCode::Push {
                        groups.push(GroupInfo {
                            root: record,
                            adjuncts: Vec::new(),
                            closed: false,
                        });
                    } else {
                        match groups.last_mut() {
                            Some(group) if !group.closed => group.adjuncts.push(record),
                            _ => {
                                return Err(BamError::Format(format!(
                                    "adjunct record outside a group at offset {}",
                                    frame.offset
                                )));
                            }
                        }
                    }
                }
            }
        }

        Ok(InspectionReport {
            file_size,
            header,
            types: types.into_values().collect(),
            groups,
            removals,
        })
    }
}

fn read_type(scan: &mut DatagramIterator<'_>, types: &mut BTreeMap<u16, TypeInfo>) -> Result<u16> {
    let (index, defined) = read_type_index(scan, |i| types.contains_key(&i))?;
    for definition in defined {
        types.insert(
            definition.index,
            TypeInfo {
                index: definition.index,
                name: definition.name,
                parents: definition.parents,
            },
        );
    }
    Ok(index)
}

impl fmt::Display for InspectionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== BAM INSPECTOR REPORT ===")?;
        writeln!(
            f,
            "Version:        {}.{} ({:?} endian, stdfloat {})",
            self.header.major,
            self.header.minor,
            self.header.endian,
            if self.header.stdfloat_double { "f64" } else { "f32" }
        )?;
        writeln!(f, "File Size:      {}b", self.file_size)?;

        writeln!(f, "\n[TYPES]")?;
        for info in &self.types {
            let parents: Vec<String> = info.parents.iter().map(|p| format!("#{p}")).collect();
            writeln!(f, "  #{} {} <- [{}]", info.index, info.name, parents.join(", "))?;
        }

        writeln!(f, "\n[OBJECTS]")?;
        for (i, group) in self.groups.iter().enumerate() {
            let is_last = i + 1 == self.groups.len();
            let connector = if is_last { "└── " } else { "├── " };
            let child_prefix = if is_last { "    " } else { "│   " };
            writeln!(f, "{connector}{}", group.root)?;
            for (j, adjunct) in group.adjuncts.iter().enumerate() {
                let connector = if j + 1 == group.adjuncts.len() { "└── " } else { "├── " };
                writeln!(f, "{child_prefix}{connector}{adjunct}")?;
            }
        }

        if !self.removals.is_empty() {
            writeln!(f, "\n[REMOVED]")?;
            for removal in &self.removals {
                writeln!(f, "  @{}: {:?}", removal.offset, removal.ids)?;
            }
        }
        Ok(())
    }
}

impl fmt::Display for RecordInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let type_name = match (self.type_index, self.type_name.as_deref()) {
            (0, _) => "<back-reference>",
            (_, Some(name)) => name,
            (_, None) => "<undefined>",
        };
        write!(
            f,
            "[{:?}] #{} {} | Size: {}b @ {}",
            self.code, self.object_id, type_name, self.payload_size, self.offset
        )
    }
}
