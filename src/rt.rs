//! Runtime utilities for code generated by `#[derive(BamObject)]`.
//! Do not use directly.

use crate::error::Result;
use crate::pointer::PointerCursor;
use crate::reader::BamReader;
use crate::types::{TypeHandle, TypeRegistry};
use crate::writable::{BamFields, WritableRef};

/// Registers a derived type under its bases, or directly under the root
/// type when it has none.
pub fn register_derived(types: &mut TypeRegistry, name: &str, bases: &[TypeHandle]) -> TypeHandle {
    if bases.is_empty() {
        let root = types.typed_writable();
        types.register_type(name, &[root])
    } else {
        types.register_type(name, bases)
    }
}

/// Hands an object's resolved pointers to its fields and reports how many
/// they consumed.
pub fn complete_fields<T: BamFields + ?Sized>(
    object: &mut T,
    pointers: &[Option<WritableRef>],
    reader: &mut BamReader,
) -> Result<usize> {
    let mut cursor = PointerCursor::new(pointers);
    object.complete_fields(&mut cursor, reader)?;
    Ok(cursor.consumed())
}
