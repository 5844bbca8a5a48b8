//! Pointer-valued fields.
//!
//! A pointer field is written as an object ID and read back in two steps:
//! `read_pointers` registers the IDs with the reader during `fillin`, and
//! `complete_pointers` later takes the live targets from a [`PointerCursor`]
//! in the same order.

use std::cell::{Ref, RefMut};
use std::fmt;
use std::marker::PhantomData;

use crate::datagram::{Datagram, DatagramIterator};
use crate::error::{BamError, Result};
use crate::reader::BamReader;
use crate::writable::{TypedWritable, WeakWritableRef, WritableRef};
use crate::writer::BamWriter;

/// Hands out resolved pointers positionally.
#[derive(Debug)]
pub struct PointerCursor<'p> {
    pointers: &'p [Option<WritableRef>],
    position: usize,
}

impl<'p> PointerCursor<'p> {
    /// Creates a cursor at the first pointer.
    pub fn new(pointers: &'p [Option<WritableRef>]) -> Self {
        Self {
            pointers,
            position: 0,
        }
    }

    /// Takes the next pointer. Running past the end means the reading code
    /// asked for more pointers than its `fillin` requested.
    pub fn next_pointer(&mut self) -> Result<Option<WritableRef>> {
        let slot = self.pointers.get(self.position).ok_or_else(|| {
            BamError::Logic(format!(
                "pointer {} requested but only {} were read",
                self.position + 1,
                self.pointers.len()
            ))
        })?;
        self.position += 1;
        Ok(slot.clone())
    }

    /// How many pointers have been taken.
    pub fn consumed(&self) -> usize {
        self.position
    }

    /// How many pointers are left.
    pub fn remaining(&self) -> usize {
        self.pointers.len() - self.position
    }
}

/// A field that is stored as one or more object IDs.
pub trait PointerField {
    /// Writes the IDs of the targets, queueing unseen targets for writing.
    fn write_pointers(&self, writer: &mut BamWriter<'_>, dg: &mut Datagram) -> Result<()>;

    /// Reads the IDs and registers them with the reader.
    fn read_pointers(
        &mut self,
        scan: &mut DatagramIterator<'_>,
        reader: &mut BamReader,
    ) -> Result<()>;

    /// Takes the resolved targets, one per ID read.
    fn complete_pointers(&mut self, cursor: &mut PointerCursor<'_>) -> Result<()>;
}

/// A nullable pointer to an object of exactly type `T`.
///
/// A `Ptr<Shape>` does not accept a `Circle` even when `Circle` derives from
/// `Shape`; use `Option<WritableRef>` for a field that holds several types.
pub struct Ptr<T> {
    target: Option<WritableRef>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Default for Ptr<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T> Clone for Ptr<T> {
    fn clone(&self) -> Self {
        Self {
            target: self.target.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Ptr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            Some(target) => write!(f, "Ptr({})", target.type_name()),
            None => f.write_str("Ptr(null)"),
        }
    }
}

impl<T> Ptr<T> {
    /// The null pointer.
    pub fn null() -> Self {
        Self {
            target: None,
            _marker: PhantomData,
        }
    }

    /// Returns true if the pointer is null.
    pub fn is_null(&self) -> bool {
        self.target.is_none()
    }

    /// The untyped handle.
    pub fn get(&self) -> Option<&WritableRef> {
        self.target.as_ref()
    }

    /// Takes the handle out, leaving null.
    pub fn take(&mut self) -> Option<WritableRef> {
        self.target.take()
    }
}

impl<T: TypedWritable> Ptr<T> {
    /// Points at `target`, which must hold a `T`.
    pub fn new(target: WritableRef) -> Result<Self> {
        let mut ptr = Self::null();
        ptr.set(Some(target))?;
        Ok(ptr)
    }

    /// Wraps a fresh object.
    pub fn from_value(value: T) -> Self {
        Self {
            target: Some(WritableRef::new(value)),
            _marker: PhantomData,
        }
    }

    /// Replaces the target. Fails without changing anything if the new target
    /// is not a `T`.
    pub fn set(&mut self, target: Option<WritableRef>) -> Result<()> {
        if let Some(t) = &target
            && !t.is::<T>()
        {
            return Err(BamError::Logic(format!(
                "pointer to {} received an object of type {}",
                std::any::type_name::<T>(),
                t.type_name()
            )));
        }
        self.target = target;
        Ok(())
    }

    /// Borrows the target.
    pub fn borrow(&self) -> Option<Ref<'_, T>> {
        self.target.as_ref().and_then(|t| t.downcast_ref::<T>())
    }

    /// Mutably borrows the target.
    pub fn borrow_mut(&self) -> Option<RefMut<'_, T>> {
        self.target.as_ref().and_then(|t| t.downcast_mut::<T>())
    }

    /// Returns true if both pointers are null or point at the same object.
    pub fn ptr_eq(&self, other: &Ptr<T>) -> bool {
        match (&self.target, &other.target) {
            (Some(a), Some(b)) => a.ptr_eq(b),
            (None, None) => true,
            _ => false,
        }
    }
}

impl<T: TypedWritable> PointerField for Ptr<T> {
    fn write_pointers(&self, writer: &mut BamWriter<'_>, dg: &mut Datagram) -> Result<()> {
        writer.write_pointer(dg, self.target.as_ref())?;
        Ok(())
    }

    fn read_pointers(
        &mut self,
        scan: &mut DatagramIterator<'_>,
        reader: &mut BamReader,
    ) -> Result<()> {
        reader.read_pointer(scan)?;
        Ok(())
    }

    fn complete_pointers(&mut self, cursor: &mut PointerCursor<'_>) -> Result<()> {
        self.set(cursor.next_pointer()?)
    }
}

impl<T: TypedWritable> PointerField for Vec<Ptr<T>> {
    fn write_pointers(&self, writer: &mut BamWriter<'_>, dg: &mut Datagram) -> Result<()> {
        let len = u32::try_from(self.len())
            .map_err(|_| BamError::Logic("pointer list exceeds u32 length".into()))?;
        dg.add_u32(len);
        for ptr in self {
            ptr.write_pointers(writer, dg)?;
        }
        Ok(())
    }

    fn read_pointers(
        &mut self,
        scan: &mut DatagramIterator<'_>,
        reader: &mut BamReader,
    ) -> Result<()> {
        let len = scan.get_u32()? as usize;
        // Each ID is four bytes; a count the record cannot hold is corruption.
        if len > scan.get_remaining_size() / 4 {
            return Err(BamError::DecodeUnderrun {
                wanted: len.saturating_mul(4),
                remaining: scan.get_remaining_size(),
            });
        }
        self.clear();
        self.reserve(len);
        for _ in 0..len {
            reader.read_pointer(scan)?;
            self.push(Ptr::null());
        }
        Ok(())
    }

    fn complete_pointers(&mut self, cursor: &mut PointerCursor<'_>) -> Result<()> {
        for ptr in self.iter_mut() {
            ptr.complete_pointers(cursor)?;
        }
        Ok(())
    }
}

/// Any object, whatever its type.
impl PointerField for Option<WritableRef> {
    fn write_pointers(&self, writer: &mut BamWriter<'_>, dg: &mut Datagram) -> Result<()> {
        writer.write_pointer(dg, self.as_ref())?;
        Ok(())
    }

    fn read_pointers(
        &mut self,
        scan: &mut DatagramIterator<'_>,
        reader: &mut BamReader,
    ) -> Result<()> {
        reader.read_pointer(scan)?;
        Ok(())
    }

    fn complete_pointers(&mut self, cursor: &mut PointerCursor<'_>) -> Result<()> {
        *self = cursor.next_pointer()?;
        Ok(())
    }
}

/// A non-owning pointer, for back-references such as a child's parent.
///
/// The writer treats it like any pointer, so the target is written even if
/// nothing else holds it. After reading, the target stays alive only as long
/// as some strong handle exists.
pub struct WeakPtr<T> {
    target: WeakWritableRef,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Default for WeakPtr<T> {
    fn default() -> Self {
        Self {
            target: WeakWritableRef::new(),
            _marker: PhantomData,
        }
    }
}

impl<T> Clone for WeakPtr<T> {
    fn clone(&self) -> Self {
        Self {
            target: self.target.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for WeakPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WeakPtr({:?})", self.target)
    }
}

impl<T: TypedWritable> WeakPtr<T> {
    /// Points weakly at the target of `ptr`.
    pub fn from_ptr(ptr: &Ptr<T>) -> Self {
        Self {
            target: ptr.get().map(WritableRef::downgrade).unwrap_or_default(),
            _marker: PhantomData,
        }
    }

    /// Returns a strong pointer if the target is still alive.
    pub fn upgrade(&self) -> Option<Ptr<T>> {
        self.target.upgrade().map(|target| Ptr {
            target: Some(target),
            _marker: PhantomData,
        })
    }

    fn set(&mut self, target: Option<WritableRef>) -> Result<()> {
        let checked: Ptr<T> = match target {
            Some(t) => Ptr::new(t)?,
            None => Ptr::null(),
        };
        *self = Self::from_ptr(&checked);
        Ok(())
    }
}

impl<T: TypedWritable> PointerField for WeakPtr<T> {
    fn write_pointers(&self, writer: &mut BamWriter<'_>, dg: &mut Datagram) -> Result<()> {
        let target = self.target.upgrade();
        writer.write_pointer(dg, target.as_ref())?;
        Ok(())
    }

    fn read_pointers(
        &mut self,
        scan: &mut DatagramIterator<'_>,
        reader: &mut BamReader,
    ) -> Result<()> {
        reader.read_pointer(scan)?;
        Ok(())
    }

    fn complete_pointers(&mut self, cursor: &mut PointerCursor<'_>) -> Result<()> {
        self.set(cursor.next_pointer()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct Leaf;

    impl TypedWritable for Leaf {
        fn type_name(&self) -> &'static str {
            "Leaf"
        }

        fn write_datagram(&self, _: &mut BamWriter<'_>, _: &mut Datagram) -> Result<()> {
            Ok(())
        }

        fn fillin(&mut self, _: &mut DatagramIterator<'_>, _: &mut BamReader) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Debug, Default)]
    struct Branch;

    impl TypedWritable for Branch {
        fn type_name(&self) -> &'static str {
            "Branch"
        }

        fn write_datagram(&self, _: &mut BamWriter<'_>, _: &mut Datagram) -> Result<()> {
            Ok(())
        }

        fn fillin(&mut self, _: &mut DatagramIterator<'_>, _: &mut BamReader) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn cursor_hands_out_in_order_and_counts() -> Result<()> {
        let leaf = WritableRef::new(Leaf);
        let slots = vec![Some(leaf.clone()), None];
        let mut cursor = PointerCursor::new(&slots);

        let mut first: Ptr<Leaf> = Ptr::null();
        let mut second: Ptr<Leaf> = Ptr::from_value(Leaf);
        first.complete_pointers(&mut cursor)?;
        second.complete_pointers(&mut cursor)?;

        assert!(first.get().is_some_and(|t| t.ptr_eq(&leaf)));
        assert!(second.is_null());
        assert_eq!(cursor.consumed(), 2);
        assert!(matches!(cursor.next_pointer(), Err(BamError::Logic(_))));
        Ok(())
    }

    #[test]
    fn wrong_type_is_a_logic_error() {
        let slots = vec![Some(WritableRef::new(Branch))];
        let mut cursor = PointerCursor::new(&slots);
        let mut ptr: Ptr<Leaf> = Ptr::null();
        let err = ptr.complete_pointers(&mut cursor).err();
        assert!(matches!(err, Some(BamError::Logic(msg)) if msg.contains("Branch")));
        assert!(ptr.is_null());
    }

    #[test]
    fn weak_pointers_do_not_keep_targets_alive() -> Result<()> {
        let leaf = WritableRef::new(Leaf);
        let slots = vec![Some(leaf.clone())];
        let mut weak: WeakPtr<Leaf> = WeakPtr::default();
        weak.complete_pointers(&mut PointerCursor::new(&slots))?;
        assert!(weak.upgrade().is_some());

        drop(slots);
        drop(leaf);
        assert!(weak.upgrade().is_none());
        Ok(())
    }
}
