//! The persistence contract and the shared handle objects live behind.
//!
//! A persistable type implements [`TypedWritable`] (the per-object hooks the
//! engine calls) and [`WritableType`] (the per-type registration hooks). Both
//! are normally produced by `#[derive(BamObject)]`, which chains the
//! [`BamFields`] of each base before the type's own fields.
//!
//! Objects are shared through [`WritableRef`]. Identity is the allocation:
//! two clones of the same handle are the same object, and a writer gives them
//! one object ID.

use std::any::{Any, TypeId};
use std::cell::{Ref, RefCell, RefMut};
use std::fmt;
use std::rc::{Rc, Weak};

use crate::datagram::{Datagram, DatagramIterator};
use crate::error::{BamError, Result};
use crate::factory::FactoryParams;
use crate::pointer::PointerCursor;
use crate::reader::BamReader;
use crate::types::{TypeHandle, TypeRegistry};
use crate::writer::BamWriter;

/// Object-safe access to `Any` for trait objects.
pub trait AsAny: Any {
    /// Upcasts to `&dyn Any`.
    fn as_any(&self) -> &dyn Any;
    /// Upcasts to `&mut dyn Any`.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Per-object persistence hooks.
///
/// Writing calls [`write_datagram`](Self::write_datagram) once per object.
/// Reading happens in two passes: [`fillin`](Self::fillin) reads plain fields
/// and requests pointers by ID, then [`complete_pointers`](Self::complete_pointers)
/// receives the live targets once every one of them exists.
pub trait TypedWritable: AsAny {
    /// The registered name of this object's type.
    fn type_name(&self) -> &'static str;

    /// Appends this object's fields to `dg`, using `writer` for pointers.
    fn write_datagram(&self, writer: &mut BamWriter<'_>, dg: &mut Datagram) -> Result<()>;

    /// Reads the fields written by `write_datagram`, in the same order.
    fn fillin(&mut self, scan: &mut DatagramIterator<'_>, reader: &mut BamReader) -> Result<()>;

    /// Receives the targets of the pointers requested during `fillin`, in
    /// request order (`None` for null). Returns how many were consumed.
    fn complete_pointers(
        &mut self,
        pointers: &[Option<WritableRef>],
        reader: &mut BamReader,
    ) -> Result<usize> {
        let _ = (pointers, reader);
        Ok(0)
    }

    /// Delays `complete_pointers` until each target has completed its own
    /// pointers.
    fn require_fully_complete(&self) -> bool {
        false
    }

    /// Called once after the whole stream has resolved, for objects that
    /// asked via [`BamReader::register_finalize`].
    fn finalize(&mut self, reader: &mut BamReader) -> Result<()> {
        let _ = reader;
        Ok(())
    }
}

/// Per-type registration hooks.
pub trait WritableType: TypedWritable + Default + Sized {
    /// The name written to streams.
    const TYPE_NAME: &'static str;

    /// Registers this type and its parents, returning this type's handle.
    fn init_type(types: &mut TypeRegistry) -> TypeHandle;

    /// Builds an instance from its record.
    fn make_from_bam(params: &mut FactoryParams<'_, '_>) -> Result<Box<dyn TypedWritable>> {
        let mut object = Self::default();
        object.fillin(params.scan, params.reader)?;
        Ok(Box::new(object))
    }
}

/// Field-level serialization, chained from base to derived.
///
/// A derived type calls each base's implementation before handling its own
/// fields, so the byte layout and the pointer order are parent first.
pub trait BamFields {
    /// Writes this level's fields (bases first).
    fn write_fields(&self, writer: &mut BamWriter<'_>, dg: &mut Datagram) -> Result<()>;

    /// Reads this level's fields (bases first).
    fn fillin_fields(
        &mut self,
        scan: &mut DatagramIterator<'_>,
        reader: &mut BamReader,
    ) -> Result<()>;

    /// Takes this level's pointers from `cursor` (bases first).
    fn complete_fields(
        &mut self,
        cursor: &mut PointerCursor<'_>,
        reader: &mut BamReader,
    ) -> Result<()>;
}

struct Slot {
    type_id: TypeId,
    type_name: &'static str,
    cell: RefCell<Box<dyn TypedWritable>>,
}

/// A shared, mutable handle to a persistable object.
#[derive(Clone)]
pub struct WritableRef(Rc<Slot>);

impl WritableRef {
    /// Wraps a concrete object.
    pub fn new<T: TypedWritable>(object: T) -> Self {
        Self::from_boxed(Box::new(object))
    }

    /// Wraps an already boxed object.
    pub fn from_boxed(object: Box<dyn TypedWritable>) -> Self {
        let type_id = (*object).as_any().type_id();
        let type_name = object.type_name();
        Self(Rc::new(Slot {
            type_id,
            type_name,
            cell: RefCell::new(object),
        }))
    }

    /// Registered name of the object's type.
    pub fn type_name(&self) -> &'static str {
        self.0.type_name
    }

    /// Returns true if the object is a `T`. Never borrows the object.
    pub fn is<T: TypedWritable>(&self) -> bool {
        self.0.type_id == TypeId::of::<T>()
    }

    /// Borrows the object.
    ///
    /// # Panics
    /// Panics if the object is mutably borrowed.
    pub fn borrow(&self) -> Ref<'_, dyn TypedWritable> {
        Ref::map(self.0.cell.borrow(), |b| &**b)
    }

    /// Mutably borrows the object.
    ///
    /// # Panics
    /// Panics if the object is already borrowed.
    pub fn borrow_mut(&self) -> RefMut<'_, dyn TypedWritable> {
        RefMut::map(self.0.cell.borrow_mut(), |b| &mut **b)
    }

    /// Borrows the object, failing instead of panicking on a conflict.
    pub fn try_borrow(&self) -> Result<Ref<'_, dyn TypedWritable>> {
        self.0
            .cell
            .try_borrow()
            .map(|r| Ref::map(r, |b| &**b))
            .map_err(|_| self.conflict())
    }

    /// Mutably borrows the object, failing instead of panicking on a conflict.
    pub fn try_borrow_mut(&self) -> Result<RefMut<'_, dyn TypedWritable>> {
        self.0
            .cell
            .try_borrow_mut()
            .map(|r| RefMut::map(r, |b| &mut **b))
            .map_err(|_| self.conflict())
    }

    /// Borrows the object as a `T`, or `None` if it is another type.
    pub fn downcast_ref<T: TypedWritable>(&self) -> Option<Ref<'_, T>> {
        if !self.is::<T>() {
            return None;
        }
        Ref::filter_map(self.0.cell.borrow(), |b| (**b).as_any().downcast_ref()).ok()
    }

    /// Mutably borrows the object as a `T`, or `None` if it is another type.
    pub fn downcast_mut<T: TypedWritable>(&self) -> Option<RefMut<'_, T>> {
        if !self.is::<T>() {
            return None;
        }
        RefMut::filter_map(self.0.cell.borrow_mut(), |b| {
            (**b).as_any_mut().downcast_mut()
        })
        .ok()
    }

    /// Returns true if both handles point to the same object.
    pub fn ptr_eq(&self, other: &WritableRef) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// Creates a non-owning handle.
    pub fn downgrade(&self) -> WeakWritableRef {
        WeakWritableRef(Rc::downgrade(&self.0))
    }

    /// Number of strong handles to the object.
    pub fn strong_count(&self) -> usize {
        Rc::strong_count(&self.0)
    }

    pub(crate) fn addr(&self) -> usize {
        Rc::as_ptr(&self.0) as *const () as usize
    }

    fn conflict(&self) -> BamError {
        BamError::Logic(format!(
            "object of type {} is already borrowed",
            self.0.type_name
        ))
    }
}

impl fmt::Debug for WritableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WritableRef")
            .field("type", &self.0.type_name)
            .field("addr", &format_args!("{:#x}", self.addr()))
            .finish()
    }
}

/// A non-owning [`WritableRef`].
#[derive(Clone, Default)]
pub struct WeakWritableRef(Weak<Slot>);

impl WeakWritableRef {
    /// Creates a handle that never upgrades.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the object if it is still alive.
    pub fn upgrade(&self) -> Option<WritableRef> {
        self.0.upgrade().map(WritableRef)
    }

    /// Returns true once every strong handle has been dropped.
    pub fn is_dead(&self) -> bool {
        self.0.strong_count() == 0
    }
}

impl fmt::Debug for WeakWritableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.upgrade() {
            Some(strong) => write!(f, "WeakWritableRef({strong:?})"),
            None => f.write_str("WeakWritableRef(dead)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, PartialEq)]
    struct Plain {
        value: u32,
    }

    impl TypedWritable for Plain {
        fn type_name(&self) -> &'static str {
            "Plain"
        }

        fn write_datagram(&self, _: &mut BamWriter<'_>, dg: &mut Datagram) -> Result<()> {
            dg.add_u32(self.value);
            Ok(())
        }

        fn fillin(&mut self, scan: &mut DatagramIterator<'_>, _: &mut BamReader) -> Result<()> {
            self.value = scan.get_u32()?;
            Ok(())
        }
    }

    #[derive(Debug, Default)]
    struct Other;

    impl TypedWritable for Other {
        fn type_name(&self) -> &'static str {
            "Other"
        }

        fn write_datagram(&self, _: &mut BamWriter<'_>, _: &mut Datagram) -> Result<()> {
            Ok(())
        }

        fn fillin(&mut self, _: &mut DatagramIterator<'_>, _: &mut BamReader) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn downcasts_see_the_concrete_type_through_the_box() {
        let handle = WritableRef::new(Plain { value: 3 });
        assert!(handle.is::<Plain>());
        assert!(!handle.is::<Other>());
        assert_eq!(handle.type_name(), "Plain");

        if let Some(mut plain) = handle.downcast_mut::<Plain>() {
            plain.value = 9;
        }
        assert_eq!(handle.downcast_ref::<Plain>().map(|p| p.value), Some(9));
        assert!(handle.downcast_ref::<Other>().is_none());
    }

    #[test]
    fn identity_is_the_allocation() {
        let a = WritableRef::new(Plain::default());
        let b = a.clone();
        let c = WritableRef::new(Plain::default());
        assert!(a.ptr_eq(&b));
        assert!(!a.ptr_eq(&c));
        assert_eq!(a.addr(), b.addr());
    }

    #[test]
    fn borrow_conflicts_are_logic_errors() {
        let a = WritableRef::new(Plain::default());
        let _held = a.borrow_mut();
        assert!(matches!(a.try_borrow(), Err(BamError::Logic(_))));
        // The type check does not need a borrow.
        assert!(a.is::<Plain>());
    }

    #[test]
    fn weak_handles_die_with_the_object() {
        let a = WritableRef::new(Other);
        let weak = a.downgrade();
        assert!(weak.upgrade().is_some());
        drop(a);
        assert!(weak.is_dead());
        assert!(weak.upgrade().is_none());
    }
}
