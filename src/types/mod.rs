//! Type identity: handles, the derivation graph, and the combined registry
//! that readers and writers consult.

mod handle;
mod registry;

use std::collections::HashMap;

pub use handle::TypeHandle;
pub use registry::{TYPED_WRITABLE, TypeRegistry};

use crate::factory::Factory;
use crate::writable::WritableType;

/// A name a type was written under before a given file version.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ObsoleteName {
    name: String,
    before_major: u16,
    before_minor: u16,
}

/// Everything a stream needs to know about the types it may meet.
///
/// A `Registry` is populated once, before any stream is opened, and then
/// shared read-only between readers and writers (typically as
/// `Arc<Registry>`). Streams never mutate it; a reader keeps what it learns
/// about unfamiliar types in its own per-stream table.
///
/// ```rust
/// use bamcode::{BamObject, Registry};
///
/// #[derive(Debug, Default, BamObject)]
/// struct Counter {
///     value: u32,
/// }
///
/// let mut registry = Registry::new();
/// let handle = registry.register::<Counter>();
/// assert_eq!(registry.types().name(handle), Some("Counter"));
/// assert!(registry.factory().is_registered(handle));
/// ```
#[derive(Debug, Clone, Default)]
pub struct Registry {
    types: TypeRegistry,
    factory: Factory,
    obsolete_names: HashMap<TypeHandle, Vec<ObsoleteName>>,
}

impl Registry {
    /// Creates a registry that knows only the root type.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `T` (and, through `init_type`, its parents) together with
    /// its read factory.
    pub fn register<T: WritableType>(&mut self) -> TypeHandle {
        let handle = T::init_type(&mut self.types);
        self.factory.register_factory(handle, T::make_from_bam);
        handle
    }

    /// The type graph.
    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    /// Mutable access to the type graph, for types registered by hand.
    pub fn types_mut(&mut self) -> &mut TypeRegistry {
        &mut self.types
    }

    /// The read factories.
    pub fn factory(&self) -> &Factory {
        &self.factory
    }

    /// Mutable access to the read factories.
    pub fn factory_mut(&mut self) -> &mut Factory {
        &mut self.factory
    }

    /// Records that `handle` was called `name` in files older than
    /// `before_major.before_minor`.
    ///
    /// Writers targeting such a version use the old name, and readers accept
    /// the old name as an alias. Calling this several times builds up a
    /// rename history.
    pub fn record_obsolete_type_name(
        &mut self,
        handle: TypeHandle,
        name: &str,
        before_major: u16,
        before_minor: u16,
    ) {
        self.types.record_alternate_name(handle, name);
        let names = self.obsolete_names.entry(handle).or_default();
        names.push(ObsoleteName {
            name: name.to_string(),
            before_major,
            before_minor,
        });
        names.sort_by_key(|n| (n.before_major, n.before_minor));
    }

    /// The name `handle` is written under in a `major.minor` file.
    pub fn type_name_for_version(&self, handle: TypeHandle, major: u16, minor: u16) -> Option<&str> {
        if let Some(names) = self.obsolete_names.get(&handle)
            && let Some(old) = names
                .iter()
                .find(|n| (major, minor) < (n.before_major, n.before_minor))
        {
            return Some(&old.name);
        }
        self.types.name(handle)
    }
}
