//! Construction of objects from their records.
//!
//! The reader never knows concrete Rust types. For every record it looks up the
//! [`MakeFn`] registered for the record's type and hands it a
//! [`FactoryParams`]; the function builds a default instance and lets it read
//! its own fields.

use std::collections::HashMap;

use tracing::warn;

use crate::datagram::DatagramIterator;
use crate::error::{BamError, Result};
use crate::reader::BamReader;
use crate::types::{TypeHandle, TypeRegistry};
use crate::writable::TypedWritable;

/// Everything a factory function needs to build one object.
#[derive(Debug)]
pub struct FactoryParams<'s, 'p> {
    /// Cursor positioned at the first field of the record.
    pub scan: &'p mut DatagramIterator<'s>,
    /// The reader driving the stream, for pointer requests and version checks.
    pub reader: &'p mut BamReader,
    /// The type being constructed.
    pub type_handle: TypeHandle,
}

/// Builds an object of one registered type from its record.
pub type MakeFn = fn(&mut FactoryParams<'_, '_>) -> Result<Box<dyn TypedWritable>>;

/// Map from type handle to construction function.
#[derive(Debug, Clone, Default)]
pub struct Factory {
    makers: HashMap<TypeHandle, MakeFn>,
}

impl Factory {
    /// Creates an empty factory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `make` for `handle`. A later registration for the same handle
    /// replaces the earlier one, which is returned.
    pub fn register_factory(&mut self, handle: TypeHandle, make: MakeFn) -> Option<MakeFn> {
        let previous = self.makers.insert(handle, make);
        if previous.is_some() {
            warn!(?handle, "replacing previously registered factory");
        }
        previous
    }

    /// Returns true if `handle` has its own factory.
    pub fn is_registered(&self, handle: TypeHandle) -> bool {
        self.makers.contains_key(&handle)
    }

    /// Number of registered factories.
    pub fn len(&self) -> usize {
        self.makers.len()
    }

    /// Returns true if no factory has been registered.
    pub fn is_empty(&self) -> bool {
        self.makers.is_empty()
    }

    /// Builds an object of exactly `handle`.
    pub fn make(
        &self,
        handle: TypeHandle,
        params: &mut FactoryParams<'_, '_>,
    ) -> Result<Box<dyn TypedWritable>> {
        match self.makers.get(&handle) {
            Some(make) => make(params),
            None => Err(BamError::UnknownType {
                name: params
                    .reader
                    .registry()
                    .types()
                    .name(handle)
                    .unwrap_or("<unnamed>")
                    .to_string(),
            }),
        }
    }

    /// The nearest type to `handle` (itself first, then ancestors breadth
    /// first) that has a factory.
    pub fn find_registered_type(
        &self,
        types: &TypeRegistry,
        handle: TypeHandle,
    ) -> Option<TypeHandle> {
        if self.is_registered(handle) {
            return Some(handle);
        }
        types
            .ancestors(handle)
            .into_iter()
            .find(|ancestor| self.is_registered(*ancestor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refuse(_: &mut FactoryParams<'_, '_>) -> Result<Box<dyn TypedWritable>> {
        Err(BamError::Logic("first".into()))
    }

    fn refuse_again(_: &mut FactoryParams<'_, '_>) -> Result<Box<dyn TypedWritable>> {
        Err(BamError::Logic("second".into()))
    }

    #[test]
    fn last_registration_wins() {
        let mut types = TypeRegistry::new();
        let node = types.register_type("Node", &[types.typed_writable()]);
        let mut factory = Factory::new();

        assert!(factory.register_factory(node, refuse).is_none());
        let previous = factory.register_factory(node, refuse_again);
        assert!(previous.is_some());
        assert_eq!(factory.len(), 1);
        assert!(factory.is_registered(node));
    }

    #[test]
    fn registered_type_search_prefers_nearest_ancestor() {
        let mut types = TypeRegistry::new();
        let root = types.typed_writable();
        let base = types.register_type("Base", &[root]);
        let mid = types.register_type("Mid", &[base]);
        let leaf = types.register_type("Leaf", &[mid]);
        let stray = types.register_type("Stray", &[root]);

        let mut factory = Factory::new();
        factory.register_factory(base, refuse);

        assert_eq!(factory.find_registered_type(&types, leaf), Some(base));
        assert_eq!(factory.find_registered_type(&types, base), Some(base));
        assert_eq!(factory.find_registered_type(&types, stray), None);

        factory.register_factory(mid, refuse);
        assert_eq!(factory.find_registered_type(&types, leaf), Some(mid));
    }
}
