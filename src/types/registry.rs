use std::collections::{HashMap, HashSet, VecDeque};

use tracing::{debug, warn};

use super::TypeHandle;

/// Name of the root type every persistable type derives from.
pub const TYPED_WRITABLE: &str = "TypedWritable";

#[derive(Debug, Clone)]
struct TypeRecord {
    name: String,
    parents: Vec<TypeHandle>,
    children: Vec<TypeHandle>,
}

/// Name → handle mapping with a multiple-inheritance derivation graph.
///
/// Registration is idempotent per name. The root type [`TYPED_WRITABLE`] is
/// present in every registry.
#[derive(Debug, Clone)]
pub struct TypeRegistry {
    records: Vec<TypeRecord>,
    by_name: HashMap<String, TypeHandle>,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeRegistry {
    /// Creates a registry holding only the root type.
    pub fn new() -> Self {
        let mut registry = Self {
            records: vec![TypeRecord {
                name: "none".to_string(),
                parents: Vec::new(),
                children: Vec::new(),
            }],
            by_name: HashMap::new(),
        };
        registry.register_type(TYPED_WRITABLE, &[]);
        registry
    }

    /// Handle of the root type.
    pub fn typed_writable(&self) -> TypeHandle {
        TypeHandle::new(1)
    }

    /// Registers `name` with the given parents and returns its handle.
    ///
    /// Registering a name again returns the existing handle; any parent not
    /// yet recorded for it is added.
    pub fn register_type(&mut self, name: &str, parents: &[TypeHandle]) -> TypeHandle {
        let handle = match self.by_name.get(name) {
            Some(&existing) => existing,
            None => {
                let handle = TypeHandle::new(self.records.len() as u32);
                self.records.push(TypeRecord {
                    name: name.to_string(),
                    parents: Vec::new(),
                    children: Vec::new(),
                });
                self.by_name.insert(name.to_string(), handle);
                debug!(type_name = name, handle = handle.index(), "registered type");
                handle
            }
        };
        for &parent in parents {
            self.record_derivation(handle, parent);
        }
        handle
    }

    /// Adds a parent edge. Unknown handles and duplicate edges are ignored.
    pub fn record_derivation(&mut self, child: TypeHandle, parent: TypeHandle) {
        if !self.contains(child) || !self.contains(parent) || child.is_none() || parent.is_none() {
            warn!(?child, ?parent, "ignoring derivation between unregistered types");
            return;
        }
        let record = &mut self.records[child.index() as usize];
        if record.parents.contains(&parent) {
            return;
        }
        record.parents.push(parent);
        self.records[parent.index() as usize].children.push(child);
    }

    /// Makes `name` resolve to `handle` as well as its primary name.
    pub fn record_alternate_name(&mut self, handle: TypeHandle, name: &str) {
        if self.contains(handle) && !handle.is_none() {
            self.by_name.entry(name.to_string()).or_insert(handle);
        }
    }

    /// Looks a type up by name (primary or alternate).
    pub fn find_type(&self, name: &str) -> Option<TypeHandle> {
        self.by_name.get(name).copied()
    }

    /// Like [`find_type`](Self::find_type) but returns [`TypeHandle::NONE`]
    /// for unknown names.
    pub fn get_handle(&self, name: &str) -> TypeHandle {
        self.find_type(name).unwrap_or(TypeHandle::NONE)
    }

    /// Primary name of a type.
    pub fn name(&self, handle: TypeHandle) -> Option<&str> {
        if handle.is_none() {
            return None;
        }
        self.records
            .get(handle.index() as usize)
            .map(|r| r.name.as_str())
    }

    /// Direct parents, in registration order.
    pub fn parents(&self, handle: TypeHandle) -> &[TypeHandle] {
        self.records
            .get(handle.index() as usize)
            .map_or(&[], |r| r.parents.as_slice())
    }

    /// Direct children, in registration order.
    pub fn children(&self, handle: TypeHandle) -> &[TypeHandle] {
        self.records
            .get(handle.index() as usize)
            .map_or(&[], |r| r.children.as_slice())
    }

    /// Number of registered types, including the root.
    pub fn len(&self) -> usize {
        self.records.len() - 1
    }

    /// Always false: the root type is always registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True if `ancestor` is reachable from `child` through parent edges.
    ///
    /// Every type derives from itself. [`TypeHandle::NONE`] derives from
    /// nothing and nothing derives from it.
    pub fn is_derived_from(&self, child: TypeHandle, ancestor: TypeHandle) -> bool {
        if child.is_none() || ancestor.is_none() || !self.contains(child) {
            return false;
        }
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([child]);
        while let Some(current) = queue.pop_front() {
            if current == ancestor {
                return true;
            }
            if seen.insert(current) {
                queue.extend(self.parents(current).iter().copied());
            }
        }
        false
    }

    /// Ancestors of `handle` in breadth-first order, nearest first, excluding
    /// `handle` itself.
    pub fn ancestors(&self, handle: TypeHandle) -> Vec<TypeHandle> {
        let mut seen = HashSet::from([handle]);
        let mut order = Vec::new();
        let mut queue: VecDeque<TypeHandle> = self.parents(handle).iter().copied().collect();
        while let Some(current) = queue.pop_front() {
            if seen.insert(current) {
                order.push(current);
                queue.extend(self.parents(current).iter().copied());
            }
        }
        order
    }

    fn contains(&self, handle: TypeHandle) -> bool {
        (handle.index() as usize) < self.records.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_is_idempotent_and_merges_parents() {
        let mut types = TypeRegistry::new();
        let root = types.typed_writable();
        let a = types.register_type("A", &[root]);
        let b = types.register_type("B", &[root]);
        let c = types.register_type("C", &[a]);
        let again = types.register_type("C", &[b]);

        assert_eq!(c, again);
        assert_eq!(types.parents(c), &[a, b]);
        assert_eq!(types.children(a), &[c]);
        assert_eq!(types.len(), 4);
    }

    #[test]
    fn derivation_walks_every_parent_edge() {
        let mut types = TypeRegistry::new();
        let root = types.typed_writable();
        let left = types.register_type("Left", &[root]);
        let right = types.register_type("Right", &[root]);
        let other = types.register_type("Other", &[root]);
        let both = types.register_type("Both", &[left, right]);

        assert!(types.is_derived_from(both, both));
        assert!(types.is_derived_from(both, left));
        assert!(types.is_derived_from(both, right));
        assert!(types.is_derived_from(both, root));
        assert!(!types.is_derived_from(both, other));
        assert!(!types.is_derived_from(left, both));
        assert!(!types.is_derived_from(TypeHandle::NONE, root));
        assert!(!types.is_derived_from(both, TypeHandle::NONE));
        assert_eq!(types.ancestors(both), vec![left, right, root]);
    }

    #[test]
    fn unknown_names_map_to_none() {
        let mut types = TypeRegistry::new();
        let node = types.register_type("Node", &[]);
        types.record_alternate_name(node, "OldNode");

        assert_eq!(types.find_type("OldNode"), Some(node));
        assert_eq!(types.name(node), Some("Node"));
        assert_eq!(types.get_handle("Missing"), TypeHandle::NONE);
        assert_eq!(types.name(TypeHandle::NONE), None);
    }
}
