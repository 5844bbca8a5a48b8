use std::fmt;

/// Opaque identifier of a registered type.
///
/// Handles are indices into one [`TypeRegistry`](super::TypeRegistry) and are
/// only meaningful alongside it. The index is also what a writer puts on the
/// wire, so a registry never holds more than `u16::MAX` types in practice.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct TypeHandle(u32);

impl TypeHandle {
    /// The "no type" handle.
    pub const NONE: TypeHandle = TypeHandle(0);

    pub(crate) const fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the registry index.
    pub fn index(&self) -> u32 {
        self.0
    }

    /// Returns true for [`TypeHandle::NONE`].
    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for TypeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            f.write_str("TypeHandle(none)")
        } else {
            write!(f, "TypeHandle({})", self.0)
        }
    }
}
