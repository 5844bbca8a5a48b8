use std::fmt;

/// A strong type for the stream-local identifier of an object.
///
/// IDs are minted by the writer starting at 1 and have no meaning outside the
/// stream that produced them. `0` is reserved for the null pointer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ObjectId(u32);

impl ObjectId {
    /// The null pointer.
    pub const NULL: ObjectId = ObjectId(0);

    /// Creates a new ObjectId.
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw numeric value.
    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// Returns true for the reserved null ID.
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    pub(crate) fn next(&self) -> Option<Self> {
        self.0.checked_add(1).map(Self)
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.0)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
