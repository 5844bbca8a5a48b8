//! Centralized error handling for bamcode.
//!
//! Every failure in the engine is reported through [`BamError`]; the library
//! does not panic on malformed input.
//!
//! ## Error Categories
//!
//! Errors are split by *who* is at fault, because callers react differently:
//!
//! - **I/O Errors** ([`BamError::Io`]): the underlying file or writer failed.
//! - **Format Errors** ([`BamError::Format`]): bad magic, unsupported version,
//!   truncated framing or an invalid object code. The file is not a BAM stream
//!   this build understands.
//! - **Decode Underrun** ([`BamError::DecodeUnderrun`]): a `fillin` asked for
//!   more bytes than its record holds. Either the file is corrupt or the
//!   reading type does not mirror the type that wrote it.
//! - **Unknown Types** ([`BamError::UnknownType`]): a record names a type with
//!   no registered factory and the reader was told to abort on those.
//! - **Dangling References** ([`BamError::DanglingReferences`]): object IDs
//!   that were requested but never defined by the end of the stream. All of
//!   them are collected before this is returned.
//! - **Logic Errors** ([`BamError::Logic`]): a client type broke the protocol,
//!   e.g. a pointer of the wrong type was delivered to one of its slots.
//!
//! ## Usage
//!
//! ```rust
//! use bamcode::BamError;
//!
//! fn describe(err: &BamError) -> &'static str {
//!     match err {
//!         BamError::Io(_) => "storage failure",
//!         BamError::DanglingReferences(_) => "file references missing objects",
//!         BamError::Logic(_) => "client type bug",
//!         _ => "corrupt or incompatible file",
//!     }
//! }
//! # let _ = describe(&BamError::Format("x".into()));
//! ```

use std::fmt;
use std::io;
use std::sync::Arc;

use thiserror::Error;

use crate::id::ObjectId;

/// A specialized `Result` type for bamcode operations.
pub type Result<T> = std::result::Result<T, BamError>;

/// The master error enum covering all failure domains of the engine.
///
/// The type is `Clone` so a failed stream can hand the same error to several
/// observers; I/O errors are wrapped in an `Arc` for that reason.
#[derive(Debug, Clone, Error)]
pub enum BamError {
    /// Low-level I/O failure while reading or writing the stream.
    #[error("I/O error: {0}")]
    Io(#[source] Arc<io::Error>),

    /// The stream is not a valid BAM stream: wrong magic, unsupported version,
    /// truncated header or framing, or an unknown object code.
    #[error("format error: {0}")]
    Format(String),

    /// A datagram cursor was asked for more bytes than remain in the record.
    #[error("decode underrun: wanted {wanted} bytes but only {remaining} remain")]
    DecodeUnderrun {
        /// Number of bytes the failing accessor needed.
        wanted: usize,
        /// Number of bytes left in the datagram.
        remaining: usize,
    },

    /// A record's type has no factory, directly or through an ancestor.
    #[error("no factory registered for type `{name}`")]
    UnknownType {
        /// The type name as written in the stream.
        name: String,
    },

    /// One or more requested object IDs were never defined in the stream.
    #[error("{} dangling reference(s): {}", .0.len(), DisplayList(.0))]
    DanglingReferences(Vec<DanglingReference>),

    /// A client type violated the persistence protocol.
    #[error("logic error: {0}")]
    Logic(String),

    /// A serde value embedded in a datagram failed to encode or decode.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Invariant violation inside the engine itself.
    #[error("internal error: {0}")]
    Internal(String),
}

/// One unresolved pointer request reported by [`BamError::DanglingReferences`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DanglingReference {
    /// The object whose `fillin` asked for the pointer.
    pub requester: ObjectId,
    /// Type name of the requesting object.
    pub requester_type: String,
    /// The ID that no record ever defined.
    pub target: ObjectId,
}

impl fmt::Display for DanglingReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} -> {}",
            self.requester_type, self.requester, self.target
        )
    }
}

struct DisplayList<'a>(&'a [DanglingReference]);

impl fmt::Display for DisplayList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, r) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{r}")?;
        }
        Ok(())
    }
}

impl BamError {
    /// Returns true for errors caused by the bytes of the stream rather than by
    /// client code or the environment.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::Format(_) | Self::DecodeUnderrun { .. } | Self::DanglingReferences(_)
        )
    }
}

impl From<io::Error> for BamError {
    fn from(err: io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<bincode::error::EncodeError> for BamError {
    fn from(err: bincode::error::EncodeError) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<bincode::error::DecodeError> for BamError {
    fn from(err: bincode::error::DecodeError) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dangling_display_names_every_target() {
        let err = BamError::DanglingReferences(vec![
            DanglingReference {
                requester: ObjectId::new(1),
                requester_type: "Node".into(),
                target: ObjectId::new(7),
            },
            DanglingReference {
                requester: ObjectId::new(2),
                requester_type: "Leaf".into(),
                target: ObjectId::new(9),
            },
        ]);
        let text = err.to_string();
        assert!(text.starts_with("2 dangling"));
        assert!(text.contains("Node #1 -> #7"));
        assert!(text.contains("Leaf #2 -> #9"));
        assert!(err.is_corruption());
    }

    #[test]
    fn io_errors_keep_their_source() {
        use std::error::Error;
        let err = BamError::from(io::Error::new(io::ErrorKind::NotFound, "gone"));
        assert!(err.source().is_some());
        assert!(!err.is_corruption());
    }
}
