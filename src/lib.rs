//! # Bamcode
//!
//! A serialization engine for graphs of shared, polymorphic objects, using the
//! BAM binary stream format.
//!
//! ## Overview
//!
//! Most serializers treat data as a tree. Bamcode treats it as a graph: the
//! same object may be reachable along many paths, pointers may form cycles,
//! and an untyped pointer field (`Option<WritableRef>`) may hold an object of
//! any registered type. Every object
//! is written exactly once per stream and given a numeric object ID; pointers
//! are written as IDs and reconnected on reading, so shared objects stay shared
//! and cycles survive the round trip.
//!
//! ### Key Features
//!
//! *   **Identity preservation:** Two pointers to one object read back as two
//!     handles to one object.
//! *   **Cycles and forward references:** Reading is two-phase. Objects are
//!     built from their records first and their pointers are connected once
//!     every target exists.
//! *   **Polymorphism:** Types are recorded by name with their derivation, so a
//!     reader that does not know a derived type can build its nearest known
//!     ancestor instead. Such a stand-in is returned as a root, but pointers
//!     to it read back as null.
//! *   **Version skew:** Every stream declares its minor version and types can
//!     gate fields on it, so new code reads old files and can write old ones.
//! *   **Graceful unknowns:** Records of types nobody can build are skipped
//!     with a diagnostic, or abort the read, as configured.
//! *   **Memory-mapped input:** Files are read through `memmap2` without
//!     copying records out of the map.
//!
//! ## Architecture
//!
//! ### File Format
//!
//! ```text
//! [Magic "pbj\0\n\r"] [len|Header] [len|Record] [len|Record] ...
//! ```
//!
//! Each record starts with an object code (`Push`, `Adjunct`, `Pop` or
//! `Remove`). A `Push` record opens a group holding one top-level object;
//! the `Adjunct` records after it hold the objects that object reaches, and a
//! `Pop` record closes the group. See [`format`] for the details.
//!
//! ### Writing
//!
//! [`BamWriter::write_object`] assigns IDs in the order objects are first
//! reached, breadth first, and drains its queue before returning.
//!
//! ### Reading
//!
//! [`BamReader::read_object`] reads one group. Each record is turned into an
//! object by the [`Factory`] entry of its type, whose
//! [`fillin`](TypedWritable::fillin) reads fields and requests pointers.
//! Requests are satisfied by [`BamReader::resolve`] once all targets exist.
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use bamcode::{Bam, BamObject, Ptr, Registry, WritableRef};
//!
//! #[derive(Debug, Default, BamObject)]
//! struct Node {
//!     label: String,
//!     #[bam(pointer)]
//!     next: Ptr<Node>,
//! }
//!
//! # fn main() -> bamcode::Result<()> {
//! let mut registry = Registry::new();
//! registry.register::<Node>();
//! let registry = Arc::new(registry);
//!
//! // A two-node cycle.
//! let a = WritableRef::new(Node { label: "a".into(), next: Ptr::null() });
//! let b = WritableRef::new(Node { label: "b".into(), next: Ptr::new(a.clone())? });
//! if let Some(mut node) = a.downcast_mut::<Node>() {
//!     node.next = Ptr::new(b.clone())?;
//! }
//!
//! let bytes = Bam::serialize(&registry, &a)?;
//! let root = Bam::deserialize(&registry, &bytes)?;
//!
//! let first = root.downcast_ref::<Node>().map(|n| n.next.clone()).unwrap_or_default();
//! let second = first.borrow().map(|n| n.next.clone()).unwrap_or_default();
//! assert!(second.get().is_some_and(|back| back.ptr_eq(&root)));
//! # // Break the cycles so the test does not leak.
//! # for node in [&a, &root] {
//! #     if let Some(mut node) = node.downcast_mut::<Node>() {
//! #         node.next = Ptr::null();
//! #     }
//! # }
//! # Ok(())
//! # }
//! ```
//!
//! ## Safety and Error Handling
//!
//! * **Encapsulated Unsafe:** The only `unsafe` is the memory map in [`io`].
//! * **No Panics:** No `unwrap()` or `panic!()` calls in the library (enforced by clippy lints).
//! * **Comprehensive Errors:** All failures correspond to a [`BamError`]; malformed
//!   input is always an error, never a crash.

#![deny(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::panic)]
#![warn(missing_docs)]

// Lets generated `bamcode::` paths resolve inside this crate's own tests.
extern crate self as bamcode;

// --- PUBLIC API MODULES ---
pub mod api;
pub mod datagram;
pub mod error;
pub mod factory;
pub mod file;
pub mod format;
pub mod id;
pub mod inspector;
pub mod pointer;
pub mod reader;
pub mod types;
pub mod value;
pub mod writable;
pub mod writer;

// --- INTERNAL IMPLEMENTATION MODULES (Hidden from Docs) ---
#[doc(hidden)]
pub mod io;

// --- MACRO SUPPORT MODULES ---

/// Runtime utilities used by the derived code.
#[doc(hidden)]
pub mod rt;

// --- RE-EXPORTS ---

pub use api::{Bam, BamOptions};
pub use datagram::{Datagram, DatagramIterator};
pub use error::{BamError, DanglingReference, Result};
pub use factory::{Factory, FactoryParams, MakeFn};
pub use file::BamFile;
pub use format::{BamEndian, BamHeader};
pub use id::ObjectId;
pub use inspector::BamInspector;
pub use pointer::{PointerCursor, PointerField, Ptr, WeakPtr};
pub use reader::{BamReader, SkippedRecord, UnknownTypePolicy};
pub use types::{Registry, TypeHandle, TypeRegistry};
pub use value::BamValue;
pub use writable::{BamFields, TypedWritable, WeakWritableRef, WritableRef, WritableType};
pub use writer::BamWriter;

// Re-export the derive macro so it is accessible as `bamcode::BamObject`
pub use bamcode_derive::BamObject;
