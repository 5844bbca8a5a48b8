//! Byte-level encoding of records.
//!
//! A [`Datagram`] accumulates primitive values; a [`DatagramIterator`] reads
//! them back in the same order. Neither knows anything about objects.

#[allow(clippy::module_inception)]
mod datagram;
mod iterator;

pub use datagram::Datagram;
pub use iterator::DatagramIterator;
