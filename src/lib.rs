//! # ziptable
//!
//! A **read-only**, **memory-mapped**, sorted key/value table reader for
//! LSM-style storage engines. A table file is self-contained: a succinct
//! index over its user keys, a separately compressed value store, per-record
//! value-type tags, a common key prefix, optional range-tombstone metadata,
//! and table-wide properties. The reader serves two operations at a
//! snapshot sequence number: point lookup of the newest visible version,
//! and ordered iteration over internal keys — forward, reverse, fixed-width
//! integer order, and across partitions.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       TableReader                        │
//! │   open → mmap → metaindex → properties → body            │
//! │                                                          │
//! │  ┌───────────┐   ┌────────────────────────────────────┐  │
//! │  │ Segment   │   │ SegmentIndex (partitioned tables)  │  │
//! │  │  KeyIndex │   │   Segment │ Segment │ Segment …    │  │
//! │  │  BlobStore│   └────────────────────────────────────┘  │
//! │  │  TypeVec  │              ▲                            │
//! │  └─────┬─────┘              │ partition-prefix lookup    │
//! │        │ get()              │                            │
//! │  ┌─────▼──────────────────────────────────────────────┐  │
//! │  │ TableIterator — one state machine for forward /    │  │
//! │  │ reverse / u64 / multi-partition iteration          │  │
//! │  └────────────────────────────────────────────────────┘  │
//! │                                                          │
//! │  TombstoneBlock (copied out, refcounted) · License       │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`reader`] | Open, meta-block discovery, warm-up, dispatch of `get` / iterators |
//! | [`segment`] | One (index, store, types, prefixes) unit; point lookup; partition resolution |
//! | [`iterator`] | The cursor contract and the shared iteration state machine |
//! | [`index`] | Sorted-set membership and ordered cursor over key suffixes |
//! | [`store`] | Random-access value payloads with per-record checksums |
//! | [`value`] | 2-bit value tags, type vector, multi-version frames |
//! | [`ikey`] | Internal-key packing and parsing |
//! | [`format`] | File framing: footer, metaindex, properties, offsets |
//! | [`tombstone`] | Range-tombstone block facade and cursor |
//! | [`license`] | License merge/validity collaborator |
//! | [`builder`] | Table file writer for tests, benches, and tooling |
//!
//! ## Key properties
//!
//! - **Zero-copy reads** — the file is mapped once; the index, store, type
//!   vector, and prefixes are views into the mapping. Only the
//!   range-tombstone block is copied out, so its cursor can outlive the
//!   reader.
//! - **Multi-version keys** — a record decodes to one or many
//!   `(sequence, type, value)` versions, newest first; lookups stop at the
//!   first version at or below the caller's sequence bound.
//! - **Immutable and share-nothing** — after `open` the reader takes no
//!   locks and may serve any number of threads; each cursor is a
//!   single-threaded object borrowing the reader.
//! - **Checksummed** — every framed block and every store record carries a
//!   CRC32; failures surface as corruption, and a failed cursor stays
//!   invalid with a sticky status.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use ziptable::builder::TableBuilder;
//! use ziptable::reader::{ReadOptions, ReaderConfig, TableReader};
//! use ziptable::ikey::{append_internal_key, EntryType, MAX_SEQ};
//! use ziptable::segment::VisitFlow;
//! use ziptable::TableCursor;
//!
//! # fn main() -> Result<(), ziptable::TableError> {
//! TableBuilder::new("/tmp/example.zt")
//!     .common_prefix(b"app/")
//!     .put(b"app/hello", 7, b"world")
//!     .finish()?;
//!
//! let reader = TableReader::open("/tmp/example.zt", ReaderConfig::default())?;
//!
//! // Point lookup at the newest snapshot.
//! let mut target = Vec::new();
//! append_internal_key(&mut target, b"app/hello", MAX_SEQ, EntryType::Value);
//! reader.get(
//!     &ReadOptions::default(),
//!     &target,
//!     &mut |ikey, value| {
//!         println!("{:?} @ {} = {:?}", ikey.user_key, ikey.sequence, value);
//!         VisitFlow::Stop
//!     },
//!     false,
//! )?;
//!
//! // Ordered scan.
//! let mut cursor = reader.new_iterator(&ReadOptions::default());
//! cursor.seek_to_first();
//! while cursor.valid() {
//!     let _ = (cursor.key(), cursor.value());
//!     cursor.next();
//! }
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod error;
pub mod format;
pub mod ikey;
pub mod index;
pub mod iterator;
pub mod license;
pub mod reader;
pub mod segment;
pub mod store;
pub mod tombstone;
pub mod value;

#[cfg(test)]
pub(crate) mod testutil;

pub use error::TableError;
pub use iterator::{PinningContext, TableCursor};
pub use reader::{ReadOptions, ReaderConfig, TableReader};
pub use segment::{GetFlags, VisitFlow};
