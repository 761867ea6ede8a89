//! The table reader: open, meta-block discovery, dispatch.
//!
//! [`TableReader::open`] memory-maps the file, reads the metaindex and
//! properties, derives the global sequence number and comparator flags,
//! validates the license, detaches the range-tombstone block, and builds
//! the body for one of three shapes:
//!
//! - **empty** — `num_entries == 0`; iterators are invalid from
//!   construction and `get` never visits;
//! - **single** — one [`Segment`] spanning the whole table;
//! - **multi** — an `offset` meta block is present; a [`SegmentIndex`]
//!   stitches per-partition segments into one logical table.
//!
//! After open the reader is immutable: any number of threads may call
//! [`TableReader::get`] and construct cursors concurrently. Cursors borrow
//! the reader, so the borrow checker enforces that the reader outlives
//! them; the one exception is the tombstone cursor, which owns a refcounted
//! copy of its block.
//!
//! # Comparator detection
//!
//! The properties block records the user comparator the table was built
//! under. A name starting with `rev:` selects reverse-bytewise iteration
//! order. The name [`UINT64_COMPARATOR_NAME`] selects fixed-width 64-bit
//! key ordering on little-endian hosts: keys are stored big-endian on disk
//! and surfaced host-endian, with the byte swap applied on both the lookup
//! and materialization paths.
//!
//! # Warm-up
//!
//! `warm_up_index_on_open` touches every page of the index region (plus the
//! store's dictionary and lookup tables when values are not warmed
//! separately); `warm_up_value_on_open` touches the whole value region.
//! Each region is advised `WillNeed` first, then read one byte per page.


use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use memmap2::Mmap;
use tracing::{info, warn};

use crate::error::TableError;
use crate::format::{
    self, block_names, ByteView, OffsetInfo, TableProperties,
};
use crate::ikey::{SequenceNumber, DISABLED_SEQ, PACKED_LEN};
use crate::index::KeyIndex;
use crate::iterator::{EmptyCursor, TableCursor, TableIterator};
use crate::license::LicenseValidator;
use crate::segment::{GetFlags, Segment, SegmentIndex, Visitor};
use crate::store::BlobStore;
use crate::tombstone::{TombstoneBlock, TombstoneCursor};
use crate::value::TypeVec;

/// Comparator-name prefix selecting reverse-bytewise order.
pub const REVERSE_COMPARATOR_PREFIX: &str = "rev:";

/// Default bytewise comparator name.
pub const BYTEWISE_COMPARATOR_NAME: &str = "ziptable.BytewiseComparator";

/// Comparator name selecting fixed-width 64-bit key ordering.
pub const UINT64_COMPARATOR_NAME: &str = "ziptable.Uint64Comparator";

/// Page granularity used by warm-up.
const PAGE_SIZE: usize = 4096;

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Open-time configuration for a [`TableReader`].
pub struct ReaderConfig {
    /// Page in the index region during open.
    pub warm_up_index_on_open: bool,

    /// Page in the value region during open.
    pub warm_up_value_on_open: bool,

    /// Fraction of index keys to sample into the lookup cache, `[0, 1]`.
    pub index_cache_ratio: f64,

    /// The reader only operates over a memory mapping; opening with this
    /// set to `false` fails with InvalidArgument.
    pub use_mmap_reads: bool,

    /// License merger/validator consulted when the table carries a
    /// `license` block.
    pub license: Option<Arc<dyn LicenseValidator>>,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        ReaderConfig {
            warm_up_index_on_open: false,
            warm_up_value_on_open: false,
            index_cache_ratio: 0.0,
            use_mmap_reads: true,
            license: None,
        }
    }
}

/// Per-read options.
///
/// The reader is synchronous, verifies checksums unconditionally, and does
/// no caching, so nothing is tunable per call yet; the struct keeps the
/// call sites stable.
#[derive(Debug, Clone, Copy, Default)]
#[non_exhaustive]
pub struct ReadOptions {}

// ------------------------------------------------------------------------------------------------
// Reader
// ------------------------------------------------------------------------------------------------

enum ReaderBody {
    Empty,
    Single(Segment),
    Multi(SegmentIndex),
}

/// An open, immutable table.
pub struct TableReader {
    mmap: ByteView,
    _file: File,
    properties: TableProperties,
    global_seqno: SequenceNumber,
    reverse: bool,
    u64_keys: bool,
    body: ReaderBody,
    tombstone: Option<Arc<TombstoneBlock>>,
}

impl TableReader {
    /// Open a table file.
    pub fn open(path: impl AsRef<Path>, config: ReaderConfig) -> Result<Self, TableError> {
        if !config.use_mmap_reads {
            return Err(TableError::InvalidArgument(
                "use_mmap_reads must be true".into(),
            ));
        }
        let file = File::open(path.as_ref())?;
        let map = unsafe { Mmap::map(&file)? };
        let mmap = ByteView::from_mmap(Arc::new(map));
        let file_size = mmap.len();

        let meta = format::read_metaindex(&mmap)?;
        let props_block = format::require_meta_block(&mmap, &meta, block_names::PROPERTIES)?;
        let properties = TableProperties::decode(props_block.as_slice())?;

        let mut global_seqno = properties.global_seqno();
        let reverse = properties
            .user_comparator
            .starts_with(REVERSE_COMPARATOR_PREFIX);
        let u64_keys = cfg!(target_endian = "little")
            && properties.user_comparator == UINT64_COMPARATOR_NAME;

        if let Some(license_block) = format::read_meta_block(&mmap, &meta, block_names::LICENSE)? {
            if let Some(validator) = &config.license {
                validator.merge(license_block.as_slice())?;
                if !validator.valid() {
                    return Err(TableError::Corruption("license expired".into()));
                }
            }
        }

        // The tombstone block is tagged with the raw (uncoerced) seqno so a
        // disabled one leaves the recorded per-interval sequences in force.
        let tombstone =
            match format::read_meta_block(&mmap, &meta, block_names::RANGE_TOMBSTONE)? {
                Some(block) => Some(TombstoneBlock::detach(&block, global_seqno)?),
                None => None,
            };
        if global_seqno == DISABLED_SEQ {
            global_seqno = 0;
        }

        let data_size = properties.data_size as usize;
        if data_size > file_size {
            return Err(TableError::Corruption(format!(
                "data_size {data_size} exceeds file size {file_size}"
            )));
        }

        let warm_started;
        let cache_started;
        let mut key_count = 0usize;

        let body = if properties.num_entries == 0 {
            warm_started = Instant::now();
            cache_started = Instant::now();
            ReaderBody::Empty
        } else if meta.find(block_names::OFFSET).is_some() {
            if u64_keys {
                return Err(TableError::InvalidArgument(
                    "fixed-width comparator is unsupported on partitioned tables".into(),
                ));
            }
            let offset_block = format::require_meta_block(&mmap, &meta, block_names::OFFSET)?;
            let offsets = OffsetInfo::decode(offset_block.as_slice())?;
            let dict = format::require_meta_block(&mmap, &meta, block_names::VALUE_DICT)?;
            let index_block = format::require_meta_block(&mmap, &meta, block_names::INDEX)?;
            let type_block = format::require_meta_block(&mmap, &meta, block_names::VALUE_TYPE)?;
            let common_prefix_block =
                format::require_meta_block(&mmap, &meta, block_names::COMMON_PREFIX)?;

            let mut segments = SegmentIndex::init(
                &offsets,
                index_block.clone(),
                mmap.slice(0..data_size),
                dict.clone(),
                type_block,
                common_prefix_block,
                reverse,
            )?;

            warm_started = Instant::now();
            if config.warm_up_index_on_open {
                warm_up_region(&index_block);
                if !config.warm_up_value_on_open {
                    warm_up_region(&dict);
                    for i in 0..segments.segment_count() {
                        warm_up_region(&segments.segment_at(i).store().lookup_region());
                    }
                }
            }
            if config.warm_up_value_on_open {
                warm_up_region(&mmap.slice(0..data_size));
            }

            cache_started = Instant::now();
            key_count = segments.build_caches(config.index_cache_ratio);
            ReaderBody::Multi(segments)
        } else {
            let dict = format::require_meta_block(&mmap, &meta, block_names::VALUE_DICT)?;
            let index_block = format::require_meta_block(&mmap, &meta, block_names::INDEX)?;
            let common_prefix =
                match format::read_meta_block(&mmap, &meta, block_names::COMMON_PREFIX)? {
                    Some(block) => block.as_slice().to_vec(),
                    None => {
                        warn!(
                            block = block_names::COMMON_PREFIX,
                            "meta block missing, treating as an older table with an empty prefix"
                        );
                        Vec::new()
                    }
                };

            let store = BlobStore::load_from_memory(mmap.slice(0..data_size), dict.clone())?;
            let mut index = KeyIndex::load(index_block.clone())?;
            let types = match format::read_meta_block(&mmap, &meta, block_names::VALUE_TYPE)? {
                Some(block) => TypeVec::new(block, index.num_keys())?,
                None => TypeVec::all_zero_seq(),
            };

            warm_started = Instant::now();
            if config.warm_up_index_on_open {
                warm_up_region(&index_block);
                if !config.warm_up_value_on_open {
                    warm_up_region(store.dict_region());
                    warm_up_region(&store.lookup_region());
                }
            }
            if config.warm_up_value_on_open {
                warm_up_region(store.mem_region());
            }

            cache_started = Instant::now();
            index.build_cache(config.index_cache_ratio);
            key_count = index.num_keys();
            ReaderBody::Single(Segment::new(0, Vec::new(), common_prefix, index, store, types))
        };
        let done = Instant::now();

        info!(
            file_size,
            entries = properties.num_entries,
            keys = key_count,
            index_size = properties.index_size,
            value_size = properties.data_size,
            warm_up_secs = (cache_started - warm_started).as_secs_f64(),
            build_cache_secs = (done - cache_started).as_secs_f64(),
            "opened table"
        );

        Ok(TableReader {
            mmap,
            _file: file,
            properties,
            global_seqno,
            reverse,
            u64_keys,
            body,
            tombstone,
        })
    }

    /// Point lookup: feed the versions of `internal_key`'s user key that
    /// are visible at its embedded sequence bound to `visitor`, newest
    /// first.
    pub fn get(
        &self,
        _opts: &ReadOptions,
        internal_key: &[u8],
        visitor: &mut Visitor<'_>,
        skip_filters: bool,
    ) -> Result<(), TableError> {
        let flags = GetFlags {
            skip_filter: skip_filters,
            uint64_comparator: self.u64_keys,
        };
        match &self.body {
            ReaderBody::Empty => Ok(()),
            ReaderBody::Single(segment) => {
                segment.get(self.global_seqno, internal_key, visitor, flags)
            }
            ReaderBody::Multi(segments) => {
                if internal_key.len() < PACKED_LEN {
                    return Err(TableError::InvalidArgument(format!(
                        "internal key too short: {} bytes",
                        internal_key.len()
                    )));
                }
                let user_key = &internal_key[..internal_key.len() - PACKED_LEN];
                match segments.get_segment(user_key) {
                    Some(segment) => {
                        segment.get(self.global_seqno, internal_key, visitor, flags)
                    }
                    // No partition covers the key, so it cannot exist.
                    None => Ok(()),
                }
            }
        }
    }

    /// A fresh cursor over the table in its comparator's order.
    pub fn new_iterator(&self, _opts: &ReadOptions) -> Box<dyn TableCursor + '_> {
        match &self.body {
            ReaderBody::Empty => Box::new(EmptyCursor::default()),
            ReaderBody::Single(segment) => Box::new(TableIterator::new_single(
                segment,
                self.global_seqno,
                self.reverse,
                self.u64_keys,
            )),
            ReaderBody::Multi(segments) => Box::new(TableIterator::new_multi(
                segments,
                self.global_seqno,
                self.reverse,
            )),
        }
    }

    /// A cursor over the range-tombstone block, or `None` when the table
    /// has none. The cursor owns a refcounted copy of the block and may
    /// outlive this reader.
    pub fn new_range_tombstone_iterator(
        &self,
        _opts: &ReadOptions,
    ) -> Option<Box<dyn TableCursor>> {
        self.tombstone
            .as_ref()
            .map(|block| Box::new(TombstoneCursor::new(Arc::clone(block))) as Box<dyn TableCursor>)
    }

    /// The table's properties block.
    pub fn properties(&self) -> &TableProperties {
        &self.properties
    }

    /// The coerced global sequence number (0 when the table carries none).
    pub fn global_seqno(&self) -> SequenceNumber {
        self.global_seqno
    }

    /// Whether iteration order is reverse-bytewise.
    pub fn is_reverse_order(&self) -> bool {
        self.reverse
    }

    /// Whether keys order as fixed-width 64-bit integers.
    pub fn is_u64_keys(&self) -> bool {
        self.u64_keys
    }

    /// Total mapped file size in bytes.
    pub fn file_size(&self) -> usize {
        self.mmap.len()
    }
}

impl std::fmt::Debug for TableReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shape = match &self.body {
            ReaderBody::Empty => "empty",
            ReaderBody::Single(_) => "single",
            ReaderBody::Multi(_) => "multi",
        };
        f.debug_struct("TableReader")
            .field("shape", &shape)
            .field("entries", &self.properties.num_entries)
            .field("global_seqno", &self.global_seqno)
            .field("reverse", &self.reverse)
            .field("u64_keys", &self.u64_keys)
            .finish()
    }
}

/// Advise a region in, then touch one byte per page.
fn warm_up_region(view: &ByteView) {
    view.advise_willneed();
    let bytes = view.as_slice();
    let mut offset = 0;
    while offset < bytes.len() {
        // volatile so the touch survives optimization
        unsafe { std::ptr::read_volatile(bytes.as_ptr().add(offset)) };
        offset += PAGE_SIZE;
    }
}
