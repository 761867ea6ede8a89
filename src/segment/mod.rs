//! Segments: the unit binding one key index to one blob store.
//!
//! A [`Segment`] owns the pieces needed to resolve a point lookup inside one
//! partition: the key index, the blob store, the per-record type vector, the
//! common prefix shared by all of its keys, and (for multi-partition tables)
//! its partition prefix. Full user keys decompose as
//!
//! ```text
//! partition_prefix || common_prefix || index_key
//! ```
//!
//! [`SegmentIndex`] holds every segment of a multi-partition table and maps
//! a full user key to its owning segment by partition prefix.
//!
//! # Lookup pipeline (`Segment::get`)
//!
//! 1. Parse the internal key; reject anything shorter than 8 bytes.
//! 2. Byte-swap the 8-byte user key under the fixed-width-integer
//!    comparator.
//! 3. Check the partition and common prefixes; a divergence means the key
//!    cannot exist here, which is a silent success.
//! 4. Exact index lookup of the remaining suffix; a miss is a silent
//!    success.
//! 5. Fetch the record into a thread-local scratch buffer, mapping store
//!    checksum failures to corruption.
//! 6. Decode per the record's value tag and feed visible versions to the
//!    visitor, newest first. The visitor can stop the walk early (merge
//!    chains that reached a non-merge operand).
//! 7. Trim the scratch buffer when a large record left it oversized.


use std::cell::RefCell;
use std::cmp::Ordering;

use crate::error::TableError;
use crate::format::{ByteView, OffsetInfo};
use crate::ikey::{
    common_prefix_len, parse_internal_key, unpack_seq_type, EntryType, ParsedInternalKey,
    SequenceNumber, PACKED_LEN,
};
use crate::index::KeyIndex;
use crate::store::{BlobStore, StoreError};
use crate::value::{MultiValue, TypeVec, ValueTag};

/// Scratch capacity above which the thread-local fetch buffer is released
/// after a lookup.
const SCRATCH_TRIM_BYTES: usize = 512 * 1024;

thread_local! {
    static GET_SCRATCH: RefCell<Vec<u8>> = const { RefCell::new(Vec::new()) };
}

// ------------------------------------------------------------------------------------------------
// Visitor protocol
// ------------------------------------------------------------------------------------------------

/// The visitor's verdict after receiving one version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisitFlow {
    /// Keep feeding older versions (an unfinished merge chain).
    Continue,
    /// The visitor is satisfied; stop the version walk.
    Stop,
}

/// Callback receiving `(parsed internal key, user value)` per visible
/// version.
pub type Visitor<'v> = dyn FnMut(&ParsedInternalKey<'_>, &[u8]) -> VisitFlow + 'v;

/// Per-call behavior switches for [`Segment::get`].
#[derive(Debug, Clone, Copy, Default)]
pub struct GetFlags {
    /// Skip auxiliary filtering structures. Accepted for interface parity;
    /// the index is exact, so there is nothing to skip.
    pub skip_filter: bool,
    /// The caller's user key is a host-endian `u64`; swap it to the
    /// big-endian form keys are stored in.
    pub uint64_comparator: bool,
}

// ------------------------------------------------------------------------------------------------
// Segment
// ------------------------------------------------------------------------------------------------

/// One (index, store, type vector, prefixes) unit of a table.
pub struct Segment {
    /// Position of this segment among its table's partitions; 0 for
    /// single-partition tables.
    pub(crate) ordinal: usize,
    /// Fixed-length partition prefix; empty for single-partition tables.
    pub(crate) partition_prefix: Vec<u8>,
    /// Bytes shared by every user key in this segment (after the partition
    /// prefix), stripped from what the index stores.
    pub(crate) common_prefix: Vec<u8>,
    pub(crate) index: KeyIndex,
    pub(crate) store: BlobStore,
    pub(crate) types: TypeVec,
}

impl Segment {
    /// Assemble a segment from its parts.
    pub fn new(
        ordinal: usize,
        partition_prefix: Vec<u8>,
        common_prefix: Vec<u8>,
        index: KeyIndex,
        store: BlobStore,
        types: TypeVec,
    ) -> Self {
        Segment {
            ordinal,
            partition_prefix,
            common_prefix,
            index,
            store,
            types,
        }
    }

    /// Number of keys in this segment.
    pub fn num_keys(&self) -> usize {
        self.index.num_keys()
    }

    /// Position of this segment among its table's partitions.
    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    /// This segment's partition prefix.
    pub fn partition_prefix(&self) -> &[u8] {
        &self.partition_prefix
    }

    /// This segment's common prefix.
    pub fn common_prefix(&self) -> &[u8] {
        &self.common_prefix
    }

    pub(crate) fn index(&self) -> &KeyIndex {
        &self.index
    }

    pub(crate) fn store(&self) -> &BlobStore {
        &self.store
    }

    pub(crate) fn types(&self) -> &TypeVec {
        &self.types
    }

    /// Point lookup of `internal_key` at the sequence bound embedded in it.
    ///
    /// Visible versions are handed to `visitor` newest first. Paths where
    /// the key cannot exist (prefix divergence, index miss, every version
    /// newer than the bound) succeed without invoking the visitor.
    pub fn get(
        &self,
        global_seqno: SequenceNumber,
        internal_key: &[u8],
        visitor: &mut Visitor<'_>,
        flags: GetFlags,
    ) -> Result<(), TableError> {
        let pikey = parse_internal_key(internal_key)
            .map_err(|e| TableError::InvalidArgument(e.to_string()))?;

        let mut swapped = [0u8; 8];
        let user_key: &[u8] = if flags.uint64_comparator {
            if pikey.user_key.len() != 8 {
                return Err(TableError::InvalidArgument(format!(
                    "u64-comparator key must be 8 bytes, got {}",
                    pikey.user_key.len()
                )));
            }
            swapped.copy_from_slice(pikey.user_key);
            swapped.reverse();
            &swapped
        } else {
            pikey.user_key
        };

        let pp = self.partition_prefix.len();
        if user_key.len() < pp || &user_key[..pp] != self.partition_prefix.as_slice() {
            return Ok(());
        }
        let tail = &user_key[pp..];
        let cplen = common_prefix_len(tail, &self.common_prefix);
        if cplen != self.common_prefix.len() {
            return Ok(());
        }

        let Some(rec) = self.index.find(&tail[cplen..]) else {
            return Ok(());
        };

        GET_SCRATCH.with(|cell| {
            let mut buf = cell.borrow_mut();
            buf.clear();
            let result = self.decode_record(global_seqno, &pikey, rec, &mut buf, visitor);
            if buf.capacity() > SCRATCH_TRIM_BYTES {
                *buf = Vec::new();
            }
            result
        })
    }

    fn decode_record(
        &self,
        global_seqno: SequenceNumber,
        pikey: &ParsedInternalKey<'_>,
        rec: usize,
        buf: &mut Vec<u8>,
        visitor: &mut Visitor<'_>,
    ) -> Result<(), TableError> {
        match self.store.get_record_append(rec, buf) {
            Ok(()) => {}
            Err(e @ StoreError::ChecksumMismatch { .. }) => {
                return Err(TableError::Corruption(e.to_string()));
            }
            Err(e) => return Err(e.into()),
        }

        let visited_key = |sequence, entry_type| ParsedInternalKey {
            user_key: pikey.user_key,
            sequence,
            entry_type,
        };

        match self.types.get(rec) {
            ValueTag::ZeroSeq => {
                visitor(&visited_key(global_seqno, EntryType::Value), buf);
            }
            ValueTag::Value => {
                let (seq, _) = read_packed(buf)?;
                if seq <= pikey.sequence {
                    visitor(&visited_key(seq, EntryType::Value), &buf[PACKED_LEN..]);
                }
            }
            ValueTag::Delete => {
                let (seq, _) = read_packed(buf)?;
                if seq <= pikey.sequence {
                    visitor(&visited_key(seq, EntryType::Deletion), &[]);
                }
            }
            ValueTag::Multi => {
                let multi = MultiValue::decode(buf).map_err(TableError::from)?;
                for i in 0..multi.len() {
                    let record = multi.get(i);
                    let (seq, entry_type) = read_packed(record)?;
                    if seq <= pikey.sequence {
                        let flow = visitor(&visited_key(seq, entry_type), &record[PACKED_LEN..]);
                        if flow == VisitFlow::Stop {
                            break;
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("ordinal", &self.ordinal)
            .field("partition_prefix", &self.partition_prefix)
            .field("common_prefix", &self.common_prefix)
            .field("keys", &self.index.num_keys())
            .finish()
    }
}

/// Read the leading `packed8` of a version payload.
pub(crate) fn read_packed(bytes: &[u8]) -> Result<(SequenceNumber, EntryType), TableError> {
    if bytes.len() < PACKED_LEN {
        return Err(TableError::Corruption(format!(
            "version payload too short: {} bytes",
            bytes.len()
        )));
    }
    let mut raw = [0u8; PACKED_LEN];
    raw.copy_from_slice(&bytes[..PACKED_LEN]);
    let packed = u64::from_le_bytes(raw);
    let (seq, ty) =
        unpack_seq_type(packed).map_err(|e| TableError::Aborted(e.to_string()))?;
    Ok((seq, ty))
}

// ------------------------------------------------------------------------------------------------
// Segment index (multi-partition lookup)
// ------------------------------------------------------------------------------------------------

/// How [`SegmentIndex::get_segment`] resolves a key to a partition, fixed at
/// initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LookupStrategy {
    /// Prefixes fit in a `u64`, few partitions: linear scan for the first
    /// prefix `>=` the target.
    U64Linear,
    /// Prefixes fit in a `u64`: binary-search lower bound.
    U64Binary,
    /// Reverse order over `u64` prefixes: upper bound, stepped back.
    U64BinaryReverse,
    /// Long prefixes: bytewise lower bound.
    Bytewise,
    /// Reverse order, bytewise: upper bound, stepped back.
    BytewiseReverse,
}

/// Partition count below which a linear scan beats binary search for `u64`
/// prefixes.
const LINEAR_SCAN_MAX_PARTS: usize = 32;

/// All segments of a multi-partition table, ordered by partition prefix,
/// with key→segment resolution.
pub struct SegmentIndex {
    segments: Vec<Segment>,
    prefix_len: usize,
    /// Prefixes loaded as big-endian integers when `prefix_len <= 8`.
    prefix_u64: Vec<u64>,
    strategy: LookupStrategy,
}

impl SegmentIndex {
    /// Build the segment set from the six concatenated byte ranges of a
    /// multi-partition table, slicing each partition's sub-ranges by
    /// successive differences of the offset table.
    pub fn init(
        offsets: &OffsetInfo,
        index_mem: ByteView,
        store_mem: ByteView,
        dict_mem: ByteView,
        type_mem: ByteView,
        common_prefix_mem: ByteView,
        reverse: bool,
    ) -> Result<Self, TableError> {
        let part_count = offsets.part_count();
        let prefix_len = offsets.prefix_len;

        let bad_offset =
            |what: &str| TableError::Corruption(format!("offset block: {what} range out of bounds"));

        let mut segments = Vec::with_capacity(part_count);
        let mut last = crate::format::PartOffsets::default();
        for i in 0..part_count {
            let curr = offsets.parts[i];
            if curr.key as usize > index_mem.len() {
                return Err(bad_offset("index"));
            }
            if curr.value as usize > store_mem.len() {
                return Err(bad_offset("store"));
            }
            if curr.typ as usize > type_mem.len() {
                return Err(bad_offset("value-type"));
            }
            if curr.common_prefix as usize > common_prefix_mem.len() {
                return Err(bad_offset("common-prefix"));
            }

            let index = KeyIndex::load(index_mem.slice(last.key as usize..curr.key as usize))?;
            let store = BlobStore::load_from_memory(
                store_mem.slice(last.value as usize..curr.value as usize),
                dict_mem.clone(),
            )?;
            let types = TypeVec::new(
                type_mem.slice(last.typ as usize..curr.typ as usize),
                index.num_keys(),
            )?;
            let common_prefix = common_prefix_mem
                .slice(last.common_prefix as usize..curr.common_prefix as usize)
                .as_slice()
                .to_vec();

            segments.push(Segment::new(
                i,
                offsets.prefix(i).to_vec(),
                common_prefix,
                index,
                store,
                types,
            ));
            last = curr;
        }

        let (prefix_u64, strategy) = if prefix_len <= 8 {
            let loaded = (0..part_count)
                .map(|i| load_prefix_u64(offsets.prefix(i), prefix_len))
                .collect();
            let strategy = if reverse {
                LookupStrategy::U64BinaryReverse
            } else if part_count < LINEAR_SCAN_MAX_PARTS {
                LookupStrategy::U64Linear
            } else {
                LookupStrategy::U64Binary
            };
            (loaded, strategy)
        } else {
            let strategy = if reverse {
                LookupStrategy::BytewiseReverse
            } else {
                LookupStrategy::Bytewise
            };
            (Vec::new(), strategy)
        };

        Ok(SegmentIndex {
            segments,
            prefix_len,
            prefix_u64,
            strategy,
        })
    }

    /// Number of partitions.
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Segment at ordinal `i`.
    pub fn segment_at(&self, i: usize) -> &Segment {
        &self.segments[i]
    }

    /// The fixed partition-prefix length.
    pub fn prefix_len(&self) -> usize {
        self.prefix_len
    }

    /// Build every segment's index lookup cache; returns the total key
    /// count.
    pub fn build_caches(&mut self, ratio: f64) -> usize {
        let mut keys = 0;
        for segment in &mut self.segments {
            segment.index.build_cache(ratio);
            keys += segment.index.num_keys();
        }
        keys
    }

    /// Resolve a full user key to the partition that would own it, or
    /// `None` when no partition covers it (before all partitions in forward
    /// order, after all in reverse).
    pub fn get_segment(&self, key: &[u8]) -> Option<&Segment> {
        match self.strategy {
            LookupStrategy::U64Linear => {
                let target = load_prefix_u64(key, self.prefix_len);
                let i = self.prefix_u64.iter().position(|&p| p >= target)?;
                Some(&self.segments[i])
            }
            LookupStrategy::U64Binary => {
                let target = load_prefix_u64(key, self.prefix_len);
                let i = self.prefix_u64.partition_point(|&p| p < target);
                self.segments.get(i)
            }
            LookupStrategy::U64BinaryReverse => {
                let target = load_prefix_u64(key, self.prefix_len);
                let i = self.prefix_u64.partition_point(|&p| p <= target);
                i.checked_sub(1).map(|i| &self.segments[i])
            }
            LookupStrategy::Bytewise => {
                let target = &key[..key.len().min(self.prefix_len)];
                let i = self
                    .segments
                    .partition_point(|s| s.partition_prefix.as_slice() < target);
                self.segments.get(i)
            }
            LookupStrategy::BytewiseReverse => {
                let target = &key[..key.len().min(self.prefix_len)];
                let i = self
                    .segments
                    .partition_point(|s| {
                        s.partition_prefix.as_slice().cmp(target) != Ordering::Greater
                    });
                i.checked_sub(1).map(|i| &self.segments[i])
            }
        }
    }
}

impl std::fmt::Debug for SegmentIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentIndex")
            .field("segments", &self.segments.len())
            .field("prefix_len", &self.prefix_len)
            .field("strategy", &self.strategy)
            .finish()
    }
}

/// Load up to `prefix_len` key bytes as a big-endian integer: the prefix
/// occupies the low `prefix_len` bytes of a zeroed 8-byte word, so unsigned
/// comparison matches bytewise comparison of the fixed-width prefixes.
fn load_prefix_u64(key: &[u8], prefix_len: usize) -> u64 {
    debug_assert!(prefix_len <= 8);
    let mut word = [0u8; 8];
    let take = prefix_len.min(key.len());
    word[8 - prefix_len..8 - prefix_len + take].copy_from_slice(&key[..take]);
    u64::from_be_bytes(word)
}
