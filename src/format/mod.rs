//! On-disk file framing consumed by the table reader.
//!
//! A table file is laid out as:
//!
//! ```text
//! [0, data_size)                        value region (blob store bytes)
//! [u32 len][content][u32 crc32]         framed meta blocks, back to back
//! [u32 len][metaindex][u32 crc32]       metaindex: named handles to the blocks
//! [u64 mi_off][u64 mi_len][u32 ver][u64 magic]   fixed 28-byte footer
//! ```
//!
//! The metaindex maps block **names** to [`BlockHandle`]s; the reader asks
//! for blocks by name and treats each as optional or required per its own
//! rules. Every framed block carries a CRC32 of its content; a mismatch is
//! reported as [`FormatError::ChecksumMismatch`] and surfaces to callers as
//! corruption.
//!
//! This module also owns the two structured blocks the reader decodes
//! itself: [`TableProperties`] and the multi-partition [`OffsetInfo`].
//! All integers are little-endian, fixed width.

#[cfg(test)]
mod tests;

use std::ops::Range;
use std::sync::Arc;

use crc32fast::Hasher as Crc32;
use memmap2::Mmap;
use thiserror::Error;
use tracing::warn;

use crate::ikey::{SequenceNumber, DISABLED_SEQ, MAX_SEQ};

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Magic number closing every table file (`b"ziptable"` read little-endian).
pub const TABLE_MAGIC: u64 = u64::from_le_bytes(*b"ziptable");

/// Current file-format version.
pub const FORMAT_VERSION: u32 = 1;

/// Byte length of the fixed footer.
pub const FOOTER_LEN: usize = 8 + 8 + 4 + 8;

/// Per-block framing overhead: `u32` length prefix + `u32` CRC32 suffix.
pub const BLOCK_FRAME_OVERHEAD: usize = 8;

/// Names of the meta blocks the reader consumes.
pub mod block_names {
    /// Table-wide properties (required).
    pub const PROPERTIES: &str = "properties";
    /// Shared dictionary for the blob store (required).
    pub const VALUE_DICT: &str = "value-dictionary";
    /// Serialized sorted-set key index (required).
    pub const INDEX: &str = "index";
    /// 2-bit-per-record value-type vector (optional).
    pub const VALUE_TYPE: &str = "value-type";
    /// Bytes shared by every user key in the segment (optional).
    pub const COMMON_PREFIX: &str = "common-prefix";
    /// Sorted range deletions (optional).
    pub const RANGE_TOMBSTONE: &str = "range-tombstone";
    /// Opaque licensing blob (optional).
    pub const LICENSE: &str = "license";
    /// Per-partition cumulative offsets, multi-partition tables only.
    pub const OFFSET: &str = "offset";
}

/// Property-map keys recognized for externally-produced tables.
pub mod property_names {
    /// Fixed32 LE external-file format version.
    pub const EXTERNAL_VERSION: &str = "external_sst.version";
    /// Fixed64 LE global sequence number.
    pub const EXTERNAL_GLOBAL_SEQNO: &str = "external_sst.global_seqno";
}

// ------------------------------------------------------------------------------------------------
// Errors
// ------------------------------------------------------------------------------------------------

/// Errors produced while interpreting the file framing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FormatError {
    /// The file is smaller than the structure being read requires.
    #[error("truncated file: need {needed} bytes, have {available}")]
    Truncated {
        /// Bytes the structure requires.
        needed: usize,
        /// Bytes actually present.
        available: usize,
    },

    /// Footer magic did not match [`TABLE_MAGIC`].
    #[error("bad table magic: {0:#018x}")]
    BadMagic(u64),

    /// Footer carried an unsupported format version.
    #[error("unsupported format version: {0}")]
    BadVersion(u32),

    /// A block handle points outside the file.
    #[error("block out of range: offset {offset}, len {len}, file {file_len}")]
    BlockOutOfRange {
        /// Claimed block offset.
        offset: u64,
        /// Claimed block length.
        len: u64,
        /// Actual file length.
        file_len: usize,
    },

    /// A framed block's content CRC32 did not match.
    #[error("block checksum mismatch")]
    ChecksumMismatch,

    /// A mandatory meta block is absent.
    #[error("missing meta block: {0}")]
    MissingBlock(&'static str),

    /// The metaindex, properties, or offset block is structurally invalid.
    #[error("malformed {0} block")]
    Malformed(&'static str),
}

// ------------------------------------------------------------------------------------------------
// Byte views
// ------------------------------------------------------------------------------------------------

/// Backing storage for a [`ByteView`].
#[derive(Clone)]
enum Backing {
    /// The reader's memory-mapped file region.
    Map(Arc<Mmap>),
    /// Heap bytes, used by unit tests and copy-out blocks.
    Owned(Arc<Vec<u8>>),
}

/// A cheaply-cloneable read-only window into the table's byte region.
///
/// The table reader owns one mapping of the whole file; every component
/// below it (index, store, type vector, prefixes) holds a `ByteView` rather
/// than a copy, so reads resolve to pointers into the map.
#[derive(Clone)]
pub struct ByteView {
    backing: Backing,
    start: usize,
    end: usize,
}

impl ByteView {
    /// Wrap a whole memory map.
    pub fn from_mmap(map: Arc<Mmap>) -> Self {
        let end = map.len();
        ByteView {
            backing: Backing::Map(map),
            start: 0,
            end,
        }
    }

    /// Wrap owned bytes (tests, copy-out blocks).
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        let end = bytes.len();
        ByteView {
            backing: Backing::Owned(Arc::new(bytes)),
            start: 0,
            end,
        }
    }

    /// An empty view.
    pub fn empty() -> Self {
        ByteView::from_vec(Vec::new())
    }

    /// The viewed bytes.
    pub fn as_slice(&self) -> &[u8] {
        match &self.backing {
            Backing::Map(m) => &m[self.start..self.end],
            Backing::Owned(v) => &v[self.start..self.end],
        }
    }

    /// Length of the view in bytes.
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// Whether the view is empty.
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// A sub-view of this view. `range` is relative to this view's start.
    pub fn slice(&self, range: Range<usize>) -> ByteView {
        debug_assert!(range.start <= range.end && self.start + range.end <= self.end);
        ByteView {
            backing: self.backing.clone(),
            start: self.start + range.start,
            end: self.start + range.end,
        }
    }

    /// Advise the OS that this range will be needed soon. Best effort.
    pub fn advise_willneed(&self) {
        if let Backing::Map(m) = &self.backing {
            let _ = m.advise_range(memmap2::Advice::WillNeed, self.start, self.len());
        }
    }

    /// Advise the OS that this range will not be needed. Best effort; a
    /// no-op for owned backings and on failure.
    pub fn advise_dontneed(&self) {
        #[cfg(unix)]
        if let Backing::Map(m) = &self.backing {
            // Read-only map: dropping the pages can only force a re-read.
            let _ = unsafe {
                m.unchecked_advise_range(memmap2::UncheckedAdvice::DontNeed, self.start, self.len())
            };
        }
    }
}

impl std::fmt::Debug for ByteView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteView")
            .field("start", &self.start)
            .field("len", &self.len())
            .finish()
    }
}

// ------------------------------------------------------------------------------------------------
// Little-endian read helpers
// ------------------------------------------------------------------------------------------------

pub(crate) fn read_u16(bytes: &[u8], at: usize) -> Option<u16> {
    bytes
        .get(at..at + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
}

pub(crate) fn read_u32(bytes: &[u8], at: usize) -> Option<u32> {
    bytes
        .get(at..at + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

pub(crate) fn read_u64(bytes: &[u8], at: usize) -> Option<u64> {
    bytes.get(at..at + 8).map(|b| {
        u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
    })
}

pub(crate) fn crc32_of(bytes: &[u8]) -> u32 {
    let mut h = Crc32::new();
    h.update(bytes);
    h.finalize()
}

// ------------------------------------------------------------------------------------------------
// Block handles, footer, metaindex
// ------------------------------------------------------------------------------------------------

/// Location of a framed block within the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHandle {
    /// Byte offset of the block's length prefix.
    pub offset: u64,
    /// Total framed length: prefix + content + CRC.
    pub len: u64,
}

/// Parsed metaindex: block name → handle.
#[derive(Debug)]
pub struct MetaIndex {
    entries: Vec<(String, BlockHandle)>,
}

impl MetaIndex {
    /// Look up a block handle by name.
    pub fn find(&self, name: &str) -> Option<BlockHandle> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, h)| *h)
    }

    /// Number of named blocks.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the metaindex is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Read and verify the footer, returning the metaindex handle.
pub fn read_footer(file: &ByteView) -> Result<BlockHandle, FormatError> {
    let bytes = file.as_slice();
    if bytes.len() < FOOTER_LEN {
        return Err(FormatError::Truncated {
            needed: FOOTER_LEN,
            available: bytes.len(),
        });
    }
    let base = bytes.len() - FOOTER_LEN;
    let mi_off = read_u64(bytes, base).ok_or(FormatError::Malformed("footer"))?;
    let mi_len = read_u64(bytes, base + 8).ok_or(FormatError::Malformed("footer"))?;
    let version = read_u32(bytes, base + 16).ok_or(FormatError::Malformed("footer"))?;
    let magic = read_u64(bytes, base + 20).ok_or(FormatError::Malformed("footer"))?;
    if magic != TABLE_MAGIC {
        return Err(FormatError::BadMagic(magic));
    }
    if version != FORMAT_VERSION {
        return Err(FormatError::BadVersion(version));
    }
    Ok(BlockHandle {
        offset: mi_off,
        len: mi_len,
    })
}

/// Read a framed block's content, verifying its CRC32.
pub fn read_block(file: &ByteView, handle: BlockHandle) -> Result<ByteView, FormatError> {
    let file_len = file.len();
    let offset = handle.offset as usize;
    let len = handle.len as usize;
    if len < BLOCK_FRAME_OVERHEAD || offset.checked_add(len).map_or(true, |e| e > file_len) {
        return Err(FormatError::BlockOutOfRange {
            offset: handle.offset,
            len: handle.len,
            file_len,
        });
    }
    let bytes = file.as_slice();
    let content_len =
        read_u32(bytes, offset).ok_or(FormatError::Malformed("block frame"))? as usize;
    if content_len + BLOCK_FRAME_OVERHEAD != len {
        return Err(FormatError::Malformed("block frame"));
    }
    let content = &bytes[offset + 4..offset + 4 + content_len];
    let stored =
        read_u32(bytes, offset + 4 + content_len).ok_or(FormatError::Malformed("block frame"))?;
    if crc32_of(content) != stored {
        return Err(FormatError::ChecksumMismatch);
    }
    Ok(file.slice(offset + 4..offset + 4 + content_len))
}

/// Read the metaindex block named by the footer.
pub fn read_metaindex(file: &ByteView) -> Result<MetaIndex, FormatError> {
    let handle = read_footer(file)?;
    let content = read_block(file, handle)?;
    let bytes = content.as_slice();
    let count = read_u32(bytes, 0).ok_or(FormatError::Malformed("metaindex"))? as usize;
    let mut entries = Vec::with_capacity(count);
    let mut pos = 4;
    for _ in 0..count {
        let name_len = read_u16(bytes, pos).ok_or(FormatError::Malformed("metaindex"))? as usize;
        pos += 2;
        let name_bytes = bytes
            .get(pos..pos + name_len)
            .ok_or(FormatError::Malformed("metaindex"))?;
        let name = std::str::from_utf8(name_bytes)
            .map_err(|_| FormatError::Malformed("metaindex"))?
            .to_owned();
        pos += name_len;
        let offset = read_u64(bytes, pos).ok_or(FormatError::Malformed("metaindex"))?;
        let len = read_u64(bytes, pos + 8).ok_or(FormatError::Malformed("metaindex"))?;
        pos += 16;
        entries.push((name, BlockHandle { offset, len }));
    }
    Ok(MetaIndex { entries })
}

/// Fetch an optional meta block by name.
pub fn read_meta_block(
    file: &ByteView,
    meta: &MetaIndex,
    name: &str,
) -> Result<Option<ByteView>, FormatError> {
    match meta.find(name) {
        Some(handle) => read_block(file, handle).map(Some),
        None => Ok(None),
    }
}

/// Fetch a mandatory meta block by name.
pub fn require_meta_block(
    file: &ByteView,
    meta: &MetaIndex,
    name: &'static str,
) -> Result<ByteView, FormatError> {
    read_meta_block(file, meta, name)?.ok_or(FormatError::MissingBlock(name))
}

/// Serialize a metaindex block (writer side).
pub fn encode_metaindex(entries: &[(&str, BlockHandle)]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    for (name, handle) in entries {
        out.extend_from_slice(&(name.len() as u16).to_le_bytes());
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(&handle.offset.to_le_bytes());
        out.extend_from_slice(&handle.len.to_le_bytes());
    }
    out
}

/// Serialize the fixed footer (writer side).
pub fn encode_footer(metaindex: BlockHandle) -> Vec<u8> {
    let mut out = Vec::with_capacity(FOOTER_LEN);
    out.extend_from_slice(&metaindex.offset.to_le_bytes());
    out.extend_from_slice(&metaindex.len.to_le_bytes());
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(&TABLE_MAGIC.to_le_bytes());
    out
}

// ------------------------------------------------------------------------------------------------
// Table properties
// ------------------------------------------------------------------------------------------------

/// Table-wide properties block.
///
/// `user_collected` is a free-form string→bytes map; the reader interprets
/// the [`property_names`] entries when deriving the global sequence number.
#[derive(Debug, Clone, Default)]
pub struct TableProperties {
    /// Number of internal keys (versions) in the table.
    pub num_entries: u64,
    /// Byte length of the value region `[0, data_size)`.
    pub data_size: u64,
    /// Byte length of the serialized key index.
    pub index_size: u64,
    /// Name of the user comparator the table was built under.
    pub user_comparator: String,
    /// User-collected properties, order preserved.
    pub user_collected: Vec<(String, Vec<u8>)>,
}

impl TableProperties {
    /// Serialize for the `properties` meta block.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.num_entries.to_le_bytes());
        out.extend_from_slice(&self.data_size.to_le_bytes());
        out.extend_from_slice(&self.index_size.to_le_bytes());
        out.extend_from_slice(&(self.user_comparator.len() as u16).to_le_bytes());
        out.extend_from_slice(self.user_comparator.as_bytes());
        out.extend_from_slice(&(self.user_collected.len() as u32).to_le_bytes());
        for (k, v) in &self.user_collected {
            out.extend_from_slice(&(k.len() as u16).to_le_bytes());
            out.extend_from_slice(k.as_bytes());
            out.extend_from_slice(&(v.len() as u32).to_le_bytes());
            out.extend_from_slice(v);
        }
        out
    }

    /// Decode the `properties` meta block.
    pub fn decode(bytes: &[u8]) -> Result<Self, FormatError> {
        let malformed = || FormatError::Malformed("properties");
        let num_entries = read_u64(bytes, 0).ok_or_else(malformed)?;
        let data_size = read_u64(bytes, 8).ok_or_else(malformed)?;
        let index_size = read_u64(bytes, 16).ok_or_else(malformed)?;
        let name_len = read_u16(bytes, 24).ok_or_else(malformed)? as usize;
        let mut pos = 26;
        let name_bytes = bytes.get(pos..pos + name_len).ok_or_else(malformed)?;
        let user_comparator = std::str::from_utf8(name_bytes)
            .map_err(|_| malformed())?
            .to_owned();
        pos += name_len;
        let count = read_u32(bytes, pos).ok_or_else(malformed)? as usize;
        pos += 4;
        let mut user_collected = Vec::with_capacity(count);
        for _ in 0..count {
            let klen = read_u16(bytes, pos).ok_or_else(malformed)? as usize;
            pos += 2;
            let key = std::str::from_utf8(bytes.get(pos..pos + klen).ok_or_else(malformed)?)
                .map_err(|_| malformed())?
                .to_owned();
            pos += klen;
            let vlen = read_u32(bytes, pos).ok_or_else(malformed)? as usize;
            pos += 4;
            let value = bytes.get(pos..pos + vlen).ok_or_else(malformed)?.to_vec();
            pos += vlen;
            user_collected.push((key, value));
        }
        Ok(TableProperties {
            num_entries,
            data_size,
            index_size,
            user_comparator,
            user_collected,
        })
    }

    fn user_property(&self, name: &str) -> Option<&[u8]> {
        self.user_collected
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_slice())
    }

    /// Derive the table's global sequence number.
    ///
    /// Tables not produced by external ingestion carry no
    /// `external_sst.version` property and get [`DISABLED_SEQ`]. A version-1
    /// external file predates global sequence numbers; a recorded seqno on
    /// such a file is malformed but tolerated with a warning. Version ≥ 2
    /// files use the recorded seqno, or [`DISABLED_SEQ`] when none was
    /// recorded.
    pub fn global_seqno(&self) -> SequenceNumber {
        let version = self.user_property(property_names::EXTERNAL_VERSION);
        let seqno = self.user_property(property_names::EXTERNAL_GLOBAL_SEQNO);

        let Some(version_bytes) = version else {
            if seqno.is_some() {
                warn!("non-external table carries a global seqno property");
            }
            return DISABLED_SEQ;
        };
        let version = read_u32(version_bytes, 0).unwrap_or(0);
        if version < 2 {
            if seqno.is_some() || version != 1 {
                warn!(version, "external table below version 2 carries a global seqno property");
            }
            return DISABLED_SEQ;
        }
        let Some(seqno_bytes) = seqno else {
            return DISABLED_SEQ;
        };
        let global_seqno = read_u64(seqno_bytes, 0).unwrap_or(DISABLED_SEQ);
        if global_seqno > MAX_SEQ && global_seqno != DISABLED_SEQ {
            warn!(global_seqno, "global seqno exceeds the maximum sequence number");
        }
        global_seqno
    }
}

// ------------------------------------------------------------------------------------------------
// Multi-partition offset info
// ------------------------------------------------------------------------------------------------

/// Cumulative end offsets for one partition's sub-ranges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartOffsets {
    /// End of this partition's slice of the concatenated index bytes.
    pub key: u64,
    /// End of its slice of the value region.
    pub value: u64,
    /// End of its slice of the concatenated type bytes.
    pub typ: u64,
    /// End of its slice of the concatenated common-prefix bytes.
    pub common_prefix: u64,
}

/// Decoded `offset` meta block for multi-partition tables.
#[derive(Debug)]
pub struct OffsetInfo {
    /// Fixed partition-prefix length.
    pub prefix_len: usize,
    /// Concatenated partition prefixes, `prefix_len` bytes each.
    pub prefix_set: Vec<u8>,
    /// Per-partition cumulative end offsets.
    pub parts: Vec<PartOffsets>,
}

impl OffsetInfo {
    /// Serialize for the `offset` meta block.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(self.parts.len() as u32).to_le_bytes());
        out.extend_from_slice(&(self.prefix_len as u32).to_le_bytes());
        out.extend_from_slice(&self.prefix_set);
        for p in &self.parts {
            out.extend_from_slice(&p.key.to_le_bytes());
            out.extend_from_slice(&p.value.to_le_bytes());
            out.extend_from_slice(&p.typ.to_le_bytes());
            out.extend_from_slice(&p.common_prefix.to_le_bytes());
        }
        out
    }

    /// Decode and structurally validate the `offset` meta block.
    ///
    /// Requires at least one partition, a non-zero prefix length, the exact
    /// serialized byte count, and non-decreasing offsets in every column.
    pub fn decode(bytes: &[u8]) -> Result<Self, FormatError> {
        let malformed = || FormatError::Malformed("offset");
        let part_count = read_u32(bytes, 0).ok_or_else(malformed)? as usize;
        let prefix_len = read_u32(bytes, 4).ok_or_else(malformed)? as usize;
        if part_count == 0 || prefix_len == 0 {
            return Err(malformed());
        }
        let prefix_bytes = part_count
            .checked_mul(prefix_len)
            .ok_or_else(malformed)?;
        let expected = 8usize
            .checked_add(prefix_bytes)
            .and_then(|n| n.checked_add(part_count * 32))
            .ok_or_else(malformed)?;
        if bytes.len() != expected {
            return Err(malformed());
        }
        let prefix_set = bytes[8..8 + prefix_bytes].to_vec();
        let mut parts = Vec::with_capacity(part_count);
        let mut pos = 8 + prefix_bytes;
        let mut last = PartOffsets::default();
        for _ in 0..part_count {
            let part = PartOffsets {
                key: read_u64(bytes, pos).ok_or_else(malformed)?,
                value: read_u64(bytes, pos + 8).ok_or_else(malformed)?,
                typ: read_u64(bytes, pos + 16).ok_or_else(malformed)?,
                common_prefix: read_u64(bytes, pos + 24).ok_or_else(malformed)?,
            };
            if part.key < last.key
                || part.value < last.value
                || part.typ < last.typ
                || part.common_prefix < last.common_prefix
            {
                return Err(malformed());
            }
            last = part;
            pos += 32;
            parts.push(part);
        }
        Ok(OffsetInfo {
            prefix_len,
            prefix_set,
            parts,
        })
    }

    /// Number of partitions.
    pub fn part_count(&self) -> usize {
        self.parts.len()
    }

    /// Partition prefix `i`.
    pub fn prefix(&self, i: usize) -> &[u8] {
        &self.prefix_set[i * self.prefix_len..(i + 1) * self.prefix_len]
    }
}
