//! The sorted-set key index.
//!
//! The index stores every user-key **suffix** of a segment (partition and
//! common prefixes stripped) in bytewise-sorted order and answers two
//! questions:
//!
//! - exact membership: [`KeyIndex::find`] maps a suffix to its record id;
//! - ordered traversal: [`IndexCursor`] walks the suffixes in sorted order
//!   with seek/next/prev, exposing the record id at each position.
//!
//! Record ids equal sorted rank, so the id doubles as the blob-store record
//! number. The serialized form is parsed in place over a [`ByteView`]; no
//! key bytes are copied out of the mapped region.
//!
//! # Serialized layout
//!
//! ```text
//! [u32 count][u32 offsets[count+1]][key bytes][u32 crc32]
//! ```
//!
//! The trailing CRC32 covers everything before it. Offsets are cumulative
//! starts into the key-bytes area; `offsets[count]` is its total length.
//!
//! [`KeyIndex::build_cache`] samples key offsets into a small in-memory
//! table so lookups binary-search a narrow bracket of the mapped file
//! instead of the whole offset array.

#[cfg(test)]
mod tests;

use std::cmp::Ordering;

use thiserror::Error;

use crate::format::{crc32_of, read_u32, ByteView};

/// Errors from index deserialization.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IndexError {
    /// The trailing CRC32 did not match the serialized content.
    #[error("index checksum mismatch")]
    ChecksumMismatch,

    /// The serialized form is shorter than its header demands.
    #[error("truncated index: need {needed} bytes, have {available}")]
    Truncated {
        /// Required byte count.
        needed: usize,
        /// Available byte count.
        available: usize,
    },

    /// Offsets are not non-decreasing or do not close the key area.
    #[error("malformed index offsets")]
    BadOffsets,
}

// ------------------------------------------------------------------------------------------------
// Key index
// ------------------------------------------------------------------------------------------------

/// Immutable sorted-set index over one segment's key suffixes.
pub struct KeyIndex {
    mem: ByteView,
    count: usize,
    /// Byte position of the offsets array within `mem`.
    offsets_at: usize,
    /// Byte position of the key area within `mem`.
    keys_at: usize,
    keys_len: usize,
    /// Sampled `(key offset bracket)` ids, populated by `build_cache`.
    cache: Vec<u32>,
}

impl KeyIndex {
    /// Parse a serialized index from a byte view, verifying its checksum.
    pub fn load(mem: ByteView) -> Result<Self, IndexError> {
        let bytes = mem.as_slice();
        if bytes.len() < 12 {
            return Err(IndexError::Truncated {
                needed: 12,
                available: bytes.len(),
            });
        }
        let body = &bytes[..bytes.len() - 4];
        let stored = read_u32(bytes, bytes.len() - 4).ok_or(IndexError::BadOffsets)?;
        if crc32_of(body) != stored {
            return Err(IndexError::ChecksumMismatch);
        }
        let count = read_u32(bytes, 0).ok_or(IndexError::BadOffsets)? as usize;
        let offsets_at = 4;
        let keys_at = offsets_at + 4 * (count + 1);
        if keys_at > body.len() {
            return Err(IndexError::Truncated {
                needed: keys_at + 4,
                available: bytes.len(),
            });
        }
        let keys_len = body.len() - keys_at;
        let mut prev = 0u32;
        for i in 0..=count {
            let off = read_u32(bytes, offsets_at + 4 * i).ok_or(IndexError::BadOffsets)?;
            if off < prev || off as usize > keys_len {
                return Err(IndexError::BadOffsets);
            }
            prev = off;
        }
        if prev as usize != keys_len {
            return Err(IndexError::BadOffsets);
        }
        Ok(KeyIndex {
            mem,
            count,
            offsets_at,
            keys_at,
            keys_len,
            cache: Vec::new(),
        })
    }

    /// Number of keys (and records) in the segment.
    pub fn num_keys(&self) -> usize {
        self.count
    }

    /// The serialized region backing this index, for page warm-up.
    pub fn mem_region(&self) -> &ByteView {
        &self.mem
    }

    /// Key suffix at sorted rank `id`.
    pub fn key(&self, id: usize) -> &[u8] {
        debug_assert!(id < self.count);
        let bytes = self.mem.as_slice();
        let start = read_u32(bytes, self.offsets_at + 4 * id).unwrap_or(0) as usize;
        let end = read_u32(bytes, self.offsets_at + 4 * (id + 1)).unwrap_or(0) as usize;
        &bytes[self.keys_at + start..self.keys_at + end]
    }

    /// Exact lookup: the record id whose key equals `key`, if any.
    pub fn find(&self, key: &[u8]) -> Option<usize> {
        let id = self.lower_bound(key);
        if id < self.count && self.key(id) == key {
            Some(id)
        } else {
            None
        }
    }

    /// First id whose key is `>= key` bytewise; `num_keys()` when none is.
    pub fn lower_bound(&self, key: &[u8]) -> usize {
        let (mut lo, mut hi) = self.cache_bracket(key);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.key(mid).cmp(key) {
                Ordering::Less => lo = mid + 1,
                _ => hi = mid,
            }
        }
        lo
    }

    /// Build the sampled lookup cache.
    ///
    /// `ratio` is the fraction of keys to sample, clamped to `[0, 1]`; zero
    /// (or an index too small to matter) leaves lookups on the plain binary
    /// search.
    pub fn build_cache(&mut self, ratio: f64) {
        self.cache.clear();
        let ratio = ratio.clamp(0.0, 1.0);
        let samples = (self.count as f64 * ratio) as usize;
        if samples < 2 || self.count < 2 {
            return;
        }
        let step = (self.count + samples - 1) / samples;
        let mut id = 0;
        while id < self.count {
            self.cache.push(id as u32);
            id += step;
        }
    }

    /// Narrow a lookup to the bracket between neighboring cache samples.
    fn cache_bracket(&self, key: &[u8]) -> (usize, usize) {
        if self.cache.is_empty() {
            return (0, self.count);
        }
        let pos = self
            .cache
            .partition_point(|&id| self.key(id as usize) < key);
        let lo = if pos == 0 {
            0
        } else {
            self.cache[pos - 1] as usize
        };
        let hi = if pos == self.cache.len() {
            self.count
        } else {
            // The sampled key at `pos` is >= target, so the bracket may
            // close on it.
            self.cache[pos] as usize + 1
        };
        (lo, hi.min(self.count))
    }

    /// A fresh, initially-invalid ordered cursor.
    pub fn cursor(&self) -> IndexCursor<'_> {
        IndexCursor {
            index: self,
            pos: 0,
            valid: false,
        }
    }
}

impl std::fmt::Debug for KeyIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyIndex")
            .field("count", &self.count)
            .field("keys_len", &self.keys_len)
            .field("cached", &self.cache.len())
            .finish()
    }
}

/// Serialize a sorted key set into index bytes (writer side).
pub fn encode_index(keys: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(keys.len() as u32).to_le_bytes());
    let mut off = 0u32;
    out.extend_from_slice(&off.to_le_bytes());
    for k in keys {
        off += k.len() as u32;
        out.extend_from_slice(&off.to_le_bytes());
    }
    for k in keys {
        out.extend_from_slice(k);
    }
    let crc = crc32_of(&out);
    out.extend_from_slice(&crc.to_le_bytes());
    out
}

// ------------------------------------------------------------------------------------------------
// Ordered cursor
// ------------------------------------------------------------------------------------------------

/// Ordered cursor over an index's sorted keys.
///
/// Movement methods return whether the cursor landed on a key; once they
/// return `false` the cursor is invalid until repositioned. `id()` and
/// `key()` are only meaningful while valid.
pub struct IndexCursor<'a> {
    index: &'a KeyIndex,
    pos: usize,
    valid: bool,
}

impl<'a> IndexCursor<'a> {
    /// Whether the cursor is positioned on a key.
    pub fn valid(&self) -> bool {
        self.valid
    }

    /// Invalidate without repositioning.
    pub fn set_invalid(&mut self) {
        self.valid = false;
    }

    /// Record id at the current position; 0 when invalid.
    pub fn id(&self) -> usize {
        if self.valid {
            self.pos
        } else {
            0
        }
    }

    /// Key suffix at the current position; empty when invalid.
    pub fn key(&self) -> &'a [u8] {
        if self.valid {
            self.index.key(self.pos)
        } else {
            &[]
        }
    }

    /// Move to the first (smallest) key.
    pub fn seek_to_first(&mut self) -> bool {
        self.pos = 0;
        self.valid = self.index.count > 0;
        self.valid
    }

    /// Move to the last (largest) key.
    pub fn seek_to_last(&mut self) -> bool {
        self.valid = self.index.count > 0;
        if self.valid {
            self.pos = self.index.count - 1;
        }
        self.valid
    }

    /// Move to the first key `>= target`; invalid when every key is
    /// smaller.
    pub fn seek(&mut self, target: &[u8]) -> bool {
        self.pos = self.index.lower_bound(target);
        self.valid = self.pos < self.index.count;
        self.valid
    }

    /// Step to the next key in sorted order.
    pub fn next(&mut self) -> bool {
        if !self.valid {
            return false;
        }
        if self.pos + 1 < self.index.count {
            self.pos += 1;
        } else {
            self.valid = false;
        }
        self.valid
    }

    /// Step to the previous key in sorted order.
    pub fn prev(&mut self) -> bool {
        if !self.valid {
            return false;
        }
        if self.pos > 0 {
            self.pos -= 1;
        } else {
            self.valid = false;
        }
        self.valid
    }
}
