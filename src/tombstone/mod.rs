//! Range-tombstone block facade.
//!
//! The `range-tombstone` meta block holds sorted range-deletion intervals.
//! Unlike every other block, its bytes are **copied out** of the mapped
//! region on open: compaction may hold a tombstone cursor long after the
//! reader (and its mapping) is gone, so the block is an owned,
//! reference-counted object and the cursor keeps an `Arc` to it. After the
//! copy the vacated pages are advised away, a hint the OS is free to
//! ignore.
//!
//! Cursor entries surface in the internal-key shape the merge layers
//! expect: `key() = start_key || packed8(seq, Deletion)` and
//! `value() = end_key`. When the table carries a global sequence number it
//! overrides each interval's recorded sequence.
//!
//! # Block layout
//!
//! ```text
//! [u32 count] { [u32 start_len][start][u32 end_len][end][u64 seq] } × count
//! ```
//!
//! Intervals are sorted by start key.

#[cfg(test)]
mod tests;

use std::sync::Arc;

use thiserror::Error;

use crate::error::TableError;
use crate::format::{read_u32, read_u64, ByteView};
use crate::ikey::{append_packed, parse_internal_key, EntryType, SequenceNumber, DISABLED_SEQ};
use crate::iterator::{PinningContext, TableCursor};

/// Errors from tombstone-block decoding.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TombstoneError {
    /// The block's cell framing is inconsistent with its length.
    #[error("malformed range-tombstone block")]
    Malformed,
}

impl From<TombstoneError> for TableError {
    fn from(e: TombstoneError) -> Self {
        TableError::Corruption(e.to_string())
    }
}

/// One range deletion: keys in `[start_key, end_key)` deleted at `seq`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeTombstone {
    /// Inclusive start of the deleted range.
    pub start_key: Vec<u8>,
    /// Exclusive end of the deleted range.
    pub end_key: Vec<u8>,
    /// Sequence number of the deletion.
    pub seq: SequenceNumber,
}

// ------------------------------------------------------------------------------------------------
// Block
// ------------------------------------------------------------------------------------------------

/// Owned, refcounted copy of a table's range-tombstone block.
#[derive(Debug)]
pub struct TombstoneBlock {
    tombstones: Vec<RangeTombstone>,
    /// The table's global seqno at load time; [`DISABLED_SEQ`] means the
    /// recorded per-interval sequences apply.
    global_seqno: SequenceNumber,
}

impl TombstoneBlock {
    /// Decode the block from the mapped region, copying everything out and
    /// advising the original pages away.
    pub fn detach(block: &ByteView, global_seqno: SequenceNumber) -> Result<Arc<Self>, TableError> {
        let tombstones = Self::decode(block.as_slice())?;
        block.advise_dontneed();
        Ok(Arc::new(TombstoneBlock {
            tombstones,
            global_seqno,
        }))
    }

    fn decode(bytes: &[u8]) -> Result<Vec<RangeTombstone>, TombstoneError> {
        let count = read_u32(bytes, 0).ok_or(TombstoneError::Malformed)? as usize;
        let mut out = Vec::with_capacity(count);
        let mut pos = 4;
        for _ in 0..count {
            let start_len = read_u32(bytes, pos).ok_or(TombstoneError::Malformed)? as usize;
            pos += 4;
            let start_key = bytes
                .get(pos..pos + start_len)
                .ok_or(TombstoneError::Malformed)?
                .to_vec();
            pos += start_len;
            let end_len = read_u32(bytes, pos).ok_or(TombstoneError::Malformed)? as usize;
            pos += 4;
            let end_key = bytes
                .get(pos..pos + end_len)
                .ok_or(TombstoneError::Malformed)?
                .to_vec();
            pos += end_len;
            let seq = read_u64(bytes, pos).ok_or(TombstoneError::Malformed)?;
            pos += 8;
            out.push(RangeTombstone {
                start_key,
                end_key,
                seq,
            });
        }
        if pos != bytes.len() {
            return Err(TombstoneError::Malformed);
        }
        Ok(out)
    }

    /// Number of intervals.
    pub fn len(&self) -> usize {
        self.tombstones.len()
    }

    /// Whether the block holds no intervals.
    pub fn is_empty(&self) -> bool {
        self.tombstones.is_empty()
    }

    /// The interval at `i`.
    pub fn get(&self, i: usize) -> &RangeTombstone {
        &self.tombstones[i]
    }

    /// Effective sequence for interval `i`, applying the global override.
    fn effective_seq(&self, i: usize) -> SequenceNumber {
        if self.global_seqno == DISABLED_SEQ {
            self.tombstones[i].seq
        } else {
            self.global_seqno
        }
    }

    /// Serialize intervals for the `range-tombstone` meta block (writer
    /// side). Input must be sorted by start key.
    pub fn encode(tombstones: &[RangeTombstone]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(tombstones.len() as u32).to_le_bytes());
        for t in tombstones {
            out.extend_from_slice(&(t.start_key.len() as u32).to_le_bytes());
            out.extend_from_slice(&t.start_key);
            out.extend_from_slice(&(t.end_key.len() as u32).to_le_bytes());
            out.extend_from_slice(&t.end_key);
            out.extend_from_slice(&t.seq.to_le_bytes());
        }
        out
    }
}

// ------------------------------------------------------------------------------------------------
// Cursor
// ------------------------------------------------------------------------------------------------

/// Cursor over a tombstone block. Holds its block alive, so it may outlive
/// the reader that produced it.
pub struct TombstoneCursor {
    block: Arc<TombstoneBlock>,
    pos: usize,
    positioned: bool,
    key_buf: Vec<u8>,
    status: Option<TableError>,
}

impl TombstoneCursor {
    /// New, initially-invalid cursor over `block`.
    pub fn new(block: Arc<TombstoneBlock>) -> Self {
        TombstoneCursor {
            block,
            pos: 0,
            positioned: false,
            key_buf: Vec::new(),
            status: None,
        }
    }

    fn materialize(&mut self) {
        let t = self.block.get(self.pos);
        self.key_buf.clear();
        self.key_buf.extend_from_slice(&t.start_key);
        append_packed(
            &mut self.key_buf,
            self.block.effective_seq(self.pos),
            EntryType::Deletion,
        );
    }

    fn position(&mut self, pos: usize) {
        if pos < self.block.len() {
            self.pos = pos;
            self.positioned = true;
            self.materialize();
        } else {
            self.positioned = false;
        }
    }
}

impl TableCursor for TombstoneCursor {
    fn valid(&self) -> bool {
        self.positioned
    }

    fn seek_to_first(&mut self) {
        self.position(0);
    }

    fn seek_to_last(&mut self) {
        if self.block.is_empty() {
            self.positioned = false;
        } else {
            self.position(self.block.len() - 1);
        }
    }

    fn seek(&mut self, target: &[u8]) {
        let pikey = match parse_internal_key(target) {
            Ok(p) => p,
            Err(e) => {
                self.status = Some(TableError::InvalidArgument(e.to_string()));
                self.positioned = false;
                return;
            }
        };
        let pos = self
            .block
            .tombstones
            .partition_point(|t| t.start_key.as_slice() < pikey.user_key);
        self.position(pos);
    }

    fn seek_for_prev(&mut self, target: &[u8]) {
        let pikey = match parse_internal_key(target) {
            Ok(p) => p,
            Err(e) => {
                self.status = Some(TableError::InvalidArgument(e.to_string()));
                self.positioned = false;
                return;
            }
        };
        let pos = self
            .block
            .tombstones
            .partition_point(|t| t.start_key.as_slice() <= pikey.user_key);
        if pos == 0 {
            self.positioned = false;
        } else {
            self.position(pos - 1);
        }
    }

    fn next(&mut self) {
        if self.positioned {
            self.position(self.pos + 1);
        }
    }

    fn prev(&mut self) {
        if !self.positioned {
            return;
        }
        if self.pos == 0 {
            self.positioned = false;
        } else {
            self.position(self.pos - 1);
        }
    }

    fn key(&self) -> &[u8] {
        if self.positioned {
            &self.key_buf
        } else {
            &[]
        }
    }

    fn value(&self) -> &[u8] {
        if self.positioned {
            &self.block.get(self.pos).end_key
        } else {
            &[]
        }
    }

    fn status(&self) -> Option<&TableError> {
        self.status.as_ref()
    }

    fn set_pinning(&mut self, _mgr: Option<Arc<dyn PinningContext>>) {
        // entries live in the refcounted block; nothing to retain
    }
}
