//! Ordered cursors over a table's internal keys.
//!
//! [`TableCursor`] is the public cursor contract; [`TableIterator`] is the
//! one state machine behind every variant the reader hands out. The
//! variants share all of their logic and differ along three axes:
//!
//! - **direction** — a `reverse` flag flips the index-cursor primitives
//!   (first↔last, next↔prev) so the public order is the table's
//!   reverse-bytewise order while the caller still drives the cursor with
//!   its own notion of next/prev;
//! - **key transform** — the fixed-width-integer comparator stores keys
//!   big-endian but talks to callers in host-endian form, so seek targets
//!   are byte-swapped on the way in and materialized keys on the way out;
//! - **segment source** — a single segment, or a [`SegmentIndex`] whose
//!   cursor hops to the adjacent partition when the inner index runs off
//!   either end.
//!
//! # Position state
//!
//! A valid cursor sits on one *version* of one record: the index cursor
//! provides the key suffix and record id, the fetched record provides
//! between one and many versions (`Multi` records expand to several,
//! newest first), and `val_idx` selects the current one. `next` first walks
//! versions within the record, then steps the index.
//!
//! # Failure
//!
//! A checksum failure while fetching a record makes the cursor invalid and
//! parks a corruption status that `status()` keeps reporting; movement on an
//! invalid cursor is a no-op. Callers are expected to check `status()`
//! whenever `valid()` turns false.
//!
//! # Pinning
//!
//! When a [`PinningContext`] is attached and enabled, any internal buffer
//! about to be reused is pushed onto a retained list instead, so bytes
//! previously surfaced through `key()`/`value()` stay allocated until the
//! manager is detached or replaced.

#[cfg(test)]
mod tests;

use std::cmp::Ordering;
use std::ops::Range;
use std::sync::Arc;

use crate::error::TableError;
use crate::ikey::{
    append_packed, common_prefix_len, parse_internal_key, EntryType, SequenceNumber, PACKED_LEN,
};
use crate::segment::{read_packed, Segment, SegmentIndex};
use crate::store::StoreError;
use crate::value::{MultiValue, ValueTag};

// ------------------------------------------------------------------------------------------------
// Public contract
// ------------------------------------------------------------------------------------------------

/// Caller-provided pinning capability.
///
/// The cursor never calls anything but the predicate; it only keeps buffers
/// alive while an enabled context is attached.
pub trait PinningContext: Send + Sync {
    /// Whether buffers should currently be retained.
    fn pinning_enabled(&self) -> bool;
}

/// Bidirectional cursor over internal keys in the table's sort order.
pub trait TableCursor {
    /// Whether the cursor is positioned on an entry.
    fn valid(&self) -> bool;
    /// Position on the first entry in table order.
    fn seek_to_first(&mut self);
    /// Position on the last entry in table order.
    fn seek_to_last(&mut self);
    /// Position on the first entry at or after `target` (an internal key)
    /// in table order.
    fn seek(&mut self, target: &[u8]);
    /// Position on the last entry at or before `target` in table order.
    fn seek_for_prev(&mut self, target: &[u8]);
    /// Step forward in table order.
    fn next(&mut self);
    /// Step backward in table order.
    fn prev(&mut self);
    /// Current internal key; empty when invalid.
    fn key(&self) -> &[u8];
    /// Current user value; empty when invalid or for deletions.
    fn value(&self) -> &[u8];
    /// The sticky error, if any movement failed.
    fn status(&self) -> Option<&TableError>;
    /// Attach or detach a pinning context. Replacing or detaching releases
    /// previously retained buffers.
    fn set_pinning(&mut self, mgr: Option<Arc<dyn PinningContext>>);
}

// ------------------------------------------------------------------------------------------------
// Segment source
// ------------------------------------------------------------------------------------------------

/// Where the iterator's segments come from.
#[derive(Clone, Copy)]
enum SegmentSource<'a> {
    /// The whole table is one segment.
    Single(&'a Segment),
    /// Partitioned table; the cursor threads across segments.
    Multi(&'a SegmentIndex),
}

// ------------------------------------------------------------------------------------------------
// Table iterator
// ------------------------------------------------------------------------------------------------

/// The shared cursor state machine. See the module docs for the axes of
/// variation.
pub struct TableIterator<'a> {
    source: SegmentSource<'a>,
    segment: Option<&'a Segment>,
    cursor: Option<crate::index::IndexCursor<'a>>,
    global_seqno: SequenceNumber,
    reverse: bool,
    u64_keys: bool,

    /// Tag of the record under the index cursor.
    tag: ValueTag,
    /// Fetched record bytes.
    val_buf: Vec<u8>,
    /// For `Multi` records: byte range of each version within `val_buf`,
    /// packed trailer included.
    val_ranges: Vec<Range<usize>>,
    val_count: usize,
    val_idx: usize,

    /// Materialized current internal key.
    key_buf: Vec<u8>,
    /// Current user value within `val_buf`.
    value_range: Range<usize>,
    /// Parsed sequence of the current version.
    seq: SequenceNumber,

    status: Option<TableError>,
    pinning: Option<Arc<dyn PinningContext>>,
    pinned: Vec<Vec<u8>>,
}

impl<'a> TableIterator<'a> {
    /// Cursor over a single-segment table.
    pub(crate) fn new_single(
        segment: &'a Segment,
        global_seqno: SequenceNumber,
        reverse: bool,
        u64_keys: bool,
    ) -> Self {
        TableIterator {
            source: SegmentSource::Single(segment),
            segment: Some(segment),
            cursor: Some(segment.index().cursor()),
            global_seqno,
            reverse,
            u64_keys,
            tag: ValueTag::ZeroSeq,
            val_buf: Vec::new(),
            val_ranges: Vec::new(),
            val_count: 0,
            val_idx: 0,
            key_buf: Vec::new(),
            value_range: 0..0,
            seq: 0,
            status: None,
            pinning: None,
            pinned: Vec::new(),
        }
    }

    /// Cursor stitching a multi-partition table into one ordered stream.
    pub(crate) fn new_multi(
        segments: &'a SegmentIndex,
        global_seqno: SequenceNumber,
        reverse: bool,
    ) -> Self {
        TableIterator {
            source: SegmentSource::Multi(segments),
            segment: None,
            cursor: None,
            global_seqno,
            reverse,
            u64_keys: false,
            tag: ValueTag::ZeroSeq,
            val_buf: Vec::new(),
            val_ranges: Vec::new(),
            val_count: 0,
            val_idx: 0,
            key_buf: Vec::new(),
            value_range: 0..0,
            seq: 0,
            status: None,
            pinning: None,
            pinned: Vec::new(),
        }
    }

    /// Number of buffers currently retained for pinning.
    pub(crate) fn pinned_count(&self) -> usize {
        self.pinned.len()
    }

    // --------------------------------------------------------------------
    // Pinning
    // --------------------------------------------------------------------

    fn pinning_enabled(&self) -> bool {
        self.pinning.as_ref().map_or(false, |m| m.pinning_enabled())
    }

    fn try_pin_key_buf(&mut self) {
        if self.pinning_enabled() {
            let buf = std::mem::take(&mut self.key_buf);
            self.pinned.push(buf);
        }
    }

    fn try_pin_val_buf(&mut self) {
        if self.pinning_enabled() {
            let buf = std::mem::take(&mut self.val_buf);
            self.pinned.push(buf);
        }
    }

    // --------------------------------------------------------------------
    // Invalidation
    // --------------------------------------------------------------------

    fn set_invalid(&mut self) {
        self.try_pin_key_buf();
        match self.source {
            SegmentSource::Single(_) => {
                if let Some(c) = self.cursor.as_mut() {
                    c.set_invalid();
                }
            }
            SegmentSource::Multi(_) => {
                self.segment = None;
                self.cursor = None;
            }
        }
        self.val_idx = 0;
        self.val_count = 0;
        self.key_buf.clear();
        self.value_range = 0..0;
    }

    fn is_positioned(&self) -> bool {
        self.cursor.as_ref().map_or(false, |c| c.valid())
    }

    // --------------------------------------------------------------------
    // Index-cursor primitives (direction- and source-aware)
    // --------------------------------------------------------------------

    /// Move the index cursor to the table-order first key.
    fn index_seek_to_first(&mut self) -> bool {
        self.try_pin_key_buf();
        match self.source {
            SegmentSource::Single(_) => {
                let reverse = self.reverse;
                match self.cursor.as_mut() {
                    Some(c) if reverse => c.seek_to_last(),
                    Some(c) => c.seek_to_first(),
                    None => false,
                }
            }
            SegmentSource::Multi(si) => {
                if self.reverse {
                    self.enter_segment(si.segment_at(si.segment_count() - 1), false)
                } else {
                    self.enter_segment(si.segment_at(0), true)
                }
            }
        }
    }

    /// Move the index cursor to the table-order last key.
    fn index_seek_to_last(&mut self) -> bool {
        self.try_pin_key_buf();
        match self.source {
            SegmentSource::Single(_) => {
                let reverse = self.reverse;
                match self.cursor.as_mut() {
                    Some(c) if reverse => c.seek_to_first(),
                    Some(c) => c.seek_to_last(),
                    None => false,
                }
            }
            SegmentSource::Multi(si) => {
                if self.reverse {
                    self.enter_segment(si.segment_at(0), true)
                } else {
                    self.enter_segment(si.segment_at(si.segment_count() - 1), false)
                }
            }
        }
    }

    /// Step the index cursor one key forward in table order, hopping
    /// segments at a boundary.
    fn index_next(&mut self) -> bool {
        self.try_pin_key_buf();
        let reverse = self.reverse;
        match self.source {
            SegmentSource::Single(_) => match self.cursor.as_mut() {
                Some(c) if reverse => c.prev(),
                Some(c) => c.next(),
                None => false,
            },
            SegmentSource::Multi(si) => {
                let stepped = match self.cursor.as_mut() {
                    Some(c) if reverse => c.prev(),
                    Some(c) => c.next(),
                    None => return false,
                };
                if stepped {
                    return true;
                }
                let Some(seg) = self.segment else { return false };
                if reverse {
                    if seg.ordinal() == 0 {
                        return false;
                    }
                    self.enter_segment(si.segment_at(seg.ordinal() - 1), false)
                } else {
                    if seg.ordinal() + 1 == si.segment_count() {
                        return false;
                    }
                    self.enter_segment(si.segment_at(seg.ordinal() + 1), true)
                }
            }
        }
    }

    /// Step the index cursor one key backward in table order, hopping
    /// segments at a boundary.
    fn index_prev(&mut self) -> bool {
        self.try_pin_key_buf();
        let reverse = self.reverse;
        match self.source {
            SegmentSource::Single(_) => match self.cursor.as_mut() {
                Some(c) if reverse => c.next(),
                Some(c) => c.prev(),
                None => false,
            },
            SegmentSource::Multi(si) => {
                let stepped = match self.cursor.as_mut() {
                    Some(c) if reverse => c.next(),
                    Some(c) => c.prev(),
                    None => return false,
                };
                if stepped {
                    return true;
                }
                let Some(seg) = self.segment else { return false };
                if reverse {
                    if seg.ordinal() + 1 == si.segment_count() {
                        return false;
                    }
                    self.enter_segment(si.segment_at(seg.ordinal() + 1), true)
                } else {
                    if seg.ordinal() == 0 {
                        return false;
                    }
                    self.enter_segment(si.segment_at(seg.ordinal() - 1), false)
                }
            }
        }
    }

    /// Make `segment` current with a fresh cursor positioned at its first
    /// (`at_first`) or last key.
    fn enter_segment(&mut self, segment: &'a Segment, at_first: bool) -> bool {
        self.segment = Some(segment);
        let mut cursor = segment.index().cursor();
        let ok = if at_first {
            cursor.seek_to_first()
        } else {
            cursor.seek_to_last()
        };
        self.cursor = Some(cursor);
        ok
    }

    // --------------------------------------------------------------------
    // Record fetch and decode
    // --------------------------------------------------------------------

    /// Fetch the record under the index cursor and prepare its version
    /// list. `has_record == false` (the index cursor ran off the end)
    /// invalidates the iterator instead.
    fn unzip_record(&mut self, has_record: bool) -> bool {
        if !has_record {
            self.set_invalid();
            return false;
        }
        let Some(seg) = self.segment else {
            self.set_invalid();
            return false;
        };
        let rec = self.cursor.as_ref().map_or(0, |c| c.id());
        self.tag = seg.types().get(rec);
        self.try_pin_val_buf();
        self.val_buf.clear();
        if let Err(e) = seg.store().get_record_append(rec, &mut self.val_buf) {
            self.set_invalid();
            self.status = Some(match e {
                StoreError::ChecksumMismatch { .. } => TableError::Corruption(e.to_string()),
                other => other.into(),
            });
            return false;
        }
        self.val_ranges.clear();
        if self.tag == ValueTag::Multi {
            let ranges = MultiValue::decode(&self.val_buf)
                .map(|multi| (0..multi.len()).map(|i| multi.frame_range(i)).collect::<Vec<_>>());
            match ranges {
                Ok(ranges) => {
                    self.val_count = ranges.len();
                    self.val_ranges = ranges;
                }
                Err(e) => {
                    self.set_invalid();
                    self.status = Some(e.into());
                    return false;
                }
            }
        } else {
            self.val_count = 1;
        }
        self.val_idx = 0;
        true
    }

    /// Decode the version selected by `val_idx` and materialize the current
    /// internal key.
    fn decode_current(&mut self) {
        let Some(seg) = self.segment else { return };
        let (seq, entry_type, value_range) = match self.tag {
            ValueTag::ZeroSeq => (self.global_seqno, EntryType::Value, 0..self.val_buf.len()),
            ValueTag::Value => match read_packed(&self.val_buf) {
                Ok((seq, _)) => (seq, EntryType::Value, PACKED_LEN..self.val_buf.len()),
                Err(e) => {
                    self.set_invalid();
                    self.status = Some(e);
                    return;
                }
            },
            ValueTag::Delete => match read_packed(&self.val_buf) {
                Ok((seq, _)) => (seq, EntryType::Deletion, 0..0),
                Err(e) => {
                    self.set_invalid();
                    self.status = Some(e);
                    return;
                }
            },
            ValueTag::Multi => {
                let range = self.val_ranges[self.val_idx].clone();
                match read_packed(&self.val_buf[range.clone()]) {
                    Ok((seq, entry_type)) => {
                        (seq, entry_type, range.start + PACKED_LEN..range.end)
                    }
                    Err(e) => {
                        self.set_invalid();
                        self.status = Some(e);
                        return;
                    }
                }
            }
        };
        self.seq = seq;
        self.value_range = value_range;

        self.key_buf.clear();
        self.key_buf.extend_from_slice(seg.partition_prefix());
        self.key_buf.extend_from_slice(seg.common_prefix());
        let suffix = self.cursor.as_ref().map_or(&[][..], |c| c.key());
        self.key_buf.extend_from_slice(suffix);
        append_packed(&mut self.key_buf, seq, entry_type);
        if self.u64_keys && self.key_buf.len() == 8 + PACKED_LEN {
            // stored big-endian, surfaced host-endian
            self.key_buf[..8].reverse();
        }
    }

    // --------------------------------------------------------------------
    // Seek
    // --------------------------------------------------------------------

    /// Seek within the current segment; `user_key` has the partition prefix
    /// already stripped.
    fn seek_internal(&mut self, user_key: &[u8], seq_bound: SequenceNumber) {
        self.try_pin_key_buf();
        let Some(seg) = self.segment else {
            self.set_invalid();
            return;
        };
        let cp = seg.common_prefix();
        let cplen = common_prefix_len(user_key, cp);
        if cplen != cp.len() {
            // The target diverges from the common prefix: every key in this
            // segment sorts entirely before or entirely after it. Position
            // within this segment only; the caller rolls to a neighbor when
            // the cursor ends up past its edge.
            let target_first = if user_key.len() == cplen {
                !self.reverse
            } else {
                (user_key[cplen] < cp[cplen]) ^ self.reverse
            };
            let has_record = match self.source {
                SegmentSource::Single(_) => {
                    if target_first {
                        self.index_seek_to_first()
                    } else {
                        self.index_seek_to_last()
                    }
                }
                SegmentSource::Multi(_) => {
                    // at_first is in bytewise terms: the segment's
                    // table-order first key is its bytewise last under the
                    // reverse comparator.
                    self.enter_segment(seg, target_first ^ self.reverse)
                }
            };
            if self.unzip_record(has_record) {
                if target_first {
                    self.decode_current();
                } else {
                    self.val_idx = self.val_count - 1;
                    self.decode_current();
                    self.next();
                }
            }
            return;
        }

        let suffix = &user_key[cplen..];
        let reverse = self.reverse;
        let mut cmp = Ordering::Equal;
        let has_record = match self.cursor.as_mut() {
            None => false,
            Some(cursor) if reverse => {
                let mut ok = cursor.seek(suffix);
                if !ok {
                    // target sorts after every stored key, so in reverse
                    // order it lands on the largest one
                    ok = cursor.seek_to_last();
                    cmp = Ordering::Less;
                } else {
                    cmp = cursor.key().cmp(suffix);
                    if cmp != Ordering::Equal {
                        ok = cursor.prev();
                    }
                }
                ok
            }
            Some(cursor) => {
                let ok = cursor.seek(suffix);
                if ok {
                    cmp = cursor.key().cmp(suffix);
                }
                ok
            }
        };

        if self.unzip_record(has_record) {
            if cmp == Ordering::Equal {
                // Exact user-key match: walk versions newest→oldest for the
                // first one visible at the target's sequence bound.
                loop {
                    self.decode_current();
                    if !self.valid() {
                        return;
                    }
                    if self.seq <= seq_bound {
                        return;
                    }
                    if self.val_idx + 1 < self.val_count {
                        self.val_idx += 1;
                    } else {
                        break;
                    }
                }
                // No visible version; the next entry in table order is the
                // answer.
                self.next();
            } else {
                self.decode_current();
            }
        }
    }

    /// Compare two internal keys under the table's order.
    fn cmp_internal(&self, a: &[u8], b: &[u8]) -> Ordering {
        let (a_user, a_packed) = split_internal(a);
        let (b_user, b_packed) = split_internal(b);
        let user = if self.u64_keys {
            u64_of(a_user).cmp(&u64_of(b_user))
        } else if self.reverse {
            b_user.cmp(a_user)
        } else {
            a_user.cmp(b_user)
        };
        user.then_with(|| b_packed.cmp(&a_packed))
    }
}

impl TableCursor for TableIterator<'_> {
    fn valid(&self) -> bool {
        self.is_positioned()
    }

    fn seek_to_first(&mut self) {
        let has = self.index_seek_to_first();
        if self.unzip_record(has) {
            self.decode_current();
        }
    }

    fn seek_to_last(&mut self) {
        let has = self.index_seek_to_last();
        if self.unzip_record(has) {
            self.val_idx = self.val_count - 1;
            self.decode_current();
        }
    }

    fn seek(&mut self, target: &[u8]) {
        let pikey = match parse_internal_key(target) {
            Ok(p) => p,
            Err(e) => {
                self.status = Some(TableError::InvalidArgument(e.to_string()));
                self.set_invalid();
                return;
            }
        };
        let mut swapped = [0u8; 8];
        let user_key: &[u8] = if self.u64_keys {
            if pikey.user_key.len() != 8 {
                self.status = Some(TableError::InvalidArgument(format!(
                    "u64-comparator key must be 8 bytes, got {}",
                    pikey.user_key.len()
                )));
                self.set_invalid();
                return;
            }
            swapped.copy_from_slice(pikey.user_key);
            swapped.reverse();
            &swapped
        } else {
            pikey.user_key
        };

        match self.source {
            SegmentSource::Single(_) => self.seek_internal(user_key, pikey.sequence),
            SegmentSource::Multi(si) => {
                let Some(seg) = si.get_segment(user_key) else {
                    self.set_invalid();
                    return;
                };
                let ordinal = seg.ordinal();
                let stripped = &user_key[seg.partition_prefix().len().min(user_key.len())..];
                let same = self.segment.map_or(false, |cur| std::ptr::eq(cur, seg));
                if !same {
                    self.segment = Some(seg);
                    self.cursor = Some(seg.index().cursor());
                }
                self.seek_internal(stripped, pikey.sequence);
                if !self.valid() {
                    // The target sat past this partition's keys; continue in
                    // the adjacent one.
                    if self.reverse {
                        if ordinal != 0 {
                            let has = self.enter_segment(si.segment_at(ordinal - 1), false);
                            if self.unzip_record(has) {
                                self.val_idx = self.val_count - 1;
                                self.decode_current();
                            }
                        }
                    } else if ordinal + 1 != si.segment_count() {
                        let has = self.enter_segment(si.segment_at(ordinal + 1), true);
                        if self.unzip_record(has) {
                            self.decode_current();
                        }
                    }
                }
            }
        }
    }

    fn seek_for_prev(&mut self, target: &[u8]) {
        if let Err(e) = parse_internal_key(target) {
            self.status = Some(TableError::InvalidArgument(e.to_string()));
            self.set_invalid();
            return;
        }
        self.seek(target);
        if !self.valid() {
            self.seek_to_last();
        }
        while self.valid() && self.cmp_internal(target, self.key()) == Ordering::Less {
            self.prev();
        }
    }

    fn next(&mut self) {
        if !self.valid() {
            return;
        }
        if self.val_idx + 1 < self.val_count {
            self.val_idx += 1;
            self.decode_current();
        } else {
            let has = self.index_next();
            if self.unzip_record(has) {
                self.decode_current();
            }
        }
    }

    fn prev(&mut self) {
        if !self.valid() {
            return;
        }
        if self.val_idx > 0 {
            self.val_idx -= 1;
            self.decode_current();
        } else {
            let has = self.index_prev();
            if self.unzip_record(has) {
                self.val_idx = self.val_count - 1;
                self.decode_current();
            }
        }
    }

    fn key(&self) -> &[u8] {
        if self.valid() {
            &self.key_buf
        } else {
            &[]
        }
    }

    fn value(&self) -> &[u8] {
        if self.valid() {
            &self.val_buf[self.value_range.clone()]
        } else {
            &[]
        }
    }

    fn status(&self) -> Option<&TableError> {
        self.status.as_ref()
    }

    fn set_pinning(&mut self, mgr: Option<Arc<dyn PinningContext>>) {
        let release = match (&self.pinning, &mgr) {
            (Some(old), Some(new)) => !Arc::ptr_eq(old, new),
            (Some(_), None) => true,
            _ => false,
        };
        if release {
            self.pinned.clear();
        }
        self.pinning = mgr;
    }
}

// ------------------------------------------------------------------------------------------------
// Empty cursor
// ------------------------------------------------------------------------------------------------

/// Cursor for a table with no keys: permanently invalid, every movement a
/// no-op.
#[derive(Default)]
pub struct EmptyCursor {
    status: Option<TableError>,
}

impl TableCursor for EmptyCursor {
    fn valid(&self) -> bool {
        false
    }
    fn seek_to_first(&mut self) {}
    fn seek_to_last(&mut self) {}
    fn seek(&mut self, target: &[u8]) {
        if let Err(e) = parse_internal_key(target) {
            self.status = Some(TableError::InvalidArgument(e.to_string()));
        }
    }
    fn seek_for_prev(&mut self, target: &[u8]) {
        self.seek(target);
    }
    fn next(&mut self) {}
    fn prev(&mut self) {}
    fn key(&self) -> &[u8] {
        &[]
    }
    fn value(&self) -> &[u8] {
        &[]
    }
    fn status(&self) -> Option<&TableError> {
        self.status.as_ref()
    }
    fn set_pinning(&mut self, _mgr: Option<Arc<dyn PinningContext>>) {}
}

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

fn split_internal(ikey: &[u8]) -> (&[u8], u64) {
    if ikey.len() < PACKED_LEN {
        return (ikey, 0);
    }
    let split = ikey.len() - PACKED_LEN;
    let mut raw = [0u8; PACKED_LEN];
    raw.copy_from_slice(&ikey[split..]);
    (&ikey[..split], u64::from_le_bytes(raw))
}

fn u64_of(user_key: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    let take = user_key.len().min(8);
    raw[..take].copy_from_slice(&user_key[..take]);
    u64::from_le_bytes(raw)
}
