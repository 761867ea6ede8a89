//! Internal-key model.
//!
//! An **internal key** is the byte string `user_key || packed8`, where
//! `packed8` is a little-endian 64-bit word packing the entry type into the
//! low 8 bits and the sequence number into the upper 56:
//!
//! ```text
//! packed8 = (sequence << 8) | entry_type
//! ```
//!
//! Sequence numbers therefore top out at [`MAX_SEQ`] `= (1 << 56) - 1`.
//! [`DISABLED_SEQ`] is a sentinel meaning "no global sequence number"; it is
//! never stored inside a key.
//!
//! Keys compare by user key first (under the table's comparator), then by
//! the packed word **descending**, so for the same user key the newest
//! version sorts first.

#[cfg(test)]
mod tests;

use thiserror::Error;

/// Sequence number type; only the low 56 bits are representable on disk.
pub type SequenceNumber = u64;

/// Largest storable sequence number.
pub const MAX_SEQ: SequenceNumber = (1 << 56) - 1;

/// Sentinel: the table carries no global sequence number.
pub const DISABLED_SEQ: SequenceNumber = u64::MAX;

/// Byte length of the packed (sequence, type) trailer.
pub const PACKED_LEN: usize = 8;

/// Errors from internal-key parsing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IkeyError {
    /// The candidate key is shorter than the 8-byte packed trailer.
    #[error("internal key too short: {0} bytes")]
    TooShort(usize),

    /// The packed trailer carried an entry-type byte outside the known set.
    #[error("unknown entry type byte: {0:#x}")]
    UnknownEntryType(u8),
}

/// The record kind carried in an internal key's packed trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryType {
    /// Point deletion.
    Deletion = 0,
    /// Regular value.
    Value = 1,
    /// Merge operand; `get` keeps feeding versions until the visitor has
    /// assembled the full chain.
    Merge = 2,
}

impl EntryType {
    /// Decode an entry-type byte.
    pub fn from_byte(b: u8) -> Result<Self, IkeyError> {
        match b {
            0 => Ok(EntryType::Deletion),
            1 => Ok(EntryType::Value),
            2 => Ok(EntryType::Merge),
            other => Err(IkeyError::UnknownEntryType(other)),
        }
    }
}

/// Pack a sequence number and entry type into the on-disk 64-bit word.
pub fn pack_seq_type(sequence: SequenceNumber, entry_type: EntryType) -> u64 {
    debug_assert!(sequence <= MAX_SEQ);
    (sequence << 8) | entry_type as u64
}

/// Split a packed word back into `(sequence, entry_type)`.
pub fn unpack_seq_type(packed: u64) -> Result<(SequenceNumber, EntryType), IkeyError> {
    let entry_type = EntryType::from_byte((packed & 0xff) as u8)?;
    Ok((packed >> 8, entry_type))
}

/// A borrowed, decomposed internal key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedInternalKey<'a> {
    /// The user-visible key bytes.
    pub user_key: &'a [u8],
    /// Sequence number of this version.
    pub sequence: SequenceNumber,
    /// Record kind.
    pub entry_type: EntryType,
}

/// Parse `user_key || packed8` into its parts.
///
/// Fails with [`IkeyError::TooShort`] when `ikey` has fewer than 8 bytes,
/// and with [`IkeyError::UnknownEntryType`] for an unrecognized type byte.
pub fn parse_internal_key(ikey: &[u8]) -> Result<ParsedInternalKey<'_>, IkeyError> {
    if ikey.len() < PACKED_LEN {
        return Err(IkeyError::TooShort(ikey.len()));
    }
    let split = ikey.len() - PACKED_LEN;
    let mut raw = [0u8; PACKED_LEN];
    raw.copy_from_slice(&ikey[split..]);
    let packed = u64::from_le_bytes(raw);
    let (sequence, entry_type) = unpack_seq_type(packed)?;
    Ok(ParsedInternalKey {
        user_key: &ikey[..split],
        sequence,
        entry_type,
    })
}

/// Append `user_key || packed8` to `buf`.
pub fn append_internal_key(
    buf: &mut Vec<u8>,
    user_key: &[u8],
    sequence: SequenceNumber,
    entry_type: EntryType,
) {
    buf.extend_from_slice(user_key);
    append_packed(buf, sequence, entry_type);
}

/// Append only the packed trailer.
pub fn append_packed(buf: &mut Vec<u8>, sequence: SequenceNumber, entry_type: EntryType) {
    buf.extend_from_slice(&pack_seq_type(sequence, entry_type).to_le_bytes());
}

/// Length of the longest common prefix of `a` and `b`.
pub fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}
