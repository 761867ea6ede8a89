//! The blob store: random-access value payloads by record id.
//!
//! The store owns no bytes; it interprets a slice of the table's value
//! region together with the shared dictionary from the `value-dictionary`
//! meta block. Records are prefix-compressed against the dictionary: the
//! encoded form is `[u32 shared_len][tail]`, decoding to
//! `dict[..shared_len] || tail`. Every encoded record carries a CRC32; a
//! mismatch on fetch is [`StoreError::ChecksumMismatch`], which the layers
//! above report as corruption.
//!
//! # Serialized layout
//!
//! ```text
//! [encoded records][u32 offsets[count+1]][u32 crcs[count]][u32 count]
//! ```
//!
//! The trailer-last layout lets a consumer that was handed an arbitrary
//! sub-slice of a larger region (the multi-partition reader) parse its store
//! without out-of-band lengths.

#[cfg(test)]
mod tests;

use thiserror::Error;

use crate::format::{crc32_of, read_u32, ByteView};

/// Errors from blob-store parsing and record fetch.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The serialized store is shorter than its trailer demands.
    #[error("truncated store: need {needed} bytes, have {available}")]
    Truncated {
        /// Required byte count.
        needed: usize,
        /// Available byte count.
        available: usize,
    },

    /// Offsets are not non-decreasing or do not close the payload area.
    #[error("malformed store offsets")]
    BadOffsets,

    /// A record id at or past the record count.
    #[error("record id {id} out of range ({count} records)")]
    BadRecordId {
        /// The offending id.
        id: usize,
        /// Records in the store.
        count: usize,
    },

    /// A record's CRC32 did not match its bytes.
    #[error("record {record} checksum mismatch")]
    ChecksumMismatch {
        /// The corrupt record's id.
        record: usize,
    },

    /// A record's dictionary reference exceeds the dictionary length.
    #[error("record {record} references {shared} dictionary bytes, dictionary has {dict_len}")]
    BadDictRef {
        /// The offending record's id.
        record: usize,
        /// Referenced prefix length.
        shared: usize,
        /// Actual dictionary length.
        dict_len: usize,
    },
}

// ------------------------------------------------------------------------------------------------
// Blob store
// ------------------------------------------------------------------------------------------------

/// Read-only random-access value store over a mapped byte range.
pub struct BlobStore {
    mem: ByteView,
    dict: ByteView,
    count: usize,
    payload_len: usize,
    offsets_at: usize,
    crcs_at: usize,
}

impl BlobStore {
    /// Parse a serialized store from `mem`, pairing it with the shared
    /// dictionary `dict`.
    pub fn load_from_memory(mem: ByteView, dict: ByteView) -> Result<Self, StoreError> {
        let bytes = mem.as_slice();
        if bytes.len() < 8 {
            return Err(StoreError::Truncated {
                needed: 8,
                available: bytes.len(),
            });
        }
        let count = read_u32(bytes, bytes.len() - 4).ok_or(StoreError::BadOffsets)? as usize;
        let trailer = 4 + 4 * count + 4 * (count + 1);
        if bytes.len() < trailer {
            return Err(StoreError::Truncated {
                needed: trailer,
                available: bytes.len(),
            });
        }
        let payload_len = bytes.len() - trailer;
        let offsets_at = payload_len;
        let crcs_at = offsets_at + 4 * (count + 1);
        let mut prev = 0u32;
        for i in 0..=count {
            let off = read_u32(bytes, offsets_at + 4 * i).ok_or(StoreError::BadOffsets)?;
            if off < prev || off as usize > payload_len {
                return Err(StoreError::BadOffsets);
            }
            prev = off;
        }
        if prev as usize != payload_len {
            return Err(StoreError::BadOffsets);
        }
        Ok(BlobStore {
            mem,
            dict,
            count,
            payload_len,
            offsets_at,
            crcs_at,
        })
    }

    /// Number of records.
    pub fn num_records(&self) -> usize {
        self.count
    }

    /// The full store region, for page warm-up.
    pub fn mem_region(&self) -> &ByteView {
        &self.mem
    }

    /// The shared dictionary region.
    pub fn dict_region(&self) -> &ByteView {
        &self.dict
    }

    /// The offsets + CRC trailer region (the store's own lookup tables),
    /// warmed when the index is warmed but values are not.
    pub fn lookup_region(&self) -> ByteView {
        self.mem.slice(self.offsets_at..self.mem.len())
    }

    /// Fetch record `rec`, appending its decoded payload to `buf`.
    ///
    /// Verifies the record's CRC32 before decoding; on any error `buf` is
    /// left exactly as passed in.
    pub fn get_record_append(&self, rec: usize, buf: &mut Vec<u8>) -> Result<(), StoreError> {
        if rec >= self.count {
            return Err(StoreError::BadRecordId {
                id: rec,
                count: self.count,
            });
        }
        let bytes = self.mem.as_slice();
        let start = read_u32(bytes, self.offsets_at + 4 * rec).unwrap_or(0) as usize;
        let end = read_u32(bytes, self.offsets_at + 4 * (rec + 1)).unwrap_or(0) as usize;
        let encoded = &bytes[start..end];
        let stored = read_u32(bytes, self.crcs_at + 4 * rec).unwrap_or(0);
        if crc32_of(encoded) != stored {
            return Err(StoreError::ChecksumMismatch { record: rec });
        }
        let shared = read_u32(encoded, 0).ok_or(StoreError::BadOffsets)? as usize;
        let dict = self.dict.as_slice();
        if shared > dict.len() {
            return Err(StoreError::BadDictRef {
                record: rec,
                shared,
                dict_len: dict.len(),
            });
        }
        buf.extend_from_slice(&dict[..shared]);
        buf.extend_from_slice(&encoded[4..]);
        Ok(())
    }
}

impl std::fmt::Debug for BlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobStore")
            .field("records", &self.count)
            .field("payload_len", &self.payload_len)
            .field("dict_len", &self.dict.len())
            .finish()
    }
}

// ------------------------------------------------------------------------------------------------
// Store builder (writer side)
// ------------------------------------------------------------------------------------------------

/// Accumulates records into serialized store bytes.
pub struct StoreBuilder {
    dict: Vec<u8>,
    payload: Vec<u8>,
    offsets: Vec<u32>,
    crcs: Vec<u32>,
}

impl StoreBuilder {
    /// Start a builder over the given shared dictionary.
    pub fn new(dict: Vec<u8>) -> Self {
        StoreBuilder {
            dict,
            payload: Vec::new(),
            offsets: vec![0],
            crcs: Vec::new(),
        }
    }

    /// Append one record's decoded payload. Records must be added in record
    /// id order.
    pub fn add(&mut self, payload: &[u8]) {
        let shared = payload
            .iter()
            .zip(self.dict.iter())
            .take_while(|(a, b)| a == b)
            .count();
        let start = self.payload.len();
        self.payload.extend_from_slice(&(shared as u32).to_le_bytes());
        self.payload.extend_from_slice(&payload[shared..]);
        self.crcs.push(crc32_of(&self.payload[start..]));
        self.offsets.push(self.payload.len() as u32);
    }

    /// Number of records added so far.
    pub fn num_records(&self) -> usize {
        self.crcs.len()
    }

    /// Finish, producing the serialized store bytes.
    pub fn finish(self) -> Vec<u8> {
        let mut out = self.payload;
        for off in &self.offsets {
            out.extend_from_slice(&off.to_le_bytes());
        }
        for crc in &self.crcs {
            out.extend_from_slice(&crc.to_le_bytes());
        }
        out.extend_from_slice(&(self.crcs.len() as u32).to_le_bytes());
        out
    }

    /// The dictionary this builder compresses against.
    pub fn dict(&self) -> &[u8] {
        &self.dict
    }
}
