//! Table file writer.
//!
//! Produces well-formed table files for the test suite, benches, and
//! tooling: sorted entries with the common prefix factored out, per-record
//! value-tag election, multi-version frames, a shared dictionary, optional
//! range tombstones and license blob, and (for [`MultiTableBuilder`]) the
//! partitioned layout with its offset block. There is deliberately no
//! tuning surface here; the production write path lives with the engine's
//! flush/compaction machinery, not in this crate.
//!
//! # Tag election
//!
//! | Versions of a key | Tag |
//! |---|---|
//! | one `Value` at sequence 0 | `ZeroSeq` (the reader re-stamps it with the global seqno) |
//! | one `Value` at sequence > 0 | `Value` |
//! | one `Deletion` | `Delete` |
//! | anything else (several versions, or a `Merge`) | `Multi` |
//!
//! Files are written to a `.tmp` sibling, fsynced, then renamed into
//! place.

#[cfg(test)]
mod tests;

use std::fs::{rename, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::TableError;
use crate::format::{
    block_names, crc32_of, encode_footer, encode_metaindex, property_names, BlockHandle,
    OffsetInfo, PartOffsets, TableProperties, BLOCK_FRAME_OVERHEAD,
};
use crate::ikey::{pack_seq_type, EntryType, SequenceNumber, MAX_SEQ};
use crate::index::encode_index;
use crate::reader::BYTEWISE_COMPARATOR_NAME;
use crate::store::StoreBuilder;
use crate::tombstone::{RangeTombstone, TombstoneBlock};
use crate::value::{encode_multi, TypeVec, ValueTag};

// ------------------------------------------------------------------------------------------------
// Input model
// ------------------------------------------------------------------------------------------------

/// One version of a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    /// Sequence number of this version.
    pub sequence: SequenceNumber,
    /// Record kind.
    pub entry_type: EntryType,
    /// User value; empty for deletions.
    pub value: Vec<u8>,
}

/// All versions of one user key.
#[derive(Debug, Clone)]
pub struct KeyVersions {
    /// Full user key, prefixes included.
    pub user_key: Vec<u8>,
    /// Versions; the builder orders them newest first.
    pub versions: Vec<Version>,
}

/// Bytes of one built partition.
#[derive(Debug)]
pub(crate) struct PartitionBytes {
    pub(crate) index: Vec<u8>,
    pub(crate) store: Vec<u8>,
    pub(crate) types: Vec<u8>,
    pub(crate) num_entries: u64,
}

// ------------------------------------------------------------------------------------------------
// Single-table builder
// ------------------------------------------------------------------------------------------------

/// Builder for a single-partition table file.
pub struct TableBuilder {
    path: PathBuf,
    common_prefix: Vec<u8>,
    dictionary: Vec<u8>,
    comparator: String,
    user_properties: Vec<(String, Vec<u8>)>,
    tombstones: Vec<RangeTombstone>,
    license: Option<Vec<u8>>,
    entries: Vec<KeyVersions>,
    omit_common_prefix_block: bool,
}

impl TableBuilder {
    /// Start a builder targeting `path`.
    pub fn new(path: impl AsRef<Path>) -> Self {
        TableBuilder {
            path: path.as_ref().to_path_buf(),
            common_prefix: Vec::new(),
            dictionary: Vec::new(),
            comparator: BYTEWISE_COMPARATOR_NAME.to_owned(),
            user_properties: Vec::new(),
            tombstones: Vec::new(),
            license: None,
            entries: Vec::new(),
            omit_common_prefix_block: false,
        }
    }

    /// Set the common prefix shared by every key.
    pub fn common_prefix(mut self, prefix: &[u8]) -> Self {
        self.common_prefix = prefix.to_vec();
        self
    }

    /// Set the shared value dictionary.
    pub fn dictionary(mut self, dict: &[u8]) -> Self {
        self.dictionary = dict.to_vec();
        self
    }

    /// Set the recorded user-comparator name.
    pub fn comparator(mut self, name: &str) -> Self {
        self.comparator = name.to_owned();
        self
    }

    /// Record a raw user property.
    pub fn property(mut self, key: &str, value: Vec<u8>) -> Self {
        self.user_properties.push((key.to_owned(), value));
        self
    }

    /// Mark the table as externally produced (format version 2) with the
    /// given global sequence number.
    pub fn global_seqno(self, seqno: SequenceNumber) -> Self {
        self.property(property_names::EXTERNAL_VERSION, 2u32.to_le_bytes().to_vec())
            .property(
                property_names::EXTERNAL_GLOBAL_SEQNO,
                seqno.to_le_bytes().to_vec(),
            )
    }

    /// Add range tombstones, sorted by start key.
    pub fn range_tombstones(mut self, tombstones: Vec<RangeTombstone>) -> Self {
        self.tombstones = tombstones;
        self
    }

    /// Attach an opaque license blob.
    pub fn license_blob(mut self, blob: Vec<u8>) -> Self {
        self.license = Some(blob);
        self
    }

    /// Skip writing the common-prefix block even when one is set, the way
    /// older files were laid out.
    pub fn omit_common_prefix_block(mut self) -> Self {
        self.omit_common_prefix_block = true;
        self
    }

    /// Add every version of one key at once.
    pub fn add_key(mut self, user_key: &[u8], versions: Vec<Version>) -> Self {
        self.entries.push(KeyVersions {
            user_key: user_key.to_vec(),
            versions,
        });
        self
    }

    /// Add a single value version.
    pub fn put(self, user_key: &[u8], sequence: SequenceNumber, value: &[u8]) -> Self {
        self.push_version(
            user_key,
            Version {
                sequence,
                entry_type: EntryType::Value,
                value: value.to_vec(),
            },
        )
    }

    /// Add a `ZeroSeq` value: stamped with the table's global seqno on
    /// read.
    pub fn put_zero_seq(self, user_key: &[u8], value: &[u8]) -> Self {
        self.put(user_key, 0, value)
    }

    /// Add a point-deletion version.
    pub fn delete(self, user_key: &[u8], sequence: SequenceNumber) -> Self {
        self.push_version(
            user_key,
            Version {
                sequence,
                entry_type: EntryType::Deletion,
                value: Vec::new(),
            },
        )
    }

    /// Add a merge-operand version.
    pub fn merge(self, user_key: &[u8], sequence: SequenceNumber, operand: &[u8]) -> Self {
        self.push_version(
            user_key,
            Version {
                sequence,
                entry_type: EntryType::Merge,
                value: operand.to_vec(),
            },
        )
    }

    fn push_version(mut self, user_key: &[u8], version: Version) -> Self {
        if let Some(last) = self
            .entries
            .last_mut()
            .filter(|kv| kv.user_key == user_key)
        {
            last.versions.push(version);
        } else {
            self.entries.push(KeyVersions {
                user_key: user_key.to_vec(),
                versions: vec![version],
            });
        }
        self
    }

    /// Write the table file.
    pub fn finish(self) -> Result<(), TableError> {
        let entries = normalize_entries(self.entries)?;
        let partition = build_partition(&[], &self.common_prefix, &entries, &self.dictionary)?;

        let properties = TableProperties {
            num_entries: partition.num_entries,
            data_size: partition.store.len() as u64,
            index_size: partition.index.len() as u64,
            user_comparator: self.comparator,
            user_collected: self.user_properties,
        };

        let mut blocks: Vec<(&str, Vec<u8>)> = Vec::new();
        blocks.push((block_names::PROPERTIES, properties.encode()));
        if !entries.is_empty() {
            blocks.push((block_names::VALUE_DICT, self.dictionary.clone()));
            blocks.push((block_names::INDEX, partition.index.clone()));
            if !partition.types.is_empty() {
                blocks.push((block_names::VALUE_TYPE, partition.types.clone()));
            }
            if !self.omit_common_prefix_block {
                blocks.push((block_names::COMMON_PREFIX, self.common_prefix.clone()));
            }
        }
        if !self.tombstones.is_empty() {
            blocks.push((
                block_names::RANGE_TOMBSTONE,
                TombstoneBlock::encode(&self.tombstones),
            ));
        }
        if let Some(license) = &self.license {
            blocks.push((block_names::LICENSE, license.clone()));
        }

        write_table_file(&self.path, &partition.store, &blocks)
    }
}

// ------------------------------------------------------------------------------------------------
// Multi-partition builder
// ------------------------------------------------------------------------------------------------

/// One partition of a [`MultiTableBuilder`] input.
#[derive(Debug, Clone)]
pub struct PartitionSpec {
    /// Fixed-length partition prefix.
    pub partition_prefix: Vec<u8>,
    /// Common prefix of this partition's keys, after the partition prefix.
    pub common_prefix: Vec<u8>,
    /// The partition's keys, full user keys included.
    pub entries: Vec<KeyVersions>,
}

/// Builder for a partitioned table file.
pub struct MultiTableBuilder {
    path: PathBuf,
    partitions: Vec<PartitionSpec>,
    dictionary: Vec<u8>,
    comparator: String,
    user_properties: Vec<(String, Vec<u8>)>,
    tombstones: Vec<RangeTombstone>,
    license: Option<Vec<u8>>,
}

impl MultiTableBuilder {
    /// Start a builder targeting `path`.
    pub fn new(path: impl AsRef<Path>) -> Self {
        MultiTableBuilder {
            path: path.as_ref().to_path_buf(),
            partitions: Vec::new(),
            dictionary: Vec::new(),
            comparator: BYTEWISE_COMPARATOR_NAME.to_owned(),
            user_properties: Vec::new(),
            tombstones: Vec::new(),
            license: None,
        }
    }

    /// Set the shared value dictionary.
    pub fn dictionary(mut self, dict: &[u8]) -> Self {
        self.dictionary = dict.to_vec();
        self
    }

    /// Set the recorded user-comparator name.
    pub fn comparator(mut self, name: &str) -> Self {
        self.comparator = name.to_owned();
        self
    }

    /// Record a raw user property.
    pub fn property(mut self, key: &str, value: Vec<u8>) -> Self {
        self.user_properties.push((key.to_owned(), value));
        self
    }

    /// Mark the table as externally produced with the given global seqno.
    pub fn global_seqno(self, seqno: SequenceNumber) -> Self {
        self.property(property_names::EXTERNAL_VERSION, 2u32.to_le_bytes().to_vec())
            .property(
                property_names::EXTERNAL_GLOBAL_SEQNO,
                seqno.to_le_bytes().to_vec(),
            )
    }

    /// Add range tombstones, sorted by start key.
    pub fn range_tombstones(mut self, tombstones: Vec<RangeTombstone>) -> Self {
        self.tombstones = tombstones;
        self
    }

    /// Attach an opaque license blob.
    pub fn license_blob(mut self, blob: Vec<u8>) -> Self {
        self.license = Some(blob);
        self
    }

    /// Add one partition. Partitions must be added in ascending prefix
    /// order.
    pub fn partition(mut self, spec: PartitionSpec) -> Self {
        self.partitions.push(spec);
        self
    }

    /// Write the table file.
    pub fn finish(self) -> Result<(), TableError> {
        if self.partitions.is_empty() {
            return Err(TableError::InvalidArgument(
                "a partitioned table needs at least one partition".into(),
            ));
        }
        let prefix_len = self.partitions[0].partition_prefix.len();
        if prefix_len == 0 {
            return Err(TableError::InvalidArgument(
                "partition prefixes must be non-empty".into(),
            ));
        }
        for pair in self.partitions.windows(2) {
            if pair[1].partition_prefix.len() != prefix_len {
                return Err(TableError::InvalidArgument(
                    "partition prefixes must share one length".into(),
                ));
            }
            if pair[0].partition_prefix >= pair[1].partition_prefix {
                return Err(TableError::InvalidArgument(
                    "partition prefixes must be strictly ascending".into(),
                ));
            }
        }

        let mut index_concat = Vec::new();
        let mut store_concat = Vec::new();
        let mut type_concat = Vec::new();
        let mut common_prefix_concat = Vec::new();
        let mut prefix_set = Vec::new();
        let mut parts = Vec::new();
        let mut num_entries = 0u64;

        for spec in &self.partitions {
            let entries = normalize_entries(spec.entries.clone())?;
            if entries.is_empty() {
                return Err(TableError::InvalidArgument(
                    "partitions cannot be empty".into(),
                ));
            }
            let built = build_partition(
                &spec.partition_prefix,
                &spec.common_prefix,
                &entries,
                &self.dictionary,
            )?;
            index_concat.extend_from_slice(&built.index);
            store_concat.extend_from_slice(&built.store);
            type_concat.extend_from_slice(&built.types);
            common_prefix_concat.extend_from_slice(&spec.common_prefix);
            prefix_set.extend_from_slice(&spec.partition_prefix);
            num_entries += built.num_entries;
            parts.push(PartOffsets {
                key: index_concat.len() as u64,
                value: store_concat.len() as u64,
                typ: type_concat.len() as u64,
                common_prefix: common_prefix_concat.len() as u64,
            });
        }

        let offsets = OffsetInfo {
            prefix_len,
            prefix_set,
            parts,
        };

        let properties = TableProperties {
            num_entries,
            data_size: store_concat.len() as u64,
            index_size: index_concat.len() as u64,
            user_comparator: self.comparator,
            user_collected: self.user_properties,
        };

        let mut blocks: Vec<(&str, Vec<u8>)> = vec![
            (block_names::PROPERTIES, properties.encode()),
            (block_names::VALUE_DICT, self.dictionary.clone()),
            (block_names::INDEX, index_concat),
            (block_names::VALUE_TYPE, type_concat),
            (block_names::COMMON_PREFIX, common_prefix_concat),
            (block_names::OFFSET, offsets.encode()),
        ];
        if !self.tombstones.is_empty() {
            blocks.push((
                block_names::RANGE_TOMBSTONE,
                TombstoneBlock::encode(&self.tombstones),
            ));
        }
        if let Some(license) = &self.license {
            blocks.push((block_names::LICENSE, license.clone()));
        }

        write_table_file(&self.path, &store_concat, &blocks)
    }
}

// ------------------------------------------------------------------------------------------------
// Shared build steps
// ------------------------------------------------------------------------------------------------

/// Sort keys, merge duplicate key groups, and order each key's versions
/// newest first.
pub(crate) fn normalize_entries(
    mut entries: Vec<KeyVersions>,
) -> Result<Vec<KeyVersions>, TableError> {
    entries.sort_by(|a, b| a.user_key.cmp(&b.user_key));
    let mut merged: Vec<KeyVersions> = Vec::with_capacity(entries.len());
    for kv in entries {
        if kv.versions.is_empty() {
            return Err(TableError::InvalidArgument(format!(
                "key {:?} has no versions",
                kv.user_key
            )));
        }
        match merged.last_mut() {
            Some(last) if last.user_key == kv.user_key => {
                last.versions.extend(kv.versions);
            }
            _ => merged.push(kv),
        }
    }
    for kv in &mut merged {
        kv.versions.sort_by(|a, b| b.sequence.cmp(&a.sequence));
        for v in &kv.versions {
            if v.sequence > MAX_SEQ {
                return Err(TableError::InvalidArgument(format!(
                    "sequence {} exceeds the maximum",
                    v.sequence
                )));
            }
            if v.entry_type == EntryType::Deletion && !v.value.is_empty() {
                return Err(TableError::InvalidArgument(
                    "deletions carry no value".into(),
                ));
            }
        }
    }
    Ok(merged)
}

/// Build one partition's index, store, and type bytes.
pub(crate) fn build_partition(
    partition_prefix: &[u8],
    common_prefix: &[u8],
    entries: &[KeyVersions],
    dictionary: &[u8],
) -> Result<PartitionBytes, TableError> {
    let strip = partition_prefix.len() + common_prefix.len();
    let mut suffixes = Vec::with_capacity(entries.len());
    let mut tags = Vec::with_capacity(entries.len());
    let mut store = StoreBuilder::new(dictionary.to_vec());
    let mut num_entries = 0u64;

    for kv in entries {
        let full = kv.user_key.as_slice();
        if full.len() < strip
            || &full[..partition_prefix.len()] != partition_prefix
            || &full[partition_prefix.len()..strip] != common_prefix
        {
            return Err(TableError::InvalidArgument(format!(
                "key {:?} does not carry the table prefixes",
                full
            )));
        }
        suffixes.push(full[strip..].to_vec());
        num_entries += kv.versions.len() as u64;

        let (tag, payload) = elect_tag(&kv.versions);
        tags.push(tag);
        store.add(&payload);
    }

    let types = if tags.iter().all(|t| *t == ValueTag::ZeroSeq) {
        Vec::new()
    } else {
        TypeVec::pack(&tags)
    };

    Ok(PartitionBytes {
        index: encode_index(&suffixes),
        store: store.finish(),
        types,
        num_entries,
    })
}

/// Pick a key's value tag and produce its record payload. `versions` is
/// non-empty and sorted newest first.
fn elect_tag(versions: &[Version]) -> (ValueTag, Vec<u8>) {
    if let [only] = versions {
        match only.entry_type {
            EntryType::Value if only.sequence == 0 => {
                return (ValueTag::ZeroSeq, only.value.clone());
            }
            EntryType::Value => {
                let mut payload = pack_seq_type(only.sequence, EntryType::Value)
                    .to_le_bytes()
                    .to_vec();
                payload.extend_from_slice(&only.value);
                return (ValueTag::Value, payload);
            }
            EntryType::Deletion => {
                let payload = pack_seq_type(only.sequence, EntryType::Deletion)
                    .to_le_bytes()
                    .to_vec();
                return (ValueTag::Delete, payload);
            }
            EntryType::Merge => {}
        }
    }
    let records: Vec<Vec<u8>> = versions
        .iter()
        .map(|v| {
            let mut record = pack_seq_type(v.sequence, v.entry_type).to_le_bytes().to_vec();
            record.extend_from_slice(&v.value);
            record
        })
        .collect();
    (ValueTag::Multi, encode_multi(&records))
}

/// Write `data region || framed blocks || metaindex || footer` to `path`
/// via a `.tmp` sibling.
fn write_table_file(
    path: &Path,
    data_region: &[u8],
    blocks: &[(&str, Vec<u8>)],
) -> Result<(), TableError> {
    let tmp_path = path.with_extension("tmp");
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp_path)?;
    let mut writer = BufWriter::new(&mut file);

    writer.write_all(data_region)?;
    let mut offset = data_region.len() as u64;

    let mut handles = Vec::with_capacity(blocks.len());
    for (name, content) in blocks {
        let handle = write_framed(&mut writer, &mut offset, content)?;
        handles.push((*name, handle));
    }

    let metaindex = encode_metaindex(&handles);
    let metaindex_handle = write_framed(&mut writer, &mut offset, &metaindex)?;
    writer.write_all(&encode_footer(metaindex_handle))?;

    writer.flush()?;
    drop(writer);
    file.sync_all()?;
    drop(file);
    rename(&tmp_path, path)?;
    Ok(())
}

fn write_framed(
    writer: &mut impl Write,
    offset: &mut u64,
    content: &[u8],
) -> Result<BlockHandle, TableError> {
    let handle = BlockHandle {
        offset: *offset,
        len: (content.len() + BLOCK_FRAME_OVERHEAD) as u64,
    };
    writer.write_all(&(content.len() as u32).to_le_bytes())?;
    writer.write_all(content)?;
    writer.write_all(&crc32_of(content).to_le_bytes())?;
    *offset += handle.len;
    Ok(handle)
}
