//! Shared helpers for the unit-test suites: in-memory segment assembly,
//! internal-key construction, and cursor draining.

use tracing::Level;
use tracing_subscriber::fmt::Subscriber;

use crate::builder::{build_partition, normalize_entries, KeyVersions, Version};
use crate::format::ByteView;
use crate::ikey::{append_internal_key, parse_internal_key, EntryType, SequenceNumber};
use crate::index::KeyIndex;
use crate::iterator::TableCursor;
use crate::segment::Segment;
use crate::store::BlobStore;
use crate::value::TypeVec;

pub(crate) fn init_tracing() {
    let _ = Subscriber::builder()
        .with_max_level(Level::TRACE)
        .try_init();
}

/// `user_key || packed8` as owned bytes.
pub(crate) fn ikey(user_key: &[u8], sequence: SequenceNumber, entry_type: EntryType) -> Vec<u8> {
    let mut out = Vec::new();
    append_internal_key(&mut out, user_key, sequence, entry_type);
    out
}

pub(crate) fn put(sequence: SequenceNumber, value: &[u8]) -> Version {
    Version {
        sequence,
        entry_type: EntryType::Value,
        value: value.to_vec(),
    }
}

pub(crate) fn del(sequence: SequenceNumber) -> Version {
    Version {
        sequence,
        entry_type: EntryType::Deletion,
        value: Vec::new(),
    }
}

pub(crate) fn key_versions(user_key: &[u8], versions: Vec<Version>) -> KeyVersions {
    KeyVersions {
        user_key: user_key.to_vec(),
        versions,
    }
}

/// Assemble an in-memory segment the way the reader would after open.
pub(crate) fn make_segment(
    ordinal: usize,
    partition_prefix: &[u8],
    common_prefix: &[u8],
    dictionary: &[u8],
    entries: Vec<KeyVersions>,
) -> Segment {
    let entries = normalize_entries(entries).expect("normalize");
    let built =
        build_partition(partition_prefix, common_prefix, &entries, dictionary).expect("build");
    let index = KeyIndex::load(ByteView::from_vec(built.index)).expect("index");
    let store = BlobStore::load_from_memory(
        ByteView::from_vec(built.store),
        ByteView::from_vec(dictionary.to_vec()),
    )
    .expect("store");
    let types = TypeVec::new(ByteView::from_vec(built.types), index.num_keys()).expect("types");
    Segment::new(
        ordinal,
        partition_prefix.to_vec(),
        common_prefix.to_vec(),
        index,
        store,
        types,
    )
}

/// Assemble an in-memory multi-partition [`SegmentIndex`] from
/// `(partition_prefix, common_prefix, entries)` triples, the way the
/// reader's open path slices a partitioned table.
pub(crate) fn make_segment_index(
    dictionary: &[u8],
    partitions: Vec<(Vec<u8>, Vec<u8>, Vec<KeyVersions>)>,
    reverse: bool,
) -> crate::segment::SegmentIndex {
    use crate::format::{OffsetInfo, PartOffsets};

    let prefix_len = partitions[0].0.len();
    let mut index_concat = Vec::new();
    let mut store_concat = Vec::new();
    let mut type_concat = Vec::new();
    let mut cp_concat = Vec::new();
    let mut prefix_set = Vec::new();
    let mut parts = Vec::new();

    for (pp, cp, entries) in &partitions {
        let entries = normalize_entries(entries.clone()).expect("normalize");
        let built = build_partition(pp, cp, &entries, dictionary).expect("build");
        index_concat.extend_from_slice(&built.index);
        store_concat.extend_from_slice(&built.store);
        type_concat.extend_from_slice(&built.types);
        cp_concat.extend_from_slice(cp);
        prefix_set.extend_from_slice(pp);
        parts.push(PartOffsets {
            key: index_concat.len() as u64,
            value: store_concat.len() as u64,
            typ: type_concat.len() as u64,
            common_prefix: cp_concat.len() as u64,
        });
    }

    let offsets = OffsetInfo {
        prefix_len,
        prefix_set,
        parts,
    };
    crate::segment::SegmentIndex::init(
        &offsets,
        ByteView::from_vec(index_concat),
        ByteView::from_vec(store_concat),
        ByteView::from_vec(dictionary.to_vec()),
        ByteView::from_vec(type_concat),
        ByteView::from_vec(cp_concat),
        reverse,
    )
    .expect("segment index")
}

/// One decoded cursor position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Entry {
    pub user_key: Vec<u8>,
    pub sequence: SequenceNumber,
    pub entry_type: EntryType,
    pub value: Vec<u8>,
}

pub(crate) fn current_entry(cursor: &dyn TableCursor) -> Entry {
    let parsed = parse_internal_key(cursor.key()).expect("cursor key");
    Entry {
        user_key: parsed.user_key.to_vec(),
        sequence: parsed.sequence,
        entry_type: parsed.entry_type,
        value: cursor.value().to_vec(),
    }
}

/// Drain a cursor forward from its current position.
pub(crate) fn drain_forward(cursor: &mut dyn TableCursor) -> Vec<Entry> {
    let mut out = Vec::new();
    while cursor.valid() {
        out.push(current_entry(cursor));
        cursor.next();
    }
    out
}

/// Drain a cursor backward from its current position.
pub(crate) fn drain_backward(cursor: &mut dyn TableCursor) -> Vec<Entry> {
    let mut out = Vec::new();
    while cursor.valid() {
        out.push(current_entry(cursor));
        cursor.prev();
    }
    out
}
