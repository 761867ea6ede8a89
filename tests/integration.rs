//! End-to-end table scenarios: build a file, reopen it, and drive the
//! public reader surface.
//!
//! Coverage:
//! - point lookups across sequence bounds, zero-seq stamping, and
//!   multi-version visibility
//! - forward/reverse full scans agreeing as mirrored streams
//! - multi-partition tables: resolution, boundary-crossing iteration
//! - randomized round-trip through the builder
//! - tampered value bytes surfacing as corruption from both `get` and a
//!   cursor

use std::path::Path;

use tempfile::TempDir;
use tracing::Level;
use tracing_subscriber::fmt::Subscriber;

use ziptable::builder::{KeyVersions, MultiTableBuilder, PartitionSpec, TableBuilder, Version};
use ziptable::ikey::{append_internal_key, parse_internal_key, EntryType, MAX_SEQ};
use ziptable::reader::{ReadOptions, ReaderConfig, TableReader};
use ziptable::segment::VisitFlow;
use ziptable::TableCursor;

fn init_tracing() {
    let _ = Subscriber::builder()
        .with_max_level(Level::TRACE)
        .try_init();
}

fn ikey(user_key: &[u8], sequence: u64, entry_type: EntryType) -> Vec<u8> {
    let mut out = Vec::new();
    append_internal_key(&mut out, user_key, sequence, entry_type);
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Observed {
    user_key: Vec<u8>,
    sequence: u64,
    entry_type: EntryType,
    value: Vec<u8>,
}

fn get_all(reader: &TableReader, user_key: &[u8], seq: u64) -> Vec<Observed> {
    let mut seen = Vec::new();
    reader
        .get(
            &ReadOptions::default(),
            &ikey(user_key, seq, EntryType::Value),
            &mut |pikey, value| {
                seen.push(Observed {
                    user_key: pikey.user_key.to_vec(),
                    sequence: pikey.sequence,
                    entry_type: pikey.entry_type,
                    value: value.to_vec(),
                });
                VisitFlow::Continue
            },
            false,
        )
        .expect("get");
    seen
}

fn scan_all(cursor: &mut dyn TableCursor) -> Vec<Observed> {
    let mut out = Vec::new();
    cursor.seek_to_first();
    while cursor.valid() {
        let parsed = parse_internal_key(cursor.key()).expect("key");
        out.push(Observed {
            user_key: parsed.user_key.to_vec(),
            sequence: parsed.sequence,
            entry_type: parsed.entry_type,
            value: cursor.value().to_vec(),
        });
        cursor.next();
    }
    assert!(cursor.status().is_none(), "scan error: {:?}", cursor.status());
    out
}

/// Shared fixture: global_seqno = 100, common prefix "abc".
fn build_scenario_table(path: &Path) {
    TableBuilder::new(path)
        .common_prefix(b"abc")
        .global_seqno(100)
        .put(b"abcX", 50, b"v50")
        .put_zero_seq(b"abcY", b"vZ")
        .put(b"abcZ", 70, b"n")
        .put(b"abcZ", 40, b"o")
        .finish()
        .expect("build");
}

// ------------------------------------------------------------------------------------------------
// Point lookups
// ------------------------------------------------------------------------------------------------

/// Scenario 1: a single version at seq 50 probed below, above, and
/// unbounded.
#[test]
fn point_lookup_sequence_bounds() {
    init_tracing();
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("s1.zt");
    build_scenario_table(&path);
    let reader = TableReader::open(&path, ReaderConfig::default()).unwrap();

    assert!(get_all(&reader, b"abcX", 30).is_empty());

    let at_60 = get_all(&reader, b"abcX", 60);
    assert_eq!(at_60.len(), 1);
    assert_eq!(at_60[0].sequence, 50);
    assert_eq!(at_60[0].value, b"v50");

    assert_eq!(get_all(&reader, b"abcX", MAX_SEQ), at_60);
}

/// Scenario 2: a zero-seq record surfaces at the global seqno even when
/// probed at bound 0.
#[test]
fn zero_seq_record_uses_global_seqno() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("s2.zt");
    build_scenario_table(&path);
    let reader = TableReader::open(&path, ReaderConfig::default()).unwrap();

    let seen = get_all(&reader, b"abcY", 0);
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].sequence, 100);
    assert_eq!(seen[0].entry_type, EntryType::Value);
    assert_eq!(seen[0].value, b"vZ");
}

/// Scenario 3: multi-version visibility at a bound between the versions,
/// and newest-first order on a full probe.
#[test]
fn multi_version_visibility() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("s3.zt");
    build_scenario_table(&path);
    let reader = TableReader::open(&path, ReaderConfig::default()).unwrap();

    let at_55 = get_all(&reader, b"abcZ", 55);
    assert_eq!(at_55.len(), 1);
    assert_eq!((at_55[0].sequence, at_55[0].value.as_slice()), (40, &b"o"[..]));

    let unbounded = get_all(&reader, b"abcZ", MAX_SEQ);
    assert_eq!(unbounded.len(), 2);
    assert_eq!(unbounded[0].sequence, 70);
    assert_eq!(unbounded[1].sequence, 40);

    // the full scan also exposes both versions, newest first
    let mut cursor = reader.new_iterator(&ReadOptions::default());
    let entries = scan_all(cursor.as_mut());
    let z_versions: Vec<u64> = entries
        .iter()
        .filter(|e| e.user_key == b"abcZ")
        .map(|e| e.sequence)
        .collect();
    assert_eq!(z_versions, vec![70, 40]);
}

// ------------------------------------------------------------------------------------------------
// Ordered iteration
// ------------------------------------------------------------------------------------------------

/// Scenario 4: reverse comparator over two keys.
#[test]
fn reverse_comparator_iteration() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("s4.zt");
    TableBuilder::new(&path)
        .comparator("rev:bytewise")
        .common_prefix(b"abc")
        .put(b"abcA", 1, b"va")
        .put(b"abcB", 2, b"vb")
        .finish()
        .unwrap();
    let reader = TableReader::open(&path, ReaderConfig::default()).unwrap();
    assert!(reader.is_reverse_order());

    let mut cursor = reader.new_iterator(&ReadOptions::default());
    cursor.seek_to_first();
    assert!(cursor.valid());
    assert_eq!(parse_internal_key(cursor.key()).unwrap().user_key, b"abcB");
    cursor.next();
    assert_eq!(parse_internal_key(cursor.key()).unwrap().user_key, b"abcA");
    cursor.next();
    assert!(!cursor.valid());
}

/// Forward and reverse scans of the same file yield mirrored streams, and
/// adjacent forward entries strictly ascend.
#[test]
fn forward_and_reverse_scans_mirror() {
    let tmp = TempDir::new().unwrap();
    let fwd_path = tmp.path().join("fwd.zt");
    let rev_path = tmp.path().join("rev.zt");

    let build = |path: &Path, comparator: &str| {
        TableBuilder::new(path)
            .comparator(comparator)
            .common_prefix(b"k/")
            .put(b"k/a", 9, b"1")
            .put(b"k/b", 8, b"2")
            .put(b"k/b", 3, b"2-old")
            .delete(b"k/c", 7)
            .put_zero_seq(b"k/d", b"4")
            .finish()
            .unwrap()
    };
    build(&fwd_path, "bytewise");
    build(&rev_path, "rev:bytewise");

    let fwd = TableReader::open(&fwd_path, ReaderConfig::default()).unwrap();
    let rev = TableReader::open(&rev_path, ReaderConfig::default()).unwrap();

    let mut forward = scan_all(fwd.new_iterator(&ReadOptions::default()).as_mut());
    let backward = scan_all(rev.new_iterator(&ReadOptions::default()).as_mut());

    // strict ascent of (user_key asc, seq desc) adjacent pairs
    for pair in forward.windows(2) {
        let key_order = pair[0].user_key.cmp(&pair[1].user_key);
        assert!(
            key_order.is_lt()
                || (key_order.is_eq() && pair[0].sequence > pair[1].sequence),
            "not strictly ascending: {pair:?}"
        );
    }

    forward.reverse();
    assert_eq!(forward, backward);
}

// ------------------------------------------------------------------------------------------------
// Multi-partition tables
// ------------------------------------------------------------------------------------------------

fn partition(prefix: &[u8], keys: &[(&[u8], u64, &[u8])]) -> PartitionSpec {
    PartitionSpec {
        partition_prefix: prefix.to_vec(),
        common_prefix: Vec::new(),
        entries: keys
            .iter()
            .map(|(k, seq, v)| KeyVersions {
                user_key: k.to_vec(),
                versions: vec![Version {
                    sequence: *seq,
                    entry_type: EntryType::Value,
                    value: v.to_vec(),
                }],
            })
            .collect(),
    }
}

/// Scenario 5: partitioned table; a seek lands in the owning partition and
/// `next` crosses into the following one.
#[test]
fn multi_partition_seek_and_boundary() {
    init_tracing();
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("multi.zt");
    MultiTableBuilder::new(&path)
        .partition(partition(
            b"p1",
            &[(b"p1_a", 1, b"1a"), (b"p1_b", 2, b"1b")],
        ))
        .partition(partition(
            b"p2",
            &[(b"p2_k", 3, b"2k"), (b"p2_m", 4, b"2m")],
        ))
        .partition(partition(
            b"p3",
            &[(b"p3_x", 5, b"3x"), (b"p3_y", 6, b"3y")],
        ))
        .finish()
        .unwrap();

    let reader = TableReader::open(&path, ReaderConfig::default()).unwrap();

    // point lookups resolve through the partition index
    let seen = get_all(&reader, b"p2_k", MAX_SEQ);
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].value, b"2k");
    // uncovered partition: silent miss
    assert!(get_all(&reader, b"p9_x", MAX_SEQ).is_empty());

    // seek into partition 2, then walk across its boundary into partition 3
    let mut cursor = reader.new_iterator(&ReadOptions::default());
    cursor.seek(&ikey(b"p2_k", MAX_SEQ, EntryType::Value));
    assert!(cursor.valid());
    assert_eq!(parse_internal_key(cursor.key()).unwrap().user_key, b"p2_k");
    cursor.next();
    assert_eq!(parse_internal_key(cursor.key()).unwrap().user_key, b"p2_m");
    cursor.next();
    assert_eq!(parse_internal_key(cursor.key()).unwrap().user_key, b"p3_x");

    // a full scan stitches all partitions in order
    let entries = scan_all(reader.new_iterator(&ReadOptions::default()).as_mut());
    let keys: Vec<&[u8]> = vec![b"p1_a", b"p1_b", b"p2_k", b"p2_m", b"p3_x", b"p3_y"];
    assert_eq!(
        entries.iter().map(|e| e.user_key.clone()).collect::<Vec<_>>(),
        keys.iter().map(|k| k.to_vec()).collect::<Vec<_>>()
    );
}

// ------------------------------------------------------------------------------------------------
// Randomized round-trip
// ------------------------------------------------------------------------------------------------

/// Build a random key set under a common prefix; the scan reproduces it in
/// sorted order and every key answers a full-sequence point lookup with
/// its newest version.
#[test]
fn random_round_trip() {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    init_tracing();
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("random.zt");

    let mut keys: Vec<Vec<u8>> = (0..400u32)
        .map(|_| {
            let len = rng.gen_range(1..=12);
            let mut key = b"pfx/".to_vec();
            key.extend((0..len).map(|_| rng.gen_range(b'a'..=b'z')));
            key
        })
        .collect();
    keys.sort();
    keys.dedup();

    let mut builder = TableBuilder::new(&path)
        .common_prefix(b"pfx/")
        .dictionary(b"common-payload-prefix");
    let mut newest: Vec<(Vec<u8>, u64, Vec<u8>)> = Vec::new();
    for key in &keys {
        let versions = rng.gen_range(1..=3usize);
        let mut seqs: Vec<u64> = (0..versions).map(|_| rng.gen_range(1..=1_000u64)).collect();
        seqs.sort_unstable();
        seqs.dedup();
        seqs.reverse();
        for (i, seq) in seqs.iter().enumerate() {
            let mut value = b"common-payload-prefix".to_vec();
            value.extend_from_slice(format!("-{i}-{seq}").as_bytes());
            builder = builder.put(key, *seq, &value);
            if i == 0 {
                newest.push((key.clone(), *seq, value.clone()));
            }
        }
    }
    builder.finish().unwrap();

    let reader = TableReader::open(
        &path,
        ReaderConfig {
            index_cache_ratio: 0.1,
            ..ReaderConfig::default()
        },
    )
    .unwrap();

    // sorted full scan over exactly the written key set
    let entries = scan_all(reader.new_iterator(&ReadOptions::default()).as_mut());
    let scanned_keys: Vec<Vec<u8>> = {
        let mut seen = entries.iter().map(|e| e.user_key.clone()).collect::<Vec<_>>();
        seen.dedup();
        seen
    };
    assert_eq!(scanned_keys, keys);

    // newest version per key via point lookup
    for (key, seq, value) in &newest {
        let seen = get_all(&reader, key, MAX_SEQ);
        assert!(!seen.is_empty(), "missing {key:?}");
        assert_eq!(seen[0].sequence, *seq);
        assert_eq!(&seen[0].value, value);
    }
}

// ------------------------------------------------------------------------------------------------
// Corruption
// ------------------------------------------------------------------------------------------------

/// Scenario 6: flip one byte in the value region; `get` reports
/// corruption and a cursor that reaches the record turns invalid with a
/// corruption status.
#[test]
fn tampered_value_bytes_surface_as_corruption() {
    init_tracing();
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("tamper.zt");
    build_scenario_table(&path);

    let mut bytes = std::fs::read(&path).unwrap();
    bytes[6] ^= 0xff; // inside the first record's payload
    std::fs::write(&path, &bytes).unwrap();

    let reader = TableReader::open(&path, ReaderConfig::default()).unwrap();

    let err = reader
        .get(
            &ReadOptions::default(),
            &ikey(b"abcX", MAX_SEQ, EntryType::Value),
            &mut |_, _| VisitFlow::Continue,
            false,
        )
        .unwrap_err();
    assert!(matches!(err, ziptable::TableError::Corruption(_)));

    let mut cursor = reader.new_iterator(&ReadOptions::default());
    cursor.seek_to_first();
    assert!(!cursor.valid());
    assert!(matches!(
        cursor.status(),
        Some(ziptable::TableError::Corruption(_))
    ));
}
