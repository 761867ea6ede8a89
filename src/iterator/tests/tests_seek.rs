//! Seek semantics: common-prefix divergence, exact-match version walks,
//! boundary targets, and seek-for-prev.

#[cfg(test)]
mod tests {
    use crate::ikey::{parse_internal_key, EntryType, MAX_SEQ};
    use crate::iterator::{TableCursor, TableIterator};
    use crate::segment::Segment;
    use crate::testutil::{ikey, key_versions, make_segment, put};

    const GLOBAL_SEQNO: u64 = 100;

    fn sample_segment() -> Segment {
        make_segment(
            0,
            b"",
            b"abc",
            b"",
            vec![
                key_versions(b"abcM", vec![put(50, b"m50")]),
                key_versions(b"abcX", vec![put(70, b"x70"), put(40, b"x40")]),
                key_versions(b"abcZ", vec![put(10, b"z10")]),
            ],
        )
    }

    fn forward(segment: &Segment) -> TableIterator<'_> {
        TableIterator::new_single(segment, GLOBAL_SEQNO, false, false)
    }

    fn reverse(segment: &Segment) -> TableIterator<'_> {
        TableIterator::new_single(segment, GLOBAL_SEQNO, true, false)
    }

    fn user_key_of(cursor: &dyn TableCursor) -> Vec<u8> {
        parse_internal_key(cursor.key()).unwrap().user_key.to_vec()
    }

    /// # Scenario
    /// Seek to an exact key at three sequence bounds: below the only
    /// visible version, between versions, and unbounded.
    ///
    /// # Expected behavior
    /// `@30` skips past the key (no visible version) onto the next key;
    /// `@60` lands on the older version (40); `@∞` lands on the newest
    /// (70).
    #[test]
    fn seek_walks_versions_for_visibility() {
        let segment = sample_segment();

        let mut cursor = forward(&segment);
        cursor.seek(&ikey(b"abcX", 30, EntryType::Value));
        assert!(cursor.valid());
        assert_eq!(user_key_of(&cursor), b"abcZ");

        let mut cursor = forward(&segment);
        cursor.seek(&ikey(b"abcX", 60, EntryType::Value));
        assert!(cursor.valid());
        let parsed = parse_internal_key(cursor.key()).unwrap();
        assert_eq!(parsed.user_key, b"abcX");
        assert_eq!(parsed.sequence, 40);
        assert_eq!(cursor.value(), b"x40");

        let mut cursor = forward(&segment);
        cursor.seek(&ikey(b"abcX", MAX_SEQ, EntryType::Value));
        let parsed = parse_internal_key(cursor.key()).unwrap();
        assert_eq!(parsed.sequence, 70);
        assert_eq!(cursor.value(), b"x70");
    }

    /// # Scenario
    /// Seek to a key with no exact match.
    ///
    /// # Expected behavior
    /// Forward: the next larger key, no version filtering. Reverse: the
    /// next key in reverse order (the largest key `<=` target).
    #[test]
    fn seek_inexact_lands_on_neighbor() {
        let segment = sample_segment();

        let mut cursor = forward(&segment);
        cursor.seek(&ikey(b"abcN", MAX_SEQ, EntryType::Value));
        assert_eq!(user_key_of(&cursor), b"abcX");

        let mut cursor = reverse(&segment);
        cursor.seek(&ikey(b"abcN", MAX_SEQ, EntryType::Value));
        assert_eq!(user_key_of(&cursor), b"abcM");
    }

    /// # Scenario
    /// Boundary targets: strictly before every key and strictly after
    /// every key, in both directions.
    #[test]
    fn seek_before_all_and_after_all() {
        let segment = sample_segment();

        let mut cursor = forward(&segment);
        cursor.seek(&ikey(b"abcA", MAX_SEQ, EntryType::Value));
        assert_eq!(user_key_of(&cursor), b"abcM");

        let mut cursor = forward(&segment);
        cursor.seek(&ikey(b"abcZZ", MAX_SEQ, EntryType::Value));
        assert!(!cursor.valid());

        // reverse order flips which edge is "before all"
        let mut cursor = reverse(&segment);
        cursor.seek(&ikey(b"abcZZ", MAX_SEQ, EntryType::Value));
        assert_eq!(user_key_of(&cursor), b"abcZ");

        let mut cursor = reverse(&segment);
        cursor.seek(&ikey(b"abcA", MAX_SEQ, EntryType::Value));
        assert!(!cursor.valid());
    }

    /// # Scenario
    /// Targets diverging from the common prefix `"abc"`: a strict prefix
    /// of it, one below it, one above it.
    #[test]
    fn seek_common_prefix_divergence() {
        let segment = sample_segment();

        // strict prefix of the common prefix: before all keys
        let mut cursor = forward(&segment);
        cursor.seek(&ikey(b"ab", MAX_SEQ, EntryType::Value));
        assert_eq!(user_key_of(&cursor), b"abcM");

        let mut cursor = reverse(&segment);
        cursor.seek(&ikey(b"ab", MAX_SEQ, EntryType::Value));
        assert!(!cursor.valid());

        // diverges below: "abb…" < "abc…"
        let mut cursor = forward(&segment);
        cursor.seek(&ikey(b"abb", MAX_SEQ, EntryType::Value));
        assert_eq!(user_key_of(&cursor), b"abcM");

        // diverges above: "abd…" > every "abc…" key
        let mut cursor = forward(&segment);
        cursor.seek(&ikey(b"abd", MAX_SEQ, EntryType::Value));
        assert!(!cursor.valid());

        // and mirrored under the reverse comparator
        let mut cursor = reverse(&segment);
        cursor.seek(&ikey(b"abd", MAX_SEQ, EntryType::Value));
        assert_eq!(user_key_of(&cursor), b"abcZ");

        let mut cursor = reverse(&segment);
        cursor.seek(&ikey(b"abb", MAX_SEQ, EntryType::Value));
        assert!(!cursor.valid());
    }

    /// # Scenario
    /// A seek target shorter than the packed trailer.
    ///
    /// # Expected behavior
    /// The cursor invalidates and parks an InvalidArgument status.
    #[test]
    fn seek_bad_target_sets_status() {
        let segment = sample_segment();
        let mut cursor = forward(&segment);
        cursor.seek(b"short");
        assert!(!cursor.valid());
        assert!(matches!(
            cursor.status(),
            Some(crate::error::TableError::InvalidArgument(_))
        ));
    }

    /// # Scenario
    /// `seek_for_prev` across exact hits, gaps, and both edges. Within one
    /// user key, internal order puts higher sequences first, so a MAX-seq
    /// target sorts before every stored version of that key.
    #[test]
    fn seek_for_prev_positions() {
        let segment = sample_segment();

        // exact internal-key hit
        let mut cursor = forward(&segment);
        cursor.seek_for_prev(&ikey(b"abcX", 70, EntryType::Value));
        let parsed = parse_internal_key(cursor.key()).unwrap();
        assert_eq!(parsed.user_key, b"abcX");
        assert_eq!(parsed.sequence, 70);

        // a zero-seq target sorts after every version of its user key
        let mut cursor = forward(&segment);
        cursor.seek_for_prev(&ikey(b"abcX", 0, EntryType::Value));
        let parsed = parse_internal_key(cursor.key()).unwrap();
        assert_eq!(parsed.user_key, b"abcX");
        assert_eq!(parsed.sequence, 40);

        // a MAX-seq target sorts before them: the previous user key wins
        let mut cursor = forward(&segment);
        cursor.seek_for_prev(&ikey(b"abcX", MAX_SEQ, EntryType::Value));
        let parsed = parse_internal_key(cursor.key()).unwrap();
        assert_eq!(parsed.user_key, b"abcM");
        assert_eq!(parsed.sequence, 50);

        // in a gap: the largest entry below the target
        let mut cursor = forward(&segment);
        cursor.seek_for_prev(&ikey(b"abcY", MAX_SEQ, EntryType::Value));
        let parsed = parse_internal_key(cursor.key()).unwrap();
        assert_eq!(parsed.user_key, b"abcX");
        assert_eq!(parsed.sequence, 40);

        // after every key: the table's last entry
        let mut cursor = forward(&segment);
        cursor.seek_for_prev(&ikey(b"abcZZ", MAX_SEQ, EntryType::Value));
        assert_eq!(user_key_of(&cursor), b"abcZ");

        // before every key: invalid
        let mut cursor = forward(&segment);
        cursor.seek_for_prev(&ikey(b"abcA", MAX_SEQ, EntryType::Value));
        assert!(!cursor.valid());
    }

    /// # Scenario
    /// The fixed-width comparator surfaces host-endian keys: seeks take
    /// them and materialized keys return them.
    #[test]
    fn u64_keys_round_trip_host_endian() {
        let numbers = [3u64, 7, 500, 70_000];
        let entries = numbers
            .iter()
            .map(|n| key_versions(&n.to_be_bytes(), vec![put(5, &n.to_le_bytes())]))
            .collect();
        let segment = make_segment(0, b"", b"", b"", entries);
        let mut cursor = TableIterator::new_single(&segment, GLOBAL_SEQNO, false, true);

        // numeric order, host-endian keys out
        cursor.seek_to_first();
        let mut seen = Vec::new();
        while cursor.valid() {
            let parsed = parse_internal_key(cursor.key()).unwrap();
            let mut raw = [0u8; 8];
            raw.copy_from_slice(parsed.user_key);
            seen.push(u64::from_le_bytes(raw));
            cursor.next();
        }
        assert_eq!(seen, numbers);

        // host-endian target in
        cursor.seek(&ikey(&500u64.to_le_bytes(), MAX_SEQ, EntryType::Value));
        assert!(cursor.valid());
        let parsed = parse_internal_key(cursor.key()).unwrap();
        let mut raw = [0u8; 8];
        raw.copy_from_slice(parsed.user_key);
        assert_eq!(u64::from_le_bytes(raw), 500);
        assert_eq!(cursor.value(), &500u64.to_le_bytes());

        // between stored numbers: next larger
        cursor.seek(&ikey(&10u64.to_le_bytes(), MAX_SEQ, EntryType::Value));
        let parsed = parse_internal_key(cursor.key()).unwrap();
        let mut raw = [0u8; 8];
        raw.copy_from_slice(parsed.user_key);
        assert_eq!(u64::from_le_bytes(raw), 500);
    }
}
