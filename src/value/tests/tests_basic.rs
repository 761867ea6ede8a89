//! Value tags, the packed type vector, and the multi-version frame.

#[cfg(test)]
mod tests {
    use crate::format::ByteView;
    use crate::value::{encode_multi, MultiValue, TypeVec, ValueError, ValueTag};

    #[test]
    fn tag_from_bits_is_total() {
        assert_eq!(ValueTag::from_bits(0), ValueTag::ZeroSeq);
        assert_eq!(ValueTag::from_bits(1), ValueTag::Value);
        assert_eq!(ValueTag::from_bits(2), ValueTag::Delete);
        assert_eq!(ValueTag::from_bits(3), ValueTag::Multi);
        // only the low two bits matter
        assert_eq!(ValueTag::from_bits(0b111), ValueTag::Multi);
    }

    #[test]
    fn type_vec_byte_len() {
        assert_eq!(TypeVec::byte_len(0), 0);
        assert_eq!(TypeVec::byte_len(1), 1);
        assert_eq!(TypeVec::byte_len(4), 1);
        assert_eq!(TypeVec::byte_len(5), 2);
        assert_eq!(TypeVec::byte_len(16), 4);
    }

    /// # Scenario
    /// Pack a mixed tag sequence and read every position back.
    #[test]
    fn type_vec_pack_get_round_trip() {
        let tags = vec![
            ValueTag::ZeroSeq,
            ValueTag::Value,
            ValueTag::Delete,
            ValueTag::Multi,
            ValueTag::Value,
            ValueTag::ZeroSeq,
        ];
        let packed = TypeVec::pack(&tags);
        assert_eq!(packed.len(), TypeVec::byte_len(tags.len()));

        let vec = TypeVec::new(ByteView::from_vec(packed), tags.len()).unwrap();
        for (i, tag) in tags.iter().enumerate() {
            assert_eq!(vec.get(i), *tag, "position {i}");
        }
    }

    /// # Scenario
    /// An empty view is the all-`ZeroSeq` degenerate vector regardless of
    /// the record count.
    #[test]
    fn empty_type_vec_is_all_zero_seq() {
        let vec = TypeVec::new(ByteView::empty(), 100).unwrap();
        assert!(vec.is_all_zero_seq());
        assert_eq!(vec.get(0), ValueTag::ZeroSeq);
        assert_eq!(vec.get(99), ValueTag::ZeroSeq);
    }

    /// # Scenario
    /// A non-empty vector must cover exactly the record count.
    #[test]
    fn type_vec_length_mismatch_rejected() {
        let err = TypeVec::new(ByteView::from_vec(vec![0u8; 3]), 4).unwrap_err();
        assert_eq!(
            err,
            ValueError::BadTypeVecLen {
                got: 3,
                records: 4
            }
        );
    }

    /// # Scenario
    /// Encode a three-version frame and read each record back.
    ///
    /// # Expected behavior
    /// `len()` reports three, and each `get(i)` returns the exact record
    /// bytes, packed trailer included, in newest-first order.
    #[test]
    fn multi_value_round_trip() {
        let records = vec![b"AAAAAAAAnew".to_vec(), b"BBBBBBBBold".to_vec(), b"CCCCCCCC".to_vec()];
        let frame = encode_multi(&records);

        let multi = MultiValue::decode(&frame).unwrap();
        assert_eq!(multi.len(), 3);
        for (i, rec) in records.iter().enumerate() {
            assert_eq!(multi.get(i), rec.as_slice());
            assert_eq!(&frame[multi.frame_range(i)], rec.as_slice());
        }
    }

    /// # Scenario
    /// Structurally broken frames are rejected: zero count, truncated
    /// offsets, and offsets that do not close the record area.
    #[test]
    fn multi_value_malformed_rejected() {
        // zero count
        let frame = encode_multi(&[]);
        let err = MultiValue::decode(&frame).map(|_| ()).unwrap_err();
        assert_eq!(err, ValueError::BadMultiFrame);

        // truncated offsets array
        let good = encode_multi(&[b"AAAAAAAAx".to_vec()]);
        assert!(MultiValue::decode(&good[..6]).map(|_| ()).is_err());

        // final offset short of the record area
        let mut frame = encode_multi(&[b"AAAAAAAAx".to_vec()]);
        frame.extend_from_slice(b"junk");
        assert!(MultiValue::decode(&frame).map(|_| ()).is_err());
    }
}
