//! File framing: framed blocks, metaindex, footer, offset info.

#[cfg(test)]
mod tests {
    use crate::format::{
        crc32_of, encode_footer, encode_metaindex, read_block, read_footer, read_metaindex,
        BlockHandle, ByteView, FormatError, OffsetInfo, PartOffsets, BLOCK_FRAME_OVERHEAD,
        FOOTER_LEN,
    };

    /// Frame `content` the way the writer does and append it to `file`,
    /// returning its handle.
    fn append_framed(file: &mut Vec<u8>, content: &[u8]) -> BlockHandle {
        let handle = BlockHandle {
            offset: file.len() as u64,
            len: (content.len() + BLOCK_FRAME_OVERHEAD) as u64,
        };
        file.extend_from_slice(&(content.len() as u32).to_le_bytes());
        file.extend_from_slice(content);
        file.extend_from_slice(&crc32_of(content).to_le_bytes());
        handle
    }

    /// # Scenario
    /// Write two named blocks, a metaindex, and a footer; read everything
    /// back through the reader-side path.
    #[test]
    fn framing_round_trip() {
        let mut file = Vec::new();
        let h1 = append_framed(&mut file, b"first block");
        let h2 = append_framed(&mut file, b"second");
        let mi = encode_metaindex(&[("one", h1), ("two", h2)]);
        let mi_handle = append_framed(&mut file, &mi);
        file.extend_from_slice(&encode_footer(mi_handle));

        let view = ByteView::from_vec(file);
        assert_eq!(read_footer(&view).unwrap(), mi_handle);

        let meta = read_metaindex(&view).unwrap();
        assert_eq!(meta.len(), 2);
        assert_eq!(meta.find("one"), Some(h1));
        assert_eq!(meta.find("two"), Some(h2));
        assert_eq!(meta.find("absent"), None);

        let one = read_block(&view, h1).unwrap();
        assert_eq!(one.as_slice(), b"first block");
        let two = read_block(&view, h2).unwrap();
        assert_eq!(two.as_slice(), b"second");
    }

    /// # Scenario
    /// A file shorter than the footer cannot be a table.
    #[test]
    fn truncated_footer_rejected() {
        let view = ByteView::from_vec(vec![0u8; FOOTER_LEN - 1]);
        assert!(matches!(
            read_footer(&view),
            Err(FormatError::Truncated { .. })
        ));
    }

    /// # Scenario
    /// A wrong magic number is rejected before anything else is trusted.
    #[test]
    fn bad_magic_rejected() {
        let mut file = Vec::new();
        let mi = encode_metaindex(&[]);
        let mi_handle = append_framed(&mut file, &mi);
        let mut footer = encode_footer(mi_handle);
        let last = footer.len() - 1;
        footer[last] ^= 0xff;
        file.extend_from_slice(&footer);

        assert!(matches!(
            read_footer(&ByteView::from_vec(file)),
            Err(FormatError::BadMagic(_))
        ));
    }

    /// # Scenario
    /// Flipping one content byte of a framed block trips its CRC.
    #[test]
    fn block_checksum_mismatch() {
        let mut file = Vec::new();
        let handle = append_framed(&mut file, b"payload bytes");
        file[6] ^= 0x01; // inside the content area

        let err = read_block(&ByteView::from_vec(file), handle).unwrap_err();
        assert_eq!(err, FormatError::ChecksumMismatch);
    }

    /// # Scenario
    /// A handle pointing past the end of the file is rejected without
    /// reading.
    #[test]
    fn out_of_range_handle_rejected() {
        let view = ByteView::from_vec(vec![0u8; 16]);
        let err = read_block(
            &view,
            BlockHandle {
                offset: 8,
                len: 100,
            },
        )
        .unwrap_err();
        assert!(matches!(err, FormatError::BlockOutOfRange { .. }));
    }

    /// # Scenario
    /// Offset-info round trip with three partitions.
    #[test]
    fn offset_info_round_trip() {
        let info = OffsetInfo {
            prefix_len: 2,
            prefix_set: b"p1p2p3".to_vec(),
            parts: vec![
                PartOffsets {
                    key: 10,
                    value: 100,
                    typ: 1,
                    common_prefix: 0,
                },
                PartOffsets {
                    key: 25,
                    value: 180,
                    typ: 2,
                    common_prefix: 3,
                },
                PartOffsets {
                    key: 31,
                    value: 260,
                    typ: 3,
                    common_prefix: 3,
                },
            ],
        };
        let decoded = OffsetInfo::decode(&info.encode()).unwrap();
        assert_eq!(decoded.prefix_len, 2);
        assert_eq!(decoded.part_count(), 3);
        assert_eq!(decoded.prefix(0), b"p1");
        assert_eq!(decoded.prefix(2), b"p3");
        assert_eq!(decoded.parts, info.parts);
    }

    /// # Scenario
    /// Structural violations of the offset block: truncation, zero
    /// partitions, and a decreasing offset column.
    #[test]
    fn offset_info_malformed_rejected() {
        let info = OffsetInfo {
            prefix_len: 2,
            prefix_set: b"p1".to_vec(),
            parts: vec![PartOffsets {
                key: 4,
                value: 9,
                typ: 1,
                common_prefix: 0,
            }],
        };
        let bytes = info.encode();

        assert!(OffsetInfo::decode(&bytes[..bytes.len() - 1]).is_err());
        assert!(OffsetInfo::decode(&[]).is_err());

        let empty = OffsetInfo {
            prefix_len: 2,
            prefix_set: Vec::new(),
            parts: Vec::new(),
        };
        assert!(OffsetInfo::decode(&empty.encode()).is_err());

        let decreasing = OffsetInfo {
            prefix_len: 1,
            prefix_set: b"ab".to_vec(),
            parts: vec![
                PartOffsets {
                    key: 10,
                    value: 10,
                    typ: 1,
                    common_prefix: 0,
                },
                PartOffsets {
                    key: 5, // goes backwards
                    value: 20,
                    typ: 2,
                    common_prefix: 0,
                },
            ],
        };
        assert!(OffsetInfo::decode(&decreasing.encode()).is_err());
    }
}
