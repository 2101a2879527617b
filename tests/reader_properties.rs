//! Property-based test for `PacketReader` (invariant 7: exact-byte read).

use std::collections::BTreeMap;
use std::io::Write as _;
use std::sync::Arc;

use fx3_capture_core::{IndexStore, PacketDescriptor, PacketReader, ReaderConfig};
use proptest::prelude::*;

fn descriptor(path: &std::path::Path, offset: u64, size: u32) -> PacketDescriptor {
    PacketDescriptor {
        timestamp_ns: offset,
        file_path: path.to_string_lossy().to_string(),
        file_offset: offset,
        size,
        batch_id: 0,
        packet_index: 0,
        command_type: 0x11,
        sequence: 0,
        valid_header: true,
        features: BTreeMap::new(),
    }
}

proptest! {
    /// `read(d)` returns bytes identical to `[d.file_offset, d.file_offset +
    /// d.size)` of `d.file_path`, for any file content and any in-bounds
    /// offset/size pair.
    #[test]
    fn read_returns_exact_byte_range(
        file_bytes in proptest::collection::vec(any::<u8>(), 1..2048),
        offset_fraction in 0.0f64..1.0f64,
        size_fraction in 0.0f64..1.0f64,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.bin");
        std::fs::File::create(&path).unwrap().write_all(&file_bytes).unwrap();

        let offset = ((file_bytes.len() as f64 - 1.0) * offset_fraction).max(0.0) as u64;
        let remaining = file_bytes.len() as u64 - offset;
        let size = (((remaining as f64) * size_fraction) as u64).max(1).min(remaining) as u32;
        prop_assume!(size > 0);

        let index = Arc::new(IndexStore::new());
        let reader = PacketReader::new(index, ReaderConfig::default());
        let desc = descriptor(&path, offset, size);

        let bytes = reader.read(&desc).unwrap();
        let expected = &file_bytes[offset as usize..offset as usize + size as usize];
        prop_assert_eq!(bytes.as_slice(), expected);
    }
}
