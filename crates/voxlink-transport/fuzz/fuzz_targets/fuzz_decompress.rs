#![no_main]

use libfuzzer_sys::fuzz_target;
use voxlink_transport::compression;

/// Decompression of arbitrary payloads must fail cleanly, and a successful
/// result must never exceed the declared bound.
fuzz_target!(|data: &[u8]| {
    let bound = compression::decompressed_size(data);
    if let Ok(out) = compression::decompress_to_vec(data, 1 << 20) {
        assert!(out.len() <= bound);
    }

    if let Ok(packed) = compression::compress_to_vec(data) {
        let restored = compression::decompress_to_vec(&packed, data.len() + 1024)
            .expect("compressed data must decompress");
        assert_eq!(restored, data);
    }
});
