//! Fuzz target for replicated entry decoding.
//!
//! Peers are untrusted input: decoding must never panic, and anything it
//! accepts must survive re-encoding unchanged.

#![no_main]

use libfuzzer_sys::fuzz_target;
use region_sync::wire::{decode_entry, encode_entry};

fuzz_target!(|data: &[u8]| {
    let Ok(raw) = serde_json::from_slice::<serde_json::Value>(data) else {
        return;
    };

    // Should never panic
    if let Ok(entry) = decode_entry(&raw) {
        let encoded = encode_entry(&entry).expect("decoded entry re-encodes");
        let again = decode_entry(&encoded).expect("re-encoded entry decodes");
        assert_eq!(entry.record_id, again.record_id);
        assert_eq!(entry.timestamp, again.timestamp);
        assert_eq!(entry.operation, again.operation);
    }
});
