//! Fuzz target for stream id parsing and offset packing.

#![no_main]

use libfuzzer_sys::fuzz_target;
use registry_relay::broker::redis::StreamPosition;

fuzz_target!(|data: &str| {
    // Should never panic
    let Ok(position) = StreamPosition::parse(data) else {
        return;
    };

    if let Ok(offset) = position.to_offset() {
        assert_eq!(StreamPosition::from_offset(offset), position);
    }
    assert!(position.predecessor() <= position);
});
