//! Fuzz target for inbound header normalization.
//!
//! Arbitrary blob bytes must never panic the mapper, and normalizing twice
//! must change nothing the first pass did not.

#![no_main]

use libfuzzer_sys::fuzz_target;
use registry_relay::mapper::PropertyMapper;
use registry_relay::properties::{HeaderBag, APPLICATION_PROPERTIES_HEADER, PROPERTIES_HEADER};

fuzz_target!(|data: (&[u8], &[u8])| {
    let (properties, application) = data;

    let mut headers = HeaderBag::new();
    headers.insert("eventName", "CommunicationPartyUpdated");
    headers.insert(PROPERTIES_HEADER, properties.to_vec());
    headers.insert(APPLICATION_PROPERTIES_HEADER, application.to_vec());

    let mapper = PropertyMapper::default();
    mapper.normalize_incoming(&mut headers);
    let once = headers.clone();
    mapper.normalize_incoming(&mut headers);
    assert_eq!(headers, once);
});
