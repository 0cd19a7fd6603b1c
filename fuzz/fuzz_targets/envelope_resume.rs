#![no_main]

use frankenengine_serializer::{EngineConfig, Envelope, Realm};
use libfuzzer_sys::fuzz_target;

const MAX_INPUT_BYTES: usize = 16 * 1024;

fuzz_target!(|data: &[u8]| {
    if data.len() > MAX_INPUT_BYTES {
        return;
    }
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(envelope) = Envelope::from_json_str(text) else {
        return;
    };

    let config = EngineConfig {
        max_call_depth: 32,
        ..EngineConfig::default()
    };
    let Ok(mut realm) = Realm::new(config) else {
        return;
    };

    // Untrusted envelopes may fail, but must never panic or leave a
    // half-open session behind.
    if let Ok(value) = realm.deserialize(&envelope) {
        let _ = realm.display_value(&value);
    }
    let events = realm.drain_events();
    assert!(events.iter().any(|event| event.event == "deserialize"));
});
