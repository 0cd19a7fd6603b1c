#![no_main]

use frankenengine_serializer::{InstrumentOptions, instrument, parser::parse_script};
use libfuzzer_sys::fuzz_target;

const MAX_SOURCE_BYTES: usize = 8 * 1024;

fuzz_target!(|data: &[u8]| {
    if data.len() > MAX_SOURCE_BYTES || data.is_empty() {
        return;
    }
    let Ok(source) = std::str::from_utf8(&data[1..]) else {
        return;
    };
    let options = InstrumentOptions {
        wrap_expressions: data[0] % 2 == 1,
    };

    // Whatever the transpiler accepts, it must emit source that parses again.
    if let Ok(output) = instrument(source, &options) {
        assert!(
            parse_script(&output, "fuzz").is_ok(),
            "instrumented output failed to parse"
        );
    }
});
