#![no_main]

use libfuzzer_sys::fuzz_target;
use dgxfer::EndPoint;

/// Anything that parses must print back to the same endpoint.
fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(ep) = EndPoint::parse(text) {
        let again = EndPoint::parse(&ep.to_string()).unwrap();
        assert_eq!(ep, again);
    }
});
