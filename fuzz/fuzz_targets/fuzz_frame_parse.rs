//! Fuzz target: `frame::parse`
//!
//! Drives arbitrary byte sequences into the frame parser and asserts that
//! it never panics, never yields an unclassifiable frame, and that every
//! accepted frame survives re-encoding.
//!
//! cargo fuzz run fuzz_frame_parse

#![no_main]

use libfuzzer_sys::fuzz_target;
use rpc_core::rpc::frame;

fuzz_target!(|data: &[u8]| {
    let Ok(f) = frame::parse(data) else {
        return;
    };

    assert!(f.id != 0 || f.is_request(), "frame with neither id nor method accepted");
    if f.is_request() {
        assert!(f.result.is_none() && !f.is_error(), "request carries a response payload");
    }

    let bytes = f.encode().expect("accepted frame must re-encode");
    let again = frame::parse(&bytes).expect("re-encoded frame must parse");
    assert_eq!(again.id, f.id);
    assert_eq!(again.method, f.method);
    assert_eq!(again.error_code, f.error_code);
});
