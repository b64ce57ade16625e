#![no_main]

use duel_sync::protocol::ServerFrame;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = serde_json::from_slice::<ServerFrame>(data);

    // Anything that parses must survive a re-encode and parse back equal.
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(frame) = serde_json::from_str::<ServerFrame>(s) {
            let text = serde_json::to_string(&frame).unwrap_or_default();
            let again = serde_json::from_str::<ServerFrame>(&text).ok();
            assert_eq!(again.as_ref(), Some(&frame));
        }
    }
});
