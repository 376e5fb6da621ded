#![no_main]

use chatbroker::broker::{InboundFrame, OutboundFrame};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    match InboundFrame::decode(text) {
        Ok(frame) => {
            let _ = frame.kind();
            let _ = frame.session_id();
        }
        Err(err) => {
            let _ = serde_json::to_string(&OutboundFrame::error(&err, None));
        }
    }
});
