#![no_main]

use libfuzzer_sys::fuzz_target;
use serde_json::Value;
use timesink_core::recording::validate_events;

fuzz_target!(|data: &[u8]| {
    let Ok(Value::Array(raw)) = serde_json::from_slice::<Value>(data) else {
        return;
    };
    let kept = validate_events(&raw);
    assert!(kept.len() <= raw.len());
});
