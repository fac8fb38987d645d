#![no_main]

use libfuzzer_sys::fuzz_target;
use serde_json::Value;
use timesink_core::random::SeededRandom;
use timesink_core::{validate_trial_answer, TrialKind};

const KINDS: [&str; 17] = [
    "image_hunt",
    "drag_sum",
    "trace_path",
    "audio_gate",
    "captcha_loopback",
    "loading_abyss",
    "multi_layer_captcha",
    "color_gradient_match",
    "pixel_perfect_click",
    "slow_reveal",
    "invisible_maze",
    "math_chain",
    "document_review",
    "keypress_combo",
    "video_frame_search",
    "looped_almost_done",
    "not_a_kind",
];

fuzz_target!(|data: &[u8]| {
    let Some((&selector, rest)) = data.split_first() else {
        return;
    };
    let kind = TrialKind::from(KINDS[selector as usize % KINDS.len()]);
    let rng = SeededRandom::new(u64::from(selector));
    let Ok(doc) = serde_json::from_slice::<Value>(rest) else {
        return;
    };
    let answer = doc.get("answer").cloned().unwrap_or(Value::Null);
    let config = doc.get("config").cloned().unwrap_or(Value::Null);
    let result = validate_trial_answer(&kind, &answer, &config, &rng);
    assert_eq!(result.success, result.reason.is_none());
    assert!(!(result.success && result.restart_on_fail));
});
