#![no_main]

use std::sync::Arc;

use libfuzzer_sys::fuzz_target;
use timesink_core::{ManualClock, StepTokenAuthority, TokenConfig, TokenSecret};

fuzz_target!(|data: &[u8]| {
    let Ok(secret) = TokenSecret::new(b"fuzz-step-token-secret-0123456789".to_vec()) else {
        return;
    };
    let authority =
        StepTokenAuthority::new(TokenConfig::default(), secret, Arc::new(ManualClock::new(0)));
    let token = String::from_utf8_lossy(data);
    if let Ok(claims) = authority.verify(&token) {
        // Anything that verifies must re-encode to a token that also verifies.
        if let Ok(again) = authority.encode(&claims) {
            assert_eq!(authority.verify(&again).ok(), Some(claims));
        }
    }
    let _ = authority.check(&token, "session", "trial");
});
