#![no_main]
use libfuzzer_sys::fuzz_target;
use promptwarden::guard::{GuardConfig, GuardContext};
use promptwarden::segmenter::TrustLevel;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        let context = GuardContext::new(GuardConfig::default());
        // Should never panic, and the risk score must stay in range
        // regardless of input shape.
        if let Ok(result) = context.scan(s, TrustLevel::Untrusted) {
            assert!(result.risk <= 100);
            assert_eq!(result.safe, result.risk < GuardConfig::default().risk_threshold);
        }
    }
});
