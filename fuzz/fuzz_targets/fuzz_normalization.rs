#![no_main]
use libfuzzer_sys::fuzz_target;
use promptwarden::sanitizer::{normalize, sanitize, default_rules};

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        // Should never panic on any UTF-8 input, and normalization is
        // idempotent once sanitized.
        let normalized = normalize(s);
        let rules = default_rules();
        let once = sanitize(&normalized, &rules, &[]);
        let twice = sanitize(&once, &rules, &[]);
        assert_eq!(once, twice, "sanitize is not idempotent");
    }
});
