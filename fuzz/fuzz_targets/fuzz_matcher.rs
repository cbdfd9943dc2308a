#![no_main]
use libfuzzer_sys::fuzz_target;
use promptwarden::pattern::{builtin_patterns, CompiledSet};
use promptwarden::matcher::Matcher;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        let matcher = Matcher::build(&CompiledSet::compile(builtin_patterns()));
        // Should never panic, and scanning twice should agree.
        let result1 = matcher.scan(s);
        let result2 = matcher.scan(s);
        assert_eq!(result1.len(), result2.len(), "non-deterministic matching");
        for m in &result1 {
            assert!(s.is_char_boundary(m.index), "match index not on a char boundary");
        }
    }
});
