//! Pattern registry (C1): the canonical catalog of injection patterns and
//! the compiled-set cache the matcher (C2) builds on.
//!
//! Patterns are immutable once registered — changing the effective set
//! means rebuilding the compiled matcher, not mutating a [`Pattern`] in
//! place.

use std::borrow::Cow;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::pipeline::outcome::Severity;

// ── Category ────────────────────────────────────────────────────────────

/// High-level classification of a detection pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum Category {
    /// Attempts to override, cancel, or redefine prior instructions.
    InstructionOverride,
    /// Abuse of delimiters, special tokens, or markers to hijack context.
    ContextHijack,
    /// Attempts to exfiltrate the system prompt or other hidden instructions.
    InfoExtraction,
    /// Attempts to get the model to execute or emit executable code.
    CodeExecution,
    /// Attempts to redefine the model's identity, role, or operating mode.
    Jailbreak,
    /// Use of encoding tricks to evade literal pattern matching.
    Obfuscation,
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InstructionOverride => write!(f, "instruction_override"),
            Self::ContextHijack => write!(f, "context_hijack"),
            Self::InfoExtraction => write!(f, "info_extraction"),
            Self::CodeExecution => write!(f, "code_execution"),
            Self::Jailbreak => write!(f, "jailbreak"),
            Self::Obfuscation => write!(f, "obfuscation"),
        }
    }
}

// ── Pattern ─────────────────────────────────────────────────────────────

/// A single detection pattern: a stable id, a regular expression, and the
/// metadata the scorer and sanitizer need when it fires.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pattern {
    /// Stable identifier, e.g. `"RC-002"`.
    pub id: Cow<'static, str>,
    /// Raw regex source (Unicode-aware, case-insensitive unless the pattern
    /// embeds its own flags).
    pub regex: Cow<'static, str>,
    /// Severity when this pattern matches.
    pub severity: Severity,
    /// Which threat category this pattern belongs to.
    pub category: Category,
    /// Weight 0–100, used both as match confidence and in scoring.
    pub weight: u8,
    /// Whether a match should feed the sanitizer's default rule set.
    pub sanitize: bool,
    /// Human-readable description of what this pattern detects.
    pub description: Option<Cow<'static, str>>,
}

impl Pattern {
    fn severity_rank(&self) -> u32 {
        match self.severity {
            Severity::Critical => 4,
            Severity::High => 3,
            Severity::Medium => 2,
            Severity::Low => 1,
            Severity::Info => 0,
        }
    }

    /// `severity_rank*100 + weight`, used to order patterns within a
    /// compiled set (highest priority first).
    #[must_use]
    pub fn priority_key(&self) -> u32 {
        self.severity_rank() * 100 + u32::from(self.weight)
    }
}

/// Helper to reduce boilerplate when defining built-in patterns.
macro_rules! pat {
    ($id:expr, $cat:expr, $desc:expr, $re:expr, $sev:expr, $w:expr) => {
        Pattern {
            id: Cow::Borrowed($id),
            regex: Cow::Borrowed($re),
            severity: $sev,
            category: $cat,
            weight: $w,
            sanitize: true,
            description: Some(Cow::Borrowed($desc)),
        }
    };
}

/// Returns the full built-in catalog (50+ patterns across all six
/// categories).
#[allow(clippy::too_many_lines)]
#[must_use]
pub fn builtin_patterns() -> Vec<Pattern> {
    use Category::{CodeExecution, ContextHijack, InfoExtraction, InstructionOverride, Jailbreak, Obfuscation};
    use Severity::{Critical, High, Low, Medium};

    vec![
        // ── Role confusion / instruction override (14) ─────────────
        pat!("RC-001", Jailbreak, "You are now", r"(?i)you\s+are\s+now\b", High, 90),
        pat!(
            "RC-002",
            InstructionOverride,
            "Ignore previous instructions",
            r"(?i)ignore\s+(all\s+)?previous\s+instructions",
            Critical,
            100
        ),
        pat!("RC-003", Jailbreak, "Act as a/an/role", r"(?i)act\s+as\s+(a|an|\w+)\b", High, 80),
        pat!(
            "RC-004",
            Jailbreak,
            "Pretend to be",
            r"(?i)pretend\s+(to\s+be|you\s+are)\b",
            High,
            85
        ),
        pat!(
            "RC-005",
            InstructionOverride,
            "Forget everything",
            r"(?i)forget\s+everything",
            Critical,
            95
        ),
        pat!("RC-006", Jailbreak, "Your new role is", r"(?i)your\s+new\s+role\s+is\b", High, 90),
        pat!(
            "RC-007",
            InstructionOverride,
            "Disregard prior",
            r"(?i)disregard\s+(all\s+)?prior\b",
            Critical,
            95
        ),
        pat!("RC-008", Jailbreak, "Switch to mode", r"(?i)switch\s+to\s+\w+\s+mode", Medium, 70),
        pat!("RC-009", InstructionOverride, "From now on", r"(?i)from\s+now\s+on\b", Medium, 60),
        pat!("RC-010", InstructionOverride, "You must now", r"(?i)you\s+must\s+now\b", High, 80),
        pat!("RC-011", ContextHijack, "system: prefix", r"(?i)^system:\s", High, 90),
        pat!(
            "RC-012",
            Jailbreak,
            "Override your programming",
            r"(?i)override\s+your\s+programming",
            Critical,
            95
        ),
        pat!(
            "RC-013",
            Jailbreak,
            "You have been reprogrammed",
            r"(?i)you\s+have\s+been\s+reprogrammed",
            Critical,
            95
        ),
        pat!("RC-014", InstructionOverride, "New instructions:", r"(?i)new\s+instructions?\s*:", High, 85),
        // ── Instruction override (12) ───────────────────────────────
        pat!("IO-001", InstructionOverride, "Ignore the above", r"(?i)ignore\s+the\s+above", Critical, 100),
        pat!(
            "IO-002",
            InstructionOverride,
            "Disregard the ... and",
            r"(?i)disregard\s+the\s+\w+\s+and\b",
            High,
            90
        ),
        pat!("IO-003", InstructionOverride, "Do not follow", r"(?i)do\s+not\s+follow", High, 85),
        pat!(
            "IO-004",
            Jailbreak,
            "Cancel all restrictions",
            r"(?i)cancel\s+all\s+restrictions",
            Critical,
            95
        ),
        pat!("IO-005", Jailbreak, "Remove safety", r"(?i)remove\s+(all\s+)?safety", Critical, 95),
        pat!("IO-006", Jailbreak, "Disable filters", r"(?i)disable\s+(all\s+)?filters", Critical, 95),
        pat!("IO-007", Jailbreak, "Bypass the", r"(?i)bypass\s+the\b", High, 85),
        pat!("IO-008", InstructionOverride, "Override: prefix", r"(?i)^override\s*:", High, 90),
        pat!("IO-009", ContextHijack, "admin tag", r"<admin>", Critical, 95),
        pat!("IO-010", CodeExecution, "Execute the following", r"(?i)execute\s+the\s+following", Medium, 70),
        pat!(
            "IO-011",
            Jailbreak,
            "Unlock hidden/secret mode",
            r"(?i)unlock\s+(hidden|secret)\s+mode",
            High,
            90
        ),
        pat!(
            "IO-012",
            Jailbreak,
            "Enter dev/debug/god mode",
            r"(?i)enter\s+(developer|debug|god)\s+mode",
            High,
            90
        ),
        // ── Delimiter / context manipulation (10) ───────────────────
        pat!("DM-001", ContextHijack, "Dash-delimited system: hijack", r"(?s)---\n.*(?i)system\s*:", High, 85),
        pat!(
            "DM-002",
            ContextHijack,
            "Code-block system: hijack",
            r"(?s)```\w*\n.*(?i)system\s*:",
            High,
            85
        ),
        pat!("DM-003", ContextHijack, "[INST] tag", r"\[INST\]", High, 90),
        pat!("DM-004", ContextHijack, "Special token <|...|>", r"<\|[a-z_]+\|>", Critical, 95),
        pat!("DM-005", ContextHijack, "End of prompt marker", r"(?i)end\s+of\s+prompt", Medium, 70),
        pat!("DM-006", CodeExecution, "Template variable abuse {{ }}", r"(?i)\{\{[^}]*\}\}", Medium, 60),
        pat!("DM-007", ContextHijack, "HTML comment injection", r"(?s)<!--.*?-->", Medium, 60),
        pat!("DM-008", ContextHijack, "</s> end-of-sequence token", r"</s>", High, 90),
        pat!(
            "DM-009",
            ContextHijack,
            "ChatML markers",
            r"(?i)<\|im_start\|>|<\|im_end\|>",
            Critical,
            95
        ),
        pat!("DM-010", ContextHijack, "Excessive newlines", r"\n{10,}", Medium, 50),
        // ── Information extraction (8) ───────────────────────────────
        pat!(
            "SE-001",
            InfoExtraction,
            "Repeat the/your/all instructions",
            r"(?i)repeat\s+(the|your|all)\s+instructions",
            High,
            90
        ),
        pat!(
            "SE-002",
            InfoExtraction,
            "Print/show/display prompt",
            r"(?i)(print|show|display)\s+(the\s+)?(system\s+)?prompt",
            High,
            90
        ),
        pat!(
            "SE-003",
            InfoExtraction,
            "Show me the original",
            r"(?i)show\s+me\s+the\s+original",
            Medium,
            70
        ),
        pat!("SE-004", InfoExtraction, "Tell me your rules", r"(?i)tell\s+me\s+your\s+rules", High, 85),
        pat!(
            "SE-005",
            InfoExtraction,
            "What were you told/instructions",
            r"(?i)what\s+(were\s+you\s+told|are\s+your\s+instructions)",
            High,
            85
        ),
        pat!(
            "SE-006",
            InfoExtraction,
            "What is your system prompt",
            r"(?i)what\s+is\s+your\s+system\s+prompt",
            Critical,
            95
        ),
        pat!(
            "SE-007",
            InfoExtraction,
            "Start response with quote",
            r"(?i)start\s+(your\s+)?response\s+with",
            Medium,
            70
        ),
        pat!(
            "SE-008",
            InfoExtraction,
            "Reproduce the text above",
            r"(?i)reproduce\s+the\s+text\s+above",
            High,
            90
        ),
        pat!(
            "SE-009",
            InfoExtraction,
            "Reveal the system prompt",
            r"(?i)reveal\s+(the\s+)?(system\s+)?prompt",
            Critical,
            95
        ),
        // ── Encoding evasion / obfuscation (7) ───────────────────────
        pat!("EE-001", Obfuscation, "Unicode escape", r"\\u[0-9a-fA-F]{4}", Medium, 60),
        pat!("EE-002", Obfuscation, "URL-encoded byte", r"%[0-9a-fA-F]{2}", Medium, 50),
        pat!("EE-003", Obfuscation, "HTML entity escape", r"&#x?[0-9a-fA-F]+;", Medium, 60),
        pat!(
            "EE-004",
            Obfuscation,
            "Base64-like blob",
            r"(?i)[a-zA-Z0-9+/]{20,}={0,2}",
            Low,
            40
        ),
        pat!(
            "EE-005",
            Obfuscation,
            "Encoding method reference",
            r"(?i)rot13|base64|hex\s+encode",
            Medium,
            65
        ),
        pat!("EE-006", Obfuscation, "Decode this/the following", r"(?i)decode\s+(this|the\s+following)", Medium, 60),
        pat!(
            "EE-007",
            Obfuscation,
            "Leet-speak ignore-previous override",
            r"(?i)[i1!|]gn[o0]r[e3]\s+(all\s+)?previous\b",
            Critical,
            90
        ),
        // ── Code execution ──────────────────────────────────────────
        pat!(
            "CE-001",
            CodeExecution,
            "Run this code/script",
            r"(?i)run\s+this\s+(code|script)",
            High,
            85
        ),
        pat!("CE-002", CodeExecution, "eval( call", r"(?i)\beval\s*\(", Critical, 90),
        pat!("CE-003", CodeExecution, "exec( call", r"(?i)\bexec\s*\(", Critical, 90),
        pat!(
            "CE-004",
            CodeExecution,
            "os.system / subprocess invocation",
            r"(?i)os\.system\s*\(|subprocess\.(run|call|popen)",
            Critical,
            95
        ),
        pat!(
            "CE-005",
            CodeExecution,
            "Shell command execution phrasing",
            r"(?i)(run|execute)\s+(this\s+)?shell\s+command",
            High,
            85
        ),
        pat!(
            "CE-006",
            CodeExecution,
            "rm -rf or destructive shell invocation",
            r"rm\s+-rf\s+/",
            Critical,
            95
        ),
    ]
}

// ── Compiled set ──────────────────────────────────────────────────────

/// The pattern set after validation and priority ordering — what [`crate::matcher`]
/// actually compiles into an automaton.
#[derive(Debug, Clone)]
pub struct CompiledSet {
    /// Patterns sorted descending by [`Pattern::priority_key`].
    pub patterns: Vec<Pattern>,
}

impl CompiledSet {
    /// Validates each pattern's regex (skipping, and logging via
    /// `tracing::warn!`, any that fail to compile) and returns the
    /// remaining set sorted descending by priority key.
    ///
    /// An empty input — or an input where every pattern is invalid —
    /// produces an empty `CompiledSet`; this is not an error.
    #[must_use]
    pub fn compile(patterns: Vec<Pattern>) -> Self {
        let mut valid: Vec<Pattern> = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            match regex_lite_check(&pattern.regex) {
                Ok(()) => valid.push(pattern),
                Err(reason) => {
                    tracing::warn!(pattern_id = %pattern.id, %reason, "skipping pattern with invalid regex");
                }
            }
        }
        valid.sort_by(|a, b| b.priority_key().cmp(&a.priority_key()));
        Self { patterns: valid }
    }

    /// Stable cache key: the sorted tuple of `(id, severity, weight)` for
    /// every pattern in the set.
    #[must_use]
    pub fn cache_key(&self) -> Vec<(String, Severity, u8)> {
        let mut key: Vec<(String, Severity, u8)> = self
            .patterns
            .iter()
            .map(|p| (p.id.to_string(), p.severity, p.weight))
            .collect();
        key.sort();
        key
    }

    /// Number of patterns in the set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    /// Whether the set has no patterns.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

#[cfg(feature = "heuristics")]
fn regex_lite_check(source: &str) -> Result<(), String> {
    regex::Regex::new(source).map(|_| ()).map_err(|e| e.to_string())
}

#[cfg(not(feature = "heuristics"))]
fn regex_lite_check(_source: &str) -> Result<(), String> {
    Ok(())
}

// ── Cache ──────────────────────────────────────────────────────────────

/// Process-wide LRU cache of compiled pattern sets, keyed by
/// [`CompiledSet::cache_key`].
///
/// Guarded by a `parking_lot::Mutex` rather than `std::sync::Mutex` —
/// contention here is brief (a key lookup plus, on miss, an insert) and
/// `parking_lot` avoids poisoning semantics that don't apply to this use.
pub struct PatternCache {
    capacity: usize,
    inner: parking_lot::Mutex<CacheInner>,
}

struct CacheInner {
    entries: HashMap<Vec<(String, Severity, u8)>, CompiledSet>,
    order: Vec<Vec<(String, Severity, u8)>>,
}

impl PatternCache {
    /// Builds a new cache with the given capacity (recommended: 100).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: parking_lot::Mutex::new(CacheInner {
                entries: HashMap::new(),
                order: Vec::new(),
            }),
        }
    }

    /// Looks up a compiled set by key, marking it most-recently-used on hit.
    #[must_use]
    pub fn get(&self, key: &[(String, Severity, u8)]) -> Option<CompiledSet> {
        let mut inner = self.inner.lock();
        if let Some(set) = inner.entries.get(key).cloned() {
            inner.order.retain(|k| k != key);
            inner.order.push(key.to_vec());
            Some(set)
        } else {
            None
        }
    }

    /// Inserts a compiled set, evicting the least-recently-used entry if the
    /// cache is at capacity.
    pub fn insert(&self, key: Vec<(String, Severity, u8)>, set: CompiledSet) {
        let mut inner = self.inner.lock();
        if inner.entries.len() >= self.capacity && !inner.entries.contains_key(&key) {
            if !inner.order.is_empty() {
                let lru = inner.order.remove(0);
                inner.entries.remove(&lru);
            }
        }
        inner.order.retain(|k| k != &key);
        inner.order.push(key.clone());
        inner.entries.insert(key, set);
    }

    /// Current number of cached entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 1. the catalog is at least 50 patterns
    #[test]
    fn builtin_has_at_least_50_patterns() {
        assert!(builtin_patterns().len() >= 50);
    }

    // 2. all six categories are represented
    #[test]
    fn all_six_categories_represented() {
        let patterns = builtin_patterns();
        for cat in [
            Category::InstructionOverride,
            Category::ContextHijack,
            Category::InfoExtraction,
            Category::CodeExecution,
            Category::Jailbreak,
            Category::Obfuscation,
        ] {
            assert!(
                patterns.iter().any(|p| p.category == cat),
                "no built-in pattern for category {cat}"
            );
        }
    }

    // 3. pattern ids are unique
    #[test]
    fn pattern_ids_are_unique() {
        let patterns = builtin_patterns();
        let mut ids: Vec<&str> = patterns.iter().map(|p| p.id.as_ref()).collect();
        ids.sort_unstable();
        let mut deduped = ids.clone();
        deduped.dedup();
        assert_eq!(ids.len(), deduped.len());
    }

    // 4. weights are in 0..=100
    #[test]
    fn weights_in_range() {
        for pattern in builtin_patterns() {
            assert!(pattern.weight <= 100);
        }
    }

    // 5. all patterns compile as valid regexes
    #[cfg(feature = "heuristics")]
    #[test]
    fn all_patterns_compile() {
        for pattern in builtin_patterns() {
            assert!(
                regex::Regex::new(&pattern.regex).is_ok(),
                "pattern {} failed to compile: {}",
                pattern.id,
                pattern.regex
            );
        }
    }

    // 6. compile() sorts descending by priority key
    #[test]
    fn compile_sorts_descending_by_priority() {
        let set = CompiledSet::compile(builtin_patterns());
        for pair in set.patterns.windows(2) {
            assert!(pair[0].priority_key() >= pair[1].priority_key());
        }
    }

    // 7. compile() skips invalid regex without failing the whole batch
    #[cfg(feature = "heuristics")]
    #[test]
    fn compile_skips_invalid_regex() {
        let mut patterns = builtin_patterns();
        patterns.push(Pattern {
            id: Cow::Borrowed("BAD-001"),
            regex: Cow::Borrowed("(unclosed"),
            severity: Severity::Low,
            category: Category::Obfuscation,
            weight: 10,
            sanitize: false,
            description: None,
        });
        let before = patterns.len();
        let set = CompiledSet::compile(patterns);
        assert_eq!(set.len(), before - 1);
    }

    // 8. cache round-trips a compiled set by its stable key
    #[test]
    fn cache_round_trips() {
        let cache = PatternCache::new(4);
        let set = CompiledSet::compile(builtin_patterns());
        let key = set.cache_key();
        assert!(cache.get(&key).is_none());
        cache.insert(key.clone(), set.clone());
        let hit = cache.get(&key).expect("cache hit");
        assert_eq!(hit.len(), set.len());
    }

    // 9. cache evicts least-recently-used entry at capacity
    #[test]
    fn cache_evicts_lru() {
        let cache = PatternCache::new(2);
        let mut keys = Vec::new();
        for i in 0..3 {
            let mut patterns = builtin_patterns();
            patterns.truncate(1 + i);
            let set = CompiledSet::compile(patterns);
            let key = set.cache_key();
            cache.insert(key.clone(), set);
            keys.push(key);
        }
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&keys[0]).is_none());
        assert!(cache.get(&keys[2]).is_some());
    }
}
