//! Sanitizer (C5): Unicode normalization applied to every scan, plus
//! rule-based redaction applied on request.
//!
//! The normalization half is ported from this codebase's existing
//! NFKC/zero-width/confusable/HTML-entity handling, generalized with
//! fullwidth folding, URL-percent decoding, and unusual-whitespace
//! collapsing per this engine's scope. HTML *tag* stripping and
//! script-mixing detection are dropped — out of scope for this engine,
//! which normalizes text for matching rather than rendering it safely as
//! HTML. The rule-based redaction half has no precedent in this codebase
//! and is new.

use std::borrow::Cow;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use unicode_normalization::{IsNormalized, UnicodeNormalization, is_nfkc_quick};

use crate::pattern::Category;

// ── Normalization ────────────────────────────────────────────────────────

fn is_dangerous_control_char(c: char) -> bool {
    matches!(
        c,
        '\u{200B}'..='\u{200F}'
        | '\u{FEFF}'
        | '\u{00AD}'
        | '\u{2060}'
        | '\u{202A}'..='\u{202E}'
        | '\u{2066}'..='\u{2069}'
        | '\u{E0001}'..='\u{E007F}'
        | '\u{FE00}'..='\u{FE0F}'
    )
}

fn strip_control_chars(input: &str) -> Cow<'_, str> {
    if !input.chars().any(is_dangerous_control_char) {
        return Cow::Borrowed(input);
    }
    Cow::Owned(input.chars().filter(|c| !is_dangerous_control_char(*c)).collect())
}

fn normalize_nfkc(input: &str) -> Cow<'_, str> {
    if is_nfkc_quick(input.chars()) == IsNormalized::Yes {
        return Cow::Borrowed(input);
    }
    let normalized: String = input.nfkc().collect();
    if normalized == input {
        Cow::Borrowed(input)
    } else {
        Cow::Owned(normalized)
    }
}

static CONFUSABLES: &[(char, &str)] = &[
    ('\u{0391}', "A"),
    ('\u{0392}', "B"),
    ('\u{0395}', "E"),
    ('\u{0397}', "H"),
    ('\u{0399}', "I"),
    ('\u{039A}', "K"),
    ('\u{039C}', "M"),
    ('\u{039D}', "N"),
    ('\u{039F}', "O"),
    ('\u{03A1}', "P"),
    ('\u{03A4}', "T"),
    ('\u{03A7}', "X"),
    ('\u{03B9}', "i"),
    ('\u{03BD}', "v"),
    ('\u{03BF}', "o"),
    ('\u{0410}', "A"),
    ('\u{0412}', "B"),
    ('\u{0415}', "E"),
    ('\u{041A}', "K"),
    ('\u{041C}', "M"),
    ('\u{041D}', "H"),
    ('\u{041E}', "O"),
    ('\u{0420}', "P"),
    ('\u{0421}', "C"),
    ('\u{0422}', "T"),
    ('\u{0425}', "X"),
    ('\u{0430}', "a"),
    ('\u{0435}', "e"),
    ('\u{043E}', "o"),
    ('\u{0440}', "p"),
    ('\u{0441}', "c"),
    ('\u{0443}', "y"),
    ('\u{0445}', "x"),
    ('\u{2115}', "N"),
    ('\u{211D}', "R"),
    ('\u{2124}', "Z"),
    ('\u{212E}', "e"),
    ('\u{2170}', "i"),
    ('\u{2171}', "ii"),
];

fn normalize_confusables(input: &str) -> Cow<'_, str> {
    let needs_work = input
        .chars()
        .any(|c| CONFUSABLES.binary_search_by_key(&c, |&(k, _)| k).is_ok());
    if !needs_work {
        return Cow::Borrowed(input);
    }
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match CONFUSABLES.binary_search_by_key(&c, |&(k, _)| k) {
            Ok(idx) => out.push_str(CONFUSABLES[idx].1),
            Err(_) => out.push(c),
        }
    }
    Cow::Owned(out)
}

fn decode_html_entities(input: &str) -> Cow<'_, str> {
    static ENTITY_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"&(#x?[0-9a-fA-F]+|[a-zA-Z]+);").unwrap());

    if !input.contains('&') {
        return Cow::Borrowed(input);
    }

    let result = ENTITY_RE.replace_all(input, |caps: &regex::Captures<'_>| {
        let inner = &caps[1];
        if let Some(hex) = inner.strip_prefix("#x").or_else(|| inner.strip_prefix("#X")) {
            u32::from_str_radix(hex, 16)
                .ok()
                .and_then(char::from_u32)
                .map_or_else(|| caps[0].to_string(), |c| c.to_string())
        } else if let Some(dec) = inner.strip_prefix('#') {
            dec.parse::<u32>()
                .ok()
                .and_then(char::from_u32)
                .map_or_else(|| caps[0].to_string(), |c| c.to_string())
        } else {
            match inner {
                "amp" => "&".to_string(),
                "lt" => "<".to_string(),
                "gt" => ">".to_string(),
                "quot" => "\"".to_string(),
                "apos" => "'".to_string(),
                "nbsp" => " ".to_string(),
                "copy" => "\u{00A9}".to_string(),
                "reg" => "\u{00AE}".to_string(),
                "trade" => "\u{2122}".to_string(),
                "euro" => "\u{20AC}".to_string(),
                "pound" => "\u{00A3}".to_string(),
                "yen" => "\u{00A5}".to_string(),
                "cent" => "\u{00A2}".to_string(),
                "mdash" => "\u{2014}".to_string(),
                "ndash" => "\u{2013}".to_string(),
                "laquo" => "\u{00AB}".to_string(),
                "raquo" => "\u{00BB}".to_string(),
                "hellip" => "\u{2026}".to_string(),
                "bull" => "\u{2022}".to_string(),
                "middot" => "\u{00B7}".to_string(),
                _ => caps[0].to_string(),
            }
        }
    });

    match result {
        Cow::Borrowed(_) => Cow::Borrowed(input),
        Cow::Owned(s) if s == input => Cow::Borrowed(input),
        Cow::Owned(s) => Cow::Owned(s),
    }
}

fn decode_url_percent(input: &str) -> Cow<'_, str> {
    static PERCENT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"%[0-9a-fA-F]{2}").unwrap());

    if !input.contains('%') {
        return Cow::Borrowed(input);
    }

    let result = PERCENT_RE.replace_all(input, |caps: &regex::Captures<'_>| {
        let hex = &caps[0][1..];
        u8::from_str_radix(hex, 16)
            .ok()
            .filter(|b| b.is_ascii())
            .map_or_else(|| caps[0].to_string(), |b| (b as char).to_string())
    });

    match result {
        Cow::Borrowed(_) => Cow::Borrowed(input),
        Cow::Owned(s) if s == input => Cow::Borrowed(input),
        Cow::Owned(s) => Cow::Owned(s),
    }
}

/// Folds fullwidth ASCII variants (`U+FF01`–`U+FF5E`) down to their plain
/// ASCII counterparts (offset `0xFEE0`).
fn fold_fullwidth(input: &str) -> Cow<'_, str> {
    let needs_work = input.chars().any(|c| ('\u{FF01}'..='\u{FF5E}').contains(&c));
    if !needs_work {
        return Cow::Borrowed(input);
    }
    let out: String = input
        .chars()
        .map(|c| {
            if ('\u{FF01}'..='\u{FF5E}').contains(&c) {
                char::from_u32(c as u32 - 0xFEE0).unwrap_or(c)
            } else {
                c
            }
        })
        .collect();
    Cow::Owned(out)
}

fn is_unusual_whitespace(c: char) -> bool {
    matches!(
        c,
        '\u{00A0}' // NBSP
        | '\u{1680}'
        | '\u{2000}'..='\u{200A}'
        | '\u{2028}'
        | '\u{2029}'
        | '\u{202F}'
        | '\u{205F}'
        | '\u{3000}' // ideographic space
    )
}

fn collapse_unusual_whitespace(input: &str) -> Cow<'_, str> {
    if !input.chars().any(is_unusual_whitespace) {
        return Cow::Borrowed(input);
    }
    let out: String = input
        .chars()
        .map(|c| if is_unusual_whitespace(c) { ' ' } else { c })
        .collect();
    Cow::Owned(out)
}

/// Runs the full normalization pipeline applied before matching on every
/// scan: control-char stripping, NFKC, confusable folding, fullwidth
/// folding, whitespace collapsing, HTML-entity decoding, URL-percent
/// decoding. Failures at any individual step are tolerated — the
/// unmodified input for that step passes through.
#[must_use]
pub fn normalize(input: &str) -> String {
    let step1 = strip_control_chars(input);
    let step2 = normalize_nfkc(&step1);
    let step3 = normalize_confusables(&step2);
    let step4 = fold_fullwidth(&step3);
    let step5 = collapse_unusual_whitespace(&step4);
    let step6 = decode_html_entities(&step5);
    let step7 = decode_url_percent(&step6);
    step7.into_owned()
}

// ── Rule-based redaction ─────────────────────────────────────────────────

/// What a [`SanitizeRule`] does to its matched text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SanitizeAction {
    /// Delete every match of the rule's regex.
    Remove,
    /// Substitute each match with the rule's replacement string, or
    /// `[REDACTED:<category>]` if none is set.
    Replace,
    /// Wrap each match in double quotes, escaping inner quotes.
    Quote,
    /// Replace with `[NEUTRALIZED: <first 20 chars>...]`.
    Neutralize,
}

/// A sanitization rule: a regex, an action, and where it sits in the
/// application order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SanitizeRule {
    /// Regex identifying text to act on.
    pub regex: String,
    /// What to do with a match.
    pub action: SanitizeAction,
    /// Replacement string for `replace` (ignored otherwise).
    pub replacement: Option<String>,
    /// Category this rule is associated with, for rule ordering.
    pub category: Category,
    /// Higher runs first.
    pub priority: i32,
}

/// The default rule set applied when a [`crate::guard::GuardContext`] is
/// built with no custom rules: one or more rules per built-in category.
/// Rules that leave `replacement` unset fall back to the category-qualified
/// `[REDACTED:<category>]` marker (see [`apply_action`]); a few high-value
/// phrasings get their own named marker instead, per the public marker-token
/// contract.
#[must_use]
pub fn default_rules() -> Vec<SanitizeRule> {
    vec![
        // The single most common override phrasing gets its own named
        // marker; everything else in the category falls through to the
        // generic instruction-removed marker below.
        SanitizeRule {
            regex: r"(?i)ignore\s+(all\s+)?previous\s+instructions|ignore\s+the\s+above".to_string(),
            action: SanitizeAction::Replace,
            replacement: Some("[REQUEST_TO_IGNORE_INSTRUCTIONS]".to_string()),
            category: Category::InstructionOverride,
            priority: 95,
        },
        SanitizeRule {
            regex: r"(?i)disregard\s+(all\s+)?prior|forget\s+everything|do\s+not\s+follow|new\s+instructions?\s*:".to_string(),
            action: SanitizeAction::Replace,
            replacement: Some("[INSTRUCTION_REMOVED]".to_string()),
            category: Category::InstructionOverride,
            priority: 80,
        },
        SanitizeRule {
            regex: r"<admin>|<\|[a-z_]+\|>|\[/?INST\]|</s>".to_string(),
            action: SanitizeAction::Remove,
            replacement: None,
            category: Category::ContextHijack,
            priority: 90,
        },
        SanitizeRule {
            regex: r"(?i)what\s+is\s+your\s+system\s+prompt|repeat\s+(the|your|all)\s+instructions|reveal\s+the\s+system\s+prompt|(print|show|display)\s+(the\s+)?(system\s+)?prompt".to_string(),
            action: SanitizeAction::Replace,
            replacement: None,
            category: Category::InfoExtraction,
            priority: 80,
        },
        SanitizeRule {
            regex: r"(?i)\beval\s*\(|\bexec\s*\(|os\.system\s*\(|subprocess\.(run|call|popen)|run\s+this\s+(code|script)|execute\s+this\s+\w+\s+code".to_string(),
            action: SanitizeAction::Quote,
            replacement: None,
            category: Category::CodeExecution,
            priority: 90,
        },
        SanitizeRule {
            regex: r"(?i)you\s+are\s+now\b|pretend\s+(to\s+be|you\s+are)\b|override\s+your\s+programming".to_string(),
            action: SanitizeAction::Replace,
            replacement: None,
            category: Category::Jailbreak,
            priority: 80,
        },
        SanitizeRule {
            regex: r"(?i)[a-zA-Z0-9+/]{20,}={0,2}".to_string(),
            action: SanitizeAction::Replace,
            replacement: None,
            category: Category::Obfuscation,
            priority: 60,
        },
    ]
}

const MARKER_TOKEN_RE_SRC: &str =
    r"\[(REDACTED[^\]]*|NEUTRALIZED:[^\]]*|[A-Z_]+_REMOVED|REQUEST_TO_IGNORE_INSTRUCTIONS|MULTIPLE_REDACTIONS)\]";

/// Bracket markers plus already quote-wrapped spans. Used only to find the
/// exclusion zones for a rule scan — `MARKER_TOKEN_RE_SRC` alone still
/// drives the bracket-coalescing pass in [`final_cleanup`], since a
/// quote-wrapped span is not a redaction marker and must not coalesce into
/// `[MULTIPLE_REDACTIONS]`.
fn protected_span_regex() -> &'static Regex {
    static RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(&format!(r#"{MARKER_TOKEN_RE_SRC}|"[^"\n]*""#)).unwrap());
    &RE
}

fn apply_action(text: &str, rule: &SanitizeRule, re: &Regex) -> String {
    match rule.action {
        SanitizeAction::Remove => re.replace_all(text, "").into_owned(),
        SanitizeAction::Replace => {
            let fallback;
            let replacement = match rule.replacement.as_deref() {
                Some(r) => r,
                None => {
                    fallback = format!("[REDACTED:{}]", rule.category);
                    &fallback
                }
            };
            re.replace_all(text, regex::NoExpand(replacement)).into_owned()
        }
        SanitizeAction::Quote => re
            .replace_all(text, |caps: &regex::Captures<'_>| {
                format!("\"{}\"", caps[0].replace('"', "\\\""))
            })
            .into_owned(),
        SanitizeAction::Neutralize => re
            .replace_all(text, |caps: &regex::Captures<'_>| {
                let snippet: String = caps[0].chars().take(20).collect();
                format!("[NEUTRALIZED: {snippet}...]")
            })
            .into_owned(),
    }
}

/// Sanitizes `text` against `rules` matching any of `categories_present`
/// first (descending priority), then all remaining default rules
/// (descending priority), followed by the final cleanup pass.
///
/// Idempotent on its own output within the same call: rule regexes never
/// re-scan text inside an already-emitted marker token.
#[must_use]
pub fn sanitize(text: &str, rules: &[SanitizeRule], categories_present: &[Category]) -> String {
    let mut matching: Vec<&SanitizeRule> = rules
        .iter()
        .filter(|r| categories_present.contains(&r.category))
        .collect();
    matching.sort_by(|a, b| b.priority.cmp(&a.priority));

    let mut remaining: Vec<&SanitizeRule> = rules
        .iter()
        .filter(|r| !categories_present.contains(&r.category))
        .collect();
    remaining.sort_by(|a, b| b.priority.cmp(&a.priority));

    let mut result = text.to_string();
    for rule in matching.into_iter().chain(remaining) {
        let Ok(re) = Regex::new(&rule.regex) else {
            tracing::warn!(regex = %rule.regex, "skipping sanitize rule with invalid regex");
            continue;
        };
        result = apply_outside_markers(&result, rule, &re);
    }

    final_cleanup(&result)
}

/// Applies `rule` to `text` but excludes marker-shaped substrings and
/// already quote-wrapped spans from the scan, so a rule can never re-match
/// output a previous rule (or a previous sanitize pass) already produced.
/// This is what keeps [`SanitizeAction::Quote`] idempotent: a span already
/// wrapped in quotes is never re-wrapped.
fn apply_outside_markers(text: &str, rule: &SanitizeRule, re: &Regex) -> String {
    let marker_re = protected_span_regex();
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0usize;
    for m in marker_re.find_iter(text) {
        out.push_str(&apply_action(&text[cursor..m.start()], rule, re));
        out.push_str(m.as_str());
        cursor = m.end();
    }
    out.push_str(&apply_action(&text[cursor..], rule, re));
    out
}

fn final_cleanup(text: &str) -> String {
    static WHITESPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());
    static EMPTY_BRACKET_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\[\s*\]").unwrap());
    static ADJACENT_MARKERS_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(&format!(r"(?:{MARKER_TOKEN_RE_SRC}\s*){{2,}}")).unwrap());

    let collapsed = WHITESPACE_RE.replace_all(text, " ");
    let no_empty_brackets = EMPTY_BRACKET_RE.replace_all(&collapsed, "");
    let coalesced = ADJACENT_MARKERS_RE.replace_all(&no_empty_brackets, "[MULTIPLE_REDACTIONS]");
    coalesced.trim().to_string()
}

/// Returns `Some(reason)` if `sanitized` still contains content the
/// sanitizer should have removed: residual context markers, residual
/// instruction-override verbs, or residual zero-width characters.
#[must_use]
pub fn validate_sanitized(sanitized: &str) -> Option<String> {
    static CONTEXT_MARKER_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?i)\[inst\]|\[system\]|<\|im_start\|>|<\|system\|>").unwrap());
    static OVERRIDE_VERB_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?i)ignore\s+(all\s+)?previous\s+instructions|disregard\s+(all\s+)?prior").unwrap());

    if CONTEXT_MARKER_RE.is_match(sanitized) {
        return Some("residual context marker".to_string());
    }
    if OVERRIDE_VERB_RE.is_match(sanitized) {
        return Some("residual instruction-override verb".to_string());
    }
    if sanitized.chars().any(is_dangerous_control_char) {
        return Some("residual zero-width or control character".to_string());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    // 1. NFKC normalization folds ligatures
    #[test]
    fn nfkc_folds_ligature() {
        let input = "\u{FB01}le"; // ﬁle
        assert_eq!(normalize(input), "file");
    }

    // 2. zero-width space is stripped
    #[test]
    fn strips_zwsp() {
        assert_eq!(normalize("a\u{200B}b"), "ab");
    }

    // 3. Cyrillic confusables fold to ASCII
    #[test]
    fn folds_cyrillic_confusables() {
        // Cyrillic А (U+0410) looks like Latin A
        assert_eq!(normalize("\u{0410}dmin"), "Admin");
    }

    // 4. HTML entities decode
    #[test]
    fn decodes_html_entities() {
        assert_eq!(normalize("a &amp; b &lt;tag&gt;"), "a & b <tag>");
    }

    // 5. URL-percent sequences decode
    #[test]
    fn decodes_url_percent() {
        assert_eq!(normalize("ignore%20previous"), "ignore previous");
    }

    // 6. fullwidth characters fold to ASCII
    #[test]
    fn folds_fullwidth() {
        assert_eq!(normalize("\u{FF29}\u{FF27}\u{FF2E}\u{FF2F}\u{FF32}\u{FF25}"), "IGNORE");
    }

    // 7. unusual whitespace collapses to a regular space
    #[test]
    fn collapses_unusual_whitespace() {
        assert_eq!(normalize("a\u{00A0}b"), "a b");
    }

    // 8. already-normalized ASCII text is untouched
    #[test]
    fn already_normal_text_untouched() {
        assert_eq!(normalize("hello world"), "hello world");
    }

    // 9. replace rule with no explicit replacement falls back to the
    // category-qualified [REDACTED:<category>] marker
    #[test]
    fn replace_rule_default_marker() {
        let rules = vec![SanitizeRule {
            regex: r"secret\d+".to_string(),
            action: SanitizeAction::Replace,
            replacement: None,
            category: Category::InfoExtraction,
            priority: 10,
        }];
        let out = sanitize("the value is secret123 here", &rules, &[]);
        assert_eq!(out, "the value is [REDACTED:info_extraction] here");
    }

    // 10. remove rule deletes the match entirely
    #[test]
    fn remove_rule_deletes_match() {
        let rules = vec![SanitizeRule {
            regex: r"<admin>".to_string(),
            action: SanitizeAction::Remove,
            replacement: None,
            category: Category::ContextHijack,
            priority: 10,
        }];
        let out = sanitize("before <admin> after", &rules, &[]);
        assert_eq!(out, "before after");
    }

    // 11. neutralize truncates to 20 chars
    #[test]
    fn neutralize_truncates_to_20_chars() {
        let rules = vec![SanitizeRule {
            regex: r"x{30}".to_string(),
            action: SanitizeAction::Neutralize,
            replacement: None,
            category: Category::Jailbreak,
            priority: 10,
        }];
        let out = sanitize(&"x".repeat(30), &rules, &[]);
        assert!(out.starts_with("[NEUTRALIZED: xxxxxxxxxxxxxxxxxxxx..."));
    }

    // 12. category-matching rules run before default rules regardless of
    // registration order
    #[test]
    fn category_matching_rules_run_first() {
        let rules = vec![
            SanitizeRule {
                regex: r"foo".to_string(),
                action: SanitizeAction::Replace,
                replacement: Some("[LOW]".to_string()),
                category: Category::Obfuscation,
                priority: 100,
            },
            SanitizeRule {
                regex: r"foo".to_string(),
                action: SanitizeAction::Replace,
                replacement: Some("[HIGH]".to_string()),
                category: Category::Jailbreak,
                priority: 1,
            },
        ];
        let out = sanitize("foo", &rules, &[Category::Jailbreak]);
        assert_eq!(out, "[HIGH]");
    }

    // 13. adjacent redaction markers coalesce into one
    #[test]
    fn coalesces_adjacent_markers() {
        let rules = vec![SanitizeRule {
            regex: r"a|b".to_string(),
            action: SanitizeAction::Replace,
            replacement: None,
            category: Category::Obfuscation,
            priority: 1,
        }];
        let out = sanitize("a b", &rules, &[]);
        assert_eq!(out, "[MULTIPLE_REDACTIONS]");
    }

    // 14. empty bracket tokens are deleted
    #[test]
    fn deletes_empty_bracket_tokens() {
        assert_eq!(final_cleanup("hello [] world"), "hello world");
    }

    // 15. idempotence: a marker token is never re-matched by a later rule
    #[test]
    fn marker_tokens_not_rematched() {
        let rules = vec![
            SanitizeRule {
                regex: r"secret".to_string(),
                action: SanitizeAction::Replace,
                replacement: None,
                category: Category::InfoExtraction,
                priority: 10,
            },
            SanitizeRule {
                regex: r"REDACTED".to_string(),
                action: SanitizeAction::Remove,
                replacement: None,
                category: Category::InfoExtraction,
                priority: 5,
            },
        ];
        let out = sanitize("secret", &rules, &[]);
        assert_eq!(out, "[REDACTED:info_extraction]");
    }

    // 16. validate_sanitized flags residual context markers
    #[test]
    fn validate_flags_residual_marker() {
        assert!(validate_sanitized("[INST] still here").is_some());
    }

    // 17. validate_sanitized passes clean text
    #[test]
    fn validate_passes_clean_text() {
        assert!(validate_sanitized("a perfectly ordinary sentence").is_none());
    }
}
