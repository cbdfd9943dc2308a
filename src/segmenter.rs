//! Trust segmenter (C3): splits text at recognizable context boundaries so
//! the scorer can reason about which parts of the input came from which
//! trust level.
//!
//! Built fresh, following this codebase's "single combined regex scan over
//! a fixed marker literal set, sorted by position" technique and the
//! config/builder shape used elsewhere here for marker-based scanning.

use serde::{Deserialize, Serialize};

/// Trust level of a piece of content.
///
/// Ranked `system(0) < user(1) < tool_output(2) < untrusted(3)` — lower
/// rank means higher trust. An *inversion* is a later segment whose rank
/// is strictly lower than (i.e. more trusted than) the previous segment's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    /// The system prompt / operator-controlled instructions.
    System,
    /// The end user's own input.
    User,
    /// Output returned from a tool call.
    ToolOutput,
    /// Content whose provenance is unknown or adversarial (e.g. retrieved
    /// documents, third-party content).
    Untrusted,
}

impl TrustLevel {
    fn rank(self) -> u8 {
        match self {
            Self::System => 0,
            Self::User => 1,
            Self::ToolOutput => 2,
            Self::Untrusted => 3,
        }
    }
}

impl std::fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::User => write!(f, "user"),
            Self::ToolOutput => write!(f, "tool_output"),
            Self::Untrusted => write!(f, "untrusted"),
        }
    }
}

/// Where a [`TrustSegment`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentSource {
    /// Text between two recognized boundary markers.
    Segmentation,
    /// The boundary marker itself.
    ContextMarker,
    /// No markers were found; the whole input is one segment.
    SingleSegment,
}

/// A contiguous span of text at a single trust level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustSegment {
    /// The segment's text.
    pub content: String,
    /// Trust level of this segment.
    pub trust: TrustLevel,
    /// Risk contribution of this segment alone (0–100).
    pub risk: u8,
    /// Where this segment came from.
    pub source: Option<SegmentSource>,
}

struct Marker {
    /// Byte offset in the input.
    start: usize,
    end: usize,
    /// Trust level that text *after* this marker inherits.
    post_trust: TrustLevel,
}

/// Splits `text` into [`TrustSegment`]s, starting from `initial_trust`.
#[must_use]
pub fn segment(text: &str, initial_trust: TrustLevel) -> Vec<TrustSegment> {
    let markers = find_markers(text);

    if markers.is_empty() {
        return vec![TrustSegment {
            content: text.to_string(),
            trust: initial_trust,
            risk: 0,
            source: Some(SegmentSource::SingleSegment),
        }];
    }

    let mut segments = Vec::with_capacity(markers.len() * 2 + 1);
    let mut cursor = 0usize;
    let mut current_trust = initial_trust;

    for marker in &markers {
        if marker.start > cursor {
            segments.push(TrustSegment {
                content: text[cursor..marker.start].to_string(),
                trust: current_trust,
                risk: 0,
                source: Some(SegmentSource::Segmentation),
            });
        }
        segments.push(TrustSegment {
            content: text[marker.start..marker.end].to_string(),
            trust: TrustLevel::Untrusted,
            risk: 80,
            source: Some(SegmentSource::ContextMarker),
        });
        current_trust = marker.post_trust;
        cursor = marker.end;
    }

    if cursor < text.len() {
        segments.push(TrustSegment {
            content: text[cursor..].to_string(),
            trust: current_trust,
            risk: 0,
            source: Some(SegmentSource::Segmentation),
        });
    }

    merge_adjacent(segments)
}

/// Merges adjacent segments that have equal trust, the same source, and
/// both risk below 50 — concatenated with a single space.
fn merge_adjacent(segments: Vec<TrustSegment>) -> Vec<TrustSegment> {
    let mut merged: Vec<TrustSegment> = Vec::with_capacity(segments.len());
    for seg in segments {
        if let Some(last) = merged.last_mut() {
            if last.trust == seg.trust && last.source == seg.source && last.risk < 50 && seg.risk < 50 {
                last.content.push(' ');
                last.content.push_str(&seg.content);
                continue;
            }
        }
        merged.push(seg);
    }
    merged
}

/// Additional risk contributed by how trust levels mix across the segment
/// list (clamped to ≤ 100).
#[must_use]
pub fn trust_mixing_risk(segments: &[TrustSegment]) -> u8 {
    let mut risk: u32 = 0;

    let has_system = segments.iter().any(|s| s.trust == TrustLevel::System);
    let has_untrusted = segments.iter().any(|s| s.trust == TrustLevel::Untrusted);
    if has_system && has_untrusted {
        risk += 30;
    }

    let distinct: std::collections::HashSet<TrustLevel> = segments.iter().map(|s| s.trust).collect();
    if distinct.len() > 3 {
        risk += 20;
    }

    if segments
        .iter()
        .any(|s| s.source == Some(SegmentSource::ContextMarker) && s.risk >= 50)
    {
        risk += 40;
    }

    if segments.windows(2).any(|pair| pair[1].trust.rank() < pair[0].trust.rank()) {
        risk += 25;
    }

    risk.min(100) as u8
}


fn find_markers(text: &str) -> Vec<Marker> {
    // A single combined scan: every literal marker is checked at every
    // byte offset in one pass over `text`, collecting hits in position
    // order. This avoids running N separate regex passes for N marker
    // literals.
    const MARKERS: &[(&str, TrustLevel)] = &[
        ("[inst]", TrustLevel::System),
        ("[instruction]", TrustLevel::System),
        ("[system]", TrustLevel::System),
        ("<|im_start|>", TrustLevel::System),
        ("<|system|>", TrustLevel::System),
        ("<|user|>", TrustLevel::User),
        ("<|human|>", TrustLevel::User),
        ("[tool_output]", TrustLevel::ToolOutput),
    ];

    let mut hits: Vec<Marker> = Vec::new();

    for (literal, post_trust) in MARKERS {
        for start in find_ascii_ci_all(text, literal) {
            hits.push(Marker {
                start,
                end: start + literal.len(),
                post_trust: *post_trust,
            });
        }
    }

    // `# system:` / `# system]` and fenced code blocks are structurally
    // distinct from the fixed-literal table above (case-insensitive word
    // boundary, and a paired open/close respectively) so they get their
    // own small regex scan merged into the same position-sorted list.
    if let Ok(re) = regex::Regex::new(r"(?i)#\s*system[:\]]") {
        for m in re.find_iter(text) {
            hits.push(Marker {
                start: m.start(),
                end: m.end(),
                post_trust: TrustLevel::System,
            });
        }
    }
    if let Ok(re) = regex::Regex::new(r"(?s)```.*?```") {
        for m in re.find_iter(text) {
            hits.push(Marker {
                start: m.start(),
                end: m.end(),
                post_trust: TrustLevel::ToolOutput,
            });
        }
    }

    hits.sort_by_key(|m| m.start);
    remove_overlaps(hits)
}

/// Finds every non-overlapping occurrence of `literal` (ASCII-only) in
/// `text`, matched case-insensitively on ASCII bytes. All recognized
/// markers are pure ASCII, so this avoids allocating a lowercased copy of
/// `text` — which would otherwise shift byte offsets whenever a non-ASCII
/// character's lowercase form has a different UTF-8 length (e.g. `İ`),
/// misaligning hits against the original text.
fn find_ascii_ci_all(text: &str, literal: &str) -> Vec<usize> {
    let haystack = text.as_bytes();
    let needle = literal.as_bytes();
    let mut out = Vec::new();
    if needle.is_empty() || needle.len() > haystack.len() {
        return out;
    }
    let mut i = 0usize;
    while i + needle.len() <= haystack.len() {
        if haystack[i..i + needle.len()]
            .iter()
            .zip(needle)
            .all(|(a, b)| a.eq_ignore_ascii_case(b))
        {
            out.push(i);
            i += needle.len();
        } else {
            i += 1;
        }
    }
    out
}

fn remove_overlaps(hits: Vec<Marker>) -> Vec<Marker> {
    let mut out: Vec<Marker> = Vec::with_capacity(hits.len());
    for hit in hits {
        if let Some(last) = out.last() {
            if hit.start < last.end {
                continue;
            }
        }
        out.push(hit);
    }
    out
}
