//! Risk scorer (C4): combines pattern matches and trust-mixing signals into
//! a single 0–100 risk score.
//!
//! Grounded on the "small pure-function core behind a struct" shape used
//! for weighted-sum-then-clamp scoring elsewhere in this codebase; the
//! exact weights, multipliers, and the `quick_scan` staged fast path are
//! this engine's own and have no direct precedent.

use crate::matcher::PatternMatch;
use crate::segmenter::TrustLevel;
use crate::pipeline::outcome::Severity;

fn severity_weight(severity: Severity) -> f64 {
    match severity {
        Severity::Low => 20.0,
        Severity::Medium => 45.0,
        Severity::High => 85.0,
        Severity::Critical => 100.0,
        Severity::Info => 0.0,
    }
}

fn trust_multiplier(trust: TrustLevel) -> f64 {
    match trust {
        TrustLevel::System => 0.10,
        TrustLevel::User => 1.00,
        TrustLevel::ToolOutput => 1.20,
        TrustLevel::Untrusted => 2.00,
    }
}

/// Computes the full risk score:
/// 1. `risk += severity_weight × (confidence / 100)` per match.
/// 2. `risk *= 1.10` if more than one match.
/// 3. add trust-mixing contribution.
/// 4. apply the trust multiplier.
/// 5. clamp to `[0, 100]` — **after** the multiplier, so a `system` trust
///    level can still suppress an already-saturated base risk.
#[must_use]
pub fn score(matches: &[PatternMatch], trust_mixing_risk: u8, trust: TrustLevel) -> u8 {
    let mut risk: f64 = matches
        .iter()
        .map(|m| severity_weight(m.severity) * (f64::from(m.confidence) / 100.0))
        .sum();

    if matches.len() > 1 {
        risk *= 1.10;
    }

    risk += f64::from(trust_mixing_risk);
    risk *= trust_multiplier(trust);

    risk.clamp(0.0, 100.0).round() as u8
}

/// Severity floor used by `quick_scan`'s staged matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuickStage {
    /// Stage 1: critical patterns only.
    Critical,
    /// Stage 2: high-severity patterns.
    High,
    /// Stage 3: medium-severity patterns.
    Medium,
}

impl QuickStage {
    /// The severity floor this stage scans at.
    #[must_use]
    pub fn floor(self) -> Severity {
        match self {
            Self::Critical => Severity::Critical,
            Self::High => Severity::High,
            Self::Medium => Severity::Medium,
        }
    }
}

fn quick_severity_weight(severity: Severity) -> f64 {
    match severity {
        Severity::Critical => 95.0,
        Severity::High => 75.0,
        Severity::Medium => 45.0,
        Severity::Low => 20.0,
        Severity::Info => 0.0,
    }
}

/// `quick_scan`'s simplified aggregation: per-match weight × confidence,
/// with a floor of 80 if any critical match is present, 60 if any high
/// match is present, and multi-match scaling `× min(1.2, 1 + 0.1 × n)`.
#[must_use]
pub fn quick_score(matches: &[PatternMatch]) -> u8 {
    if matches.is_empty() {
        return 0;
    }

    let mut risk: f64 = matches
        .iter()
        .map(|m| quick_severity_weight(m.severity) * (f64::from(m.confidence) / 100.0))
        .sum();

    let scale = (1.0 + 0.1 * matches.len() as f64).min(1.2);
    risk *= scale;

    if matches.iter().any(|m| m.severity == Severity::Critical) {
        risk = risk.max(80.0);
    } else if matches.iter().any(|m| m.severity == Severity::High) {
        risk = risk.max(60.0);
    }

    risk.clamp(0.0, 100.0).round() as u8
}

/// Decides which `quick_scan` stage to run next, given the running risk and
/// the configured threshold. Returns `None` once the running risk already
/// meets the threshold (early exit) or stage 3's ambiguity window doesn't
/// apply.
#[must_use]
pub fn next_quick_stage(completed: Option<QuickStage>, running_risk: u8, threshold: u8) -> Option<QuickStage> {
    let threshold_f = f64::from(threshold);
    let risk_f = f64::from(running_risk);

    match completed {
        None => Some(QuickStage::Critical),
        Some(QuickStage::Critical) => {
            if running_risk >= threshold {
                None
            } else {
                Some(QuickStage::High)
            }
        }
        Some(QuickStage::High) => {
            if running_risk >= threshold {
                None
            } else if risk_f > 0.3 * threshold_f && risk_f < 0.8 * threshold_f {
                Some(QuickStage::Medium)
            } else {
                None
            }
        }
        Some(QuickStage::Medium) => None,
    }
}
