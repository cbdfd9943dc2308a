//! Crate-wide error taxonomy.
//!
//! Each fallible boundary gets its own `thiserror` enum, colocated with the
//! module that raises it where it is purely internal; [`GuardError`] is the
//! one variant that actually crosses the public `scan`/`quick_scan` boundary
//! — everything else (pattern-compile failures, matcher failures, sanitizer
//! rule failures) is caught internally and folded into a fail-closed
//! [`crate::guard::DetectionResult`] rather than propagated.

use thiserror::Error;

/// Errors returned directly from [`crate::guard::GuardContext`] operations.
///
/// This is deliberately small: almost every internal failure mode is
/// non-fatal by design and surfaces as a fail-closed `DetectionResult`
/// instead of an `Err`. Only caller errors — input that cannot be scanned
/// at all — make it here.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GuardError {
    /// The caller passed content that is not scannable text.
    #[error("invalid input: {reason}")]
    InvalidInput {
        /// Human-readable explanation.
        reason: String,
    },
}

/// Errors internal to the compiled matcher (C2).
///
/// Never escapes [`crate::guard::GuardContext::scan`] — callers observe a
/// fail-closed result instead. Exposed publicly so unit tests and the
/// streaming shell can assert on the failure path directly.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MatcherError {
    /// The Aho-Corasick automaton failed to build from the extracted seeds.
    #[error("automaton construction failed: {reason}")]
    AutomatonBuild {
        /// Underlying error message.
        reason: String,
    },

    /// A verification regex panicked or otherwise failed during a scan.
    #[error("regex verification failed for pattern '{pattern_id}': {reason}")]
    Verification {
        /// Pattern whose verification step failed.
        pattern_id: String,
        /// Underlying error message.
        reason: String,
    },
}

/// Errors raised by the streaming shell (C7).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StreamError {
    /// `process_chunk` was called after the stream already reported
    /// `is_complete = true`.
    #[error("process_chunk called on a completed stream; call reset() first")]
    AlreadyComplete,
}
