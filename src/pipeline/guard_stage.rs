//! [`GuardStage`] — adapts a [`GuardContext`](crate::guard::GuardContext)
//! into a [`GuardrailStage`] so the detection engine can be composed inside
//! a [`PipelineExecutor`](super::executor::PipelineExecutor) alongside other
//! guardrails.
//!
//! Grounded on the shape of this module's previous legacy-adapter pattern:
//! wrap an inner type that already knows how to evaluate content, translate
//! its result into a [`StageOutcome`], and let [`GuardrailStage::degradable`]
//! decide how the pipeline reacts to an internal failure. The engine itself
//! never returns `Err` to callers, so this stage's `evaluate` is effectively
//! infallible — `degradable` is kept `true` only so a future non-text
//! `Content` variant doesn't abort the whole pipeline.

use std::sync::Arc;

use async_trait::async_trait;

use super::content::Content;
use super::outcome::{Severity, StageError, StageOutcome};
use super::stage::{GuardrailStage, SecurityContext};
use crate::guard::GuardContext;
use crate::segmenter::TrustLevel;

/// Wraps a shared [`GuardContext`] as a single pipeline stage.
///
/// `trust_level` is the trust assigned to content this stage receives; it
/// has no way to infer trust from [`SecurityContext`], so the caller fixes
/// it at construction (e.g. one `GuardStage` per trust boundary in the
/// pipeline).
pub struct GuardStage {
    context: Arc<GuardContext>,
    trust_level: TrustLevel,
    id: &'static str,
}

impl GuardStage {
    /// Builds a stage bound to `context`, scanning content at `trust_level`.
    #[must_use]
    pub fn new(context: Arc<GuardContext>) -> Self {
        Self::with_trust(context, TrustLevel::User)
    }

    /// Builds a stage scanning content at an explicit trust level.
    #[must_use]
    pub fn with_trust(context: Arc<GuardContext>, trust_level: TrustLevel) -> Self {
        Self {
            context,
            trust_level,
            id: "promptwarden_guard",
        }
    }

    fn severity_of(risk: u8) -> Severity {
        match risk {
            0..=24 => Severity::Low,
            25..=49 => Severity::Medium,
            50..=84 => Severity::High,
            _ => Severity::Critical,
        }
    }
}

#[async_trait]
impl GuardrailStage for GuardStage {
    fn id(&self) -> &str {
        self.id
    }

    async fn evaluate(&self, content: &Content, _ctx: &SecurityContext) -> Result<StageOutcome, StageError> {
        let text = content.as_text();

        let result = self
            .context
            .scan(&text, self.trust_level)
            .map_err(|err| StageError::InvalidContent {
                stage: self.id.to_owned(),
                reason: err.to_string(),
            })?;

        if result.safe {
            return Ok(StageOutcome::allow(1.0 - f32::from(result.risk) / 100.0));
        }

        if result.sanitized != result.input {
            return Ok(StageOutcome::transform(
                Content::Text(result.sanitized),
                format!("sanitized {} pattern match(es)", result.matches.len()),
            ));
        }

        Ok(StageOutcome::block(
            format!("risk {} exceeds threshold ({} match(es))", result.risk, result.matches.len()),
            Self::severity_of(result.risk),
        ))
    }

    fn degradable(&self) -> bool {
        true
    }

    fn priority(&self) -> u32 {
        10
    }
}
