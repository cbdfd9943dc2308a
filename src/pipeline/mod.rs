//! Guardrail staging framework — the ambient multi-stage pipeline shell the
//! detection engine (C1–C7) plugs into as a single stage.
//!
//! This module provides the foundational abstractions for composing
//! multi-stage content pipelines:
//!
//! - Async execution with Tokio
//! - Stage ordering and degradability
//! - Metadata propagation via [`stage::SecurityContext`]
//! - Graceful degradation on stage failures (see [`crate::config::FailMode`])
//!
//! ## Architecture
//!
//! ```text
//! PipelineExecutor
//!   ├─► Stage 1 (GuardStage — wraps a GuardContext)
//!   ├─► Stage 2 (...)            ◄── caller-supplied, conditional
//!   └─► Stage N (...)
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use promptwarden::pipeline::{executor::PipelineExecutor, guard_stage::GuardStage};
//! use promptwarden::guard::{GuardConfig, GuardContext};
//!
//! let context = std::sync::Arc::new(GuardContext::new(GuardConfig::default()));
//! let executor = PipelineExecutor::builder()
//!     .add_stage(GuardStage::new(context))
//!     .build();
//! ```

pub mod content;
pub mod executor;
#[cfg(feature = "heuristics")]
pub mod guard_stage;
pub mod outcome;
pub mod stage;
