//! Feedback loop that turns benchmark failures into behavior spec revisions.
//!
//! The reflector watches a job tree written by an external benchmark engine,
//! classifies each finished task exactly once, batches the failures, asks an
//! external text collaborator to analyze the batch and revise the agent's
//! behavior spec, and publishes every accepted revision to a registry.
//!
//! - **[`core`]**: Pure, deterministic logic (marker classification, artifact
//!   layout, batch state, spec validation). No I/O.
//! - **[`io`]**: Side-effecting helpers (config, durable state, staging,
//!   collaborator processes, registry storage).
//!
//! Orchestration modules ([`scan`], [`aggregate`], [`analyze`], [`update`],
//! [`publish`], [`cycle`], [`looping`]) coordinate core logic with I/O.

pub mod aggregate;
pub mod analyze;
pub mod core;
pub mod cycle;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod looping;
pub mod publish;
pub mod scan;
pub mod status;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod update;
