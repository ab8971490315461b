//! Core types and error definitions for the Conductor workflow engine.
//!
//! This crate provides the foundational types shared across all Conductor crates:
//! the unified error enum and the human-interrupt records that suspend a workflow.
//!
//! # Main types
//!
//! - [`ConductorError`]: Unified error enum for all Conductor subsystems.
//! - [`ConductorResult`]: Convenience alias for `Result<T, ConductorError>`.
//! - [`HumanInterrupt`]: A structured request for human input, approval, or a tool connection.
//! - [`HumanResponse`]: The human's answer to a [`HumanInterrupt`].
//! - [`InputSpec`]: Declaration of a single input a human must (or may) supply.

/// Error types shared by every Conductor crate.
pub mod error;
/// Human-in-the-loop interrupt and response records.
pub mod interrupt;

pub use error::{ConductorError, ConductorResult};
pub use interrupt::{
    HumanInterrupt, HumanResponse, InputSpec, InterruptKind, InterruptView, APPROVAL_OPTIONS,
    TOOL_INPUT_PREFIX,
};
