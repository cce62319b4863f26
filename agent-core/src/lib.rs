//! Agent Core
//!
//! Core types and abstractions for the grading agent.
//!
//! This crate contains:
//! - Domain types: grading requests, responses, grader configuration and
//!   the failure policy applied to messages whose grading failed
//! - Errors: the configuration and grading error taxonomy shared by the
//!   broker and runner crates

pub mod domain;
pub mod error;

pub use domain::grader_config::{
    CommandGraderConfig, GraderConfig, HttpGraderConfig, SleepGraderConfig,
};
pub use domain::grading::{GraderRequest, GraderResponse};
pub use domain::policy::{FailurePolicy, Settlement};
pub use error::{ConfigurationError, GradingError};
