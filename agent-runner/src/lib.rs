//! Agent Runner
//!
//! A grading agent that consumes grading requests from a message broker and
//! hands each one to a pluggable grader.
//!
//! Architecture:
//! - Configuration: defaults, `AGENT_*` environment variables, CLI overrides
//! - Graders: HTTP endpoint, local command, or synthetic delay
//! - Workers: one consumer channel each, fetch → grade → settle in sequence
//! - Pool: spawns and supervises the workers, reports their status
//! - Lifecycle: runs the pool until a signal, then drains it

pub mod config;
pub mod grader;
pub mod lifecycle;
pub mod pool;
pub mod worker;

#[cfg(test)]
mod test_support;
