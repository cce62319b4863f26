//! Core domain types
//!
//! These types describe one grading task as it moves from the broker,
//! through a grader, and back to the broker as an acknowledgment.

pub mod grader_config;
pub mod grading;
pub mod policy;
