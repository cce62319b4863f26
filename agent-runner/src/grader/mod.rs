//! Grader layer
//!
//! A grader turns one grading request into a response by invoking whatever
//! actually evaluates the submission: an HTTP service, a local program, or
//! (for load testing) nothing at all.
//!
//! Graders deliberately stay small:
//! - `grade` does not complete until the result is known, so a worker holds
//!   exactly one request at a time and the broker's prefetch credit keeps
//!   the backend from being flooded
//! - no internal concurrency, rate limiting or retries; the worker owns
//!   flow control and the failure policy
//! - every failure is reported as a typed [`GradingError`], never as a
//!   fabricated success

mod command;
mod http;
mod sleep;

pub use command::CommandGrader;
pub use http::HttpGrader;
pub use sleep::{SLEEP_RESPONSE, SleepGrader};

use agent_core::{ConfigurationError, GraderConfig, GraderRequest, GraderResponse, GradingError};
use async_trait::async_trait;
use std::sync::Arc;

/// Capability shared by every grader variant
#[async_trait]
pub trait Grader: Send + Sync {
    /// Grades one request
    ///
    /// # Returns
    /// A successful response, or the reason no result could be obtained
    async fn grade(&self, request: &GraderRequest) -> Result<GraderResponse, GradingError>;

    /// Short description for startup logs
    fn describe(&self) -> String;
}

/// Builds a fully configured grader
///
/// Fails fast on invalid configuration so that a misconfigured agent never
/// starts consuming.
pub fn from_config(config: &GraderConfig) -> Result<Arc<dyn Grader>, ConfigurationError> {
    let grader: Arc<dyn Grader> = match config {
        GraderConfig::Http(http) => Arc::new(HttpGrader::from_config(http)?),
        GraderConfig::Sleep(sleep) => Arc::new(SleepGrader::from_config(sleep)?),
        GraderConfig::Command(command) => Arc::new(CommandGrader::from_config(command)?),
    };
    Ok(grader)
}

/// Truncates backend output for error messages and logs
pub(crate) fn preview(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_core::{CommandGraderConfig, HttpGraderConfig, SleepGraderConfig};

    #[test]
    fn test_from_config_builds_each_variant() {
        let http = from_config(&GraderConfig::Http(HttpGraderConfig::new(
            "http://localhost:9000/grade",
        )))
        .unwrap();
        assert!(http.describe().contains("http://localhost:9000/grade"));

        let sleep = from_config(&GraderConfig::Sleep(SleepGraderConfig::default())).unwrap();
        assert!(sleep.describe().starts_with("SleepGrader"));

        let command = from_config(&GraderConfig::Command(CommandGraderConfig::new(
            "cat",
            vec![],
        )))
        .unwrap();
        assert!(command.describe().contains("cat"));
    }

    #[test]
    fn test_from_config_fails_fast() {
        let result = from_config(&GraderConfig::Sleep(SleepGraderConfig::new(0.5, 0.1)));
        assert!(matches!(result, Err(ConfigurationError::Invalid { .. })));

        let result = from_config(&GraderConfig::Http(HttpGraderConfig::new("")));
        assert!(matches!(result, Err(ConfigurationError::Missing("url"))));
    }

    #[test]
    fn test_preview_truncates_on_char_boundary() {
        assert_eq!(preview("short", 10), "short");
        assert_eq!(preview("ééééé", 2), "éé…");
    }
}
