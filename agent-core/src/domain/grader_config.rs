//! Grader configuration
//!
//! A `GraderConfig` selects one grader variant and carries its parameters.
//! It is built once at startup and shared read-only by every worker.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ConfigurationError;

/// Default HTTP grader timeout in seconds
pub const DEFAULT_HTTP_TIMEOUT_SECS: f64 = 30.0;

/// Default command grader timeout in seconds
pub const DEFAULT_COMMAND_TIMEOUT_SECS: f64 = 300.0;

/// Grader selection and parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GraderConfig {
    /// POST the payload to an HTTP endpoint
    Http(HttpGraderConfig),
    /// Sleep for a random duration, then answer with a fixed payload
    Sleep(SleepGraderConfig),
    /// Pipe the payload through a local program
    Command(CommandGraderConfig),
}

impl GraderConfig {
    /// Short variant name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            GraderConfig::Http(_) => "http",
            GraderConfig::Sleep(_) => "sleep",
            GraderConfig::Command(_) => "command",
        }
    }

    /// Checks the parameters of the selected variant
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        match self {
            GraderConfig::Http(http) => http.validate(),
            GraderConfig::Sleep(sleep) => sleep.delay_range().map(|_| ()),
            GraderConfig::Command(command) => command.validate(),
        }
    }
}

impl Default for GraderConfig {
    fn default() -> Self {
        GraderConfig::Http(HttpGraderConfig::new("http://localhost/"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpGraderConfig {
    /// Endpoint that receives the POSTed payload
    pub url: String,

    /// Request timeout, covering connect through reading the body
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: f64,
}

impl HttpGraderConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
        }
    }

    /// Request timeout as a `Duration`
    pub fn timeout(&self) -> Result<Duration, ConfigurationError> {
        positive_duration("timeout_secs", self.timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.url.is_empty() {
            return Err(ConfigurationError::Missing("url"));
        }

        if !self.url.starts_with("http://") && !self.url.starts_with("https://") {
            return Err(ConfigurationError::invalid(
                "url",
                format!("'{}' must start with http:// or https://", self.url),
            ));
        }

        self.timeout().map(|_| ())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SleepGraderConfig {
    /// Inclusive lower bound of the delay, in seconds
    #[serde(default)]
    pub min_secs: f64,

    /// Exclusive upper bound of the delay, in seconds
    #[serde(default = "default_sleep_max")]
    pub max_secs: f64,
}

impl SleepGraderConfig {
    pub fn new(min_secs: f64, max_secs: f64) -> Self {
        Self { min_secs, max_secs }
    }

    /// Returns the half-open delay range `[min, max)`
    ///
    /// Fails when either bound is negative or not finite, or when
    /// `min >= max`.
    pub fn delay_range(&self) -> Result<(Duration, Duration), ConfigurationError> {
        if self.min_secs >= self.max_secs {
            return Err(ConfigurationError::invalid(
                "min_secs",
                format!(
                    "min_secs ({}) must be less than max_secs ({})",
                    self.min_secs, self.max_secs
                ),
            ));
        }

        let min = non_negative_duration("min_secs", self.min_secs)?;
        let max = non_negative_duration("max_secs", self.max_secs)?;
        if min >= max {
            return Err(ConfigurationError::invalid(
                "max_secs",
                "delay range is narrower than one nanosecond",
            ));
        }
        Ok((min, max))
    }
}

impl Default for SleepGraderConfig {
    fn default() -> Self {
        Self::new(0.0, default_sleep_max())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandGraderConfig {
    /// Program to execute
    pub program: String,

    /// Arguments passed to the program
    #[serde(default)]
    pub args: Vec<String>,

    /// Maximum run time before the child is killed
    #[serde(default = "default_command_timeout")]
    pub timeout_secs: f64,
}

impl CommandGraderConfig {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            timeout_secs: DEFAULT_COMMAND_TIMEOUT_SECS,
        }
    }

    pub fn timeout(&self) -> Result<Duration, ConfigurationError> {
        positive_duration("timeout_secs", self.timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.program.trim().is_empty() {
            return Err(ConfigurationError::Missing("program"));
        }
        self.timeout().map(|_| ())
    }
}

fn default_http_timeout() -> f64 {
    DEFAULT_HTTP_TIMEOUT_SECS
}

fn default_command_timeout() -> f64 {
    DEFAULT_COMMAND_TIMEOUT_SECS
}

fn default_sleep_max() -> f64 {
    0.01
}

fn non_negative_duration(field: &'static str, secs: f64) -> Result<Duration, ConfigurationError> {
    Duration::try_from_secs_f64(secs).map_err(|_| {
        ConfigurationError::invalid(
            field,
            format!("{} is not a valid non-negative number of seconds", secs),
        )
    })
}

fn positive_duration(field: &'static str, secs: f64) -> Result<Duration, ConfigurationError> {
    let duration = non_negative_duration(field, secs)?;
    if duration.is_zero() {
        return Err(ConfigurationError::invalid(field, "must be greater than 0"));
    }
    Ok(duration)
}
