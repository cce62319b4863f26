//! Synthetic grader for load and concurrency testing
//!
//! Sleeps for a random duration and answers with a fixed payload, which makes
//! pool throughput predictable without a real grading backend.

use agent_core::{
    ConfigurationError, GraderRequest, GraderResponse, GradingError, SleepGraderConfig,
};
use async_trait::async_trait;
use rand::RngExt;
use std::time::Duration;
use tracing::debug;

use super::Grader;

/// Payload returned by every successful sleep
pub const SLEEP_RESPONSE: &str = "Zzzzzzzz";

/// Sleeps for a duration drawn uniformly from `[min, max)`
#[derive(Debug, Clone)]
pub struct SleepGrader {
    min: Duration,
    max: Duration,
}

impl SleepGrader {
    /// Creates a sleep grader
    ///
    /// # Errors
    /// Returns a [`ConfigurationError`] when `min >= max`.
    pub fn new(min: Duration, max: Duration) -> Result<Self, ConfigurationError> {
        if min >= max {
            return Err(ConfigurationError::invalid(
                "min_secs",
                format!("min ({:?}) must be less than max ({:?})", min, max),
            ));
        }
        Ok(Self { min, max })
    }

    pub fn from_config(config: &SleepGraderConfig) -> Result<Self, ConfigurationError> {
        let (min, max) = config.delay_range()?;
        Self::new(min, max)
    }

    /// Draws the next delay
    pub fn sample_delay(&self) -> Duration {
        let secs = rand::rng().random_range(self.min.as_secs_f64()..self.max.as_secs_f64());
        let delay = Duration::from_secs_f64(secs).max(self.min);
        // Float rounding can land exactly on the exclusive bound.
        delay.min(self.max - Duration::from_nanos(1))
    }
}

#[async_trait]
impl Grader for SleepGrader {
    async fn grade(&self, request: &GraderRequest) -> Result<GraderResponse, GradingError> {
        let delay = self.sample_delay();
        debug!(delivery_tag = request.delivery_tag(), ?delay, "sleeping");
        tokio::time::sleep(delay).await;
        Ok(GraderResponse::success(serde_json::Value::String(
            SLEEP_RESPONSE.to_string(),
        )))
    }

    fn describe(&self) -> String {
        format!("SleepGrader: {:?} <= t < {:?}", self.min, self.max)
    }
}
