//! Grading request/response types

use serde::{Deserialize, Serialize};

/// One grading task as delivered by the broker
///
/// The payload is opaque to the agent; only the grader interprets it.
/// The delivery tag is carried for logging.
#[derive(Debug, Clone)]
pub struct GraderRequest {
    data: Vec<u8>,
    delivery_tag: u64,
}

impl GraderRequest {
    /// Wraps a raw payload received under `delivery_tag`
    pub fn new(data: impl Into<Vec<u8>>, delivery_tag: u64) -> Self {
        Self {
            data: data.into(),
            delivery_tag,
        }
    }

    /// Raw payload bytes
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Payload as text, with invalid UTF-8 replaced
    pub fn data_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.data)
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }
}

/// Result produced by a grader
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraderResponse {
    pub data: serde_json::Value,
    pub success: bool,
}

impl GraderResponse {
    /// Creates a successful response carrying `data`
    pub fn success(data: serde_json::Value) -> Self {
        Self {
            data,
            success: true,
        }
    }
}
