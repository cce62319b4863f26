//! HTTP grader
//!
//! POSTs the raw payload to a grading endpoint and decodes the JSON reply.

use agent_core::{ConfigurationError, GraderRequest, GraderResponse, GradingError, HttpGraderConfig};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

use super::{Grader, preview};

/// Longest response body quoted in a status error
const ERROR_BODY_PREVIEW: usize = 512;

/// Grader backed by an HTTP endpoint
#[derive(Debug, Clone)]
pub struct HttpGrader {
    client: Client,
    url: String,
    timeout: Duration,
}

impl HttpGrader {
    /// Creates an HTTP grader
    ///
    /// # Arguments
    /// * `url` - Endpoint receiving the payload (e.g., "http://localhost:1710/grade")
    /// * `timeout` - Bound on the whole request, from connect to the last body byte
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, ConfigurationError> {
        let mut config = HttpGraderConfig::new(url);
        config.timeout_secs = timeout.as_secs_f64();
        Self::from_config(&config)
    }

    pub fn from_config(config: &HttpGraderConfig) -> Result<Self, ConfigurationError> {
        config.validate()?;
        let timeout = config.timeout()?;

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConfigurationError::invalid("http_client", e.to_string()))?;

        Ok(Self {
            client,
            url: config.url.clone(),
            timeout,
        })
    }

    fn classify(&self, err: reqwest::Error) -> GradingError {
        if err.is_timeout() {
            GradingError::Timeout(self.timeout)
        } else if err.is_decode() {
            GradingError::MalformedResponse(err.to_string())
        } else {
            GradingError::Connection(format!("{} ({})", err, self.url))
        }
    }
}

#[async_trait]
impl Grader for HttpGrader {
    async fn grade(&self, request: &GraderRequest) -> Result<GraderResponse, GradingError> {
        debug!(url = %self.url, delivery_tag = request.delivery_tag(), "posting grading request");

        let response = self
            .client
            .post(&self.url)
            .body(request.data().to_vec())
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = match response.text().await {
                Ok(body) => body,
                Err(e) => format!("<body unreadable: {}>", e),
            };
            return Err(GradingError::Status {
                status: status.as_u16(),
                body: preview(&body, ERROR_BODY_PREVIEW),
            });
        }

        let body = response.bytes().await.map_err(|e| self.classify(e))?;
        let data = serde_json::from_slice(&body).map_err(|e| {
            GradingError::MalformedResponse(format!(
                "{}: {}",
                e,
                preview(&String::from_utf8_lossy(&body), ERROR_BODY_PREVIEW)
            ))
        })?;

        Ok(GraderResponse::success(data))
    }

    fn describe(&self) -> String {
        format!("HttpGrader: POST {} (timeout {:?})", self.url, self.timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::spawn_http;
    use axum::Router;
    use axum::http::StatusCode;
    use axum::routing::post;
    use futures::StreamExt;

    fn request(body: &str) -> GraderRequest {
        GraderRequest::new(body.as_bytes().to_vec(), 1)
    }

    #[tokio::test]
    async fn test_grade_decodes_json_reply() {
        let app = Router::new().route(
            "/grade",
            post(|| async { axum::Json(serde_json::json!({"result": "ok"})) }),
        );
        let addr = spawn_http(app).await;

        let grader =
            HttpGrader::new(format!("http://{}/grade", addr), Duration::from_secs(5)).unwrap();
        let response = grader.grade(&request(r#"{"a":1}"#)).await.unwrap();

        assert!(response.success);
        assert_eq!(response.data, serde_json::json!({"result": "ok"}));
    }

    #[tokio::test]
    async fn test_grade_posts_raw_payload() {
        let app = Router::new().route(
            "/echo",
            post(|body: String| async move { axum::Json(serde_json::json!({ "echo": body })) }),
        );
        let addr = spawn_http(app).await;

        let grader =
            HttpGrader::new(format!("http://{}/echo", addr), Duration::from_secs(5)).unwrap();
        let response = grader.grade(&request("Hello world 1!")).await.unwrap();

        assert_eq!(response.data["echo"], "Hello world 1!");
    }

    #[tokio::test]
    async fn test_grade_times_out() {
        let app = Router::new().route(
            "/slow",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "too late"
            }),
        );
        let addr = spawn_http(app).await;

        let grader =
            HttpGrader::new(format!("http://{}/slow", addr), Duration::from_millis(100)).unwrap();
        let err = grader.grade(&request("{}")).await.unwrap_err();

        assert!(err.is_timeout(), "unexpected error: {:?}", err);
    }

    #[tokio::test]
    async fn test_grade_reports_error_status() {
        let app = Router::new().route(
            "/grade",
            post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "grader exploded") }),
        );
        let addr = spawn_http(app).await;

        let grader =
            HttpGrader::new(format!("http://{}/grade", addr), Duration::from_secs(5)).unwrap();
        let err = grader.grade(&request("{}")).await.unwrap_err();

        match err {
            GradingError::Status { status, body } => {
                assert_eq!(status, 500);
                assert_eq!(body, "grader exploded");
            }
            other => panic!("expected status error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_error_status_keeps_body_read_failure() {
        let app = Router::new().route(
            "/grade",
            post(|| async {
                let chunks = futures::stream::iter([
                    Ok::<_, std::io::Error>("partial body"),
                    Err(std::io::Error::other("connection reset")),
                ])
                .then(|chunk| async move {
                    if chunk.is_err() {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                    chunk
                });
                (StatusCode::BAD_GATEWAY, axum::body::Body::from_stream(chunks))
            }),
        );
        let addr = spawn_http(app).await;

        let grader =
            HttpGrader::new(format!("http://{}/grade", addr), Duration::from_secs(5)).unwrap();
        let err = grader.grade(&request("{}")).await.unwrap_err();

        match err {
            GradingError::Status { status, body } => {
                assert_eq!(status, 502);
                assert!(body.starts_with("<body unreadable"), "body: {}", body);
            }
            other => panic!("expected status error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_grade_rejects_non_json_body() {
        let app = Router::new().route("/grade", post(|| async { "<html>not json</html>" }));
        let addr = spawn_http(app).await;

        let grader =
            HttpGrader::new(format!("http://{}/grade", addr), Duration::from_secs(5)).unwrap();
        let err = grader.grade(&request("{}")).await.unwrap_err();

        assert_eq!(err.kind(), "malformed_response");
    }

    #[tokio::test]
    async fn test_grade_reports_connection_failure() {
        // Bind and immediately drop a listener to get a port nobody serves.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let grader =
            HttpGrader::new(format!("http://{}/grade", addr), Duration::from_secs(5)).unwrap();
        let err = grader.grade(&request("{}")).await.unwrap_err();

        assert_eq!(err.kind(), "connection");
    }

    #[test]
    fn test_invalid_url_rejected() {
        assert!(HttpGrader::new("localhost:9000", Duration::from_secs(1)).is_err());
        assert!(HttpGrader::new("http://localhost", Duration::ZERO).is_err());
    }
}
