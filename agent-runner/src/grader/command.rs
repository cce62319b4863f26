//! Command grader
//!
//! Runs a local program per request: the payload goes to its stdin and its
//! stdout is decoded as JSON.

use agent_core::{
    CommandGraderConfig, ConfigurationError, GraderRequest, GraderResponse, GradingError,
};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::{Grader, preview};

const STDERR_PREVIEW: usize = 512;

/// Grader that pipes each payload through a program
#[derive(Debug, Clone)]
pub struct CommandGrader {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandGrader {
    pub fn from_config(config: &CommandGraderConfig) -> Result<Self, ConfigurationError> {
        config.validate()?;
        Ok(Self {
            program: config.program.clone(),
            args: config.args.clone(),
            timeout: config.timeout()?,
        })
    }

    async fn run(&self, payload: &[u8]) -> Result<std::process::Output, GradingError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                GradingError::Connection(format!("failed to spawn '{}': {}", self.program, e))
            })?;

        let stdin = child.stdin.take();
        let write = async move {
            if let Some(mut stdin) = stdin {
                stdin.write_all(payload).await?;
                stdin.shutdown().await?;
            }
            Ok::<(), std::io::Error>(())
        };

        let (written, output) = tokio::join!(write, child.wait_with_output());

        // A program that ignores its input closes the pipe early; that is
        // not a grading failure on its own.
        if let Err(e) = written {
            if e.kind() != ErrorKind::BrokenPipe {
                return Err(GradingError::Connection(format!(
                    "failed to write payload to '{}': {}",
                    self.program, e
                )));
            }
        }

        output.map_err(|e| {
            GradingError::Connection(format!("failed to wait for '{}': {}", self.program, e))
        })
    }
}

#[async_trait]
impl Grader for CommandGrader {
    async fn grade(&self, request: &GraderRequest) -> Result<GraderResponse, GradingError> {
        debug!(program = %self.program, delivery_tag = request.delivery_tag(), "running grading command");

        // Dropping the child on timeout kills it.
        let output = tokio::time::timeout(self.timeout, self.run(request.data()))
            .await
            .map_err(|_| GradingError::Timeout(self.timeout))??;

        if !output.status.success() {
            return Err(GradingError::ProcessFailed {
                code: output.status.code(),
                stderr: preview(
                    String::from_utf8_lossy(&output.stderr).trim(),
                    STDERR_PREVIEW,
                ),
            });
        }

        let data = serde_json::from_slice(&output.stdout).map_err(|e| {
            GradingError::MalformedResponse(format!(
                "{}: {}",
                e,
                preview(&String::from_utf8_lossy(&output.stdout), STDERR_PREVIEW)
            ))
        })?;

        Ok(GraderResponse::success(data))
    }

    fn describe(&self) -> String {
        format!(
            "CommandGrader: {} {} (timeout {:?})",
            self.program,
            self.args.join(" "),
            self.timeout
        )
    }
}
