//! Text-generation collaborator.
//!
//! The pipeline only sees the [`TextGenerator`] trait. The default adapter
//! delegates to a user-configured command: the prompt goes to stdin and
//! stdout is the response. Any tool that accepts text and produces text works
//! (`llm`, `ollama run`, `claude -p`, custom scripts).
//!
//! Timeouts are reported as [`LmError::Timeout`] so callers with a retry
//! policy (the synthesis aggregator) can tell them apart from hard failures.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// What a generation request is for; used for logging and by test fakes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LmTaskKind {
    FileSummary,
    DirectorySummary,
    Synthesis,
    Architecture,
    Overview,
    Workflow,
}

impl std::fmt::Display for LmTaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FileSummary => write!(f, "file_summary"),
            Self::DirectorySummary => write!(f, "directory_summary"),
            Self::Synthesis => write!(f, "synthesis"),
            Self::Architecture => write!(f, "architecture"),
            Self::Overview => write!(f, "overview"),
            Self::Workflow => write!(f, "workflow"),
        }
    }
}

/// One prompt for the collaborator.
#[derive(Debug, Clone)]
pub struct LmRequest {
    pub kind: LmTaskKind,
    /// Unit path, batch label, or page name the request is about.
    pub subject: String,
    pub prompt: String,
}

impl LmRequest {
    pub fn new(kind: LmTaskKind, subject: impl Into<String>, prompt: String) -> Self {
        Self {
            kind,
            subject: subject.into(),
            prompt,
        }
    }
}

#[derive(Debug, Error)]
pub enum LmError {
    #[error("LM call timed out after {0:?}")]
    Timeout(Duration),

    #[error("LM command is empty")]
    EmptyCommand,

    #[error("parse LM command: {0}")]
    BadCommand(String),

    #[error("spawn LM command {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("LM I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("LM command failed with status {status}: {stderr}")]
    Failed { status: String, stderr: String },

    #[error("LM output is not UTF-8")]
    NotUtf8,
}

impl LmError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, request: &LmRequest) -> Result<String, LmError>;
}

/// Runs a configured shell-style command once per request.
#[derive(Debug, Clone)]
pub struct CommandGenerator {
    argv: Vec<String>,
    timeout: Duration,
}

impl CommandGenerator {
    pub fn new(command: &str, timeout: Duration) -> Result<Self, LmError> {
        let argv =
            shell_words::split(command).map_err(|err| LmError::BadCommand(err.to_string()))?;
        if argv.is_empty() {
            return Err(LmError::EmptyCommand);
        }
        Ok(Self { argv, timeout })
    }

    pub fn program(&self) -> &str {
        &self.argv[0]
    }

    async fn run(&self, prompt: &str) -> Result<String, LmError> {
        let mut child = Command::new(&self.argv[0])
            .args(&self.argv[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| LmError::Spawn {
                program: self.argv[0].clone(),
                source,
            })?;

        // Feed stdin while draining stdout so large prompts cannot deadlock.
        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                stdin.write_all(prompt.as_bytes()).await?;
                stdin.shutdown().await?;
            }
            Ok::<(), std::io::Error>(())
        };
        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        let output = output?;
        if let Err(err) = fed {
            if err.kind() != std::io::ErrorKind::BrokenPipe {
                return Err(err.into());
            }
        }
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(LmError::Failed {
                status: output.status.to_string(),
                stderr: stderr.trim().to_string(),
            });
        }
        String::from_utf8(output.stdout).map_err(|_| LmError::NotUtf8)
    }
}

#[async_trait]
impl TextGenerator for CommandGenerator {
    async fn generate(&self, request: &LmRequest) -> Result<String, LmError> {
        let start = Instant::now();
        let response = tokio::time::timeout(self.timeout, self.run(&request.prompt))
            .await
            .map_err(|_| LmError::Timeout(self.timeout))??;

        tracing::info!(
            kind = %request.kind,
            subject = %request.subject,
            elapsed_ms = start.elapsed().as_millis() as u64,
            prompt_bytes = request.prompt.len(),
            response_bytes = response.len(),
            "lm invoke complete"
        );
        Ok(response)
    }
}

/// Extract JSON from text that might have markdown code fences.
pub fn extract_json(text: &str) -> &str {
    let text = text.trim();

    if let Some(start) = text.find("```json") {
        let start = start + 7;
        if let Some(end) = text[start..].find("```") {
            return text[start..start + end].trim();
        }
    }

    if let Some(start) = text.find("```") {
        let start = start + 3;
        // Skip language identifier if present
        let start = text[start..]
            .find('\n')
            .map(|i| start + i + 1)
            .unwrap_or(start);
        if let Some(end) = text[start..].find("```") {
            return text[start..start + end].trim();
        }
    }

    // Prose around a bare object: take the outermost braces.
    if let (Some(open), Some(close)) = (text.find('{'), text.rfind('}')) {
        if open < close {
            return &text[open..=close];
        }
    }

    text
}
