//! LM invocation logging.
//!
//! Every collaborator call made during a run is appended to
//! `.repo-man/lm_log.jsonl` as newline-delimited JSON:
//!
//! ```jsonl
//! {"schema_version":1,"ts":1707900000000,"kind":"file_summary","subject":"src/lib.rs",...}
//! {"schema_version":1,"ts":1707900004100,"kind":"synthesis","subject":"batch 1/2",...}
//! ```
//!
//! The log lives outside the versioned artifact tree, so appending to it never
//! touches the live documentation.

use crate::lm::{LmError, LmRequest, LmTaskKind, TextGenerator};
use crate::util::now_epoch_ms;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;

/// Current schema version for lm_log.jsonl entries.
pub const LM_LOG_SCHEMA_VERSION: u32 = 1;

/// Outcome of an LM invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LmOutcome {
    Success,
    Timeout,
    Failed,
}

/// A single LM invocation log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LmLogEntry {
    pub schema_version: u32,

    /// Unix timestamp in milliseconds when the invocation finished.
    pub ts: u128,

    pub kind: LmTaskKind,

    /// Unit path or batch label the call was about.
    pub subject: String,

    pub duration_ms: u64,

    pub prompt_bytes: usize,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_bytes: Option<usize>,

    pub outcome: LmOutcome,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Decorates a generator with JSONL logging of every call.
pub struct LoggedGenerator<G> {
    inner: G,
    log_path: PathBuf,
    write_lock: Mutex<()>,
}

impl<G> LoggedGenerator<G> {
    pub fn new(inner: G, log_path: PathBuf) -> Self {
        Self {
            inner,
            log_path,
            write_lock: Mutex::new(()),
        }
    }

    fn record(&self, entry: &LmLogEntry) {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Err(err) = append_lm_log(&self.log_path, entry) {
            tracing::warn!(error = %err, "failed to append lm log entry");
        }
    }
}

#[async_trait]
impl<G: TextGenerator> TextGenerator for LoggedGenerator<G> {
    async fn generate(&self, request: &LmRequest) -> Result<String, LmError> {
        let start = Instant::now();
        let result = self.inner.generate(request).await;
        let (outcome, response_bytes, error) = match &result {
            Ok(text) => (LmOutcome::Success, Some(text.len()), None),
            Err(err) if err.is_timeout() => (LmOutcome::Timeout, None, Some(err.to_string())),
            Err(err) => (LmOutcome::Failed, None, Some(err.to_string())),
        };
        self.record(&LmLogEntry {
            schema_version: LM_LOG_SCHEMA_VERSION,
            ts: now_epoch_ms().unwrap_or_default(),
            kind: request.kind,
            subject: request.subject.clone(),
            duration_ms: start.elapsed().as_millis() as u64,
            prompt_bytes: request.prompt.len(),
            response_bytes,
            outcome,
            error,
        });
        result
    }
}

/// Append an LM log entry to the log file.
pub fn append_lm_log(log_path: &Path, entry: &LmLogEntry) -> Result<()> {
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent).context("create state directory for lm_log")?;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .with_context(|| format!("open lm_log for append: {}", log_path.display()))?;

    let line = serde_json::to_string(entry).context("serialize lm_log entry")?;
    writeln!(file, "{}", line).context("write lm_log entry")?;

    Ok(())
}

/// Load all LM log entries from the log file.
pub fn load_lm_log(log_path: &Path) -> Result<Vec<LmLogEntry>> {
    if !log_path.exists() {
        return Ok(Vec::new());
    }

    let file =
        File::open(log_path).with_context(|| format!("open lm_log: {}", log_path.display()))?;

    let reader = BufReader::new(file);
    let mut entries = Vec::new();

    for (line_num, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("read line {} of lm_log", line_num + 1))?;
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<LmLogEntry>(&line) {
            Ok(entry) => entries.push(entry),
            Err(e) => {
                tracing::warn!(line = line_num + 1, error = %e, "skip corrupt lm_log entry");
            }
        }
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedGenerator;

    #[tokio::test]
    async fn logged_generator_records_success_and_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("lm_log.jsonl");
        let scripted = ScriptedGenerator::new().timeout_on(LmTaskKind::Synthesis);
        let generator = LoggedGenerator::new(scripted, log_path.clone());

        let ok = LmRequest::new(LmTaskKind::Overview, "overview", "prompt".to_string());
        generator.generate(&ok).await.unwrap();
        let slow = LmRequest::new(LmTaskKind::Synthesis, "batch 1/1", "prompt".to_string());
        assert!(generator.generate(&slow).await.is_err());

        let entries = load_lm_log(&log_path).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].outcome, LmOutcome::Success);
        assert_eq!(entries[0].subject, "overview");
        assert!(entries[0].ts > 0);
        assert!(entries[1].ts >= entries[0].ts);
        assert_eq!(entries[1].outcome, LmOutcome::Timeout);
        assert!(entries[1].error.is_some());
    }

    #[test]
    fn corrupt_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("lm_log.jsonl");
        std::fs::write(&log_path, "not json\n\n").unwrap();
        assert!(load_lm_log(&log_path).unwrap().is_empty());
    }
}
