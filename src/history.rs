//! Run history persistence.
//!
//! One JSONL line per run in `.repo-man/history.jsonl`, outside the versioned
//! tree so recording a no-op run never touches the live pages.
use crate::paths::DocTreePaths;
use crate::pipeline::RunReport;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;

pub const HISTORY_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunHistoryEntry {
    pub schema_version: u32,
    pub report: RunReport,
}

/// Append a history entry as JSONL.
pub fn append_history(paths: &DocTreePaths, report: &RunReport) -> Result<()> {
    let path = paths.history_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("create state dir")?;
    }
    let entry = RunHistoryEntry {
        schema_version: HISTORY_SCHEMA_VERSION,
        report: report.clone(),
    };
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("open {}", path.display()))?;
    let line = serde_json::to_string(&entry).context("serialize run history entry")?;
    file.write_all(line.as_bytes())
        .with_context(|| format!("write {}", path.display()))?;
    file.write_all(b"\n")
        .with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

/// Load every readable history entry, oldest first.
pub fn load_history(paths: &DocTreePaths) -> Result<Vec<RunHistoryEntry>> {
    let path = paths.history_path();
    if !path.is_file() {
        return Ok(Vec::new());
    }
    let text = fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    let mut entries = Vec::new();
    for (index, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<RunHistoryEntry>(line) {
            Ok(entry) => entries.push(entry),
            Err(err) => {
                tracing::warn!(line = index + 1, error = %err, "skip corrupt history entry")
            }
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{Phase, RunCounts, RunOutcome};

    #[test]
    fn history_appends_and_loads() {
        let dir = tempfile::tempdir().unwrap();
        let paths = DocTreePaths::new(dir.path().to_path_buf());
        let report = RunReport {
            outcome: RunOutcome::Failed {
                phase: Phase::Synthesis,
                message: "timed out".to_string(),
            },
            phases: vec![Phase::Cleanup, Phase::Analysis, Phase::Files],
            counts: RunCounts::default(),
            version: None,
            revision: None,
            started_at_epoch_ms: 1,
            finished_at_epoch_ms: 2,
        };
        append_history(&paths, &report).unwrap();
        append_history(&paths, &report).unwrap();
        let entries = load_history(&paths).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].report.outcome, report.outcome);
        assert_eq!(entries[1].report.phases, report.phases);
    }
}
