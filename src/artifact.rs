//! Generated pages and their embedded provenance.
//!
//! The stored form of every page starts with a delimited JSON block:
//!
//! ```text
//! <!-- repo-man:provenance
//! {"schema_version":1,"source_path":"src/lib.rs","kind":"file",...}
//! -->
//! # page body...
//! ```
//!
//! Cleanup reads nothing but this block, so it must stay self-contained and
//! independent of any side store.
use crate::summary::{Layer, UnitSummary};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const PROVENANCE_SCHEMA_VERSION: u32 = 1;
pub const PROVENANCE_OPEN: &str = "<!-- repo-man:provenance";
pub const PROVENANCE_CLOSE: &str = "-->";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    File,
    Directory,
    Architecture,
    Overview,
    Workflow,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub schema_version: u32,
    /// Repository-relative source; absent for pages with no single source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_path: Option<String>,
    pub kind: ArtifactKind,
    pub generated_at_epoch_ms: u128,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layer: Option<Layer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<UnitSummary>,
}

/// One generated page plus its tree-relative location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub rel_path: String,
    pub provenance: Provenance,
    pub body: String,
}

impl Artifact {
    /// Serialize to the stored form: provenance block, blank line, body.
    pub fn render(&self) -> Result<String> {
        let block =
            serde_json::to_string(&self.provenance).context("serialize provenance block")?;
        // '>' only occurs inside JSON strings; escaping it keeps "-->" out of the block.
        let block = block.replace('>', "\\u003e");
        Ok(format!(
            "{PROVENANCE_OPEN}\n{block}\n{PROVENANCE_CLOSE}\n\n{}\n",
            self.body.trim_end()
        ))
    }

    /// Write the stored form under `tree_root`.
    pub fn write_to(&self, tree_root: &Path) -> Result<()> {
        let text = self.render()?;
        crate::staging::write_staged_text(tree_root, &self.rel_path, &text)
    }
}

/// Split a stored page into its provenance (if parseable) and display body.
pub fn parse_stored(text: &str) -> (Option<Provenance>, &str) {
    let trimmed = text.trim_start();
    let Some(rest) = trimmed.strip_prefix(PROVENANCE_OPEN) else {
        return (None, text);
    };
    let Some(close) = rest.find(PROVENANCE_CLOSE) else {
        return (None, text);
    };
    let body = rest[close + PROVENANCE_CLOSE.len()..].trim_start_matches(['\r', '\n']);
    let provenance = serde_json::from_str::<Provenance>(rest[..close].trim()).ok();
    (provenance, body)
}

/// The human-facing body of a stored page; the provenance block is never shown.
pub fn display_body(text: &str) -> &str {
    parse_stored(text).1
}

/// Read the provenance of a stored page. `Ok(None)` means no parseable block.
pub fn read_provenance(path: &Path) -> Result<Option<Provenance>> {
    let text = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    Ok(parse_stored(&text).0)
}
