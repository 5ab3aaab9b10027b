//! Generation state: what was documented, from which content, and when.
//!
//! The state lives at `_meta/state.json` inside each version root so it is
//! promoted atomically together with the pages it describes.
use crate::paths::STATE_REL;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

pub const STATE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileState {
    pub fingerprint: String,
    pub generated_at_epoch_ms: u128,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirState {
    /// Derived from the member files' fingerprints.
    pub fingerprint: String,
    pub members: Vec<String>,
    pub generated_at_epoch_ms: u128,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationState {
    pub schema_version: u32,
    #[serde(default)]
    pub files: BTreeMap<String, FileState>,
    #[serde(default)]
    pub dirs: BTreeMap<String, DirState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synthesis_fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    #[serde(default)]
    pub generated_at_epoch_ms: u128,
}

impl Default for GenerationState {
    fn default() -> Self {
        Self {
            schema_version: STATE_SCHEMA_VERSION,
            files: BTreeMap::new(),
            dirs: BTreeMap::new(),
            synthesis_fingerprint: None,
            revision: None,
            generated_at_epoch_ms: 0,
        }
    }
}

impl GenerationState {
    /// When a file or directory unit was last generated, if ever.
    pub fn last_generated(&self, unit: &str) -> Option<u128> {
        self.files
            .get(unit)
            .map(|file| file.generated_at_epoch_ms)
            .or_else(|| self.dirs.get(unit).map(|dir| dir.generated_at_epoch_ms))
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.dirs.is_empty()
    }
}

/// Load the state stored in a version root; empty when there is no tree.
///
/// An unreadable state file is treated as empty, which regenerates every unit.
pub fn load_state(tree_root: Option<&Path>) -> Result<GenerationState> {
    let Some(tree_root) = tree_root else {
        return Ok(GenerationState::default());
    };
    let path = tree_root.join(STATE_REL);
    if !path.is_file() {
        return Ok(GenerationState::default());
    }
    let bytes = fs::read(&path).with_context(|| format!("read state {}", path.display()))?;
    match serde_json::from_slice::<GenerationState>(&bytes) {
        Ok(state) if state.schema_version == STATE_SCHEMA_VERSION => Ok(state),
        Ok(state) => {
            tracing::warn!(
                schema_version = state.schema_version,
                "ignoring generation state with unsupported schema"
            );
            Ok(GenerationState::default())
        }
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "ignoring corrupt generation state");
            Ok(GenerationState::default())
        }
    }
}

pub fn write_state(tree_root: &Path, state: &GenerationState) -> Result<()> {
    crate::staging::write_staged_json(tree_root, STATE_REL, state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_tree_yields_empty_state() {
        let state = load_state(None).unwrap();
        assert!(state.is_empty());
        assert!(state.synthesis_fingerprint.is_none());
        let dir = tempfile::tempdir().unwrap();
        assert!(load_state(Some(dir.path())).unwrap().is_empty());
    }

    #[test]
    fn state_roundtrips_through_tree() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = GenerationState::default();
        state.files.insert(
            "src/a.rs".to_string(),
            FileState {
                fingerprint: "abc".to_string(),
                generated_at_epoch_ms: 10,
            },
        );
        state.dirs.insert(
            "src".to_string(),
            DirState {
                fingerprint: "def".to_string(),
                members: vec!["src/a.rs".to_string()],
                generated_at_epoch_ms: 11,
            },
        );
        state.synthesis_fingerprint = Some("f00".to_string());
        write_state(dir.path(), &state).unwrap();
        let loaded = load_state(Some(dir.path())).unwrap();
        assert_eq!(loaded, state);
        assert_eq!(loaded.last_generated("src/a.rs"), Some(10));
        assert_eq!(loaded.last_generated("src"), Some(11));
        assert_eq!(loaded.last_generated("docs"), None);
    }

    #[test]
    fn corrupt_state_is_treated_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        crate::staging::write_staged_text(dir.path(), STATE_REL, "{oops").unwrap();
        assert!(load_state(Some(dir.path())).unwrap().is_empty());
    }
}
