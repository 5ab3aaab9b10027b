//! Typed paths into an output tree.
//!
//! Centralizing path construction keeps file access consistent across the
//! pipeline and prevents drift when the layout evolves.
use anyhow::Result;
use std::path::{Path, PathBuf};

/// Name of the bookkeeping directory inside the output root.
pub const STATE_DIR_NAME: &str = ".repo-man";
/// Directory holding per-file pages inside a version root.
pub const FILES_DIR: &str = "files";
/// Directory holding per-directory pages inside a version root.
pub const DIRS_DIR: &str = "dirs";
/// Directory holding workflow pages inside a version root.
pub const WORKFLOWS_DIR: &str = "workflows";
/// Metadata directory inside a version root; never scanned as artifacts.
pub const META_DIR: &str = "_meta";
pub const ARCHITECTURE_REL: &str = "architecture.md";
pub const OVERVIEW_REL: &str = "overview.md";
pub const STATE_REL: &str = "_meta/state.json";
pub const SYNTHESIS_REL: &str = "_meta/synthesis.json";
/// Repository-relative name used for the repository root directory.
pub const ROOT_DIR_REL: &str = ".";

/// Convenience wrapper for locating bookkeeping files under an output root.
#[derive(Debug, Clone)]
pub struct DocTreePaths {
    root: PathBuf,
}

impl DocTreePaths {
    /// Create a new path helper rooted at the output root.
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Return the output root used for path derivation.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Return the `.repo-man/` directory path.
    pub fn state_dir(&self) -> PathBuf {
        self.root.join(STATE_DIR_NAME)
    }

    /// Return the `.repo-man/config.json` path.
    pub fn config_path(&self) -> PathBuf {
        self.state_dir().join("config.json")
    }

    /// Return the `.repo-man/run.lock` path.
    pub fn lock_path(&self) -> PathBuf {
        self.state_dir().join("run.lock")
    }

    /// Return the `.repo-man/CURRENT` pointer path.
    pub fn pointer_path(&self) -> PathBuf {
        self.state_dir().join("CURRENT")
    }

    /// Return the `current` convenience symlink path.
    pub fn current_link(&self) -> PathBuf {
        self.root.join("current")
    }

    /// Return the `.repo-man/versions` directory path.
    pub fn versions_root(&self) -> PathBuf {
        self.state_dir().join("versions")
    }

    /// Return the directory of one promoted version.
    pub fn version_root(&self, version: &str) -> PathBuf {
        self.versions_root().join(version)
    }

    /// Return the `.repo-man/staging` directory path.
    pub fn staging_parent(&self) -> PathBuf {
        self.state_dir().join("staging")
    }

    /// Return the per-transaction staging directory path.
    pub fn staging_root(&self, txn_id: &str) -> PathBuf {
        self.staging_parent().join(txn_id)
    }

    /// Return the `.repo-man/notes` directory path.
    pub fn notes_dir(&self) -> PathBuf {
        self.state_dir().join("notes")
    }

    /// Return the `.repo-man/history.jsonl` path.
    pub fn history_path(&self) -> PathBuf {
        self.state_dir().join("history.jsonl")
    }

    /// Return the `.repo-man/lm_log.jsonl` path.
    pub fn lm_log_path(&self) -> PathBuf {
        self.state_dir().join("lm_log.jsonl")
    }
}

/// Tree-relative path of the page documenting a source file.
pub fn file_artifact_rel(source_rel: &str) -> String {
    format!("{FILES_DIR}/{source_rel}.md")
}

/// Tree-relative path of the page documenting a source directory.
pub fn dir_artifact_rel(dir_rel: &str) -> String {
    if dir_rel == ROOT_DIR_REL || dir_rel.is_empty() {
        format!("{DIRS_DIR}/index.md")
    } else {
        format!("{DIRS_DIR}/{dir_rel}/index.md")
    }
}

/// Tree-relative path of the workflow page for an entry point.
pub fn workflow_artifact_rel(entry_rel: &str) -> String {
    format!("{WORKFLOWS_DIR}/{}.md", crate::util::slugify(entry_rel))
}

/// Convert an absolute path into a root-relative string with `/` separators.
pub fn rel_path(root: &Path, path: &Path) -> Result<String> {
    let rel = path.strip_prefix(root).unwrap_or(path);
    let parts = rel
        .components()
        .map(|component| component.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>();
    if parts.is_empty() {
        return Ok(ROOT_DIR_REL.to_string());
    }
    Ok(parts.join("/"))
}

/// Parent directory of a repository-relative file path.
pub fn parent_rel(rel: &str) -> String {
    match rel.rsplit_once('/') {
        Some((parent, _)) if !parent.is_empty() => parent.to_string(),
        _ => ROOT_DIR_REL.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_paths_follow_layout() {
        assert_eq!(file_artifact_rel("src/lib.rs"), "files/src/lib.rs.md");
        assert_eq!(dir_artifact_rel("src/net"), "dirs/src/net/index.md");
        assert_eq!(dir_artifact_rel(ROOT_DIR_REL), "dirs/index.md");
        assert_eq!(workflow_artifact_rel("src/main.rs"), "workflows/src-main-rs.md");
    }

    #[test]
    fn parent_rel_handles_root_files() {
        assert_eq!(parent_rel("README.md"), ".");
        assert_eq!(parent_rel("src/a/b.rs"), "src/a");
    }

    #[test]
    fn rel_path_uses_forward_slashes() {
        let root = Path::new("/repo");
        assert_eq!(rel_path(root, Path::new("/repo/src/a.rs")).unwrap(), "src/a.rs");
        assert_eq!(rel_path(root, Path::new("/repo")).unwrap(), ".");
    }
}
