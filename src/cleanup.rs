//! Provenance-driven cleanup of stale artifacts and notes.
//!
//! The scanner only trusts what each page says about itself: a page without
//! a parseable provenance block, or whose recorded source is gone, is an
//! orphan. Workflow pages are always listed because they are rebuilt on every
//! run.
use crate::artifact::{read_provenance, ArtifactKind};
use crate::notes::{orphaned, CorrectionNote, NoteStore};
use crate::paths::{rel_path, META_DIR, ROOT_DIR_REL};
use crate::staging::{collect_files_recursive, remove_file_and_empty_parents};
use anyhow::Result;
use serde::Serialize;
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupPlan {
    /// Tree-relative pages with no provenance or a vanished source.
    pub orphaned_artifacts: Vec<String>,
    /// Tree-relative workflow pages.
    pub workflow_artifacts: Vec<String>,
    /// Ids of notes whose target no longer exists.
    pub orphaned_notes: Vec<String>,
}

impl CleanupPlan {
    pub fn is_empty(&self) -> bool {
        self.orphaned_artifacts.is_empty()
            && self.workflow_artifacts.is_empty()
            && self.orphaned_notes.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupResult {
    pub orphaned_artifacts: usize,
    pub workflow_artifacts: usize,
    pub orphaned_notes: usize,
    pub failures: usize,
}

/// Scan a tree (usually the live one) and list what should be deleted.
pub fn scan(
    tree_root: Option<&Path>,
    repo_root: &Path,
    notes: &[CorrectionNote],
) -> Result<CleanupPlan> {
    let mut plan = CleanupPlan::default();
    if let Some(tree_root) = tree_root {
        for path in collect_files_recursive(tree_root)? {
            let rel = rel_path(tree_root, &path)?;
            if rel == META_DIR || rel.starts_with(&format!("{META_DIR}/")) {
                continue;
            }
            let provenance = match read_provenance(&path) {
                Ok(provenance) => provenance,
                Err(err) => {
                    tracing::debug!(path = %rel, error = %err, "unreadable artifact");
                    None
                }
            };
            let Some(provenance) = provenance else {
                plan.orphaned_artifacts.push(rel);
                continue;
            };
            let source = provenance.source_path.as_deref();
            match provenance.kind {
                ArtifactKind::Workflow => plan.workflow_artifacts.push(rel),
                ArtifactKind::File => {
                    if !source.is_some_and(|source| repo_root.join(source).is_file()) {
                        plan.orphaned_artifacts.push(rel);
                    }
                }
                ArtifactKind::Directory => {
                    let exists = source.is_some_and(|source| {
                        source == ROOT_DIR_REL || repo_root.join(source).is_dir()
                    });
                    if !exists {
                        plan.orphaned_artifacts.push(rel);
                    }
                }
                ArtifactKind::Architecture | ArtifactKind::Overview => {}
            }
        }
    }
    plan.orphaned_notes = orphaned(notes, |target| {
        target == ROOT_DIR_REL || repo_root.join(target).exists()
    })
    .into_iter()
    .map(|note| note.id.clone())
    .collect();
    tracing::info!(
        orphaned_artifacts = plan.orphaned_artifacts.len(),
        workflow_artifacts = plan.workflow_artifacts.len(),
        orphaned_notes = plan.orphaned_notes.len(),
        "cleanup scan complete"
    );
    Ok(plan)
}

/// Delete the plan's pages from `tree_root`. Failures are logged, not raised.
pub fn apply_artifacts(plan: &CleanupPlan, tree_root: &Path, result: &mut CleanupResult) {
    for rel in &plan.orphaned_artifacts {
        if delete_page(tree_root, rel, result) {
            result.orphaned_artifacts += 1;
        }
    }
    for rel in &plan.workflow_artifacts {
        if delete_page(tree_root, rel, result) {
            result.workflow_artifacts += 1;
        }
    }
}

/// Delete the plan's orphaned notes from the store.
pub fn apply_notes(plan: &CleanupPlan, store: &NoteStore, result: &mut CleanupResult) {
    for id in &plan.orphaned_notes {
        match store.remove(id) {
            Ok(()) => result.orphaned_notes += 1,
            Err(err) => {
                tracing::warn!(note = %id, error = %err, "failed to remove orphaned note");
                result.failures += 1;
            }
        }
    }
}

/// Apply the whole plan.
pub fn apply(plan: &CleanupPlan, tree_root: &Path, store: &NoteStore) -> CleanupResult {
    let mut result = CleanupResult::default();
    apply_artifacts(plan, tree_root, &mut result);
    apply_notes(plan, store, &mut result);
    result
}

fn delete_page(tree_root: &Path, rel: &str, result: &mut CleanupResult) -> bool {
    let path = tree_root.join(rel);
    match remove_file_and_empty_parents(&path, tree_root) {
        Ok(()) => {
            tracing::debug!(path = %rel, "deleted stale artifact");
            true
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => false,
        Err(err) => {
            tracing::warn!(path = %rel, error = %err, "failed to delete stale artifact");
            result.failures += 1;
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::Artifact;
    use crate::summarize::RunStamp;
    use crate::testing::write_files;

    fn page(tree: &Path, rel: &str, kind: ArtifactKind, source: Option<&str>) {
        let stamp = RunStamp {
            generated_at_epoch_ms: 1,
            revision: None,
        };
        Artifact {
            rel_path: rel.to_string(),
            provenance: stamp.provenance(kind, source, None),
            body: "body".to_string(),
        }
        .write_to(tree)
        .unwrap();
    }

    #[test]
    fn scan_then_apply_is_idempotent() {
        let repo = tempfile::tempdir().unwrap();
        let tree = tempfile::tempdir().unwrap();
        let state = tempfile::tempdir().unwrap();
        write_files(repo.path(), &[("src/a.rs", "fn a() {}")]);

        page(tree.path(), "files/src/a.rs.md", ArtifactKind::File, Some("src/a.rs"));
        page(tree.path(), "files/src/gone.rs.md", ArtifactKind::File, Some("src/gone.rs"));
        page(tree.path(), "dirs/src/index.md", ArtifactKind::Directory, Some("src"));
        page(tree.path(), "dirs/old/index.md", ArtifactKind::Directory, Some("old"));
        page(tree.path(), "dirs/index.md", ArtifactKind::Directory, Some("."));
        page(tree.path(), "workflows/src-main-rs.md", ArtifactKind::Workflow, Some("src/main.rs"));
        page(tree.path(), "architecture.md", ArtifactKind::Architecture, None);
        write_files(
            tree.path(),
            &[("notes.md", "hand written"), ("_meta/state.json", "{}")],
        );

        let store = NoteStore::new(state.path().join("notes"));
        store.add("src/a.rs", "keep me").unwrap();
        store.add("src/gone.rs", "orphan").unwrap();
        let notes = store.list().unwrap();

        let plan = scan(Some(tree.path()), repo.path(), &notes).unwrap();
        assert_eq!(
            plan.orphaned_artifacts,
            vec!["dirs/old/index.md", "files/src/gone.rs.md", "notes.md"]
        );
        assert_eq!(plan.workflow_artifacts, vec!["workflows/src-main-rs.md"]);
        assert_eq!(plan.orphaned_notes.len(), 1);

        let first = apply(&plan, tree.path(), &store);
        assert_eq!(
            first,
            CleanupResult {
                orphaned_artifacts: 3,
                workflow_artifacts: 1,
                orphaned_notes: 1,
                failures: 0,
            }
        );
        assert!(tree.path().join("files/src/a.rs.md").is_file());
        assert!(tree.path().join("architecture.md").is_file());
        assert!(!tree.path().join("dirs/old").exists());

        let notes = store.list().unwrap();
        let again = scan(Some(tree.path()), repo.path(), &notes).unwrap();
        assert!(again.is_empty());
        assert_eq!(apply(&again, tree.path(), &store), CleanupResult::default());
    }

    #[test]
    fn missing_tree_scans_only_notes() {
        let repo = tempfile::tempdir().unwrap();
        let plan = scan(None, repo.path(), &[]).unwrap();
        assert!(plan.is_empty());
    }
}
