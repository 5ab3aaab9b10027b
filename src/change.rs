//! Change detection against the previous generation state.
//!
//! Files are hashed from raw content. Directories are never hashed directly:
//! their fingerprint is derived from their member files, so a directory is
//! changed exactly when its membership or a member's content changed.
use crate::state::{DirState, FileState, GenerationState};
use crate::util::sha256_hex;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

/// Content fingerprint of a single file.
pub fn fingerprint(content: &[u8]) -> String {
    sha256_hex(content)
}

/// Derived fingerprint of a directory from `(member path, member fingerprint)` pairs.
pub fn directory_fingerprint<'a, I>(members: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut pairs = members.into_iter().collect::<Vec<_>>();
    pairs.sort();
    let mut hasher = Sha256::new();
    for (path, fingerprint) in pairs {
        hasher.update(path.as_bytes());
        hasher.update(b"\0");
        hasher.update(fingerprint.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

pub fn file_changed(prior: Option<&FileState>, fingerprint: &str) -> bool {
    !matches!(prior, Some(prior) if prior.fingerprint == fingerprint)
}

pub fn directory_changed(prior: Option<&DirState>, members: &[String], fingerprint: &str) -> bool {
    let Some(prior) = prior else {
        return true;
    };
    let before = prior.members.iter().collect::<BTreeSet<_>>();
    let after = members.iter().collect::<BTreeSet<_>>();
    before != after || prior.fingerprint != fingerprint
}

/// Current directory shape: direct member files and derived fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirSnapshot {
    pub members: Vec<String>,
    pub fingerprint: String,
}

/// Classification of every unit against the prior state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub changed_files: BTreeSet<String>,
    pub unchanged_files: BTreeSet<String>,
    pub removed_files: BTreeSet<String>,
    pub changed_dirs: BTreeSet<String>,
    pub unchanged_dirs: BTreeSet<String>,
    pub removed_dirs: BTreeSet<String>,
}

impl ChangeSet {
    pub fn has_unit_changes(&self) -> bool {
        !self.changed_files.is_empty()
            || !self.removed_files.is_empty()
            || !self.changed_dirs.is_empty()
            || !self.removed_dirs.is_empty()
    }
}

/// Compare current fingerprints with the prior state.
pub fn detect_changes(
    state: &GenerationState,
    files: &BTreeMap<String, String>,
    dirs: &BTreeMap<String, DirSnapshot>,
) -> ChangeSet {
    let mut changes = ChangeSet::default();
    for (path, fingerprint) in files {
        if file_changed(state.files.get(path), fingerprint) {
            changes.changed_files.insert(path.clone());
        } else {
            changes.unchanged_files.insert(path.clone());
        }
    }
    for (path, snapshot) in dirs {
        if directory_changed(state.dirs.get(path), &snapshot.members, &snapshot.fingerprint) {
            changes.changed_dirs.insert(path.clone());
        } else {
            changes.unchanged_dirs.insert(path.clone());
        }
    }
    changes.removed_files = state
        .files
        .keys()
        .filter(|path| !files.contains_key(*path))
        .cloned()
        .collect();
    changes.removed_dirs = state
        .dirs
        .keys()
        .filter(|path| !dirs.contains_key(*path))
        .cloned()
        .collect();
    changes
}
