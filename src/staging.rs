//! Staging, versioned roots, and atomic promotion.
//!
//! A run writes into `.repo-man/staging/<txn>/`. Promotion renames the staging
//! directory to `.repo-man/versions/<txn>/` and then atomically replaces the
//! `.repo-man/CURRENT` pointer, so readers see either the previous tree or the
//! new one, never a mixture. Anything that goes wrong before the pointer swap
//! leaves the live version untouched; the staging guard deletes its directory
//! on drop unless committed.
use crate::paths::DocTreePaths;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

static TXN_SEQ: AtomicU64 = AtomicU64::new(0);

pub fn write_staged_bytes(staging_root: &Path, rel_path: &str, bytes: &[u8]) -> Result<()> {
    let staging_path = staging_root.join(rel_path);
    if let Some(parent) = staging_path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    fs::write(&staging_path, bytes).with_context(|| format!("write {}", staging_path.display()))?;
    Ok(())
}

pub fn write_staged_text(staging_root: &Path, rel_path: &str, text: &str) -> Result<()> {
    write_staged_bytes(staging_root, rel_path, text.as_bytes())?;
    Ok(())
}

pub fn write_staged_json<T: serde::Serialize>(
    staging_root: &Path,
    rel_path: &str,
    value: &T,
) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value).context("serialize staged JSON")?;
    write_staged_bytes(staging_root, rel_path, &bytes)?;
    Ok(())
}

pub fn collect_files_recursive(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    if !root.exists() {
        return Ok(files);
    }
    for entry in fs::read_dir(root).with_context(|| format!("read {}", root.display()))? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            files.extend(collect_files_recursive(&path)?);
        } else if path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Copy every regular file under `src` into `dst`, preserving layout.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<usize> {
    let files = collect_files_recursive(src)?;
    for file in &files {
        let rel = file.strip_prefix(src).context("strip source prefix")?;
        let dest = dst.join(rel);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        fs::copy(file, &dest).with_context(|| format!("copy {}", file.display()))?;
    }
    Ok(files.len())
}

/// Remove a file and prune any directories it leaves empty, up to `stop_at`.
pub fn remove_file_and_empty_parents(path: &Path, stop_at: &Path) -> std::io::Result<()> {
    fs::remove_file(path)?;
    let mut current = path.parent();
    while let Some(dir) = current {
        if dir == stop_at || !dir.starts_with(stop_at) {
            break;
        }
        if fs::remove_dir(dir).is_err() {
            break;
        }
        current = dir.parent();
    }
    Ok(())
}

/// Name of the currently promoted version, if any.
pub fn current_version(paths: &DocTreePaths) -> Result<Option<String>> {
    let pointer = paths.pointer_path();
    if !pointer.is_file() {
        return Ok(None);
    }
    let text =
        fs::read_to_string(&pointer).with_context(|| format!("read {}", pointer.display()))?;
    let version = text.trim();
    if version.is_empty() {
        return Ok(None);
    }
    Ok(Some(version.to_string()))
}

/// Root directory of the live tree, if one has been promoted.
pub fn live_root(paths: &DocTreePaths) -> Result<Option<PathBuf>> {
    let Some(version) = current_version(paths)? else {
        return Ok(None);
    };
    let root = paths.version_root(&version);
    if !root.is_dir() {
        return Err(anyhow!(
            "CURRENT points at missing version {} ({})",
            version,
            root.display()
        ));
    }
    Ok(Some(root))
}

/// An isolated staging tree for one run.
///
/// Dropping the guard without calling [`StagingArea::promote`] deletes the
/// staging directory.
pub struct StagingArea {
    paths: DocTreePaths,
    txn_id: String,
    root: PathBuf,
    committed: bool,
}

impl StagingArea {
    pub fn create(paths: &DocTreePaths, started_at_epoch_ms: u128) -> Result<Self> {
        let seq = TXN_SEQ.fetch_add(1, Ordering::Relaxed);
        let txn_id = format!("{started_at_epoch_ms:015}-{:06}-{seq:04}", std::process::id());
        let root = paths.staging_root(&txn_id);
        fs::create_dir_all(&root).context("create staging dir")?;
        Ok(Self {
            paths: paths.clone(),
            txn_id,
            root,
            committed: false,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn txn_id(&self) -> &str {
        &self.txn_id
    }

    /// Seed staging with a full copy of the live tree.
    pub fn seed_from(&self, live_root: &Path) -> Result<usize> {
        copy_tree(live_root, &self.root)
    }

    /// Move staging into `versions/` and swap the live pointer to it.
    pub fn promote(mut self) -> Result<String> {
        let version_root = self.paths.version_root(&self.txn_id);
        fs::create_dir_all(self.paths.versions_root()).context("create versions dir")?;
        fs::rename(&self.root, &version_root).with_context(|| {
            format!(
                "move {} to {}",
                self.root.display(),
                version_root.display()
            )
        })?;
        self.committed = true;
        if let Err(err) = swap_pointer(&self.paths, &self.txn_id) {
            // The pointer still names the previous version; drop the orphaned one.
            let _ = fs::remove_dir_all(&version_root);
            return Err(err);
        }
        Ok(self.txn_id.clone())
    }
}

impl Drop for StagingArea {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Err(err) = fs::remove_dir_all(&self.root) {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(
                    staging = %self.root.display(),
                    error = %err,
                    "failed to discard staging"
                );
            }
        }
    }
}

/// Atomically replace the CURRENT pointer, then refresh the convenience link.
fn swap_pointer(paths: &DocTreePaths, version: &str) -> Result<()> {
    let state_dir = paths.state_dir();
    let mut tmp = tempfile::NamedTempFile::new_in(&state_dir)
        .with_context(|| format!("create pointer temp in {}", state_dir.display()))?;
    tmp.write_all(format!("{version}\n").as_bytes())
        .context("write pointer temp")?;
    tmp.as_file().sync_all().context("sync pointer temp")?;
    tmp.persist(paths.pointer_path())
        .map_err(|err| anyhow!("replace {}: {}", paths.pointer_path().display(), err.error))?;

    if let Err(err) = refresh_current_link(paths, version) {
        tracing::warn!(error = %err, "failed to refresh current symlink");
    }
    Ok(())
}

#[cfg(unix)]
fn refresh_current_link(paths: &DocTreePaths, version: &str) -> Result<()> {
    let link = paths.current_link();
    if link.exists() && !link.is_symlink() {
        return Err(anyhow!(
            "{} exists and is not a symlink; leaving it alone",
            link.display()
        ));
    }
    let target = PathBuf::from(crate::paths::STATE_DIR_NAME)
        .join("versions")
        .join(version);
    let tmp_link = paths.root().join(format!(".current.{}.tmp", std::process::id()));
    let _ = fs::remove_file(&tmp_link);
    std::os::unix::fs::symlink(&target, &tmp_link)
        .with_context(|| format!("create {}", tmp_link.display()))?;
    fs::rename(&tmp_link, &link).with_context(|| format!("replace {}", link.display()))?;
    Ok(())
}

#[cfg(not(unix))]
fn refresh_current_link(_paths: &DocTreePaths, _version: &str) -> Result<()> {
    Ok(())
}

/// Delete promoted versions beyond the newest `keep`, never the current one.
pub fn prune_versions(paths: &DocTreePaths, keep: usize) -> Result<usize> {
    let current = current_version(paths)?;
    let versions_root = paths.versions_root();
    if !versions_root.is_dir() {
        return Ok(0);
    }
    let mut versions = fs::read_dir(&versions_root)
        .with_context(|| format!("read {}", versions_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
        .collect::<Vec<_>>();
    versions.sort();
    let excess = versions.len().saturating_sub(keep);
    let mut removed = 0;
    for version in versions.into_iter().take(excess) {
        if current.as_deref() == Some(version.as_str()) {
            continue;
        }
        match fs::remove_dir_all(paths.version_root(&version)) {
            Ok(()) => removed += 1,
            Err(err) => tracing::warn!(version, error = %err, "failed to prune version"),
        }
    }
    Ok(removed)
}

/// Remove staging directories left behind by crashed runs.
pub fn sweep_stale_staging(paths: &DocTreePaths) {
    let parent = paths.staging_parent();
    let Ok(entries) = fs::read_dir(&parent) else {
        return;
    };
    for entry in entries.filter_map(|entry| entry.ok()) {
        let path = entry.path();
        if let Err(err) = fs::remove_dir_all(&path) {
            tracing::warn!(staging = %path.display(), error = %err, "failed to sweep stale staging");
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockMetadata {
    pub pid: u32,
    pub started_at_epoch_ms: u128,
}

/// Single-writer lock for an output root, released on drop.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    pub fn acquire(paths: &DocTreePaths) -> Result<Self> {
        let path = paths.lock_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let holder = fs::read_to_string(&path).unwrap_or_default();
                return Err(anyhow!(
                    "another run holds {} ({}); remove it if that run is gone",
                    path.display(),
                    holder.trim()
                ));
            }
            Err(err) => {
                return Err(err).with_context(|| format!("create {}", path.display()));
            }
        };
        let metadata = LockMetadata {
            pid: std::process::id(),
            started_at_epoch_ms: crate::util::now_epoch_ms()?,
        };
        let text = serde_json::to_string(&metadata).context("serialize lock metadata")?;
        file.write_all(text.as_bytes())
            .with_context(|| format!("write {}", path.display()))?;
        Ok(Self { path })
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            tracing::warn!(lock = %self.path.display(), error = %err, "failed to release run lock");
        }
    }
}
