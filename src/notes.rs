//! Correction notes: human hints attached to a file or directory.
//!
//! Notes live as one JSON file each under `.repo-man/notes/`, outside the
//! versioned tree. A note newer than its target's last generation forces the
//! target to be regenerated with the note text as extra prompt context.
use crate::paths::ROOT_DIR_REL;
use crate::state::GenerationState;
use crate::util::{now_epoch_ms, slugify};
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrectionNote {
    pub id: String,
    /// Repository-relative file or directory the note is about.
    pub target: String,
    pub text: String,
    pub created_at_epoch_ms: u128,
}

#[derive(Debug, Clone)]
pub struct NoteStore {
    dir: PathBuf,
}

impl NoteStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn add(&self, target: &str, text: &str) -> Result<CorrectionNote> {
        let target = normalize_target(target);
        let text = text.trim();
        if text.is_empty() {
            return Err(anyhow!("note text must be non-empty"));
        }
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create {}", self.dir.display()))?;
        let created_at_epoch_ms = now_epoch_ms()?;
        let base = format!("{created_at_epoch_ms}-{}", slugify(&target));
        for attempt in 0..100u32 {
            let id = if attempt == 0 {
                base.clone()
            } else {
                format!("{base}-{attempt}")
            };
            let path = self.note_path(&id);
            let mut file = match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(file) => file,
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(err) => return Err(err).with_context(|| format!("create {}", path.display())),
            };
            let note = CorrectionNote {
                id,
                target: target.clone(),
                text: text.to_string(),
                created_at_epoch_ms,
            };
            let json = serde_json::to_string_pretty(&note).context("serialize note")?;
            file.write_all(json.as_bytes())
                .with_context(|| format!("write {}", path.display()))?;
            return Ok(note);
        }
        Err(anyhow!("could not allocate a note id for {target}"))
    }

    /// All readable notes, oldest first. Corrupt files are skipped.
    pub fn list(&self) -> Result<Vec<CorrectionNote>> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut notes = Vec::new();
        for entry in
            fs::read_dir(&self.dir).with_context(|| format!("read {}", self.dir.display()))?
        {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let parsed = fs::read(&path)
                .map_err(anyhow::Error::from)
                .and_then(|bytes| Ok(serde_json::from_slice::<CorrectionNote>(&bytes)?));
            match parsed {
                Ok(note) => notes.push(note),
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "skip unreadable note")
                }
            }
        }
        notes.sort_by(|a, b| {
            a.created_at_epoch_ms
                .cmp(&b.created_at_epoch_ms)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(notes)
    }

    pub fn remove(&self, id: &str) -> Result<()> {
        let path = self.note_path(id);
        fs::remove_file(&path).with_context(|| format!("remove {}", path.display()))
    }

    pub fn note_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }
}

/// Notes whose target no longer exists as a file or directory in the repo.
pub fn orphaned<'a>(
    notes: &'a [CorrectionNote],
    target_exists: impl Fn(&str) -> bool,
) -> Vec<&'a CorrectionNote> {
    notes
        .iter()
        .filter(|note| !target_exists(&note.target))
        .collect()
}

/// Documented units with a note newer than their last generation.
pub fn pending(
    notes: &[CorrectionNote],
    state: &GenerationState,
    is_unit: impl Fn(&str) -> bool,
) -> BTreeSet<String> {
    notes
        .iter()
        .filter(|note| is_unit(&note.target))
        .filter(|note| match state.last_generated(&note.target) {
            Some(generated) => note.created_at_epoch_ms > generated,
            None => true,
        })
        .map(|note| note.target.clone())
        .collect()
}

/// Note texts for one unit, oldest first.
pub fn texts_for<'a>(notes: &'a [CorrectionNote], target: &str) -> Vec<&'a str> {
    notes
        .iter()
        .filter(|note| note.target == target)
        .map(|note| note.text.as_str())
        .collect()
}

fn normalize_target(target: &str) -> String {
    let trimmed = target.trim().trim_start_matches("./").trim_end_matches('/');
    if trimmed.is_empty() || trimmed == ROOT_DIR_REL {
        ROOT_DIR_REL.to_string()
    } else {
        trimmed.to_string()
    }
}
