//! Source collaborator: walks the repository and extracts unit inputs.
//!
//! The walk is gitignore-aware, skips hidden entries, the output directory,
//! binary files and files over the configured size. Symbols and imports are
//! regex heuristics per language family; they are prompt context, not a parse.
use crate::change::{directory_fingerprint, fingerprint, DirSnapshot};
use crate::config::RunConfig;
use crate::paths::{parent_rel, rel_path, ROOT_DIR_REL};
use crate::util::truncate_string;
use anyhow::{Context, Result};
use ignore::WalkBuilder;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

/// Lockfiles and similar generated inputs that are never documented.
const SKIP_FILE_NAMES: &[&str] = &[
    "Cargo.lock",
    "package-lock.json",
    "yarn.lock",
    "pnpm-lock.yaml",
    "poetry.lock",
    "go.sum",
];

const ENTRY_FILE_NAMES: &[&str] = &[
    "main.rs",
    "main.go",
    "__main__.py",
    "index.js",
    "index.ts",
    "cli.py",
    "app.py",
    "manage.py",
];

const README_NAMES: &[&str] = &["README.md", "README", "README.rst", "README.txt"];

/// Bytes inspected for NUL when sniffing binary content.
const BINARY_SNIFF_BYTES: usize = 8000;
const MAX_EXTRACTED: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub rel_path: String,
    pub content: String,
    pub fingerprint: String,
    pub symbols: Vec<String>,
    pub imports: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDir {
    pub rel_path: String,
    /// Direct member files, sorted.
    pub members: Vec<String>,
    /// Documented direct subdirectories, sorted.
    pub subdirs: Vec<String>,
    pub fingerprint: String,
}

/// Everything the pipeline needs to know about the repository right now.
#[derive(Debug, Clone, Default)]
pub struct SourceTree {
    pub root: PathBuf,
    pub files: BTreeMap<String, SourceFile>,
    pub dirs: BTreeMap<String, SourceDir>,
    pub entry_points: Vec<String>,
    pub readme: Option<String>,
    pub skipped: usize,
}

impl SourceTree {
    /// Walk `repo_root`, never descending into `exclude` (the output root).
    ///
    /// Only an output root strictly inside the repository is excluded; one that
    /// contains the repository holds nothing the walk would reach.
    pub fn scan(repo_root: &Path, exclude: Option<&Path>, config: &RunConfig) -> Result<Self> {
        let root = fs::canonicalize(repo_root)
            .with_context(|| format!("resolve repository {}", repo_root.display()))?;
        let exclude = exclude
            .and_then(|path| fs::canonicalize(path).ok())
            .filter(|out| out != &root && out.starts_with(&root));
        let extractors = Extractors::new()?;

        let mut builder = WalkBuilder::new(&root);
        builder
            .hidden(true)
            .git_ignore(true)
            .git_exclude(true)
            .ignore(true)
            .require_git(false)
            .sort_by_file_name(|a, b| a.cmp(b));
        if let Some(exclude) = exclude.clone() {
            builder.filter_entry(move |entry| !entry.path().starts_with(&exclude));
        }

        let mut tree = SourceTree {
            root: root.clone(),
            ..SourceTree::default()
        };
        for entry in builder.build() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    tracing::warn!(error = %err, "walker error");
                    continue;
                }
            };
            if !entry.file_type().is_some_and(|kind| kind.is_file()) {
                continue;
            }
            let path = entry.path();
            let name = entry.file_name().to_string_lossy();
            if SKIP_FILE_NAMES.contains(&name.as_ref()) {
                continue;
            }
            let rel = rel_path(&root, path)?;
            match read_source_text(path, config.max_file_bytes)? {
                Some(content) => {
                    let file = extractors.describe(&rel, content);
                    tree.files.insert(rel, file);
                }
                None => {
                    tracing::debug!(path = %rel, "skipping binary or oversized file");
                    tree.skipped += 1;
                }
            }
        }

        tree.dirs = build_dirs(&tree.files);
        tree.entry_points = tree
            .files
            .keys()
            .filter(|rel| is_entry_point(rel))
            .cloned()
            .collect();
        tree.readme = read_readme(&root, config.readme_max_bytes);
        tracing::info!(
            files = tree.files.len(),
            dirs = tree.dirs.len(),
            entry_points = tree.entry_points.len(),
            skipped = tree.skipped,
            "source scan complete"
        );
        Ok(tree)
    }

    pub fn file_fingerprints(&self) -> BTreeMap<String, String> {
        self.files
            .iter()
            .map(|(rel, file)| (rel.clone(), file.fingerprint.clone()))
            .collect()
    }

    pub fn dir_snapshots(&self) -> BTreeMap<String, DirSnapshot> {
        self.dirs
            .iter()
            .map(|(rel, dir)| {
                (
                    rel.clone(),
                    DirSnapshot {
                        members: dir.members.clone(),
                        fingerprint: dir.fingerprint.clone(),
                    },
                )
            })
            .collect()
    }
}

/// Read a file as text, or `None` when it is binary, not UTF-8, or too large.
fn read_source_text(path: &Path, max_bytes: u64) -> Result<Option<String>> {
    let metadata = fs::metadata(path).with_context(|| format!("inspect {}", path.display()))?;
    if metadata.len() > max_bytes {
        return Ok(None);
    }
    let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let sniff = &bytes[..bytes.len().min(BINARY_SNIFF_BYTES)];
    if sniff.contains(&0) {
        return Ok(None);
    }
    Ok(String::from_utf8(bytes).ok())
}

/// Documented directories are exactly the parents of documented files.
fn build_dirs(files: &BTreeMap<String, SourceFile>) -> BTreeMap<String, SourceDir> {
    let mut members: BTreeMap<String, Vec<&SourceFile>> = BTreeMap::new();
    for (rel, file) in files {
        members.entry(parent_rel(rel)).or_default().push(file);
    }
    let names = members.keys().cloned().collect::<BTreeSet<_>>();
    members
        .into_iter()
        .map(|(dir, files)| {
            let subdirs = names
                .iter()
                .filter(|candidate| {
                    candidate.as_str() != ROOT_DIR_REL && parent_rel(candidate) == dir
                })
                .cloned()
                .collect();
            let fingerprint = directory_fingerprint(
                files
                    .iter()
                    .map(|file| (file.rel_path.as_str(), file.fingerprint.as_str())),
            );
            let source_dir = SourceDir {
                rel_path: dir.clone(),
                members: files.iter().map(|file| file.rel_path.clone()).collect(),
                subdirs,
                fingerprint,
            };
            (dir, source_dir)
        })
        .collect()
}

/// Whether a repository-relative file is a program entry point.
pub fn is_entry_point(rel: &str) -> bool {
    let mut parts = rel.rsplit('/');
    let name = parts.next().unwrap_or_default();
    if ENTRY_FILE_NAMES.contains(&name) {
        return true;
    }
    let parent = parts.next();
    let grandparent = parts.next();
    name.ends_with(".rs") && parent == Some("bin") && grandparent == Some("src")
}

fn read_readme(root: &Path, max_bytes: usize) -> Option<String> {
    let entries = fs::read_dir(root).ok()?;
    let mut candidates = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_file())
        .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
        .filter(|name| {
            README_NAMES
                .iter()
                .any(|readme| readme.eq_ignore_ascii_case(name))
        })
        .collect::<Vec<_>>();
    candidates.sort_by_key(|name| {
        README_NAMES
            .iter()
            .position(|readme| readme.eq_ignore_ascii_case(name))
    });
    let name = candidates.first()?;
    let text = fs::read_to_string(root.join(name)).ok()?;
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    Some(truncate_string(text, max_bytes))
}

/// Current revision via `git rev-parse HEAD`; `None` outside a git checkout.
pub fn current_revision(repo_root: &Path) -> Option<String> {
    let output = std::process::Command::new("git")
        .arg("-C")
        .arg(repo_root)
        .args(["rev-parse", "HEAD"])
        .stderr(std::process::Stdio::null())
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let revision = String::from_utf8(output.stdout).ok()?.trim().to_string();
    (!revision.is_empty()).then_some(revision)
}

struct LanguageRules {
    extensions: &'static [&'static str],
    symbols: Vec<Regex>,
    imports: Vec<Regex>,
}

struct Extractors {
    languages: Vec<LanguageRules>,
}

impl Extractors {
    fn new() -> Result<Self> {
        let compile = |patterns: &[&str]| -> Result<Vec<Regex>> {
            patterns
                .iter()
                .map(|pattern| {
                    Regex::new(pattern).with_context(|| format!("compile pattern {pattern}"))
                })
                .collect()
        };
        Ok(Self {
            languages: vec![
                LanguageRules {
                    extensions: &["rs"],
                    symbols: compile(&[
                        r"(?m)^\s*(?:pub(?:\([^)]*\))?\s+)?(?:async\s+)?(?:unsafe\s+)?(?:fn|struct|enum|trait|type|const|static)\s+([A-Za-z_][A-Za-z0-9_]*)",
                    ])?,
                    imports: compile(&[
                        r"(?m)^\s*(?:pub(?:\([^)]*\))?\s+)?use\s+([A-Za-z_][A-Za-z0-9_:]*)",
                        r"(?m)^\s*(?:pub(?:\([^)]*\))?\s+)?mod\s+([A-Za-z_][A-Za-z0-9_]*)\s*;",
                    ])?,
                },
                LanguageRules {
                    extensions: &["py", "pyi"],
                    symbols: compile(&[r"(?m)^\s*(?:async\s+)?(?:def|class)\s+([A-Za-z_]\w*)"])?,
                    imports: compile(&[
                        r"(?m)^\s*import\s+([A-Za-z_][\w.]*)",
                        r"(?m)^\s*from\s+([.\w]+)\s+import\b",
                    ])?,
                },
                LanguageRules {
                    extensions: &["js", "jsx", "ts", "tsx", "mjs", "cjs"],
                    symbols: compile(&[
                        r"(?m)^\s*(?:export\s+)?(?:default\s+)?(?:async\s+)?(?:function\*?|class|interface|type|enum)\s+([A-Za-z_$][\w$]*)",
                        r"(?m)^\s*export\s+(?:const|let|var)\s+([A-Za-z_$][\w$]*)",
                    ])?,
                    imports: compile(&[
                        r#"(?m)^\s*import\s+(?:[^'"]*?\s+from\s+)?['"]([^'"]+)['"]"#,
                        r#"require\(\s*['"]([^'"]+)['"]\s*\)"#,
                    ])?,
                },
                LanguageRules {
                    extensions: &["go"],
                    symbols: compile(&[
                        r"(?m)^func\s+(?:\([^)]*\)\s*)?([A-Za-z_]\w*)",
                        r"(?m)^type\s+([A-Za-z_]\w*)",
                    ])?,
                    imports: compile(&[
                        r#"(?m)^import\s+(?:\w+\s+)?"([^"]+)""#,
                        r#"(?m)^\s+(?:[\w.]+\s+)?"([^"]+)"\s*$"#,
                    ])?,
                },
            ],
        })
    }

    fn describe(&self, rel: &str, content: String) -> SourceFile {
        let extension = rel.rsplit_once('.').map(|(_, ext)| ext).unwrap_or_default();
        let rules = self
            .languages
            .iter()
            .find(|rules| rules.extensions.contains(&extension));
        let (symbols, imports) = match rules {
            Some(rules) => (
                collect_captures(&rules.symbols, &content),
                collect_captures(&rules.imports, &content),
            ),
            None => (Vec::new(), Vec::new()),
        };
        SourceFile {
            rel_path: rel.to_string(),
            fingerprint: fingerprint(content.as_bytes()),
            content,
            symbols,
            imports,
        }
    }
}

fn collect_captures(patterns: &[Regex], content: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut found = Vec::new();
    for pattern in patterns {
        for captures in pattern.captures_iter(content) {
            let Some(name) = captures.get(1) else {
                continue;
            };
            let name = name.as_str().to_string();
            if seen.insert(name.clone()) {
                found.push(name);
            }
            if found.len() >= MAX_EXTRACTED {
                return found;
            }
        }
    }
    found
}
