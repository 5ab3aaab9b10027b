//! Structured unit summaries and their single validation boundary.
//!
//! Every generated unit page ends with a `<unit_summary>` block holding JSON.
//! The block is metadata: it is parsed here, stripped from the page body, and
//! either validated into a typed summary or replaced by the deterministic
//! fallback. Parsing never fails.
use crate::lm::extract_json;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

pub const SUMMARY_OPEN: &str = "<unit_summary>";
pub const SUMMARY_CLOSE: &str = "</unit_summary>";
pub const FALLBACK_PURPOSE: &str = "Unknown";

/// Closed set of architectural layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    Api,
    Domain,
    Infrastructure,
    Utility,
    Config,
    Test,
}

impl Layer {
    pub const ALL: [Layer; 6] = [
        Layer::Api,
        Layer::Domain,
        Layer::Infrastructure,
        Layer::Utility,
        Layer::Config,
        Layer::Test,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Api => "api",
            Self::Domain => "domain",
            Self::Infrastructure => "infrastructure",
            Self::Utility => "utility",
            Self::Config => "config",
            Self::Test => "test",
        }
    }

    /// Parse a layer name, tolerating case and surrounding whitespace.
    pub fn parse(raw: &str) -> Option<Layer> {
        let normalized = raw.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|layer| layer.as_str() == normalized)
    }

    /// Parse a layer name, coercing anything outside the closed set to `utility`.
    pub fn coerce(raw: &str) -> Layer {
        Self::parse(raw).unwrap_or(Layer::Utility)
    }
}

impl std::fmt::Display for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSummary {
    pub path: String,
    pub purpose: String,
    pub layer: Layer,
    pub key_abstractions: Vec<String>,
    pub internal_dependencies: Vec<String>,
    pub external_dependencies: Vec<String>,
}

impl FileSummary {
    pub fn fallback(path: &str) -> Self {
        Self {
            path: path.to_string(),
            purpose: FALLBACK_PURPOSE.to_string(),
            layer: Layer::Utility,
            key_abstractions: Vec::new(),
            internal_dependencies: Vec::new(),
            external_dependencies: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectorySummary {
    pub path: String,
    pub purpose: String,
    pub layer: Layer,
    pub key_abstractions: Vec<String>,
    pub contained_files: Vec<String>,
    pub role_in_system: String,
}

impl DirectorySummary {
    pub fn fallback(path: &str) -> Self {
        Self {
            path: path.to_string(),
            purpose: FALLBACK_PURPOSE.to_string(),
            layer: Layer::Utility,
            key_abstractions: Vec::new(),
            contained_files: Vec::new(),
            role_in_system: FALLBACK_PURPOSE.to_string(),
        }
    }
}

/// Summary of either kind, as embedded in an artifact's provenance block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "unit", rename_all = "snake_case")]
pub enum UnitSummary {
    File(FileSummary),
    Directory(DirectorySummary),
}

impl UnitSummary {
    pub fn path(&self) -> &str {
        match self {
            Self::File(summary) => &summary.path,
            Self::Directory(summary) => &summary.path,
        }
    }

    pub fn layer(&self) -> Layer {
        match self {
            Self::File(summary) => summary.layer,
            Self::Directory(summary) => summary.layer,
        }
    }
}

/// A collaborator response split into the user-facing body and its summary.
#[derive(Debug, Clone)]
pub struct ParsedResponse<T> {
    pub body: String,
    pub summary: T,
    /// Why the fallback was used, when it was.
    pub fallback_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawFileSummary {
    purpose: Option<String>,
    layer: Option<String>,
    #[serde(default)]
    key_abstractions: Vec<String>,
    #[serde(default)]
    internal_dependencies: Vec<String>,
    #[serde(default)]
    external_dependencies: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawDirectorySummary {
    purpose: Option<String>,
    layer: Option<String>,
    #[serde(default)]
    key_abstractions: Vec<String>,
    role_in_system: Option<String>,
}

/// Parse a file-summary response. Malformed or invalid blocks yield the fallback.
pub fn parse_file_response(path: &str, text: &str) -> ParsedResponse<FileSummary> {
    let (body, block) = split_summary_block(text);
    match block.ok_or_else(|| "missing summary block".to_string()).and_then(|raw| {
        let raw: RawFileSummary = serde_json::from_str(extract_json(raw))
            .map_err(|err| format!("summary JSON: {err}"))?;
        validate_file(path, raw)
    }) {
        Ok(summary) => ParsedResponse {
            body,
            summary,
            fallback_reason: None,
        },
        Err(reason) => ParsedResponse {
            body,
            summary: FileSummary::fallback(path),
            fallback_reason: Some(reason),
        },
    }
}

/// Parse a directory-summary response. `contained_files` comes from the source
/// tree, not from the collaborator.
pub fn parse_directory_response(
    path: &str,
    contained_files: &[String],
    text: &str,
) -> ParsedResponse<DirectorySummary> {
    let (body, block) = split_summary_block(text);
    match block.ok_or_else(|| "missing summary block".to_string()).and_then(|raw| {
        let raw: RawDirectorySummary = serde_json::from_str(extract_json(raw))
            .map_err(|err| format!("summary JSON: {err}"))?;
        validate_directory(path, contained_files, raw)
    }) {
        Ok(summary) => ParsedResponse {
            body,
            summary,
            fallback_reason: None,
        },
        Err(reason) => ParsedResponse {
            body,
            summary: DirectorySummary::fallback(path),
            fallback_reason: Some(reason),
        },
    }
}

fn validate_file(path: &str, raw: RawFileSummary) -> Result<FileSummary, String> {
    let purpose = required_text(raw.purpose, "purpose")?;
    let layer = required_layer(raw.layer)?;
    Ok(FileSummary {
        path: path.to_string(),
        purpose,
        layer,
        key_abstractions: clean_list(raw.key_abstractions),
        internal_dependencies: clean_list(raw.internal_dependencies),
        external_dependencies: clean_list(raw.external_dependencies),
    })
}

fn validate_directory(
    path: &str,
    contained_files: &[String],
    raw: RawDirectorySummary,
) -> Result<DirectorySummary, String> {
    let purpose = required_text(raw.purpose, "purpose")?;
    let layer = required_layer(raw.layer)?;
    let role_in_system = required_text(raw.role_in_system, "role_in_system")?;
    Ok(DirectorySummary {
        path: path.to_string(),
        purpose,
        layer,
        key_abstractions: clean_list(raw.key_abstractions),
        contained_files: contained_files.to_vec(),
        role_in_system,
    })
}

fn required_text(value: Option<String>, field: &str) -> Result<String, String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| format!("missing or empty {field}"))
}

fn required_layer(value: Option<String>) -> Result<Layer, String> {
    let raw = required_text(value, "layer")?;
    Layer::parse(&raw).ok_or_else(|| format!("invalid layer {raw:?}"))
}

fn clean_list(items: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .filter(|item| seen.insert(item.clone()))
        .collect()
}

/// Split the last summary block out of a response.
///
/// An opening tag without a closing tag strips everything after it: the
/// remainder is treated as a truncated block, never as page content.
pub fn split_summary_block(text: &str) -> (String, Option<&str>) {
    let Some(open) = text.rfind(SUMMARY_OPEN) else {
        return (text.trim().to_string(), None);
    };
    let inner_start = open + SUMMARY_OPEN.len();
    match text[inner_start..].find(SUMMARY_CLOSE) {
        Some(rel_close) => {
            let close = inner_start + rel_close;
            let after = &text[close + SUMMARY_CLOSE.len()..];
            let body = format!("{}\n{}", text[..open].trim_end(), after.trim());
            (body.trim().to_string(), Some(&text[inner_start..close]))
        }
        None => (text[..open].trim().to_string(), None),
    }
}
