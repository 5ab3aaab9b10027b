//! Synthesis aggregator: many unit summaries in, one cross-cutting model out.
//!
//! Layer grouping is computed locally and never batched, so every file lands
//! in exactly one layer whatever the batch plan. Components, dependency edges
//! and the project summary come from the collaborator; when the serialized
//! summaries exceed the context budget they are sent in batches and merged
//! last-write-wins.
use crate::lm::{extract_json, LmRequest, LmTaskKind, TextGenerator};
use crate::paths::SYNTHESIS_REL;
use crate::summary::{DirectorySummary, FileSummary, Layer, UnitSummary};
use crate::templates::SYNTHESIS_PROMPT_MD;
use crate::util::{sha256_hex, truncate_string};
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerInfo {
    pub purpose: String,
    pub directories: Vec<String>,
    pub files: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentInfo {
    pub name: String,
    pub file: String,
    pub role: String,
    pub layer: Layer,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynthesisModel {
    pub layers: BTreeMap<Layer, LayerInfo>,
    pub components: Vec<ComponentInfo>,
    pub dependency_graph: BTreeMap<String, Vec<String>>,
    pub project_summary: String,
}

impl SynthesisModel {
    /// Stable content hash; BTreeMaps and fixed field order keep the JSON canonical.
    pub fn fingerprint(&self) -> Result<String> {
        let bytes = serde_json::to_vec(self).context("serialize synthesis model")?;
        Ok(sha256_hex(&bytes))
    }

    pub fn layer_of_file(&self, path: &str) -> Option<Layer> {
        self.layers
            .iter()
            .find(|(_, info)| info.files.iter().any(|file| file == path))
            .map(|(layer, _)| *layer)
    }
}

/// Budget knobs for the collaborator step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SynthesisLimits {
    pub context_budget_bytes: usize,
    pub batch_size: usize,
}

pub fn layer_purpose(layer: Layer) -> &'static str {
    match layer {
        Layer::Api => "Entry points and interfaces exposed to users or other systems.",
        Layer::Domain => "Core logic and the concepts the project is about.",
        Layer::Infrastructure => "Storage, networking, process and platform integration.",
        Layer::Utility => "Shared helpers used across the codebase.",
        Layer::Config => "Configuration, build and packaging definitions.",
        Layer::Test => "Tests, fixtures and test support code.",
    }
}

/// Deterministic grouping of every unit by its own layer.
pub fn group_by_layer(
    files: &[FileSummary],
    dirs: &[DirectorySummary],
) -> BTreeMap<Layer, LayerInfo> {
    let mut layers: BTreeMap<Layer, LayerInfo> = BTreeMap::new();
    for file in files {
        let info = layers.entry(file.layer).or_default();
        info.files.push(file.path.clone());
    }
    for dir in dirs {
        let info = layers.entry(dir.layer).or_default();
        info.directories.push(dir.path.clone());
    }
    for (layer, info) in layers.iter_mut() {
        info.purpose = layer_purpose(*layer).to_string();
        info.files.sort();
        info.files.dedup();
        info.directories.sort();
        info.directories.dedup();
    }
    layers
}

/// Compact one-line JSON per summary, files first, each group sorted by path.
pub fn serialize_summaries(
    files: &[FileSummary],
    dirs: &[DirectorySummary],
) -> Result<Vec<String>> {
    let mut files = files.to_vec();
    files.sort_by(|a, b| a.path.cmp(&b.path));
    let mut dirs = dirs.to_vec();
    dirs.sort_by(|a, b| a.path.cmp(&b.path));
    let units = files
        .into_iter()
        .map(UnitSummary::File)
        .chain(dirs.into_iter().map(UnitSummary::Directory));
    units
        .map(|unit| serde_json::to_string(&unit).context("serialize unit summary"))
        .collect()
}

fn serialized_len(items: &[String]) -> usize {
    items.iter().map(|item| item.len() + 1).sum()
}

/// Split serialized summaries into batches that fit the limits.
///
/// Everything goes in one batch when it fits the byte budget. Otherwise
/// batches are filled greedily, bounded by both `batch_size` and the budget;
/// a single summary larger than the budget is truncated to fit.
pub fn plan_batches(items: Vec<String>, limits: SynthesisLimits) -> Vec<Vec<String>> {
    let budget = limits.context_budget_bytes.max(1);
    let max_items = limits.batch_size.max(1);
    if items.is_empty() {
        return Vec::new();
    }
    if serialized_len(&items) <= budget {
        return vec![items];
    }
    let mut batches = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut current_len = 0;
    for item in items {
        let item = if item.len() + 1 > budget {
            truncate_string(&item, budget.saturating_sub(1))
        } else {
            item
        };
        let item_len = item.len() + 1;
        if !current.is_empty() && (current.len() >= max_items || current_len + item_len > budget)
        {
            batches.push(std::mem::take(&mut current));
            current_len = 0;
        }
        current_len += item_len;
        current.push(item);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

#[derive(Debug, Deserialize)]
struct RawComponent {
    name: Option<String>,
    #[serde(default)]
    file: Option<String>,
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    layer: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawBatch {
    #[serde(default)]
    components: Vec<RawComponent>,
    #[serde(default)]
    dependency_graph: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    project_summary: Option<String>,
}

#[derive(Debug, Default, PartialEq, Eq)]
struct BatchOutput {
    components: Vec<ComponentInfo>,
    edges: BTreeMap<String, Vec<String>>,
    project_summary: Option<String>,
}

fn parse_batch(label: &str, text: &str) -> BatchOutput {
    let raw = match serde_json::from_str::<RawBatch>(extract_json(text)) {
        Ok(raw) => raw,
        Err(err) => {
            tracing::warn!(batch = label, error = %err, "synthesis batch returned malformed JSON; skipping");
            return BatchOutput::default();
        }
    };
    let components = raw
        .components
        .into_iter()
        .filter_map(|component| {
            let name = component.name?.trim().to_string();
            if name.is_empty() {
                return None;
            }
            Some(ComponentInfo {
                name,
                file: component.file.unwrap_or_default().trim().to_string(),
                role: component.role.unwrap_or_default().trim().to_string(),
                layer: Layer::coerce(component.layer.as_deref().unwrap_or_default()),
            })
        })
        .collect();
    let edges = raw
        .dependency_graph
        .into_iter()
        .filter(|(key, _)| !key.trim().is_empty())
        .map(|(key, targets)| {
            let mut deduped: Vec<String> = Vec::new();
            for target in targets {
                let target = target.trim().to_string();
                if !target.is_empty() && !deduped.contains(&target) {
                    deduped.push(target);
                }
            }
            (key.trim().to_string(), deduped)
        })
        .collect();
    let project_summary = raw
        .project_summary
        .map(|summary| summary.trim().to_string())
        .filter(|summary| !summary.is_empty());
    BatchOutput {
        components,
        edges,
        project_summary,
    }
}

/// Last-write-wins accumulator across batches.
#[derive(Default)]
struct Merger {
    components: Vec<ComponentInfo>,
    positions: HashMap<String, usize>,
    graph: BTreeMap<String, Vec<String>>,
    summaries: Vec<String>,
}

impl Merger {
    fn absorb(&mut self, output: BatchOutput) {
        for component in output.components {
            match self.positions.get(&component.name) {
                Some(&index) => self.components[index] = component,
                None => {
                    self.positions
                        .insert(component.name.clone(), self.components.len());
                    self.components.push(component);
                }
            }
        }
        for (key, targets) in output.edges {
            self.graph.insert(key, targets);
        }
        if let Some(summary) = output.project_summary {
            self.summaries.push(summary);
        }
    }
}

fn build_prompt(label: &str, items: &[String]) -> String {
    SYNTHESIS_PROMPT_MD
        .replace("{batch_label}", label)
        .replace("{summaries}", &items.join("\n"))
}

async fn call_batch(
    generator: &dyn TextGenerator,
    label: &str,
    items: &[String],
) -> Result<BatchOutput, crate::lm::LmError> {
    let request = LmRequest::new(LmTaskKind::Synthesis, label, build_prompt(label, items));
    let response = generator.generate(&request).await?;
    Ok(parse_batch(label, &response))
}

/// Run one batch; on a timeout retry once with the batch split in half.
async fn run_batch_with_retry(
    generator: &dyn TextGenerator,
    label: &str,
    items: &[String],
) -> Result<Vec<BatchOutput>> {
    match call_batch(generator, label, items).await {
        Ok(output) => Ok(vec![output]),
        Err(err) if err.is_timeout() => {
            let mid = items.len().div_ceil(2);
            let halves = if items.len() > 1 {
                vec![&items[..mid], &items[mid..]]
            } else {
                vec![items]
            };
            tracing::warn!(
                batch = label,
                items = items.len(),
                retry_batches = halves.len(),
                "synthesis batch timed out; retrying at half size"
            );
            let count = halves.len();
            let mut outputs = Vec::with_capacity(count);
            for (index, half) in halves.into_iter().enumerate() {
                let retry_label = format!("{label} (retry {}/{count})", index + 1);
                let output = call_batch(generator, &retry_label, half)
                    .await
                    .map_err(|err| anyhow!("synthesis {retry_label} failed after retry: {err}"))?;
                outputs.push(output);
            }
            Ok(outputs)
        }
        Err(err) => Err(anyhow!("synthesis {label} failed: {err}")),
    }
}

/// Build a fresh model from the current summaries.
pub async fn synthesize(
    generator: &dyn TextGenerator,
    files: &[FileSummary],
    dirs: &[DirectorySummary],
    limits: SynthesisLimits,
) -> Result<SynthesisModel> {
    let layers = group_by_layer(files, dirs);
    let items = serialize_summaries(files, dirs)?;
    if items.is_empty() {
        return Ok(SynthesisModel {
            layers,
            ..SynthesisModel::default()
        });
    }

    let batches = plan_batches(items, limits);
    let total = batches.len();
    tracing::info!(
        files = files.len(),
        dirs = dirs.len(),
        batches = total,
        "synthesizing"
    );
    let mut merger = Merger::default();
    for (index, batch) in batches.iter().enumerate() {
        let label = format!("batch {}/{total}", index + 1);
        for output in run_batch_with_retry(generator, &label, batch).await? {
            merger.absorb(output);
        }
    }
    Ok(SynthesisModel {
        layers,
        components: merger.components,
        dependency_graph: merger.graph,
        project_summary: merger.summaries.join("\n\n"),
    })
}

/// Load the persisted model from a version root.
pub fn load_model(tree_root: &Path) -> Result<Option<SynthesisModel>> {
    let path = tree_root.join(SYNTHESIS_REL);
    if !path.is_file() {
        return Ok(None);
    }
    let bytes = fs::read(&path).with_context(|| format!("read {}", path.display()))?;
    match serde_json::from_slice(&bytes) {
        Ok(model) => Ok(Some(model)),
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "ignoring unreadable synthesis model");
            Ok(None)
        }
    }
}

pub fn save_model(tree_root: &Path, model: &SynthesisModel) -> Result<()> {
    crate::staging::write_staged_json(tree_root, SYNTHESIS_REL, model)
}

#[cfg(test)]
#[path = "synthesis_tests.rs"]
mod tests;
