//! Workflow pages: one per program entry point, rebuilt on every run.
use crate::artifact::{Artifact, ArtifactKind};
use crate::lm::{LmRequest, LmTaskKind, TextGenerator};
use crate::paths::{file_artifact_rel, workflow_artifact_rel};
use crate::source::SourceFile;
use crate::summarize::RunStamp;
use crate::synthesis::SynthesisModel;
use crate::templates::WORKFLOW_PROMPT_MD;
use crate::util::{sha256_hex, truncate_string};
use anyhow::{anyhow, Result};
use std::collections::BTreeMap;
use std::fmt::Write;

const MAX_ENTRY_CONTENT_BYTES: usize = 16 * 1024;
const MAX_PROMPT_COMPONENTS: usize = 40;

/// Page path per entry point. Entry points whose slugs collide get a short
/// hash of their path appended.
pub fn page_paths(entry_points: &[String]) -> BTreeMap<String, String> {
    let mut by_page: BTreeMap<String, Vec<&String>> = BTreeMap::new();
    for entry in entry_points {
        by_page
            .entry(workflow_artifact_rel(entry))
            .or_default()
            .push(entry);
    }
    let mut pages = BTreeMap::new();
    for (page, entries) in by_page {
        if let [entry] = entries.as_slice() {
            pages.insert((*entry).clone(), page);
            continue;
        }
        for entry in entries {
            let stem = page.trim_end_matches(".md");
            let suffix = &sha256_hex(entry.as_bytes())[..8];
            pages.insert(entry.clone(), format!("{stem}-{suffix}.md"));
        }
    }
    pages
}

pub async fn generate_workflow(
    generator: &dyn TextGenerator,
    entry: &SourceFile,
    page: String,
    model: &SynthesisModel,
    stamp: &RunStamp,
) -> Result<Artifact> {
    let prompt = build_prompt(entry, model);
    let request = LmRequest::new(LmTaskKind::Workflow, &entry.rel_path, prompt);
    let narrative = generator
        .generate(&request)
        .await
        .map_err(|err| anyhow!("workflow {}: {err}", entry.rel_path))?;

    let mut body = format!("# Workflow: `{}`\n\n", entry.rel_path);
    let narrative = narrative.trim();
    if !narrative.is_empty() {
        body.push_str(narrative);
        body.push_str("\n\n");
    }
    body.push_str("## Entry point\n\n");
    let _ = writeln!(
        body,
        "- Source: `{}` (see `{}`)",
        entry.rel_path,
        file_artifact_rel(&entry.rel_path)
    );
    if let Some(layer) = model.layer_of_file(&entry.rel_path) {
        let _ = writeln!(body, "- Layer: {layer}");
    }
    let defined_here = model
        .components
        .iter()
        .filter(|component| component.file == entry.rel_path)
        .map(|component| component.name.as_str())
        .collect::<Vec<_>>();
    if !defined_here.is_empty() {
        let _ = writeln!(body, "- Components: {}", defined_here.join(", "));
    }

    Ok(Artifact {
        rel_path: page,
        provenance: stamp.provenance(ArtifactKind::Workflow, Some(&entry.rel_path), None),
        body,
    })
}

fn build_prompt(entry: &SourceFile, model: &SynthesisModel) -> String {
    let components = if model.components.is_empty() {
        "(none identified)".to_string()
    } else {
        model
            .components
            .iter()
            .take(MAX_PROMPT_COMPONENTS)
            .map(|component| {
                format!(
                    "- {} [{}] in `{}`: {}",
                    component.name, component.layer, component.file, component.role
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    };
    let project_summary = if model.project_summary.trim().is_empty() {
        "(not available)"
    } else {
        model.project_summary.trim()
    };
    WORKFLOW_PROMPT_MD
        .replace("{path}", &entry.rel_path)
        .replace("{project_summary}", project_summary)
        .replace("{components}", &components)
        .replace(
            "{content}",
            &truncate_string(&entry.content, MAX_ENTRY_CONTENT_BYTES),
        )
}
