//! Architecture and overview pages built from the synthesis model.
//!
//! Each page is the collaborator's narrative followed by a deterministic
//! rendering of the model, so a page is never empty even when the README is
//! missing and the collaborator is terse.
use crate::artifact::{Artifact, ArtifactKind};
use crate::lm::{LmRequest, LmTaskKind, TextGenerator};
use crate::paths::{ARCHITECTURE_REL, OVERVIEW_REL};
use crate::summarize::RunStamp;
use crate::synthesis::SynthesisModel;
use crate::templates::{ARCHITECTURE_PROMPT_MD, OVERVIEW_PROMPT_MD};
use anyhow::{anyhow, Context, Result};
use std::fmt::Write;

pub async fn generate_architecture(
    generator: &dyn TextGenerator,
    model: &SynthesisModel,
    readme: Option<&str>,
    stamp: &RunStamp,
) -> Result<Artifact> {
    let prompt = build_prompt(ARCHITECTURE_PROMPT_MD, model, readme)?;
    let request = LmRequest::new(LmTaskKind::Architecture, "architecture", prompt);
    let narrative = generator
        .generate(&request)
        .await
        .map_err(|err| anyhow!("architecture page: {err}"))?;
    let mut body = String::from("# Architecture\n\n");
    push_narrative(&mut body, &narrative);
    render_layers(&mut body, model);
    render_components(&mut body, model);
    render_dependencies(&mut body, model);
    Ok(Artifact {
        rel_path: ARCHITECTURE_REL.to_string(),
        provenance: stamp.provenance(ArtifactKind::Architecture, None, None),
        body,
    })
}

pub async fn generate_overview(
    generator: &dyn TextGenerator,
    model: &SynthesisModel,
    readme: Option<&str>,
    stamp: &RunStamp,
) -> Result<Artifact> {
    let prompt = build_prompt(OVERVIEW_PROMPT_MD, model, readme)?;
    let request = LmRequest::new(LmTaskKind::Overview, "overview", prompt);
    let narrative = generator
        .generate(&request)
        .await
        .map_err(|err| anyhow!("overview page: {err}"))?;
    let mut body = String::from("# Overview\n\n");
    push_narrative(&mut body, &narrative);
    if !model.project_summary.trim().is_empty() {
        let _ = writeln!(body, "## Summary\n\n{}\n", model.project_summary.trim());
    }
    render_layer_table(&mut body, model);
    Ok(Artifact {
        rel_path: OVERVIEW_REL.to_string(),
        provenance: stamp.provenance(ArtifactKind::Overview, None, None),
        body,
    })
}

fn build_prompt(template: &str, model: &SynthesisModel, readme: Option<&str>) -> Result<String> {
    let model_json =
        serde_json::to_string_pretty(model).context("serialize synthesis model for prompt")?;
    let readme_section = match readme {
        Some(readme) => format!("\n## README (supplementary)\n{readme}\n"),
        None => String::new(),
    };
    Ok(template
        .replace("{readme_section}", &readme_section)
        .replace("{model}", &model_json))
}

fn push_narrative(body: &mut String, narrative: &str) {
    let narrative = narrative.trim();
    if !narrative.is_empty() {
        body.push_str(narrative);
        body.push_str("\n\n");
    }
}

fn render_layers(body: &mut String, model: &SynthesisModel) {
    body.push_str("## Layers\n\n");
    if model.layers.is_empty() {
        body.push_str("No documented units.\n\n");
        return;
    }
    for (layer, info) in &model.layers {
        let _ = writeln!(body, "### {layer}\n\n{}\n", info.purpose);
        for dir in &info.directories {
            let _ = writeln!(body, "- directory `{dir}`");
        }
        for file in &info.files {
            let _ = writeln!(body, "- `{file}`");
        }
        body.push('\n');
    }
}

fn render_components(body: &mut String, model: &SynthesisModel) {
    if model.components.is_empty() {
        return;
    }
    body.push_str("## Components\n\n| Component | Layer | File | Role |\n|---|---|---|---|\n");
    for component in &model.components {
        let _ = writeln!(
            body,
            "| {} | {} | `{}` | {} |",
            component.name, component.layer, component.file, component.role
        );
    }
    body.push('\n');
}

fn render_dependencies(body: &mut String, model: &SynthesisModel) {
    if model.dependency_graph.is_empty() {
        return;
    }
    body.push_str("## Dependencies\n\n");
    for (from, targets) in &model.dependency_graph {
        if targets.is_empty() {
            continue;
        }
        let _ = writeln!(body, "- {from} → {}", targets.join(", "));
    }
    body.push('\n');
}

fn render_layer_table(body: &mut String, model: &SynthesisModel) {
    body.push_str("## At a glance\n\n| Layer | Directories | Files |\n|---|---|---|\n");
    for (layer, info) in &model.layers {
        let _ = writeln!(
            body,
            "| {layer} | {} | {} |",
            info.directories.len(),
            info.files.len()
        );
    }
    let _ = writeln!(body, "\n{} components identified.", model.components.len());
}
