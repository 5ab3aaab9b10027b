use super::*;
use crate::testing::ScriptedGenerator;
use std::collections::BTreeSet;

fn file(path: &str, layer: Layer) -> FileSummary {
    FileSummary {
        path: path.to_string(),
        purpose: format!("Handles {path}"),
        layer,
        key_abstractions: vec!["Thing".to_string()],
        internal_dependencies: vec![],
        external_dependencies: vec![],
    }
}

fn dir(path: &str, layer: Layer) -> DirectorySummary {
    DirectorySummary {
        path: path.to_string(),
        purpose: "Groups things".to_string(),
        layer,
        key_abstractions: vec![],
        contained_files: vec![],
        role_in_system: "Holds things".to_string(),
    }
}

fn fixture_files(count: usize) -> Vec<FileSummary> {
    (0..count)
        .map(|index| {
            let layer = Layer::ALL[index % Layer::ALL.len()];
            file(&format!("src/module_{index:02}.rs"), layer)
        })
        .collect()
}

fn wide_open() -> SynthesisLimits {
    SynthesisLimits {
        context_budget_bytes: 1_000_000,
        batch_size: 1_000,
    }
}

#[test]
fn every_file_lands_in_exactly_one_layer() {
    let files = fixture_files(20);
    let layers = group_by_layer(&files, &[dir("src", Layer::Domain)]);
    for summary in &files {
        let hits = layers
            .values()
            .filter(|info| info.files.contains(&summary.path))
            .count();
        assert_eq!(hits, 1, "{}", summary.path);
    }
    assert_eq!(layers[&Layer::Domain].directories, vec!["src"]);
    assert!(!layers[&Layer::Api].purpose.is_empty());
}

#[tokio::test]
async fn model_roundtrips_through_json_and_disk() {
    let generator = ScriptedGenerator::new();
    let model = synthesize(
        &generator,
        &fixture_files(6),
        &[dir("src", Layer::Domain)],
        wide_open(),
    )
    .await
    .unwrap();
    assert_eq!(model.components.len(), 6);
    let json = serde_json::to_string(&model).unwrap();
    let back: SynthesisModel = serde_json::from_str(&json).unwrap();
    assert_eq!(back, model);

    let tree = tempfile::tempdir().unwrap();
    save_model(tree.path(), &model).unwrap();
    assert_eq!(load_model(tree.path()).unwrap(), Some(model.clone()));
    assert_eq!(back.fingerprint().unwrap(), model.fingerprint().unwrap());
}

#[tokio::test]
async fn empty_input_yields_empty_model_without_calls() {
    let generator = ScriptedGenerator::new();
    let model = synthesize(&generator, &[], &[], wide_open()).await.unwrap();
    assert!(model.layers.is_empty());
    assert!(model.components.is_empty());
    assert_eq!(generator.call_count(), 0);
}

#[test]
fn batches_respect_count_and_byte_budget() {
    let items = (0..25).map(|i| format!("{i:0>40}")).collect::<Vec<_>>();
    let limits = SynthesisLimits {
        context_budget_bytes: 200,
        batch_size: 3,
    };
    let batches = plan_batches(items.clone(), limits);
    assert!(batches.len() > 1);
    for batch in &batches {
        assert!(batch.len() <= 3);
        assert!(serialized_len(batch) <= 200);
    }
    assert_eq!(batches.concat(), items);
}

#[test]
fn oversized_summary_is_truncated_to_budget() {
    let items = vec!["x".repeat(50), "y".repeat(5000)];
    let limits = SynthesisLimits {
        context_budget_bytes: 100,
        batch_size: 10,
    };
    let batches = plan_batches(items, limits);
    assert_eq!(batches.len(), 2);
    assert!(serialized_len(&batches[1]) <= 100);
}

#[test]
fn small_input_is_one_batch() {
    let items = vec!["a".to_string(), "b".to_string()];
    assert_eq!(plan_batches(items.clone(), wide_open()), vec![items]);
}

#[tokio::test]
async fn batching_keeps_layer_grouping_and_all_components() {
    let files = fixture_files(30);
    let single = ScriptedGenerator::new();
    let whole = synthesize(&single, &files, &[], wide_open()).await.unwrap();
    assert_eq!(single.count_of(LmTaskKind::Synthesis), 1);

    let batched_generator = ScriptedGenerator::new();
    let limits = SynthesisLimits {
        context_budget_bytes: 1_000,
        batch_size: 4,
    };
    let batched = synthesize(&batched_generator, &files, &[], limits)
        .await
        .unwrap();
    assert!(batched_generator.count_of(LmTaskKind::Synthesis) > 1);
    assert_eq!(batched.layers, whole.layers);
    let names = |model: &SynthesisModel| {
        model
            .components
            .iter()
            .map(|component| component.name.clone())
            .collect::<BTreeSet<_>>()
    };
    assert_eq!(names(&batched), names(&whole));
}

#[tokio::test]
async fn later_batches_win_on_collision() {
    let generator = ScriptedGenerator::new().respond(LmTaskKind::Synthesis, |request| {
        let role = if request.subject.starts_with("batch 1/") {
            "early"
        } else {
            "late"
        };
        Ok(serde_json::json!({
            "components": [
                {"name": "Core", "file": "src/core.rs", "role": role, "layer": "Domain"},
                {"name": request.subject.clone(), "file": "", "role": "marker", "layer": "nonsense"}
            ],
            "dependency_graph": {"api": [role]},
            "project_summary": format!("summary {role}")
        })
        .to_string())
    });
    let limits = SynthesisLimits {
        context_budget_bytes: 450,
        batch_size: 2,
    };
    let model = synthesize(&generator, &fixture_files(4), &[], limits)
        .await
        .unwrap();
    assert_eq!(generator.count_of(LmTaskKind::Synthesis), 2);
    assert_eq!(model.components[0].name, "Core");
    assert_eq!(model.components[0].role, "late");
    assert_eq!(model.components[1].name, "batch 1/2");
    assert_eq!(model.components[1].layer, Layer::Utility);
    assert_eq!(model.dependency_graph["api"], vec!["late"]);
    assert_eq!(model.project_summary, "summary early\n\nsummary late");
}

#[tokio::test]
async fn malformed_batch_contributes_nothing() {
    let generator = ScriptedGenerator::new()
        .respond(LmTaskKind::Synthesis, |_| Ok("I cannot do that".to_string()));
    let model = synthesize(&generator, &fixture_files(3), &[], wide_open())
        .await
        .unwrap();
    assert!(model.components.is_empty());
    assert_eq!(model.layers.values().map(|info| info.files.len()).sum::<usize>(), 3);
}

#[tokio::test]
async fn timeout_retries_once_at_half_size() {
    let generator = ScriptedGenerator::new()
        .timeout_if(|request| request.kind == LmTaskKind::Synthesis && !request.subject.contains("retry"));
    let model = synthesize(&generator, &fixture_files(5), &[], wide_open())
        .await
        .unwrap();
    assert_eq!(
        generator.subjects_of(LmTaskKind::Synthesis),
        vec![
            "batch 1/1".to_string(),
            "batch 1/1 (retry 1/2)".to_string(),
            "batch 1/1 (retry 2/2)".to_string(),
        ]
    );
    assert_eq!(model.components.len(), 5);
}

#[tokio::test]
async fn second_timeout_fails_the_phase() {
    let generator = ScriptedGenerator::new().timeout_on(LmTaskKind::Synthesis);
    let err = synthesize(&generator, &fixture_files(5), &[], wide_open())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("after retry"), "{err}");
    assert_eq!(generator.count_of(LmTaskKind::Synthesis), 2);
}
