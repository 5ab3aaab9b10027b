//! End-to-end runs of the `repo-man` binary with a mock LM.

mod common;

use common::{repo_man, stderr, stdout, Workspace};
use std::fs;

#[test]
fn first_generate_promotes_a_complete_tree() {
    let ws = Workspace::setup();
    let output = ws.generate();
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert!(stdout(&output).contains("promoted"));

    let version = ws.current_version().expect("CURRENT written");
    let live = ws.out().join(".repo-man/versions").join(&version);
    for rel in [
        "files/src/lib.rs.md",
        "files/README.md.md",
        "dirs/index.md",
        "dirs/src/index.md",
        "architecture.md",
        "overview.md",
        "workflows/src-main-rs.md",
        "_meta/state.json",
        "_meta/synthesis.json",
    ] {
        assert!(live.join(rel).is_file(), "missing {rel}");
    }
    // 4 files, 2 directories, 1 synthesis batch, 2 high-level pages, 1 workflow.
    assert_eq!(ws.lm_calls(), 10);

    let show = ws.run(&["show", "--out", &ws.out().display().to_string(), "architecture.md"]);
    assert!(show.status.success(), "stderr: {}", stderr(&show));
    let page = stdout(&show);
    assert!(page.starts_with("# Architecture"));
    assert!(page.contains("Engine"));
    assert!(!page.contains("repo-man:provenance"));

    let status = ws.run(&["status", "--out", &ws.out().display().to_string(), "--json"]);
    assert!(status.status.success());
    let summary: serde_json::Value = serde_json::from_str(&stdout(&status)).unwrap();
    assert_eq!(summary["version"], version.as_str());
    assert_eq!(summary["files"], 4);
    assert_eq!(summary["dirs"], 2);
    assert_eq!(summary["last_run"]["outcome"]["status"], "completed");
}

#[test]
fn second_generate_without_changes_is_a_no_op() {
    let ws = Workspace::setup();
    assert!(ws.generate().status.success());
    let version = ws.current_version();
    let calls = ws.lm_calls();

    let output = ws.generate();
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert!(stdout(&output).contains("no changes"));
    assert_eq!(ws.lm_calls(), calls);
    assert_eq!(ws.current_version(), version);
}

#[test]
fn edited_file_regenerates_only_its_units() {
    let ws = Workspace::setup();
    assert!(ws.generate().status.success());
    let calls = ws.lm_calls();
    ws.write("src/util.rs", "pub fn helper() -> u8 {\n    7\n}\n");

    let output = ws.generate();
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert!(stdout(&output).contains("1 files regenerated"));
    // The file, its directory, synthesis and the workflow; the model is unchanged.
    assert_eq!(ws.lm_calls(), calls + 4);
    assert!(stdout(&output).contains("architecture and overview unchanged"));
}

#[test]
fn failing_lm_exits_non_zero_and_keeps_nothing() {
    let ws = Workspace::setup();
    let output = repo_man()
        .args(["generate", "--repo"])
        .arg(ws.repo.path())
        .arg("--out")
        .arg(ws.out())
        .args(["--lm", "sh -c 'exit 3'"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(stderr(&output).contains("run failed during files"));
    assert_eq!(ws.current_version(), None);
}

#[test]
fn missing_lm_command_is_reported() {
    let ws = Workspace::setup();
    let output = repo_man()
        .args(["generate", "--repo"])
        .arg(ws.repo.path())
        .arg("--out")
        .arg(ws.out())
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(stderr(&output).contains("no LM command configured"));
}

#[test]
fn notes_are_added_listed_and_consumed() {
    let ws = Workspace::setup();
    assert!(ws.generate().status.success());
    let out = ws.out().display().to_string();

    let add = ws.run(&[
        "note", "add", "--out", &out, "--target", "src/lib.rs", "--text", "Engine is the core",
    ]);
    assert!(add.status.success(), "stderr: {}", stderr(&add));
    let list = ws.run(&["note", "list", "--out", &out]);
    assert!(stdout(&list).contains("Engine is the core"));

    let calls = ws.lm_calls();
    let output = ws.generate();
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert!(stdout(&output).contains("1 files regenerated"));
    assert!(ws.lm_calls() > calls);
}

#[test]
fn init_writes_config_once() {
    let ws = Workspace::setup();
    let out = ws.out().display().to_string();
    assert!(ws.run(&["init", "--out", &out]).status.success());
    let config = fs::read_to_string(ws.out().join(".repo-man/config.json")).unwrap();
    assert!(config.contains("\"schema_version\": 1"));
    let again = ws.run(&["init", "--out", &out]);
    assert!(!again.status.success());
    assert!(ws.run(&["init", "--out", &out, "--force"]).status.success());
}

#[test]
fn clean_removes_pages_of_deleted_sources() {
    let ws = Workspace::setup();
    assert!(ws.generate().status.success());
    fs::remove_file(ws.repo.path().join("src/util.rs")).unwrap();

    let output = ws.run(&[
        "clean",
        "--repo",
        &ws.repo.path().display().to_string(),
        "--out",
        &ws.out().display().to_string(),
    ]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert!(stdout(&output).contains("removed 1 stale pages"));
    let version = ws.current_version().unwrap();
    let live = ws.out().join(".repo-man/versions").join(version);
    assert!(!live.join("files/src/util.rs.md").exists());
    assert!(live.join("workflows/src-main-rs.md").is_file());
}
