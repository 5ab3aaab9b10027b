//! Shared test infrastructure for integration tests.
//!
//! Tests drive the built `repo-man` binary against a scratch repository with a
//! shell mock standing in for the LM command.

use std::fs;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

/// Answers every prompt kind with a minimal valid response.
const MOCK_LM: &str = r#"#!/bin/sh
prompt=$(cat)
case "$prompt" in
  "You are documenting one source file"*)
    printf '# Mock file\n\nMock page.\n\n<unit_summary>\n{"purpose": "Mock purpose", "layer": "domain", "key_abstractions": ["Mock"], "internal_dependencies": [], "external_dependencies": []}\n</unit_summary>\n'
    ;;
  "You are documenting one directory"*)
    printf '# Mock dir\n\nMock directory page.\n\n<unit_summary>\n{"purpose": "Mock directory", "layer": "domain", "key_abstractions": [], "role_in_system": "Mock role"}\n</unit_summary>\n'
    ;;
  "You are building a cross-cutting model"*)
    printf '{"components": [{"name": "Engine", "file": "src/lib.rs", "role": "core", "layer": "domain"}], "dependency_graph": {}, "project_summary": "Mock project."}\n'
    ;;
  *)
    printf 'Mock narrative.\n'
    ;;
esac
"#;

const FIXTURE: &[(&str, &str)] = &[
    ("README.md", "# Demo\n\nA demo project.\n"),
    ("src/main.rs", "fn main() {\n    demo::run();\n}\n"),
    ("src/lib.rs", "pub struct Engine;\npub fn run() {}\n"),
    ("src/util.rs", "pub fn helper() {}\n"),
];

/// Scratch repository, output root and mock LM for one test.
pub struct Workspace {
    pub repo: TempDir,
    pub out: TempDir,
    pub tools: TempDir,
}

impl Workspace {
    pub fn setup() -> Self {
        let workspace = Self {
            repo: TempDir::new().expect("repo dir"),
            out: TempDir::new().expect("out dir"),
            tools: TempDir::new().expect("tools dir"),
        };
        for (rel, content) in FIXTURE {
            workspace.write(rel, content);
        }
        workspace
    }

    pub fn write(&self, rel: &str, content: &str) {
        let path = self.repo.path().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        fs::write(path, content).expect("write fixture file");
    }

    /// LM command running the mock script through `sh`.
    pub fn mock_lm(&self) -> String {
        let path = self.tools.path().join("mock-lm.sh");
        if !path.is_file() {
            fs::write(&path, MOCK_LM).expect("write mock lm");
        }
        format!("sh {}", path.display())
    }

    pub fn out(&self) -> &Path {
        self.out.path()
    }

    pub fn generate(&self) -> Output {
        let lm = self.mock_lm();
        self.run(&[
            "generate",
            "--repo",
            &self.repo.path().display().to_string(),
            "--out",
            &self.out().display().to_string(),
            "--lm",
            &lm,
        ])
    }

    pub fn run(&self, args: &[&str]) -> Output {
        repo_man()
            .args(args)
            .output()
            .expect("spawn repo-man")
    }

    /// Lines in the LM invocation log, i.e. number of LM calls so far.
    pub fn lm_calls(&self) -> usize {
        fs::read_to_string(self.out().join(".repo-man/lm_log.jsonl"))
            .map(|text| text.lines().filter(|line| !line.trim().is_empty()).count())
            .unwrap_or(0)
    }

    pub fn current_version(&self) -> Option<String> {
        fs::read_to_string(self.out().join(".repo-man/CURRENT"))
            .ok()
            .map(|text| text.trim().to_string())
    }
}

pub fn repo_man() -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_repo-man"));
    command
        .env_remove("REPO_MAN_LM_COMMAND")
        .env("REPO_MAN_LOG", "warn");
    command
}

pub fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

pub fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}
