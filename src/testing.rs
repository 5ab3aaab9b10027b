//! Test doubles shared by unit tests.
use crate::lm::{LmError, LmRequest, LmTaskKind, TextGenerator};
use async_trait::async_trait;
use regex::Regex;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

type Responder = Box<dyn Fn(&LmRequest) -> Result<String, LmError> + Send + Sync>;
type Predicate = Box<dyn Fn(&LmRequest) -> bool + Send + Sync>;

/// Deterministic stand-in for the text-generation collaborator.
///
/// Default responses are well-formed for every task kind; individual kinds can
/// be overridden, delayed, or made to time out.
#[derive(Default)]
pub struct ScriptedGenerator {
    responders: HashMap<LmTaskKind, Responder>,
    timeouts: Vec<Predicate>,
    delays: HashMap<LmTaskKind, Duration>,
    calls: Mutex<Vec<(LmTaskKind, String)>>,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout_on(self, kind: LmTaskKind) -> Self {
        self.timeout_if(move |request| request.kind == kind)
    }

    pub fn timeout_if(
        mut self,
        predicate: impl Fn(&LmRequest) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.timeouts.push(Box::new(predicate));
        self
    }

    pub fn respond(
        mut self,
        kind: LmTaskKind,
        responder: impl Fn(&LmRequest) -> Result<String, LmError> + Send + Sync + 'static,
    ) -> Self {
        self.responders.insert(kind, Box::new(responder));
        self
    }

    pub fn delay(mut self, kind: LmTaskKind, delay: Duration) -> Self {
        self.delays.insert(kind, delay);
        self
    }

    pub fn calls(&self) -> Vec<(LmTaskKind, String)> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls().len()
    }

    pub fn count_of(&self, kind: LmTaskKind) -> usize {
        self.calls().iter().filter(|(k, _)| *k == kind).count()
    }

    pub fn subjects_of(&self, kind: LmTaskKind) -> Vec<String> {
        let mut subjects = self
            .calls()
            .into_iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, subject)| subject)
            .collect::<Vec<_>>();
        subjects.sort();
        subjects
    }
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    async fn generate(&self, request: &LmRequest) -> Result<String, LmError> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((request.kind, request.subject.clone()));
        if let Some(delay) = self.delays.get(&request.kind) {
            tokio::time::sleep(*delay).await;
        }
        if self.timeouts.iter().any(|predicate| predicate(request)) {
            return Err(LmError::Timeout(Duration::from_secs(1)));
        }
        if let Some(responder) = self.responders.get(&request.kind) {
            return responder(request);
        }
        Ok(default_response(request))
    }
}

/// Layer guessed from a unit path so fixtures spread across layers.
pub fn layer_for(subject: &str) -> &'static str {
    if subject.contains("test") {
        "test"
    } else if subject.contains("config") {
        "config"
    } else if subject.contains("main") || subject.contains("api") {
        "api"
    } else if subject.contains("util") {
        "utility"
    } else {
        "domain"
    }
}

fn default_response(request: &LmRequest) -> String {
    let subject = &request.subject;
    match request.kind {
        LmTaskKind::FileSummary => format!(
            "# {subject}\n\nDocuments {subject}.\n\n<unit_summary>\n{{\"purpose\": \"Implements {subject}\", \"layer\": \"{}\", \"key_abstractions\": [\"{subject}\"], \"internal_dependencies\": [], \"external_dependencies\": []}}\n</unit_summary>\n",
            layer_for(subject)
        ),
        LmTaskKind::DirectorySummary => format!(
            "# {subject}/\n\nGroups related modules.\n\n<unit_summary>\n{{\"purpose\": \"Directory {subject}\", \"layer\": \"{}\", \"key_abstractions\": [], \"role_in_system\": \"Holds {subject}\"}}\n</unit_summary>\n",
            layer_for(subject)
        ),
        LmTaskKind::Synthesis => synthesis_response(&request.prompt),
        LmTaskKind::Architecture => "The system is organised in layers.".to_string(),
        LmTaskKind::Overview => "This project documents itself.".to_string(),
        LmTaskKind::Workflow => format!("Running `{subject}` starts the program."),
    }
}

/// One component per file summary found in the prompt.
fn synthesis_response(prompt: &str) -> String {
    let Ok(pattern) = Regex::new(r#""unit":"file","path":"([^"]+)""#) else {
        return "{}".to_string();
    };
    let components = pattern
        .captures_iter(prompt)
        .filter_map(|captures| captures.get(1))
        .map(|path| {
            serde_json::json!({
                "name": path.as_str(),
                "file": path.as_str(),
                "role": "component",
                "layer": layer_for(path.as_str()),
            })
        })
        .collect::<Vec<_>>();
    serde_json::json!({
        "components": components,
        "dependency_graph": {},
        "project_summary": "A scripted project.",
    })
    .to_string()
}

/// Write `(relative path, content)` pairs under `root`.
pub fn write_files(root: &Path, files: &[(&str, &str)]) {
    for (rel, content) in files {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }
}
