//! Unit summarizer: one collaborator call per file or directory.
use crate::artifact::{Artifact, ArtifactKind, Provenance, PROVENANCE_SCHEMA_VERSION};
use crate::lm::{LmError, LmRequest, LmTaskKind, TextGenerator};
use crate::paths::{dir_artifact_rel, file_artifact_rel};
use crate::source::{SourceDir, SourceFile};
use crate::summary::{parse_directory_response, parse_file_response, FileSummary, UnitSummary};
use crate::templates::{DIRECTORY_SUMMARY_PROMPT_MD, FILE_SUMMARY_PROMPT_MD};

/// Timestamp and revision stamped into every artifact of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunStamp {
    pub generated_at_epoch_ms: u128,
    pub revision: Option<String>,
}

impl RunStamp {
    pub fn provenance(
        &self,
        kind: ArtifactKind,
        source_path: Option<&str>,
        summary: Option<UnitSummary>,
    ) -> Provenance {
        Provenance {
            schema_version: PROVENANCE_SCHEMA_VERSION,
            source_path: source_path.map(str::to_string),
            kind,
            generated_at_epoch_ms: self.generated_at_epoch_ms,
            revision: self.revision.clone(),
            layer: match &summary {
                Some(UnitSummary::File(file)) => Some(file.layer),
                _ => None,
            },
            summary,
        }
    }
}

pub async fn summarize_file(
    generator: &dyn TextGenerator,
    file: &SourceFile,
    notes: &[&str],
    stamp: &RunStamp,
) -> Result<(Artifact, UnitSummary), LmError> {
    let prompt = build_file_prompt(file, notes);
    let request = LmRequest::new(LmTaskKind::FileSummary, &file.rel_path, prompt);
    let response = generator.generate(&request).await?;
    let parsed = parse_file_response(&file.rel_path, &response);
    if let Some(reason) = &parsed.fallback_reason {
        tracing::warn!(path = %file.rel_path, reason = %reason, "file summary invalid; using fallback");
    }
    let summary = UnitSummary::File(parsed.summary);
    let body = page_body(&file.rel_path, &parsed.body, &summary);
    let artifact = Artifact {
        rel_path: file_artifact_rel(&file.rel_path),
        provenance: stamp.provenance(
            ArtifactKind::File,
            Some(&file.rel_path),
            Some(summary.clone()),
        ),
        body,
    };
    Ok((artifact, summary))
}

pub async fn summarize_directory(
    generator: &dyn TextGenerator,
    dir: &SourceDir,
    members: &[FileSummary],
    notes: &[&str],
    stamp: &RunStamp,
) -> Result<(Artifact, UnitSummary), LmError> {
    let prompt = build_directory_prompt(dir, members, notes);
    let request = LmRequest::new(LmTaskKind::DirectorySummary, &dir.rel_path, prompt);
    let response = generator.generate(&request).await?;
    let parsed = parse_directory_response(&dir.rel_path, &dir.members, &response);
    if let Some(reason) = &parsed.fallback_reason {
        tracing::warn!(path = %dir.rel_path, reason = %reason, "directory summary invalid; using fallback");
    }
    let summary = UnitSummary::Directory(parsed.summary);
    let body = page_body(&dir.rel_path, &parsed.body, &summary);
    let artifact = Artifact {
        rel_path: dir_artifact_rel(&dir.rel_path),
        provenance: stamp.provenance(
            ArtifactKind::Directory,
            Some(&dir.rel_path),
            Some(summary.clone()),
        ),
        body,
    };
    Ok((artifact, summary))
}

/// Keep the collaborator's page, or a minimal one when it returned only a block.
fn page_body(path: &str, body: &str, summary: &UnitSummary) -> String {
    if !body.trim().is_empty() {
        return body.trim().to_string();
    }
    let purpose = match summary {
        UnitSummary::File(file) => file.purpose.as_str(),
        UnitSummary::Directory(dir) => dir.purpose.as_str(),
    };
    format!("# `{path}`\n\n{purpose}")
}

fn bullet_list(items: &[String]) -> String {
    if items.is_empty() {
        return "(none)".to_string();
    }
    items
        .iter()
        .map(|item| format!("- `{item}`"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn notes_section(notes: &[&str]) -> String {
    if notes.is_empty() {
        return String::new();
    }
    let mut section = String::from("\n## Corrections from maintainers (take these into account)\n");
    for note in notes {
        section.push_str(&format!("- {note}\n"));
    }
    section
}

fn build_file_prompt(file: &SourceFile, notes: &[&str]) -> String {
    FILE_SUMMARY_PROMPT_MD
        .replace("{path}", &file.rel_path)
        .replace("{symbols}", &bullet_list(&file.symbols))
        .replace("{imports}", &bullet_list(&file.imports))
        .replace("{notes_section}", &notes_section(notes))
        .replace("{content}", &file.content)
}

fn build_directory_prompt(dir: &SourceDir, members: &[FileSummary], notes: &[&str]) -> String {
    let members = if members.is_empty() {
        "(none)".to_string()
    } else {
        members
            .iter()
            .map(|member| {
                format!(
                    "- `{}` [{}]: {}",
                    member.path,
                    member.layer,
                    member.purpose
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    };
    DIRECTORY_SUMMARY_PROMPT_MD
        .replace("{path}", &dir.rel_path)
        .replace("{subdirs}", &bullet_list(&dir.subdirs))
        .replace("{notes_section}", &notes_section(notes))
        .replace("{members}", &members)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::parse_stored;
    use crate::summary::{DirectorySummary, Layer, SUMMARY_OPEN};
    use crate::testing::ScriptedGenerator;

    fn stamp() -> RunStamp {
        RunStamp {
            generated_at_epoch_ms: 42,
            revision: Some("deadbeef".to_string()),
        }
    }

    fn source_file(path: &str) -> SourceFile {
        SourceFile {
            rel_path: path.to_string(),
            content: "pub fn parse() {}".to_string(),
            fingerprint: "fp".to_string(),
            symbols: vec!["parse".to_string()],
            imports: vec![],
        }
    }

    #[tokio::test]
    async fn file_artifact_embeds_summary_and_hides_block() {
        let generator = ScriptedGenerator::new();
        let (artifact, summary) =
            summarize_file(&generator, &source_file("src/parser.rs"), &[], &stamp())
                .await
                .unwrap();
        assert_eq!(artifact.rel_path, "files/src/parser.rs.md");
        assert!(!artifact.body.contains(SUMMARY_OPEN));
        assert_eq!(summary.layer(), Layer::Domain);
        let text = artifact.render().unwrap();
        let provenance = parse_stored(&text).0.unwrap();
        assert_eq!(provenance.source_path.as_deref(), Some("src/parser.rs"));
        assert_eq!(provenance.revision.as_deref(), Some("deadbeef"));
        assert_eq!(provenance.layer, Some(Layer::Domain));
        assert_eq!(provenance.summary, Some(summary));
    }

    #[tokio::test]
    async fn malformed_response_falls_back_and_still_renders() {
        let generator = ScriptedGenerator::new()
            .respond(LmTaskKind::FileSummary, |_| Ok("<unit_summary>{oops".to_string()));
        let (artifact, summary) =
            summarize_file(&generator, &source_file("src/x.rs"), &[], &stamp())
                .await
                .unwrap();
        assert_eq!(summary, UnitSummary::File(FileSummary::fallback("src/x.rs")));
        assert_eq!(artifact.body, "# `src/x.rs`\n\nUnknown");
    }

    #[tokio::test]
    async fn call_errors_propagate() {
        let generator = ScriptedGenerator::new().timeout_on(LmTaskKind::FileSummary);
        let err = summarize_file(&generator, &source_file("src/x.rs"), &[], &stamp())
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn notes_reach_the_prompt() {
        let generator = ScriptedGenerator::new().respond(LmTaskKind::FileSummary, |request| {
            assert!(request.prompt.contains("- Mention the cache"));
            Ok("body".to_string())
        });
        summarize_file(
            &generator,
            &source_file("src/x.rs"),
            &["Mention the cache"],
            &stamp(),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn directory_summary_uses_member_summaries() {
        let generator = ScriptedGenerator::new();
        let dir = SourceDir {
            rel_path: "src".to_string(),
            members: vec!["src/a.rs".to_string(), "src/b.rs".to_string()],
            subdirs: vec![],
            fingerprint: "fp".to_string(),
        };
        let members = vec![FileSummary::fallback("src/a.rs"), FileSummary::fallback("src/b.rs")];
        let (artifact, summary) = summarize_directory(&generator, &dir, &members, &[], &stamp())
            .await
            .unwrap();
        assert_eq!(artifact.rel_path, "dirs/src/index.md");
        match summary {
            UnitSummary::Directory(DirectorySummary {
                contained_files,
                role_in_system,
                ..
            }) => {
                assert_eq!(contained_files, dir.members);
                assert_eq!(role_in_system, "Holds src");
            }
            other => panic!("unexpected {other:?}"),
        }
        let provenance = parse_stored(&artifact.render().unwrap()).0.unwrap();
        assert_eq!(provenance.kind, ArtifactKind::Directory);
        assert_eq!(provenance.layer, None);
        assert!(provenance.summary.is_some());
    }
}
