//! CLI argument parsing for repo-man.
//!
//! Every command names its output root explicitly; nothing is inferred from
//! the working directory.
use crate::config::Backend;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Root CLI entrypoint.
#[derive(Parser, Debug)]
#[command(
    name = "repo-man",
    version,
    about = "Incremental, LM-driven documentation for source repositories",
    after_help = "Commands:\n  init --out <dir>                     Write the default config\n  generate --repo <dir> --out <dir>    Regenerate documentation incrementally\n  clean --repo <dir> --out <dir>       Remove stale pages and orphaned notes\n  status --out <dir>                   Show the current version and last run\n  show --out <dir> <page>              Print a page without its provenance\n  note add|list --out <dir>            Manage correction notes\n\nExamples:\n  repo-man init --out /tmp/docs\n  repo-man generate --repo . --out /tmp/docs --lm 'claude -p'\n  repo-man note add --out /tmp/docs --target src/lib.rs --text 'Engine owns the cache'\n  repo-man show --out /tmp/docs architecture.md",
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct RootArgs {
    #[command(subcommand)]
    pub command: Command,
}

/// Top-level commands.
#[derive(Subcommand, Debug)]
pub enum Command {
    Init(InitArgs),
    Generate(GenerateArgs),
    Clean(CleanArgs),
    Status(StatusArgs),
    Show(ShowArgs),
    Note(NoteArgs),
}

impl Command {
    pub fn verbose(&self) -> bool {
        match self {
            Command::Generate(args) => args.verbose,
            Command::Clean(args) => args.verbose,
            _ => false,
        }
    }
}

#[derive(Parser, Debug)]
#[command(about = "Write the default config into an output root")]
pub struct InitArgs {
    /// Output root for generated documentation
    #[arg(long, value_name = "DIR")]
    pub out: PathBuf,

    /// Overwrite an existing config.json
    #[arg(long)]
    pub force: bool,
}

#[derive(Parser, Debug)]
#[command(about = "Regenerate documentation for changed units and promote it")]
pub struct GenerateArgs {
    /// Repository to document
    #[arg(long, value_name = "DIR")]
    pub repo: PathBuf,

    /// Output root for generated documentation
    #[arg(long, value_name = "DIR")]
    pub out: PathBuf,

    /// LM command (prompt on stdin, response on stdout)
    #[arg(long, value_name = "CMD")]
    pub lm: Option<String>,

    /// Override the worker limit for the selected backend
    #[arg(long, value_name = "N")]
    pub concurrency: Option<usize>,

    /// Where the LM runs; selects the default worker limit
    #[arg(long, value_enum)]
    pub backend: Option<Backend>,

    /// Emit debug logs
    #[arg(long)]
    pub verbose: bool,
}

#[derive(Parser, Debug)]
#[command(about = "Delete stale pages and orphaned notes without regenerating")]
pub struct CleanArgs {
    /// Repository the documentation describes
    #[arg(long, value_name = "DIR")]
    pub repo: PathBuf,

    /// Output root for generated documentation
    #[arg(long, value_name = "DIR")]
    pub out: PathBuf,

    /// Emit debug logs
    #[arg(long)]
    pub verbose: bool,
}

#[derive(Parser, Debug)]
#[command(about = "Summarize the current version and the last run")]
pub struct StatusArgs {
    /// Output root for generated documentation
    #[arg(long, value_name = "DIR")]
    pub out: PathBuf,

    /// Emit machine-readable JSON output
    #[arg(long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
#[command(about = "Print a page of the live tree without its provenance block")]
pub struct ShowArgs {
    /// Output root for generated documentation
    #[arg(long, value_name = "DIR")]
    pub out: PathBuf,

    /// Page path relative to the tree (e.g. `files/src/lib.rs.md`)
    #[arg(value_name = "PAGE")]
    pub page: String,
}

#[derive(Parser, Debug)]
#[command(about = "Manage correction notes")]
pub struct NoteArgs {
    #[command(subcommand)]
    pub command: NoteCommand,
}

#[derive(Subcommand, Debug)]
pub enum NoteCommand {
    /// Attach a correction to a file or directory
    Add(NoteAddArgs),
    /// List notes, oldest first
    List(NoteListArgs),
}

#[derive(Parser, Debug)]
pub struct NoteAddArgs {
    /// Output root for generated documentation
    #[arg(long, value_name = "DIR")]
    pub out: PathBuf,

    /// Repository-relative file or directory (`.` for the root)
    #[arg(long, value_name = "PATH")]
    pub target: String,

    /// Correction text fed into the next summary of the target
    #[arg(long)]
    pub text: String,
}

#[derive(Parser, Debug)]
pub struct NoteListArgs {
    /// Output root for generated documentation
    #[arg(long, value_name = "DIR")]
    pub out: PathBuf,

    /// Emit machine-readable JSON output
    #[arg(long)]
    pub json: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        RootArgs::command().debug_assert();
    }

    #[test]
    fn generate_accepts_overrides() {
        let args = RootArgs::try_parse_from([
            "repo-man",
            "generate",
            "--repo",
            "r",
            "--out",
            "o",
            "--backend",
            "remote",
            "--concurrency",
            "4",
        ])
        .unwrap();
        match args.command {
            Command::Generate(args) => {
                assert_eq!(args.backend, Some(Backend::Remote));
                assert_eq!(args.concurrency, Some(4));
                assert!(args.lm.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn note_add_requires_target_and_text() {
        assert!(RootArgs::try_parse_from(["repo-man", "note", "add", "--out", "o"]).is_err());
        let args = RootArgs::try_parse_from([
            "repo-man", "note", "add", "--out", "o", "--target", "src", "--text", "fix",
        ])
        .unwrap();
        assert!(matches!(
            args.command,
            Command::Note(NoteArgs {
                command: NoteCommand::Add(_)
            })
        ));
    }
}
