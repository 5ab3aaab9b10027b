//! Command handlers behind the CLI.
use crate::artifact::display_body;
use crate::cleanup::{self, CleanupPlan};
use crate::cli::{
    CleanArgs, Command, GenerateArgs, InitArgs, NoteArgs, NoteCommand, ShowArgs, StatusArgs,
};
use crate::config::{
    load_config, output_inside_repo, resolve_lm_command, validate_config, write_config, Backend,
    RunConfig,
};
use crate::history::load_history;
use crate::lm::CommandGenerator;
use crate::lm_log::{load_lm_log, LoggedGenerator};
use crate::notes::NoteStore;
use crate::paths::DocTreePaths;
use crate::pipeline::{Pipeline, RunOutcome, RunReport};
use crate::staging::{current_version, live_root, prune_versions, RunLock, StagingArea};
use crate::state::load_state;
use crate::util::{display_path, now_epoch_ms};
use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub async fn dispatch(command: Command) -> Result<ExitCode> {
    match command {
        Command::Init(args) => run_init(args).map(|()| ExitCode::SUCCESS),
        Command::Generate(args) => run_generate(args).await,
        Command::Clean(args) => run_clean(args).map(|()| ExitCode::SUCCESS),
        Command::Status(args) => run_status(args).map(|()| ExitCode::SUCCESS),
        Command::Show(args) => run_show(args).map(|()| ExitCode::SUCCESS),
        Command::Note(args) => run_note(args).map(|()| ExitCode::SUCCESS),
    }
}

pub fn run_init(args: InitArgs) -> Result<()> {
    let paths = DocTreePaths::new(args.out);
    let config_path = paths.config_path();
    if config_path.is_file() && !args.force {
        return Err(anyhow!(
            "config already exists at {} (use --force to overwrite)",
            config_path.display()
        ));
    }
    write_config(&paths, &RunConfig::default())?;
    println!("wrote {}", config_path.display());
    Ok(())
}

/// Apply CLI overrides on top of the loaded config.
fn effective_config(
    mut config: RunConfig,
    backend: Option<Backend>,
    concurrency: Option<usize>,
) -> RunConfig {
    if let Some(backend) = backend {
        config.backend = backend;
    }
    if let Some(limit) = concurrency {
        match config.backend {
            Backend::Local => config.concurrency.local = limit,
            Backend::Remote => config.concurrency.remote = limit,
        }
    }
    config
}

fn resolve_repo(repo: &Path) -> Result<PathBuf> {
    if !repo.is_dir() {
        return Err(anyhow!("repository {} is not a directory", repo.display()));
    }
    fs::canonicalize(repo).with_context(|| format!("resolve repository {}", repo.display()))
}

/// Canonical repository and output roots; the output root must already exist.
fn resolve_roots(repo: &Path, out: &Path) -> Result<(PathBuf, PathBuf)> {
    let repo = resolve_repo(repo)?;
    let out = fs::canonicalize(out)
        .with_context(|| format!("resolve output root {}", out.display()))?;
    if out == repo {
        return Err(anyhow!("output root must differ from the repository root"));
    }
    if output_inside_repo(&repo, &out) {
        tracing::info!(out = %out.display(), "output root is inside the repository; excluded from scan");
    }
    Ok((repo, out))
}

pub async fn run_generate(args: GenerateArgs) -> Result<ExitCode> {
    fs::create_dir_all(&args.out).with_context(|| format!("create {}", args.out.display()))?;
    let (repo, out) = resolve_roots(&args.repo, &args.out)?;

    let paths = DocTreePaths::new(out.clone());
    let config = effective_config(load_config(&paths)?, args.backend, args.concurrency);
    validate_config(&config)?;
    let command = resolve_lm_command(args.lm.as_deref(), &config)?;
    let generator = CommandGenerator::new(&command, config.lm_timeout())?;
    which::which(generator.program())
        .with_context(|| format!("LM program `{}` not found on PATH", generator.program()))?;
    let generator = LoggedGenerator::new(generator, paths.lm_log_path());

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; cancelling run");
            on_interrupt.cancel();
        }
    });

    let report = Pipeline::new(repo, out, config, Arc::new(generator))
        .with_cancellation(cancel)
        .run()
        .await?;
    print_report(&report);
    Ok(match report.outcome {
        RunOutcome::Failed { .. } => ExitCode::FAILURE,
        _ => ExitCode::SUCCESS,
    })
}

fn print_report(report: &RunReport) {
    let counts = &report.counts;
    match &report.outcome {
        RunOutcome::Completed => {
            println!(
                "promoted {}: {} files regenerated ({} reused, {} removed), {} directories regenerated ({} reused, {} removed), {} workflows",
                report.version.as_deref().unwrap_or("-"),
                counts.files_regenerated,
                counts.files_reused,
                counts.files_removed,
                counts.dirs_regenerated,
                counts.dirs_reused,
                counts.dirs_removed,
                counts.workflows_generated,
            );
            if !counts.high_level_regenerated {
                println!("architecture and overview unchanged");
            }
        }
        RunOutcome::NoChanges => println!("no changes; documentation is up to date"),
        RunOutcome::Cancelled => println!("run cancelled; documentation left unchanged"),
        RunOutcome::Failed { phase, message } => {
            eprintln!("run failed during {phase}: {message}");
        }
    }
    if counts.artifacts_cleaned > 0 || counts.notes_removed > 0 {
        println!(
            "cleaned {} stale pages and {} orphaned notes",
            counts.artifacts_cleaned, counts.notes_removed
        );
    }
}

/// Remove orphaned pages and notes without regenerating anything.
///
/// Workflow pages are left alone here; only `generate` rebuilds them.
pub fn run_clean(args: CleanArgs) -> Result<()> {
    let (repo, out) = resolve_roots(&args.repo, &args.out)?;
    let paths = DocTreePaths::new(out);
    let _lock = RunLock::acquire(&paths)?;
    let store = NoteStore::new(paths.notes_dir());
    let notes = store.list()?;
    let live = live_root(&paths)?;
    let plan = CleanupPlan {
        workflow_artifacts: Vec::new(),
        ..cleanup::scan(live.as_deref(), &repo, &notes)?
    };
    if plan.is_empty() {
        println!("nothing to clean");
        return Ok(());
    }

    let result = match live.as_deref() {
        Some(live) if !plan.orphaned_artifacts.is_empty() => {
            let staging = StagingArea::create(&paths, now_epoch_ms()?)?;
            staging.seed_from(live)?;
            let result = cleanup::apply(&plan, staging.root(), &store);
            let version = staging.promote()?;
            if let Err(err) = prune_versions(&paths, load_config(&paths)?.keep_versions) {
                tracing::warn!(error = %err, "failed to prune old versions");
            }
            println!("promoted {version}");
            result
        }
        _ => {
            let mut result = cleanup::CleanupResult::default();
            cleanup::apply_notes(&plan, &store, &mut result);
            result
        }
    };
    println!(
        "removed {} stale pages and {} orphaned notes ({} failures)",
        result.orphaned_artifacts, result.orphaned_notes, result.failures
    );
    Ok(())
}

#[derive(Debug, Serialize)]
struct StatusSummary {
    out: String,
    version: Option<String>,
    files: usize,
    dirs: usize,
    revision: Option<String>,
    generated_at_epoch_ms: Option<u128>,
    notes: usize,
    lm_calls: usize,
    run_in_progress: bool,
    last_run: Option<RunReport>,
}

pub fn run_status(args: StatusArgs) -> Result<()> {
    let paths = DocTreePaths::new(args.out);
    let version = current_version(&paths)?;
    let live = live_root(&paths)?;
    let state = match live.as_deref() {
        Some(live) => Some(load_state(Some(live))?),
        None => None,
    };
    let summary = StatusSummary {
        out: display_path(paths.root(), None),
        version,
        files: state.as_ref().map_or(0, |state| state.files.len()),
        dirs: state.as_ref().map_or(0, |state| state.dirs.len()),
        revision: state.as_ref().and_then(|state| state.revision.clone()),
        generated_at_epoch_ms: state
            .as_ref()
            .filter(|state| !state.is_empty())
            .map(|state| state.generated_at_epoch_ms),
        notes: NoteStore::new(paths.notes_dir()).list()?.len(),
        lm_calls: load_lm_log(&paths.lm_log_path())?.len(),
        run_in_progress: paths.lock_path().is_file(),
        last_run: load_history(&paths)?.pop().map(|entry| entry.report),
    };

    if args.json {
        let text = serde_json::to_string_pretty(&summary).context("serialize status")?;
        println!("{text}");
        return Ok(());
    }
    match &summary.version {
        Some(version) => println!("version: {version}"),
        None => println!("version: none (run `repo-man generate`)"),
    }
    println!("documented: {} files, {} directories", summary.files, summary.dirs);
    if let Some(revision) = &summary.revision {
        println!("revision: {revision}");
    }
    println!("notes: {}", summary.notes);
    println!("lm calls logged: {}", summary.lm_calls);
    if summary.run_in_progress {
        println!("a run is in progress (lock held)");
    }
    if let Some(last) = &summary.last_run {
        let outcome = match &last.outcome {
            RunOutcome::Completed => "completed".to_string(),
            RunOutcome::NoChanges => "no changes".to_string(),
            RunOutcome::Cancelled => "cancelled".to_string(),
            RunOutcome::Failed { phase, message } => format!("failed in {phase}: {message}"),
        };
        println!(
            "last run: {outcome} ({} ms)",
            last.finished_at_epoch_ms
                .saturating_sub(last.started_at_epoch_ms)
        );
    }
    Ok(())
}

/// Tree-relative page path, rejecting anything that could escape the tree.
fn page_path(page: &str) -> Result<PathBuf> {
    let path = Path::new(page.trim_start_matches("./"));
    if page.is_empty()
        || !path
            .components()
            .all(|component| matches!(component, Component::Normal(_)))
    {
        return Err(anyhow!("invalid page path `{page}`"));
    }
    Ok(path.to_path_buf())
}

pub fn run_show(args: ShowArgs) -> Result<()> {
    let paths = DocTreePaths::new(args.out);
    let live = live_root(&paths)?.ok_or_else(|| anyhow!("no documentation generated yet"))?;
    let path = live.join(page_path(&args.page)?);
    let text = fs::read_to_string(&path).with_context(|| format!("read page {}", args.page))?;
    let body = display_body(&text);
    println!("{}", body.trim_end());
    Ok(())
}

pub fn run_note(args: NoteArgs) -> Result<()> {
    match args.command {
        NoteCommand::Add(args) => {
            let store = NoteStore::new(DocTreePaths::new(args.out).notes_dir());
            let note = store.add(&args.target, &args.text)?;
            println!("added note {} for {}", note.id, note.target);
        }
        NoteCommand::List(args) => {
            let notes = NoteStore::new(DocTreePaths::new(args.out).notes_dir()).list()?;
            if args.json {
                let text = serde_json::to_string_pretty(&notes).context("serialize notes")?;
                println!("{text}");
            } else if notes.is_empty() {
                println!("no notes");
            } else {
                for note in notes {
                    println!("{}  {}  {}", note.id, note.target, note.text);
                }
            }
        }
    }
    Ok(())
}
