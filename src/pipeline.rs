//! Cascade controller.
//!
//! One run moves through a fixed sequence of states:
//!
//! ```text
//! Idle → Analyzing → SummarizingFiles → SummarizingDirectories → Synthesizing
//!      → GeneratingHighLevel → GeneratingWorkflows → Promoting
//!      → Completed | Failed | Cancelled
//! ```
//!
//! Every phase writes into a staging copy of the live tree. The live tree is
//! only replaced by the final pointer swap, so a failed or cancelled run leaves
//! it exactly as it was. When nothing changed the run stops after analysis
//! without creating staging at all.
use crate::artifact::read_provenance;
use crate::change::{detect_changes, ChangeSet};
use crate::cleanup::{self, CleanupPlan, CleanupResult};
use crate::config::RunConfig;
use crate::highlevel::{generate_architecture, generate_overview};
use crate::history::append_history;
use crate::lm::TextGenerator;
use crate::notes::{self, CorrectionNote, NoteStore};
use crate::paths::{
    dir_artifact_rel, file_artifact_rel, DocTreePaths, ARCHITECTURE_REL, OVERVIEW_REL,
    WORKFLOWS_DIR,
};
use crate::source::{current_revision, SourceTree};
use crate::staging::{
    live_root, prune_versions, remove_file_and_empty_parents, sweep_stale_staging, RunLock,
    StagingArea,
};
use crate::state::{load_state, write_state, DirState, FileState, GenerationState};
use crate::summarize::{summarize_directory, summarize_file, RunStamp};
use crate::summary::{DirectorySummary, FileSummary, UnitSummary};
use crate::synthesis::{self, SynthesisLimits, SynthesisModel};
use crate::util::now_epoch_ms;
use crate::workflows::{generate_workflow, page_paths};
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Unit of work reported in run history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Cleanup,
    Analysis,
    Files,
    Directories,
    Synthesis,
    Architecture,
    Overview,
    Workflows,
    Promotion,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Cleanup => "cleanup",
            Self::Analysis => "analysis",
            Self::Files => "files",
            Self::Directories => "directories",
            Self::Synthesis => "synthesis",
            Self::Architecture => "architecture",
            Self::Overview => "overview",
            Self::Workflows => "workflows",
            Self::Promotion => "promotion",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Analyzing,
    SummarizingFiles,
    SummarizingDirectories,
    Synthesizing,
    GeneratingHighLevel,
    GeneratingWorkflows,
    Promoting,
    Completed,
    Failed,
    Cancelled,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    NoChanges,
    Failed { phase: Phase, message: String },
    Cancelled,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    pub files_regenerated: usize,
    pub files_reused: usize,
    pub files_removed: usize,
    pub dirs_regenerated: usize,
    pub dirs_reused: usize,
    pub dirs_removed: usize,
    pub workflows_generated: usize,
    pub artifacts_cleaned: usize,
    pub notes_removed: usize,
    pub high_level_regenerated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub outcome: RunOutcome,
    /// Phases that actually executed, in order.
    pub phases: Vec<Phase>,
    pub counts: RunCounts,
    /// Version promoted by this run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    pub started_at_epoch_ms: u128,
    pub finished_at_epoch_ms: u128,
}

/// What the run will regenerate, decided at a phase boundary.
///
/// The value is never mutated; later boundaries derive a new one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CascadeDecision {
    pub regenerate_files: BTreeSet<String>,
    pub regenerate_dirs: BTreeSet<String>,
    pub removed_files: BTreeSet<String>,
    pub removed_dirs: BTreeSet<String>,
    pub run_synthesis: bool,
    pub run_high_level: bool,
    /// Stale pages in the live tree that staging must drop.
    pub cleanup_required: bool,
}

impl CascadeDecision {
    pub fn is_noop(&self) -> bool {
        self.regenerate_files.is_empty()
            && self.regenerate_dirs.is_empty()
            && self.removed_files.is_empty()
            && self.removed_dirs.is_empty()
            && !self.run_synthesis
            && !self.run_high_level
            && !self.cleanup_required
    }

    fn with_high_level(&self, run_high_level: bool) -> Self {
        Self {
            run_high_level,
            ..self.clone()
        }
    }
}

/// Facts gathered during analysis that feed the cascade rules.
#[derive(Debug, Clone, Copy)]
pub struct DecisionInputs<'a> {
    pub changes: &'a ChangeSet,
    pub pending_notes: &'a BTreeSet<String>,
    /// Unchanged files whose live summary could not be recovered.
    pub unreadable_files: &'a BTreeSet<String>,
    pub unreadable_dirs: &'a BTreeSet<String>,
    pub model_present: bool,
    pub high_level_present: bool,
    pub orphans_present: bool,
}

/// Apply the cascade rules for the unit phases and synthesis.
pub fn decide(inputs: &DecisionInputs<'_>) -> CascadeDecision {
    let changes = inputs.changes;
    let regenerate_files = changes
        .changed_files
        .iter()
        .chain(inputs.unreadable_files)
        .chain(
            inputs
                .pending_notes
                .iter()
                .filter(|target| changes.unchanged_files.contains(*target)),
        )
        .cloned()
        .collect::<BTreeSet<_>>();
    let regenerate_dirs = changes
        .changed_dirs
        .iter()
        .chain(inputs.unreadable_dirs)
        .chain(
            inputs
                .pending_notes
                .iter()
                .filter(|target| changes.unchanged_dirs.contains(*target)),
        )
        .cloned()
        .collect::<BTreeSet<_>>();
    let run_synthesis = !regenerate_files.is_empty()
        || !regenerate_dirs.is_empty()
        || !changes.removed_files.is_empty()
        || !changes.removed_dirs.is_empty()
        || !inputs.model_present;
    CascadeDecision {
        regenerate_files,
        regenerate_dirs,
        removed_files: changes.removed_files.clone(),
        removed_dirs: changes.removed_dirs.clone(),
        run_synthesis,
        run_high_level: !inputs.high_level_present,
        cleanup_required: inputs.orphans_present,
    }
}

/// Why a run stopped early.
#[derive(Debug)]
enum Interrupt {
    Cancelled,
    Failed { phase: Phase, error: anyhow::Error },
}

trait InPhase<T> {
    fn in_phase(self, phase: Phase) -> Result<T, Interrupt>;
}

impl<T> InPhase<T> for Result<T> {
    fn in_phase(self, phase: Phase) -> Result<T, Interrupt> {
        self.map_err(|error| Interrupt::Failed { phase, error })
    }
}

/// Mutable bookkeeping for one run.
struct RunContext {
    state: PipelineState,
    phases: Vec<Phase>,
    counts: RunCounts,
    version: Option<String>,
    revision: Option<String>,
}

impl RunContext {
    fn transition(&mut self, next: PipelineState) {
        tracing::info!(from = %self.state, to = %next, "pipeline state");
        self.state = next;
    }

    fn enter(&mut self, phase: Phase) -> Instant {
        self.phases.push(phase);
        tracing::debug!(phase = %phase, "phase start");
        Instant::now()
    }
}

/// Everything analysis learned, handed to the generation phases.
struct Analysis {
    prior: GenerationState,
    source: SourceTree,
    notes: Vec<CorrectionNote>,
    plan: CleanupPlan,
    decision: CascadeDecision,
    reused_files: BTreeMap<String, FileSummary>,
    reused_dirs: BTreeMap<String, DirectorySummary>,
    prior_model: Option<SynthesisModel>,
}

pub struct Pipeline {
    repo_root: PathBuf,
    paths: DocTreePaths,
    config: RunConfig,
    generator: Arc<dyn TextGenerator>,
    cancel: CancellationToken,
}

impl Pipeline {
    pub fn new(
        repo_root: PathBuf,
        out_root: PathBuf,
        config: RunConfig,
        generator: Arc<dyn TextGenerator>,
    ) -> Self {
        Self {
            repo_root,
            paths: DocTreePaths::new(out_root),
            config,
            generator,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run the pipeline once.
    ///
    /// `Err` means the run could not start (for example another run holds the
    /// lock). Phase failures and cancellation are reported in the outcome.
    pub async fn run(&self) -> Result<RunReport> {
        let _lock = RunLock::acquire(&self.paths)?;
        sweep_stale_staging(&self.paths);
        let started_at_epoch_ms = now_epoch_ms()?;
        let mut ctx = RunContext {
            state: PipelineState::Idle,
            phases: Vec::new(),
            counts: RunCounts::default(),
            version: None,
            revision: None,
        };

        let outcome = match self.execute(&mut ctx, started_at_epoch_ms).await {
            Ok(outcome) => {
                ctx.transition(PipelineState::Completed);
                outcome
            }
            Err(Interrupt::Cancelled) => {
                ctx.transition(PipelineState::Cancelled);
                tracing::warn!("run cancelled; live tree untouched");
                RunOutcome::Cancelled
            }
            Err(Interrupt::Failed { phase, error }) => {
                ctx.transition(PipelineState::Failed);
                let message = format!("{error:#}");
                tracing::error!(phase = %phase, error = %message, "run failed; live tree untouched");
                RunOutcome::Failed { phase, message }
            }
        };

        let report = RunReport {
            outcome,
            phases: ctx.phases,
            counts: ctx.counts,
            version: ctx.version,
            revision: ctx.revision,
            started_at_epoch_ms,
            finished_at_epoch_ms: now_epoch_ms()?,
        };
        if let Err(err) = append_history(&self.paths, &report) {
            tracing::warn!(error = %err, "failed to append run history");
        }
        Ok(report)
    }

    async fn execute(
        &self,
        ctx: &mut RunContext,
        started_at_epoch_ms: u128,
    ) -> Result<RunOutcome, Interrupt> {
        let live = live_root(&self.paths).in_phase(Phase::Cleanup)?;
        let store = NoteStore::new(self.paths.notes_dir());

        ctx.enter(Phase::Cleanup);
        let notes = store.list().in_phase(Phase::Cleanup)?;
        let plan = cleanup::scan(live.as_deref(), &self.repo_root, &notes).in_phase(Phase::Cleanup)?;
        let mut cleaned = CleanupResult::default();
        cleanup::apply_notes(&plan, &store, &mut cleaned);
        ctx.counts.notes_removed = cleaned.orphaned_notes;
        self.checkpoint()?;

        ctx.transition(PipelineState::Analyzing);
        let started = ctx.enter(Phase::Analysis);
        let analysis = self.analyze(live.as_deref(), plan).await?;
        tracing::info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            files = analysis.decision.regenerate_files.len(),
            dirs = analysis.decision.regenerate_dirs.len(),
            removed_files = analysis.decision.removed_files.len(),
            removed_dirs = analysis.decision.removed_dirs.len(),
            synthesis = analysis.decision.run_synthesis,
            "cascade decision"
        );
        if live.is_some() && analysis.decision.is_noop() {
            tracing::info!("no changes; live tree left untouched");
            ctx.counts.files_reused = analysis.source.files.len();
            ctx.counts.dirs_reused = analysis.source.dirs.len();
            return Ok(RunOutcome::NoChanges);
        }
        self.checkpoint()?;

        let revision = current_revision(&analysis.source.root);
        ctx.revision = revision.clone();
        let stamp = RunStamp {
            generated_at_epoch_ms: started_at_epoch_ms,
            revision,
        };

        let staging = StagingArea::create(&self.paths, started_at_epoch_ms).in_phase(Phase::Analysis)?;
        if let Some(live) = live.as_deref() {
            staging.seed_from(live).in_phase(Phase::Analysis)?;
        }
        let staging_root = staging.root().to_path_buf();
        tracing::debug!(txn = staging.txn_id(), "staging seeded");
        cleanup::apply_artifacts(&analysis.plan, &staging_root, &mut cleaned);
        ctx.counts.artifacts_cleaned = cleaned.orphaned_artifacts;
        self.remove_units(ctx, &analysis.decision, &staging_root);

        ctx.transition(PipelineState::SummarizingFiles);
        let file_summaries = self
            .run_files_phase(ctx, &analysis, &stamp, &staging_root)
            .await?;
        self.checkpoint()?;

        ctx.transition(PipelineState::SummarizingDirectories);
        let dir_summaries = self
            .run_dirs_phase(ctx, &analysis, &file_summaries, &stamp, &staging_root)
            .await?;
        self.checkpoint()?;

        ctx.transition(PipelineState::Synthesizing);
        let model = match (&analysis.prior_model, analysis.decision.run_synthesis) {
            (Some(model), false) => model.clone(),
            _ => {
                let started = ctx.enter(Phase::Synthesis);
                let files = file_summaries.values().cloned().collect::<Vec<_>>();
                let dirs = dir_summaries.values().cloned().collect::<Vec<_>>();
                let limits = SynthesisLimits {
                    context_budget_bytes: self.config.context_budget_bytes,
                    batch_size: self.config.synthesis_batch_size,
                };
                let model = self
                    .cancellable(synthesis::synthesize(
                        self.generator.as_ref(),
                        &files,
                        &dirs,
                        limits,
                    ))
                    .await?
                    .in_phase(Phase::Synthesis)?;
                synthesis::save_model(&staging_root, &model).in_phase(Phase::Synthesis)?;
                tracing::info!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    components = model.components.len(),
                    "synthesis complete"
                );
                model
            }
        };
        let fingerprint = model.fingerprint().in_phase(Phase::Synthesis)?;
        let fingerprint_changed = analysis.prior.synthesis_fingerprint.as_deref() != Some(&fingerprint);
        let pages_missing = !staging_root.join(ARCHITECTURE_REL).is_file()
            || !staging_root.join(OVERVIEW_REL).is_file();
        let decision = analysis
            .decision
            .with_high_level(fingerprint_changed || pages_missing);
        self.checkpoint()?;

        ctx.transition(PipelineState::GeneratingHighLevel);
        if decision.run_high_level {
            ctx.enter(Phase::Architecture);
            ctx.enter(Phase::Overview);
            let readme = analysis.source.readme.as_deref();
            let (architecture, overview) = self
                .cancellable(async {
                    tokio::try_join!(
                        async {
                            generate_architecture(self.generator.as_ref(), &model, readme, &stamp)
                                .await
                                .map_err(|error| Interrupt::Failed {
                                    phase: Phase::Architecture,
                                    error,
                                })
                        },
                        async {
                            generate_overview(self.generator.as_ref(), &model, readme, &stamp)
                                .await
                                .map_err(|error| Interrupt::Failed {
                                    phase: Phase::Overview,
                                    error,
                                })
                        }
                    )
                })
                .await??;
            architecture.write_to(&staging_root).in_phase(Phase::Architecture)?;
            overview.write_to(&staging_root).in_phase(Phase::Overview)?;
            ctx.counts.high_level_regenerated = true;
        } else {
            tracing::info!("synthesis fingerprint unchanged; keeping architecture and overview");
        }
        self.checkpoint()?;

        ctx.transition(PipelineState::GeneratingWorkflows);
        self.run_workflows_phase(ctx, &analysis.source, &model, &stamp, &staging_root)
            .await?;
        self.checkpoint()?;

        let state = build_state(&analysis, &decision, &fingerprint, &stamp);
        write_state(&staging_root, &state).in_phase(Phase::Promotion)?;

        ctx.transition(PipelineState::Promoting);
        ctx.enter(Phase::Promotion);
        let version = staging.promote().in_phase(Phase::Promotion)?;
        tracing::info!(version = %version, "promoted new documentation tree");
        ctx.version = Some(version);
        if let Err(err) = prune_versions(&self.paths, self.config.keep_versions) {
            tracing::warn!(error = %err, "failed to prune old versions");
        }
        Ok(RunOutcome::Completed)
    }

    fn checkpoint(&self) -> Result<(), Interrupt> {
        if self.cancel.is_cancelled() {
            return Err(Interrupt::Cancelled);
        }
        Ok(())
    }

    /// Race a future against cancellation; in-flight work is dropped.
    async fn cancellable<T>(&self, work: impl Future<Output = T>) -> Result<T, Interrupt> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Interrupt::Cancelled),
            value = work => Ok(value),
        }
    }

    async fn analyze(&self, live: Option<&Path>, plan: CleanupPlan) -> Result<Analysis, Interrupt> {
        let prior = load_state(live).in_phase(Phase::Analysis)?;
        let repo = self.repo_root.clone();
        let out = self.paths.root().to_path_buf();
        let config = self.config.clone();
        let source = tokio::task::spawn_blocking(move || SourceTree::scan(&repo, Some(&out), &config))
            .await
            .map_err(|err| anyhow!("source scan task: {err}"))
            .and_then(|result| result)
            .in_phase(Phase::Analysis)?;

        let changes = detect_changes(&prior, &source.file_fingerprints(), &source.dir_snapshots());
        if !changes.has_unit_changes() {
            tracing::debug!("no file or directory changes detected");
        }
        let notes = NoteStore::new(self.paths.notes_dir())
            .list()
            .in_phase(Phase::Analysis)?;
        let pending = notes::pending(&notes, &prior, |unit| {
            source.files.contains_key(unit) || source.dirs.contains_key(unit)
        });

        let mut reused_files = BTreeMap::new();
        let mut unreadable_files = BTreeSet::new();
        for path in &changes.unchanged_files {
            match live.and_then(|live| stored_summary(live, &file_artifact_rel(path))) {
                Some(UnitSummary::File(summary)) => {
                    reused_files.insert(path.clone(), summary);
                }
                _ => {
                    unreadable_files.insert(path.clone());
                }
            }
        }
        let mut reused_dirs = BTreeMap::new();
        let mut unreadable_dirs = BTreeSet::new();
        for path in &changes.unchanged_dirs {
            match live.and_then(|live| stored_summary(live, &dir_artifact_rel(path))) {
                Some(UnitSummary::Directory(summary)) => {
                    reused_dirs.insert(path.clone(), summary);
                }
                _ => {
                    unreadable_dirs.insert(path.clone());
                }
            }
        }
        if !unreadable_files.is_empty() || !unreadable_dirs.is_empty() {
            tracing::info!(
                files = unreadable_files.len(),
                dirs = unreadable_dirs.len(),
                "prior summaries unavailable; regenerating"
            );
        }

        let prior_model = match live {
            Some(live) => synthesis::load_model(live).in_phase(Phase::Analysis)?,
            None => None,
        };
        let high_level_present = live.is_some_and(|live| {
            live.join(ARCHITECTURE_REL).is_file() && live.join(OVERVIEW_REL).is_file()
        });
        let decision = decide(&DecisionInputs {
            changes: &changes,
            pending_notes: &pending,
            unreadable_files: &unreadable_files,
            unreadable_dirs: &unreadable_dirs,
            model_present: prior_model.is_some(),
            high_level_present,
            orphans_present: !plan.orphaned_artifacts.is_empty(),
        });
        Ok(Analysis {
            prior,
            source,
            notes,
            plan,
            decision,
            reused_files,
            reused_dirs,
            prior_model,
        })
    }

    fn remove_units(&self, ctx: &mut RunContext, decision: &CascadeDecision, staging_root: &Path) {
        let targets = decision
            .removed_files
            .iter()
            .map(|path| file_artifact_rel(path))
            .chain(decision.removed_dirs.iter().map(|path| dir_artifact_rel(path)));
        for rel in targets {
            match remove_file_and_empty_parents(&staging_root.join(&rel), staging_root) {
                Ok(()) => tracing::debug!(path = %rel, "removed artifact of deleted unit"),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => tracing::warn!(path = %rel, error = %err, "failed to remove artifact"),
            }
        }
        ctx.counts.files_removed = decision.removed_files.len();
        ctx.counts.dirs_removed = decision.removed_dirs.len();
    }

    async fn run_files_phase(
        &self,
        ctx: &mut RunContext,
        analysis: &Analysis,
        stamp: &RunStamp,
        staging_root: &Path,
    ) -> Result<BTreeMap<String, FileSummary>, Interrupt> {
        let mut summaries = analysis.reused_files.clone();
        ctx.counts.files_reused = summaries.len();
        let regenerate = &analysis.decision.regenerate_files;
        if regenerate.is_empty() {
            return Ok(summaries);
        }
        let started = ctx.enter(Phase::Files);
        let pool = WorkerPool::new(self.config.worker_limit(), self.cancel.clone());
        let mut set = JoinSet::new();
        for path in regenerate {
            let Some(file) = analysis.source.files.get(path).cloned() else {
                continue;
            };
            let generator = Arc::clone(&self.generator);
            let notes = owned_notes(&analysis.notes, path);
            let stamp = stamp.clone();
            pool.spawn(&mut set, async move {
                let notes = notes.iter().map(String::as_str).collect::<Vec<_>>();
                summarize_file(generator.as_ref(), &file, &notes, &stamp)
                    .await
                    .with_context(|| format!("summarize {}", file.rel_path))
            });
        }
        for (artifact, summary) in pool.drain(set, Phase::Files).await? {
            artifact.write_to(staging_root).in_phase(Phase::Files)?;
            tracing::debug!(path = summary.path(), layer = %summary.layer(), "summarized");
            if let UnitSummary::File(summary) = summary {
                summaries.insert(summary.path.clone(), summary);
            }
            ctx.counts.files_regenerated += 1;
        }
        tracing::info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            regenerated = ctx.counts.files_regenerated,
            reused = ctx.counts.files_reused,
            "file summaries complete"
        );
        Ok(summaries)
    }

    async fn run_dirs_phase(
        &self,
        ctx: &mut RunContext,
        analysis: &Analysis,
        file_summaries: &BTreeMap<String, FileSummary>,
        stamp: &RunStamp,
        staging_root: &Path,
    ) -> Result<BTreeMap<String, DirectorySummary>, Interrupt> {
        let mut summaries = analysis.reused_dirs.clone();
        ctx.counts.dirs_reused = summaries.len();
        let regenerate = &analysis.decision.regenerate_dirs;
        if regenerate.is_empty() {
            return Ok(summaries);
        }
        let started = ctx.enter(Phase::Directories);
        let pool = WorkerPool::new(self.config.worker_limit(), self.cancel.clone());
        let mut set = JoinSet::new();
        for path in regenerate {
            let Some(dir) = analysis.source.dirs.get(path).cloned() else {
                continue;
            };
            let members = dir
                .members
                .iter()
                .filter_map(|member| file_summaries.get(member).cloned())
                .collect::<Vec<_>>();
            let generator = Arc::clone(&self.generator);
            let notes = owned_notes(&analysis.notes, path);
            let stamp = stamp.clone();
            pool.spawn(&mut set, async move {
                let notes = notes.iter().map(String::as_str).collect::<Vec<_>>();
                summarize_directory(generator.as_ref(), &dir, &members, &notes, &stamp)
                    .await
                    .with_context(|| format!("summarize directory {}", dir.rel_path))
            });
        }
        for (artifact, summary) in pool.drain(set, Phase::Directories).await? {
            artifact.write_to(staging_root).in_phase(Phase::Directories)?;
            tracing::debug!(path = summary.path(), layer = %summary.layer(), "summarized");
            if let UnitSummary::Directory(summary) = summary {
                summaries.insert(summary.path.clone(), summary);
            }
            ctx.counts.dirs_regenerated += 1;
        }
        tracing::info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            regenerated = ctx.counts.dirs_regenerated,
            reused = ctx.counts.dirs_reused,
            "directory summaries complete"
        );
        Ok(summaries)
    }

    async fn run_workflows_phase(
        &self,
        ctx: &mut RunContext,
        source: &SourceTree,
        model: &SynthesisModel,
        stamp: &RunStamp,
        staging_root: &Path,
    ) -> Result<(), Interrupt> {
        let started = ctx.enter(Phase::Workflows);
        let workflows_dir = staging_root.join(WORKFLOWS_DIR);
        if workflows_dir.exists() {
            std::fs::remove_dir_all(&workflows_dir)
                .with_context(|| format!("clear {}", workflows_dir.display()))
                .in_phase(Phase::Workflows)?;
        }
        for (entry, page) in page_paths(&source.entry_points) {
            let Some(file) = source.files.get(&entry) else {
                continue;
            };
            let work = generate_workflow(self.generator.as_ref(), file, page, model, stamp);
            let artifact = self
                .cancellable(work)
                .await?
                .in_phase(Phase::Workflows)?;
            artifact.write_to(staging_root).in_phase(Phase::Workflows)?;
            ctx.counts.workflows_generated += 1;
        }
        tracing::info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            workflows = ctx.counts.workflows_generated,
            "workflows complete"
        );
        Ok(())
    }
}

fn owned_notes(notes: &[CorrectionNote], target: &str) -> Vec<String> {
    notes::texts_for(notes, target)
        .into_iter()
        .map(str::to_string)
        .collect()
}

/// Summary embedded in a stored page, if the page exists and parses.
fn stored_summary(tree_root: &Path, rel: &str) -> Option<UnitSummary> {
    let path = tree_root.join(rel);
    if !path.is_file() {
        return None;
    }
    match read_provenance(&path) {
        Ok(provenance) => provenance.and_then(|provenance| provenance.summary),
        Err(err) => {
            tracing::debug!(path = %rel, error = %err, "unreadable stored page");
            None
        }
    }
}

fn build_state(
    analysis: &Analysis,
    decision: &CascadeDecision,
    synthesis_fingerprint: &str,
    stamp: &RunStamp,
) -> GenerationState {
    let files = analysis
        .source
        .files
        .iter()
        .map(|(path, file)| {
            let prior = analysis.prior.files.get(path);
            let entry = match prior {
                Some(prior) if !decision.regenerate_files.contains(path) => prior.clone(),
                _ => FileState {
                    fingerprint: file.fingerprint.clone(),
                    generated_at_epoch_ms: stamp.generated_at_epoch_ms,
                },
            };
            (path.clone(), entry)
        })
        .collect();
    let dirs = analysis
        .source
        .dirs
        .iter()
        .map(|(path, dir)| {
            let generated_at_epoch_ms = match analysis.prior.dirs.get(path) {
                Some(prior) if !decision.regenerate_dirs.contains(path) => {
                    prior.generated_at_epoch_ms
                }
                _ => stamp.generated_at_epoch_ms,
            };
            let entry = DirState {
                fingerprint: dir.fingerprint.clone(),
                members: dir.members.clone(),
                generated_at_epoch_ms,
            };
            (path.clone(), entry)
        })
        .collect();
    GenerationState {
        files,
        dirs,
        synthesis_fingerprint: Some(synthesis_fingerprint.to_string()),
        revision: stamp.revision.clone(),
        generated_at_epoch_ms: stamp.generated_at_epoch_ms,
        ..GenerationState::default()
    }
}

/// Bounded pool for the per-unit phases.
struct WorkerPool {
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
}

type PoolResult<T> = Option<Result<T>>;

impl WorkerPool {
    fn new(limit: usize, cancel: CancellationToken) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(limit.max(1))),
            cancel,
        }
    }

    fn spawn<T, F>(&self, set: &mut JoinSet<PoolResult<T>>, work: F)
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        let cancel = self.cancel.clone();
        set.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => None,
                result = async move {
                    let _permit = permits
                        .acquire_owned()
                        .await
                        .context("worker pool closed")?;
                    work.await
                } => Some(result),
            }
        });
    }

    /// Collect every result; the first failure or a cancellation aborts the rest.
    async fn drain<T: 'static>(
        &self,
        mut set: JoinSet<PoolResult<T>>,
        phase: Phase,
    ) -> Result<Vec<T>, Interrupt> {
        let mut results = Vec::with_capacity(set.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Some(Ok(value))) => results.push(value),
                Ok(Some(Err(error))) => {
                    set.abort_all();
                    return Err(Interrupt::Failed { phase, error });
                }
                Ok(None) => {
                    set.abort_all();
                    return Err(Interrupt::Cancelled);
                }
                Err(err) => {
                    set.abort_all();
                    return Err(Interrupt::Failed {
                        phase,
                        error: anyhow!("worker task failed: {err}"),
                    });
                }
            }
        }
        if self.cancel.is_cancelled() {
            return Err(Interrupt::Cancelled);
        }
        Ok(results)
    }
}

#[cfg(test)]
#[path = "pipeline_tests.rs"]
mod tests;
