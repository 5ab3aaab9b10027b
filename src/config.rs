//! Run configuration.
//!
//! One `RunConfig` is built at startup (defaults, then the output root's
//! `.repo-man/config.json`, then CLI overrides) and handed to every component.
use crate::paths::DocTreePaths;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Current schema version for `.repo-man/config.json`.
pub const CONFIG_SCHEMA_VERSION: u32 = 1;

/// Environment variable consulted when no LM command is configured.
pub const LM_COMMAND_ENV: &str = "REPO_MAN_LM_COMMAND";

/// Where the text-generation collaborator runs; selects the worker limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    Local,
    Remote,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConcurrencyLimits {
    pub local: usize,
    pub remote: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    pub schema_version: u32,
    pub backend: Backend,
    pub concurrency: ConcurrencyLimits,
    /// Serialized summary bytes a single synthesis call may carry.
    pub context_budget_bytes: usize,
    /// Upper bound on summaries per synthesis batch.
    pub synthesis_batch_size: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lm_command: Option<String>,
    pub lm_timeout_secs: u64,
    /// Files larger than this are not documented.
    pub max_file_bytes: u64,
    pub readme_max_bytes: usize,
    /// Promoted versions retained after a successful run.
    pub keep_versions: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            schema_version: CONFIG_SCHEMA_VERSION,
            backend: Backend::Local,
            concurrency: ConcurrencyLimits {
                local: 2,
                remote: 8,
            },
            context_budget_bytes: 48_000,
            synthesis_batch_size: 60,
            lm_command: None,
            lm_timeout_secs: 300,
            max_file_bytes: 256 * 1024,
            readme_max_bytes: 8 * 1024,
            keep_versions: 3,
        }
    }
}

impl RunConfig {
    /// Worker limit for the unit phases given the configured backend.
    pub fn worker_limit(&self) -> usize {
        match self.backend {
            Backend::Local => self.concurrency.local,
            Backend::Remote => self.concurrency.remote,
        }
    }

    pub fn lm_timeout(&self) -> Duration {
        Duration::from_secs(self.lm_timeout_secs)
    }
}

/// Load the config from the output root, or defaults when none exists.
pub fn load_config(paths: &DocTreePaths) -> Result<RunConfig> {
    let path = paths.config_path();
    if !path.is_file() {
        return Ok(RunConfig::default());
    }
    let bytes = fs::read(&path).with_context(|| format!("read config {}", path.display()))?;
    let config: RunConfig = serde_json::from_slice(&bytes).context("parse run config JSON")?;
    Ok(config)
}

/// Persist a config to disk in a stable JSON format.
pub fn write_config(paths: &DocTreePaths, config: &RunConfig) -> Result<()> {
    let path = paths.config_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("create state dir")?;
    }
    let text = serde_json::to_string_pretty(config).context("serialize run config")?;
    fs::write(&path, text.as_bytes()).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

/// Validate schema version and numeric limits.
pub fn validate_config(config: &RunConfig) -> Result<()> {
    if config.schema_version != CONFIG_SCHEMA_VERSION {
        return Err(anyhow!(
            "unsupported config schema_version {}",
            config.schema_version
        ));
    }
    if config.concurrency.local == 0 || config.concurrency.remote == 0 {
        return Err(anyhow!("concurrency limits must be at least 1"));
    }
    if config.context_budget_bytes < 1024 {
        return Err(anyhow!(
            "context_budget_bytes must be at least 1024 (got {})",
            config.context_budget_bytes
        ));
    }
    if config.synthesis_batch_size == 0 {
        return Err(anyhow!("synthesis_batch_size must be at least 1"));
    }
    if config.lm_timeout_secs == 0 {
        return Err(anyhow!("lm_timeout_secs must be at least 1"));
    }
    if config.keep_versions == 0 {
        return Err(anyhow!("keep_versions must be at least 1"));
    }
    if let Some(command) = config.lm_command.as_deref() {
        if command.trim().is_empty() {
            return Err(anyhow!("lm_command must be non-empty when set"));
        }
    }
    Ok(())
}

/// Resolve the LM command: explicit flag > config > environment.
pub fn resolve_lm_command(explicit: Option<&str>, config: &RunConfig) -> Result<String> {
    explicit
        .map(str::to_string)
        .or_else(|| config.lm_command.clone())
        .or_else(|| std::env::var(LM_COMMAND_ENV).ok())
        .map(|command| command.trim().to_string())
        .filter(|command| !command.is_empty())
        .ok_or_else(|| {
            anyhow!("no LM command configured (pass --lm, set lm_command, or set {LM_COMMAND_ENV})")
        })
}

/// Whether the repository and output roots overlap in a way that matters for scanning.
pub fn output_inside_repo(repo_root: &Path, out_root: &Path) -> bool {
    out_root.starts_with(repo_root) && out_root != repo_root
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
