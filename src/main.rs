use anyhow::Result;
use clap::Parser;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

mod artifact;
mod change;
mod cleanup;
mod cli;
mod commands;
mod config;
mod highlevel;
mod history;
mod lm;
mod lm_log;
mod notes;
mod paths;
mod pipeline;
mod source;
mod staging;
mod state;
mod summarize;
mod summary;
mod synthesis;
mod templates;
#[cfg(test)]
mod testing;
mod util;
mod workflows;

/// Log filter variable checked before `RUST_LOG`.
const LOG_ENV: &str = "REPO_MAN_LOG";

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_env(LOG_ENV)
            .or_else(|_| EnvFilter::try_from_default_env())
            .unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = cli::RootArgs::parse();
    init_tracing(args.command.verbose());
    commands::dispatch(args.command).await
}
