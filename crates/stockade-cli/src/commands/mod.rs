//! CLI command definitions and dispatch.

pub mod inspect;
pub mod ps;
pub mod run;
pub mod validate;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use stockade_common::config::RuntimeConfig;

/// Stockade: daemon-less container lifecycle runtime.
#[derive(Parser, Debug)]
#[command(name = "stockade", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Options shared by every subcommand.
    #[command(flatten)]
    pub global: GlobalArgs,
}

/// Options shared by every subcommand.
#[derive(Args, Debug)]
pub struct GlobalArgs {
    /// Runtime configuration file (YAML).
    #[arg(long, global = true, env = "STOCKADE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Path to the state index, overriding the configuration.
    #[arg(long, global = true)]
    pub state_file: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,
}

impl GlobalArgs {
    /// Loads the runtime configuration and applies command-line overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file cannot be loaded.
    pub fn runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let mut config = match &self.config {
            Some(path) => RuntimeConfig::load(path)
                .with_context(|| format!("loading configuration {}", path.display()))?,
            None => RuntimeConfig::default(),
        };
        if let Some(state_file) = &self.state_file {
            config.state_file.clone_from(state_file);
        }
        Ok(config)
    }
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create, start, and wait for a container, then destroy it.
    Run(run::RunArgs),
    /// Check a container spec without touching the host.
    Validate(validate::ValidateArgs),
    /// List containers recorded in the state index.
    Ps(ps::PsArgs),
    /// Show the recorded snapshot of one container as JSON.
    Inspect(inspect::InspectArgs),
}

/// Dispatches the parsed CLI command to its handler.
///
/// # Errors
///
/// Returns an error if the command execution fails.
pub fn execute(cli: Cli) -> anyhow::Result<ExitCode> {
    match cli.command {
        Command::Run(args) => run::execute(args, &cli.global),
        Command::Validate(args) => validate::execute(&args, &cli.global).map(|()| ExitCode::SUCCESS),
        Command::Ps(args) => ps::execute(&args, &cli.global).map(|()| ExitCode::SUCCESS),
        Command::Inspect(args) => inspect::execute(&args, &cli.global).map(|()| ExitCode::SUCCESS),
    }
}
