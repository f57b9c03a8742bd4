//! `stockade ps`: List recorded containers.

use clap::Args;
use stockade_common::types::LifecycleState;
use stockade_runtime::state::StateStore;

use super::GlobalArgs;
use crate::output::{format_age, format_pid};

/// Arguments for the `ps` command.
#[derive(Args, Debug)]
pub struct PsArgs {
    /// Show all containers (including destroyed).
    #[arg(short, long)]
    pub all: bool,
}

/// Executes the `ps` command.
///
/// Reads the state index and displays the containers in a table.
///
/// # Errors
///
/// Returns an error if the state index cannot be loaded.
pub fn execute(args: &PsArgs, global: &GlobalArgs) -> anyhow::Result<()> {
    let config = global.runtime_config()?;
    let containers = StateStore::new(config.state_file).load()?;

    let filtered: Vec<_> = containers
        .into_iter()
        .filter(|c| args.all || c.state != LifecycleState::Destroyed)
        .collect();

    if filtered.is_empty() {
        println!("No containers found.");
        return Ok(());
    }

    let now = chrono::Utc::now();
    println!(
        "{:<24} {:<10} {:<8} {:<16} {:<10} {:<24}",
        "CONTAINER ID", "STATE", "PID", "ADDRESS", "CREATED", "STATUS"
    );
    for c in &filtered {
        println!(
            "{:<24} {:<10} {:<8} {:<16} {:<10} {:<24}",
            c.id,
            c.state,
            format_pid(c.pid),
            c.network.as_ref().map_or("-", |n| n.address.as_str()),
            format_age(now - c.created_at),
            c.exit_status.map_or_else(|| "-".to_string(), |s| s.to_string()),
        );
    }

    Ok(())
}
