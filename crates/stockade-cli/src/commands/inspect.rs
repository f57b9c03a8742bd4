//! `stockade inspect`: Print one container snapshot.

use clap::Args;
use stockade_common::types::ContainerId;
use stockade_runtime::state::StateStore;

use super::GlobalArgs;

/// Arguments for the `inspect` command.
#[derive(Args, Debug)]
pub struct InspectArgs {
    /// Container identifier.
    pub id: String,
}

/// Executes the `inspect` command.
///
/// # Errors
///
/// Returns an error if the container is not in the state index.
pub fn execute(args: &InspectArgs, global: &GlobalArgs) -> anyhow::Result<()> {
    let config = global.runtime_config()?;
    let id = ContainerId::new(args.id.as_str())?;
    let info = StateStore::new(config.state_file).find(&id)?;
    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(())
}
