//! Invocation of the host networking tools.

use std::fmt;
use std::process::Command;

use stockade_common::error::{Result, StockadeError};

/// Runs an external program and returns its standard output.
pub trait CommandRunner: Send + Sync + fmt::Debug {
    /// Runs `program` with `args`.
    ///
    /// # Errors
    ///
    /// Returns [`StockadeError::NetworkAllocation`] if the program cannot be
    /// found or started, or exits unsuccessfully.
    fn run(&self, program: &str, args: &[&str]) -> Result<String>;
}

/// Runs programs on the host, resolving them through `PATH`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<String> {
        let binary = which::which(program).map_err(|e| StockadeError::NetworkAllocation {
            message: format!("{program} not found: {e}"),
        })?;
        tracing::debug!(program, args = ?args, "running");
        let output = Command::new(&binary)
            .args(args)
            .output()
            .map_err(|e| StockadeError::NetworkAllocation {
                message: format!("cannot run {program}: {e}"),
            })?;
        if !output.status.success() {
            return Err(StockadeError::NetworkAllocation {
                message: format!(
                    "{program} {} failed ({}): {}",
                    args.join(" "),
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
