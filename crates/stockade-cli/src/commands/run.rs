//! `stockade run`: Run one container to completion.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Args;
use stockade_common::spec::ContainerSpec;
use stockade_common::error::Result as StockadeResult;
use stockade_common::types::{ExitStatus, LifecycleState};
use stockade_runtime::backend::linux::LinuxBackend;
use stockade_runtime::cancel::CancelToken;
use stockade_runtime::engine::Orchestrator;
use stockade_runtime::process::parse_signal;
use stockade_runtime::state::StateStore;

use super::GlobalArgs;
use crate::output::format_bytes;

/// Arguments for the `run` command.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path to the container spec (YAML or JSON).
    pub spec: PathBuf,

    /// Signal sent to the container on Ctrl+C.
    #[arg(long, default_value = "TERM")]
    pub stop_signal: String,
}

const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";
const GREEN: &str = "\x1b[32m";
const RED: &str = "\x1b[31m";
const RESET: &str = "\x1b[0m";

/// Shell status reported when Ctrl+C ends the run.
const INTERRUPTED: u8 = 130;

/// What Ctrl+C does, given the container's state at that moment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InterruptAction {
    /// Creation is in flight or the process has not started yet.
    Cancel,
    /// The entry process is running.
    Stop,
    /// The container already exited or is being torn down.
    Ignore,
}

fn on_interrupt(state: StockadeResult<LifecycleState>) -> InterruptAction {
    match state {
        Err(_) | Ok(LifecycleState::Created) => InterruptAction::Cancel,
        Ok(LifecycleState::Running) => InterruptAction::Stop,
        Ok(_) => InterruptAction::Ignore,
    }
}

/// Executes the `run` command.
///
/// Ctrl+C during creation cancels it and rolls back. Once the container
/// runs, Ctrl+C stops it with `--stop-signal`, escalating to `SIGKILL`
/// after the configured grace period. Resources are always released.
///
/// # Errors
///
/// Returns an error if the spec is invalid or any lifecycle step fails.
pub fn execute(args: RunArgs, global: &GlobalArgs) -> anyhow::Result<ExitCode> {
    let started = Instant::now();
    let config = global.runtime_config()?;
    let spec = ContainerSpec::load(&args.spec)
        .with_context(|| format!("loading container spec {}", args.spec.display()))?;
    let signal = parse_signal(&args.stop_signal)?;
    let id = spec.id.clone();
    let token = config
        .create_timeout_secs
        .map_or_else(CancelToken::new, |secs| CancelToken::with_timeout(Duration::from_secs(secs)));
    let interrupted = Arc::new(AtomicBool::new(false));

    let store = StateStore::new(config.state_file.clone());
    let backend = LinuxBackend::new(&config);
    let orch = Arc::new(Orchestrator::new(backend, config)?.with_state_store(store));

    {
        let orch = Arc::clone(&orch);
        let id = id.clone();
        let token = token.clone();
        let interrupted = Arc::clone(&interrupted);
        ctrlc::set_handler(move || {
            interrupted.store(true, Ordering::SeqCst);
            match on_interrupt(orch.state(&id)) {
                InterruptAction::Cancel => {
                    tracing::info!(%id, "interrupt received, cancelling");
                    token.cancel();
                }
                InterruptAction::Stop => {
                    tracing::info!(%id, %signal, "interrupt received, stopping container");
                    if let Err(e) = orch.stop(&id, signal) {
                        tracing::warn!(%id, error = %e, "stop failed");
                    }
                }
                InterruptAction::Ignore => {}
            }
        })
        .context("failed to set Ctrl+C handler")?;
    }

    let info = match orch.create_with_cancel(spec, &token) {
        Ok(info) => info,
        Err(e) if interrupted.load(Ordering::SeqCst) => {
            tracing::debug!(%id, error = %e, "creation interrupted");
            eprintln!("  {RED}●{RESET} {BOLD}{id}{RESET} interrupted during creation");
            return Ok(ExitCode::from(INTERRUPTED));
        }
        Err(e) => return Err(e.into()),
    };
    eprintln!("  {BOLD}{id}{RESET} created {DIM}[{} layer(s)]{RESET}", info.layers.len());
    if interrupted.load(Ordering::SeqCst) {
        orch.destroy(&id)?;
        eprintln!("  {RED}●{RESET} {BOLD}{id}{RESET} interrupted before start");
        return Ok(ExitCode::from(INTERRUPTED));
    }

    let info = orch.start(&id)?;
    eprintln!(
        "  {GREEN}●{RESET} {BOLD}{id}{RESET} running {DIM}[pid {}, {:.1}s]{RESET}",
        info.pid.unwrap_or_default(),
        started.elapsed().as_secs_f64()
    );
    // An interrupt that landed while start was running saw `Created`.
    if interrupted.load(Ordering::SeqCst) {
        if let Err(e) = orch.stop(&id, signal) {
            tracing::debug!(%id, error = %e, "container already stopped");
        }
    }

    let status = orch.wait(&id)?;
    let peak = orch.usage(&id).map(|u| u.memory_peak_bytes).ok();
    orch.destroy(&id)?;

    let color = if status.success() { GREEN } else { RED };
    eprintln!("  {color}●{RESET} {BOLD}{id}{RESET} {status}");
    if let Some(peak) = peak {
        eprintln!("  {DIM}peak memory: {}{RESET}", format_bytes(peak));
    }
    Ok(exit_code(status))
}

fn exit_code(status: ExitStatus) -> ExitCode {
    ExitCode::from(shell_status(status))
}

/// Maps a container exit status to a shell-style status byte.
fn shell_status(status: ExitStatus) -> u8 {
    let code = match status {
        ExitStatus::Exited(code) => code,
        ExitStatus::Signaled(signal) => 128 + signal,
    };
    u8::try_from(code & 0xff).unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_byte_follows_shell_convention() {
        assert_eq!(shell_status(ExitStatus::Exited(0)), 0);
        assert_eq!(shell_status(ExitStatus::Exited(3)), 3);
        assert_eq!(shell_status(ExitStatus::Exited(256)), 0);
        assert_eq!(shell_status(ExitStatus::Signaled(9)), 137);
    }

    #[test]
    fn interrupt_cancels_until_the_container_runs() {
        use stockade_common::error::StockadeError;

        let not_yet_registered = Err(StockadeError::NotFound {
            kind: "container",
            id: "web".into(),
        });
        assert_eq!(on_interrupt(not_yet_registered), InterruptAction::Cancel);
        assert_eq!(on_interrupt(Ok(LifecycleState::Created)), InterruptAction::Cancel);
        assert_eq!(on_interrupt(Ok(LifecycleState::Running)), InterruptAction::Stop);
        assert_eq!(on_interrupt(Ok(LifecycleState::Stopped)), InterruptAction::Ignore);
        assert_eq!(on_interrupt(Ok(LifecycleState::Destroyed)), InterruptAction::Ignore);
    }
}
