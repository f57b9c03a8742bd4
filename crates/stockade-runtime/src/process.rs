//! Supervision of container entry processes: waiting and signalling.

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{Id, WaitPidFlag, WaitStatus, waitid, waitpid};
use nix::unistd::Pid;
use stockade_common::error::{Result, StockadeError};
use stockade_common::types::ExitStatus;

fn to_pid(pid: u32) -> Result<Pid> {
    i32::try_from(pid)
        .map(Pid::from_raw)
        .map_err(|_| StockadeError::NotFound {
            kind: "process",
            id: pid.to_string(),
        })
}

/// Blocks until the child `pid` terminates, leaving it unreaped.
///
/// The PID stays reserved as a zombie until [`reap`] is called, so it cannot
/// be reused while the exit is being recorded.
///
/// # Errors
///
/// Returns [`StockadeError::ProcessLaunch`] if `waitid(2)` fails, e.g.
/// because `pid` is not a child of this process.
pub fn wait_for_exit(pid: u32) -> Result<ExitStatus> {
    let target = to_pid(pid)?;
    loop {
        match waitid(Id::Pid(target), WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT) {
            Ok(WaitStatus::Exited(_, code)) => return Ok(ExitStatus::Exited(code)),
            Ok(WaitStatus::Signaled(_, signal, _)) => return Ok(ExitStatus::Signaled(signal as i32)),
            Ok(_) | Err(Errno::EINTR) => {}
            Err(e) => {
                return Err(StockadeError::ProcessLaunch {
                    message: format!("waitid({pid}) failed: {e}"),
                });
            }
        }
    }
}

/// Collects an exited child and frees its PID.
///
/// # Errors
///
/// Returns [`StockadeError::ProcessLaunch`] if `waitpid(2)` fails.
pub fn reap(pid: u32) -> Result<()> {
    let target = to_pid(pid)?;
    loop {
        match waitpid(target, None) {
            Ok(WaitStatus::Exited(..) | WaitStatus::Signaled(..)) | Err(Errno::ECHILD) => return Ok(()),
            Ok(_) | Err(Errno::EINTR) => {}
            Err(e) => {
                return Err(StockadeError::ProcessLaunch {
                    message: format!("waitpid({pid}) failed: {e}"),
                });
            }
        }
    }
}

/// Sends `signal` to `pid`, treating an already exited process as success.
///
/// # Errors
///
/// Returns [`StockadeError::ProcessLaunch`] if the signal cannot be sent.
pub fn send_signal(pid: u32, signal: Signal) -> Result<()> {
    match kill(to_pid(pid)?, signal) {
        Ok(()) | Err(Errno::ESRCH) => {
            tracing::debug!(pid, %signal, "signal sent");
            Ok(())
        }
        Err(e) => Err(StockadeError::ProcessLaunch {
            message: format!("cannot send {signal} to {pid}: {e}"),
        }),
    }
}

/// Parses a signal given as `TERM`, `SIGTERM`, or `15`.
///
/// # Errors
///
/// Returns [`StockadeError::Config`] for an unknown signal.
pub fn parse_signal(name: &str) -> Result<Signal> {
    let unknown = || StockadeError::Config {
        message: format!("unknown signal {name:?}"),
    };
    if let Ok(number) = name.parse::<i32>() {
        return Signal::try_from(number).map_err(|_| unknown());
    }
    let upper = name.to_ascii_uppercase();
    let full = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{upper}")
    };
    full.parse::<Signal>().map_err(|_| unknown())
}
