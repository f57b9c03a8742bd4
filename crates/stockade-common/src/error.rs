//! Unified error types for the Stockade workspace.
//!
//! Each subsystem reports failures through a dedicated variant so the
//! lifecycle orchestrator can tell which step failed and aggregate rollback
//! results into a single [`StockadeError::SetupFailed`].

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Creation and start steps that the orchestrator may need to roll back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SetupStep {
    /// Overlay root preparation.
    PrepareRoot,
    /// Cgroup creation and limit writes.
    CreateGroup,
    /// IP reservation, veth creation, and firewall rules.
    AllocateNetwork,
    /// Namespace creation and process launch.
    Launch,
}

impl fmt::Display for SetupStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::PrepareRoot => "prepare root",
            Self::CreateGroup => "create cgroup",
            Self::AllocateNetwork => "allocate network",
            Self::Launch => "launch process",
        };
        f.write_str(name)
    }
}

/// Result of one rollback step run after a setup failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackOutcome {
    /// What was rolled back (e.g. `"release network"`).
    pub action: &'static str,
    /// `None` on success, otherwise the error message.
    pub error: Option<String>,
}

impl RollbackOutcome {
    /// Returns whether the rollback step succeeded.
    #[must_use]
    pub const fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

impl fmt::Display for RollbackOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error {
            None => write!(f, "{}: ok", self.action),
            Some(e) => write!(f, "{}: failed ({e})", self.action),
        }
    }
}

fn join_outcomes(outcomes: &[RollbackOutcome]) -> String {
    if outcomes.is_empty() {
        return "nothing to roll back".into();
    }
    outcomes
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum StockadeError {
    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A configuration or spec value is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// A required resource was not found.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Type of the missing resource.
        kind: &'static str,
        /// Identifier of the missing resource.
        id: String,
    },

    /// A container with this identifier already exists.
    #[error("container {id} already exists")]
    AlreadyExists {
        /// Conflicting identifier.
        id: String,
    },

    /// The overlay root could not be prepared.
    #[error("filesystem setup failed: {message}")]
    FilesystemSetup {
        /// Description of the failure.
        message: String,
    },

    /// A resource limit is invalid or the cgroup could not be written.
    #[error("resource limit error: {message}")]
    ResourceLimit {
        /// Description of the failure.
        message: String,
    },

    /// A cgroup still has attached processes.
    #[error("cgroup {path} still has attached processes")]
    ResourceBusy {
        /// Path of the busy cgroup.
        path: PathBuf,
    },

    /// An IP or interface could not be allocated.
    #[error("network allocation failed: {message}")]
    NetworkAllocation {
        /// Description of the failure.
        message: String,
    },

    /// A namespace could not be created or entered.
    #[error("namespace setup failed: {message}")]
    NamespaceSetup {
        /// Description of the failure.
        message: String,
    },

    /// The container process could not be launched.
    #[error("process launch failed: {message}")]
    ProcessLaunch {
        /// Description of the failure.
        message: String,
    },

    /// Releasing kernel resources failed.
    #[error("teardown failed: {message}")]
    Teardown {
        /// Description of every failed step.
        message: String,
    },

    /// The requested operation is not legal in the container's state.
    #[error("container {id} cannot {event} while {state}")]
    InvalidTransition {
        /// Container identifier.
        id: String,
        /// Current lifecycle state name.
        state: String,
        /// Attempted lifecycle event name.
        event: String,
    },

    /// Creation was cancelled before the container reached `Created`.
    #[error("operation cancelled")]
    Cancelled,

    /// A setup step failed and rollback was attempted.
    #[error("{step} failed for container {id}: {source}; rollback: {}", join_outcomes(.rollback))]
    SetupFailed {
        /// Container identifier.
        id: String,
        /// Step that failed.
        step: SetupStep,
        /// Error raised by the failing step.
        source: Box<StockadeError>,
        /// Outcome of each rollback step, in execution order.
        rollback: Vec<RollbackOutcome>,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

impl StockadeError {
    /// Returns the innermost error, looking through [`Self::SetupFailed`].
    #[must_use]
    pub fn root_cause(&self) -> &Self {
        match self {
            Self::SetupFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Returns whether every rollback step of a setup failure succeeded.
    /// Errors other than [`Self::SetupFailed`] report `true`.
    #[must_use]
    pub fn rolled_back_cleanly(&self) -> bool {
        match self {
            Self::SetupFailed { rollback, .. } => rollback.iter().all(RollbackOutcome::succeeded),
            _ => true,
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, StockadeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_failure_lists_rollback_steps() {
        let err = StockadeError::SetupFailed {
            id: "web".into(),
            step: SetupStep::AllocateNetwork,
            source: Box::new(StockadeError::NetworkAllocation {
                message: "pool exhausted".into(),
            }),
            rollback: vec![
                RollbackOutcome {
                    action: "destroy cgroup",
                    error: None,
                },
                RollbackOutcome {
                    action: "teardown root",
                    error: Some("busy".into()),
                },
            ],
        };
        let text = err.to_string();
        assert!(text.contains("allocate network failed for container web"));
        assert!(text.contains("destroy cgroup: ok"));
        assert!(text.contains("teardown root: failed (busy)"));
        assert!(!err.rolled_back_cleanly());
        assert!(matches!(
            err.root_cause(),
            StockadeError::NetworkAllocation { .. }
        ));
    }
}
