//! Domain primitive types used across the Stockade workspace.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::constants::MAX_ID_LEN;
use crate::error::{Result, StockadeError};

/// Unique identifier for a container instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContainerId(String);

impl ContainerId {
    /// Creates a container ID, validating that it is safe to use as a
    /// directory and cgroup name.
    ///
    /// # Errors
    ///
    /// Returns an error if the ID is empty, too long, a relative path
    /// component, or contains characters outside `[A-Za-z0-9_.-]`.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        let valid_chars = id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
        if id.is_empty() || id.len() > MAX_ID_LEN || id == "." || id == ".." || !valid_chars {
            return Err(StockadeError::Config {
                message: format!("invalid container id {id:?}"),
            });
        }
        Ok(Self(id))
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ContainerId {
    type Error = StockadeError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<ContainerId> for String {
    fn from(id: ContainerId) -> Self {
        id.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Resource limits for a container. Unset fields leave the kernel default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceLimits {
    /// CPU time allowed per period, in microseconds.
    #[serde(default)]
    pub cpu_quota: Option<u64>,
    /// Length of the CPU accounting period, in microseconds.
    #[serde(default)]
    pub cpu_period: Option<u64>,
    /// Relative CPU shares (cgroup v1 scale, 2-262144).
    #[serde(default)]
    pub cpu_shares: Option<u64>,
    /// Hard memory ceiling in bytes.
    #[serde(default)]
    pub memory_limit_bytes: Option<u64>,
    /// I/O weight (1-1000).
    #[serde(default)]
    pub io_weight: Option<u16>,
}

/// Kernel isolation domains a container may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamespaceKind {
    /// Process IDs.
    Pid,
    /// Network stack.
    Net,
    /// Mount table.
    Mnt,
    /// Hostname and domain name.
    Uts,
    /// System V IPC and POSIX message queues.
    Ipc,
    /// User and group IDs.
    User,
}

impl NamespaceKind {
    /// Every namespace kind, user first so that id mappings precede
    /// privileged operations in the others.
    pub const ALL: [Self; 6] = [
        Self::User,
        Self::Mnt,
        Self::Pid,
        Self::Net,
        Self::Uts,
        Self::Ipc,
    ];

    /// Name of the namespace link under `/proc/<pid>/ns/`.
    #[must_use]
    pub const fn proc_name(self) -> &'static str {
        match self {
            Self::Pid => "pid",
            Self::Net => "net",
            Self::Mnt => "mnt",
            Self::Uts => "uts",
            Self::Ipc => "ipc",
            Self::User => "user",
        }
    }
}

impl fmt::Display for NamespaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.proc_name())
    }
}

impl FromStr for NamespaceKind {
    type Err = StockadeError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.proc_name() == s)
            .ok_or_else(|| StockadeError::Config {
                message: format!("unknown namespace kind {s:?}"),
            })
    }
}

/// Lifecycle state of a container.
///
/// Transitions are computed by [`LifecycleState::next`]; any pair it does not
/// list is illegal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    /// Filesystem, cgroup, and network are prepared; no process exists.
    Created,
    /// The entry command is executing.
    Running,
    /// The process has exited; resources are still held.
    Stopped,
    /// Every resource has been released.
    Destroyed,
    /// A teardown step failed and resources may have leaked.
    Failed,
}

/// Events that drive a [`LifecycleState`] transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    /// The process was launched into its namespaces.
    Start,
    /// The process exited.
    Exit,
    /// All resources were released.
    Destroy,
    /// A teardown step failed irrecoverably.
    Fail,
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Start => "start",
            Self::Exit => "exit",
            Self::Destroy => "destroy",
            Self::Fail => "fail",
        };
        f.write_str(name)
    }
}

impl LifecycleState {
    /// Returns the state reached by applying `event`, or `None` when the
    /// transition is illegal.
    #[must_use]
    pub const fn next(self, event: LifecycleEvent) -> Option<Self> {
        match (self, event) {
            (Self::Created, LifecycleEvent::Start) => Some(Self::Running),
            (Self::Running, LifecycleEvent::Exit) => Some(Self::Stopped),
            (Self::Created | Self::Stopped, LifecycleEvent::Destroy) => Some(Self::Destroyed),
            (Self::Created | Self::Running | Self::Stopped, LifecycleEvent::Fail) => {
                Some(Self::Failed)
            }
            _ => None,
        }
    }

    /// Returns whether no further transition is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Destroyed | Self::Failed)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Destroyed => write!(f, "destroyed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// How a container process terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "value")]
pub enum ExitStatus {
    /// Normal exit with the given code.
    Exited(i32),
    /// Terminated by the given signal number.
    Signaled(i32),
}

impl ExitStatus {
    /// Returns whether the process exited with code zero.
    #[must_use]
    pub const fn success(self) -> bool {
        matches!(self, Self::Exited(0))
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with code {code}"),
            Self::Signaled(signal) => write!(f, "killed by signal {signal}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_id_rejects_path_components() {
        assert!(ContainerId::new("web-1").is_ok());
        assert!(ContainerId::new("").is_err());
        assert!(ContainerId::new("..").is_err());
        assert!(ContainerId::new("a/b").is_err());
        assert!(ContainerId::new("x".repeat(MAX_ID_LEN + 1)).is_err());
    }

    #[test]
    fn lifecycle_follows_the_happy_path() {
        let s = LifecycleState::Created;
        let s = s.next(LifecycleEvent::Start).unwrap();
        assert_eq!(s, LifecycleState::Running);
        let s = s.next(LifecycleEvent::Exit).unwrap();
        assert_eq!(s, LifecycleState::Stopped);
        let s = s.next(LifecycleEvent::Destroy).unwrap();
        assert_eq!(s, LifecycleState::Destroyed);
        assert!(s.is_terminal());
    }

    #[test]
    fn created_container_can_be_destroyed_directly() {
        assert_eq!(
            LifecycleState::Created.next(LifecycleEvent::Destroy),
            Some(LifecycleState::Destroyed)
        );
    }

    #[test]
    fn terminal_states_accept_no_event() {
        for state in [LifecycleState::Destroyed, LifecycleState::Failed] {
            for event in [
                LifecycleEvent::Start,
                LifecycleEvent::Exit,
                LifecycleEvent::Destroy,
                LifecycleEvent::Fail,
            ] {
                assert_eq!(state.next(event), None, "{state} accepted {event}");
            }
        }
    }

    #[test]
    fn running_container_cannot_be_destroyed_or_restarted() {
        assert_eq!(LifecycleState::Running.next(LifecycleEvent::Destroy), None);
        assert_eq!(LifecycleState::Running.next(LifecycleEvent::Start), None);
        assert_eq!(LifecycleState::Stopped.next(LifecycleEvent::Start), None);
    }

    #[test]
    fn namespace_kind_parses_proc_names() {
        assert_eq!("mnt".parse::<NamespaceKind>().unwrap(), NamespaceKind::Mnt);
        assert!("cgroup".parse::<NamespaceKind>().is_err());
    }
}
