//! Container records and the snapshots handed to callers.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stockade_common::error::{Result, StockadeError};
use stockade_common::spec::ContainerSpec;
use stockade_common::types::{ContainerId, ExitStatus, LifecycleEvent, LifecycleState, NamespaceKind};

use crate::backend::HostBackend;

/// Network attachment as shown in snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInfo {
    /// Bridge the host end is attached to.
    pub bridge: String,
    /// Container address in CIDR form.
    pub address: String,
    /// Default gateway.
    pub gateway: String,
    /// Host-side veth.
    pub host_veth: String,
    /// Container-side veth.
    pub container_veth: String,
}

/// Read-only view of a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    /// Container identifier.
    pub id: ContainerId,
    /// Lifecycle state at snapshot time.
    pub state: LifecycleState,
    /// Host PID of the entry process while running.
    pub pid: Option<u32>,
    /// Hostname inside the container.
    pub hostname: String,
    /// Isolated namespace kinds.
    pub namespaces: Vec<NamespaceKind>,
    /// Lower layers, bottom to top.
    pub layers: Vec<PathBuf>,
    /// Merged root while it exists.
    pub root: Option<PathBuf>,
    /// Control group path while it exists.
    pub cgroup: Option<PathBuf>,
    /// Network attachment while it exists.
    pub network: Option<NetworkInfo>,
    /// When the container was created.
    pub created_at: DateTime<Utc>,
    /// When the entry process was released.
    pub started_at: Option<DateTime<Utc>>,
    /// When the entry process exit was observed.
    pub finished_at: Option<DateTime<Utc>>,
    /// How the entry process terminated.
    pub exit_status: Option<ExitStatus>,
    /// Errors recorded by failed setup or teardown steps.
    pub diagnostics: Vec<String>,
}

/// A container owned by the orchestrator, together with every kernel
/// resource it holds.
#[derive(Debug)]
pub struct Container<B: HostBackend> {
    /// Immutable spec the container was created from.
    pub spec: ContainerSpec,
    /// Current lifecycle state.
    pub state: LifecycleState,
    /// Host PID of the entry process (set on start, cleared on exit).
    pub pid: Option<u32>,
    /// Prepared root filesystem.
    pub root: Option<B::Root>,
    /// Control group.
    pub group: Option<B::Group>,
    /// Network attachment.
    pub endpoint: Option<B::Endpoint>,
    /// Namespace references.
    pub namespaces: Option<B::Namespaces>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Start time.
    pub started_at: Option<DateTime<Utc>>,
    /// Exit observation time.
    pub finished_at: Option<DateTime<Utc>>,
    /// Exit status once stopped.
    pub exit_status: Option<ExitStatus>,
    /// Failure diagnostics.
    pub diagnostics: Vec<String>,
}

impl<B: HostBackend> Container<B> {
    /// Creates a record in the `Created` state.
    #[must_use]
    pub fn new(spec: ContainerSpec) -> Self {
        Self {
            spec,
            state: LifecycleState::Created,
            pid: None,
            root: None,
            group: None,
            endpoint: None,
            namespaces: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            exit_status: None,
            diagnostics: Vec::new(),
        }
    }

    /// Returns the container identifier.
    #[must_use]
    pub const fn id(&self) -> &ContainerId {
        &self.spec.id
    }

    /// Returns the state `event` leads to, without applying it.
    ///
    /// # Errors
    ///
    /// Returns [`StockadeError::InvalidTransition`]
    /// if the event is illegal in the current state.
    pub fn check(&self, event: LifecycleEvent) -> Result<LifecycleState> {
        self.state
            .next(event)
            .ok_or_else(|| StockadeError::InvalidTransition {
                id: self.spec.id.to_string(),
                state: self.state.to_string(),
                event: event.to_string(),
            })
    }

    /// Applies `event`.
    ///
    /// # Errors
    ///
    /// Returns [`StockadeError::InvalidTransition`]
    /// if the event is illegal in the current state; the state is unchanged.
    pub fn transition(&mut self, event: LifecycleEvent) -> Result<()> {
        let from = self.state;
        self.state = self.check(event)?;
        tracing::info!(id = %self.spec.id, %from, to = %self.state, "state transition");
        Ok(())
    }

    /// Builds a snapshot, asking `backend` to describe the held handles.
    #[must_use]
    pub fn info(&self, backend: &B) -> ContainerInfo {
        ContainerInfo {
            id: self.spec.id.clone(),
            state: self.state,
            pid: self.pid,
            hostname: self.spec.hostname().to_owned(),
            namespaces: self.spec.namespaces.iter().copied().collect(),
            layers: self.spec.rootfs.layers(),
            root: self.root.as_ref().map(|r| backend.root_path(r).to_path_buf()),
            cgroup: self.group.as_ref().map(|g| backend.group_path(g).to_path_buf()),
            network: self.endpoint.as_ref().map(|e| backend.network_info(e)),
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            exit_status: self.exit_status,
            diagnostics: self.diagnostics.clone(),
        }
    }
}
