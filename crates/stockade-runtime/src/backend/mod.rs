//! Host backend abstraction.
//!
//! The orchestrator drives the four isolation subsystems only through
//! [`HostBackend`], which keeps lifecycle sequencing and rollback testable
//! without root. [`linux::LinuxBackend`] is the real implementation.

pub mod linux;

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

use nix::sys::signal::Signal;
use stockade_common::error::Result;
use stockade_common::spec::{ContainerSpec, NetworkRequest};
use stockade_common::types::{ContainerId, ExitStatus, NamespaceKind, ResourceLimits};
use stockade_core::cgroup::ResourceUsage;

use crate::container::NetworkInfo;

/// Operations the orchestrator needs from the host.
///
/// Handles are opaque to the orchestrator; it only stores them in the
/// container record and hands them back.
pub trait HostBackend: Send + Sync + 'static {
    /// Prepared root filesystem.
    type Root: Send + fmt::Debug + 'static;
    /// Resource control group.
    type Group: Send + fmt::Debug + 'static;
    /// Network attachment.
    type Endpoint: Send + fmt::Debug + 'static;
    /// Isolated namespaces and the references holding them.
    type Namespaces: Send + fmt::Debug + 'static;
    /// A launched process parked before its entrypoint.
    type Pending: Send + fmt::Debug + 'static;

    /// Prepares host-wide state (cgroup parent, controllers).
    ///
    /// # Errors
    ///
    /// Returns an error if the host cannot run containers.
    fn ensure_ready(&self) -> Result<()>;

    /// Builds the union root from `layers`, bottom to top.
    ///
    /// # Errors
    ///
    /// Returns [`stockade_common::error::StockadeError::FilesystemSetup`] on failure.
    fn prepare_root(&self, id: &ContainerId, layers: &[PathBuf]) -> Result<Self::Root>;

    /// Unmounts and removes a root. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`stockade_common::error::StockadeError::Teardown`] on failure.
    fn teardown_root(&self, root: &mut Self::Root) -> Result<()>;

    /// Returns the merged directory of a root.
    fn root_path<'a>(&self, root: &'a Self::Root) -> &'a Path;

    /// Creates a control group with `limits` applied.
    ///
    /// # Errors
    ///
    /// Returns [`stockade_common::error::StockadeError::ResourceLimit`] on failure.
    fn create_group(&self, id: &ContainerId, limits: &ResourceLimits) -> Result<Self::Group>;

    /// Moves `pid` into the group.
    ///
    /// # Errors
    ///
    /// Returns an error if the process cannot be attached.
    fn attach(&self, group: &Self::Group, pid: u32) -> Result<()>;

    /// Reads current usage counters.
    ///
    /// # Errors
    ///
    /// Returns an error only for a destroyed group.
    fn read_usage(&self, group: &Self::Group) -> Result<ResourceUsage>;

    /// Removes the group. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`stockade_common::error::StockadeError::ResourceBusy`] while
    /// processes remain attached.
    fn destroy_group(&self, group: &mut Self::Group) -> Result<()>;

    /// Returns the path of a group.
    fn group_path<'a>(&self, group: &'a Self::Group) -> &'a Path;

    /// Reserves an address and wires the host side of an endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`stockade_common::error::StockadeError::NetworkAllocation`] on failure.
    fn allocate_network(&self, id: &ContainerId, request: &NetworkRequest) -> Result<Self::Endpoint>;

    /// Moves the container side of `endpoint` into the namespace of `pid`.
    ///
    /// # Errors
    ///
    /// Returns an error if the interface cannot be moved or configured.
    fn move_endpoint(&self, endpoint: &Self::Endpoint, pid: u32) -> Result<()>;

    /// Releases an endpoint. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`stockade_common::error::StockadeError::Teardown`] on failure.
    fn release_network(&self, endpoint: &mut Self::Endpoint) -> Result<()>;

    /// Describes an endpoint for snapshots.
    fn network_info(&self, endpoint: &Self::Endpoint) -> NetworkInfo;

    /// Checks support for the requested namespaces.
    ///
    /// # Errors
    ///
    /// Returns [`stockade_common::error::StockadeError::NamespaceSetup`] for
    /// an unsupported kind.
    fn create_namespaces(&self, requested: &BTreeSet<NamespaceKind>) -> Result<Self::Namespaces>;

    /// Clones the entry process into `namespaces`, parked before exec.
    ///
    /// # Errors
    ///
    /// Returns an error if the process cannot be launched.
    fn spawn(
        &self,
        namespaces: &mut Self::Namespaces,
        root: &Self::Root,
        spec: &ContainerSpec,
    ) -> Result<Self::Pending>;

    /// Returns the host PID of a parked process.
    fn pending_pid(&self, pending: &Self::Pending) -> u32;

    /// Lets a parked process exec its entrypoint.
    ///
    /// # Errors
    ///
    /// Returns [`stockade_common::error::StockadeError::ProcessLaunch`] if
    /// the process failed before exec; it has been reaped by then.
    fn release(&self, pending: Self::Pending) -> Result<u32>;

    /// Kills and reaps a parked process.
    fn abort(&self, pending: Self::Pending);

    /// Drops the namespace references. Idempotent.
    fn close_namespaces(&self, namespaces: &mut Self::Namespaces);

    /// Blocks until `pid` exits and returns how it terminated. The process
    /// is left unreaped so its PID cannot be reused before [`Self::reap`].
    ///
    /// # Errors
    ///
    /// Returns an error if the process cannot be waited for.
    fn wait(&self, pid: u32) -> Result<ExitStatus>;

    /// Reaps an exited process, freeing its PID.
    ///
    /// # Errors
    ///
    /// Returns an error if the process cannot be reaped.
    fn reap(&self, pid: u32) -> Result<()>;

    /// Kills every process left in the group.
    ///
    /// # Errors
    ///
    /// Returns an error if the processes cannot be signalled.
    fn kill_group(&self, group: &Self::Group) -> Result<()>;

    /// Sends `signal` to `pid`. A process that is already gone is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the signal cannot be delivered.
    fn signal(&self, pid: u32, signal: Signal) -> Result<()>;
}
