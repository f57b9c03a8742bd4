//! Linux host backend built on `stockade-core`.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::sys::signal::Signal;
use stockade_common::config::{IdMapConfig, RuntimeConfig};
use stockade_common::error::Result;
use stockade_common::spec::{ContainerSpec, NetworkRequest};
use stockade_common::types::{ContainerId, ExitStatus, NamespaceKind, ResourceLimits};
use stockade_core::cgroup::{CgroupController, CgroupHandle, ResourceUsage};
use stockade_core::filesystem::{FilesystemMount, LayerManager};
use stockade_core::namespace::NamespaceSet;
use stockade_core::namespace::launch::{self, PendingProcess};
use stockade_core::network::allocator::AddressAllocator;
use stockade_core::network::command::{CommandRunner, SystemRunner};
use stockade_core::network::{NetworkEndpoint, NetworkManager};

use super::HostBackend;
use crate::container::NetworkInfo;
use crate::process;

/// Runs containers with kernel namespaces, cgroups v2, `OverlayFS`, and
/// bridge networking on the local host.
#[derive(Debug)]
pub struct LinuxBackend {
    layers: LayerManager,
    cgroups: CgroupController,
    network: NetworkManager,
    id_map: IdMapConfig,
}

impl LinuxBackend {
    /// Creates a backend from the runtime configuration, running network
    /// tools on the host.
    #[must_use]
    pub fn new(config: &RuntimeConfig) -> Self {
        Self::with_runner(config, Arc::new(SystemRunner))
    }

    /// Creates a backend that runs network tools through `runner`.
    #[must_use]
    pub fn with_runner(config: &RuntimeConfig, runner: Arc<dyn CommandRunner>) -> Self {
        let allocator = Arc::new(
            AddressAllocator::new(&config.network.bridges, config.network.veth_prefix.clone())
                .with_lease_file(config.lease_file.clone()),
        );
        Self {
            layers: LayerManager::new(config.layers_dir.clone()),
            cgroups: CgroupController::new(config.cgroup.clone()),
            network: NetworkManager::new(config.network.clone(), allocator, runner),
            id_map: config.id_map,
        }
    }
}

impl HostBackend for LinuxBackend {
    type Root = FilesystemMount;
    type Group = CgroupHandle;
    type Endpoint = NetworkEndpoint;
    type Namespaces = NamespaceSet;
    type Pending = PendingProcess;

    fn ensure_ready(&self) -> Result<()> {
        self.cgroups.ensure_hierarchy()
    }

    fn prepare_root(&self, id: &ContainerId, layers: &[PathBuf]) -> Result<FilesystemMount> {
        self.layers.prepare_root(id, layers)
    }

    fn teardown_root(&self, root: &mut FilesystemMount) -> Result<()> {
        self.layers.teardown(root)
    }

    fn root_path<'a>(&self, root: &'a FilesystemMount) -> &'a Path {
        &root.merged_dir
    }

    fn create_group(&self, id: &ContainerId, limits: &ResourceLimits) -> Result<CgroupHandle> {
        self.cgroups.create_group(id, limits)
    }

    fn attach(&self, group: &CgroupHandle, pid: u32) -> Result<()> {
        self.cgroups.attach(group, pid)
    }

    fn read_usage(&self, group: &CgroupHandle) -> Result<ResourceUsage> {
        self.cgroups.read_usage(group)
    }

    fn destroy_group(&self, group: &mut CgroupHandle) -> Result<()> {
        self.cgroups.destroy(group)
    }

    fn group_path<'a>(&self, group: &'a CgroupHandle) -> &'a Path {
        &group.path
    }

    fn allocate_network(&self, id: &ContainerId, request: &NetworkRequest) -> Result<NetworkEndpoint> {
        self.network.allocate(id, request)
    }

    fn move_endpoint(&self, endpoint: &NetworkEndpoint, pid: u32) -> Result<()> {
        self.network.move_into_namespace(endpoint, pid)
    }

    fn release_network(&self, endpoint: &mut NetworkEndpoint) -> Result<()> {
        self.network.release(endpoint)
    }

    fn network_info(&self, endpoint: &NetworkEndpoint) -> NetworkInfo {
        NetworkInfo {
            bridge: endpoint.bridge.clone(),
            address: endpoint.address.to_string(),
            gateway: endpoint.gateway.to_string(),
            host_veth: endpoint.host_veth.clone(),
            container_veth: endpoint.container_veth.clone(),
        }
    }

    fn create_namespaces(&self, requested: &BTreeSet<NamespaceKind>) -> Result<NamespaceSet> {
        NamespaceSet::create_isolated(requested)
    }

    fn spawn(
        &self,
        namespaces: &mut NamespaceSet,
        root: &FilesystemMount,
        spec: &ContainerSpec,
    ) -> Result<PendingProcess> {
        launch::spawn(namespaces, root, spec, &self.id_map)
    }

    fn pending_pid(&self, pending: &PendingProcess) -> u32 {
        pending.pid()
    }

    fn release(&self, pending: PendingProcess) -> Result<u32> {
        pending.release()
    }

    fn abort(&self, pending: PendingProcess) {
        pending.abort();
    }

    fn close_namespaces(&self, namespaces: &mut NamespaceSet) {
        namespaces.close();
    }

    fn wait(&self, pid: u32) -> Result<ExitStatus> {
        process::wait_for_exit(pid)
    }

    fn reap(&self, pid: u32) -> Result<()> {
        process::reap(pid)
    }

    fn kill_group(&self, group: &CgroupHandle) -> Result<()> {
        self.cgroups.kill_all(group)
    }

    fn signal(&self, pid: u32, signal: Signal) -> Result<()> {
        process::send_signal(pid, signal)
    }
}
