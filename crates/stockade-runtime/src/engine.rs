//! Lifecycle orchestrator.
//!
//! Sequences the four isolation subsystems into one reversible lifecycle.
//! Every transition of a container runs under that container's mutex; the
//! container map is locked only for lookups and inserts, so different
//! containers progress in parallel.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread;
use std::time::Duration;

use chrono::Utc;
use nix::sys::signal::Signal;
use stockade_common::config::RuntimeConfig;
use stockade_common::error::{Result, RollbackOutcome, SetupStep, StockadeError};
use stockade_common::spec::ContainerSpec;
use stockade_common::types::{ContainerId, ExitStatus, LifecycleEvent, LifecycleState};
use stockade_core::cgroup::ResourceUsage;

use crate::backend::HostBackend;
use crate::cancel::CancelToken;
use crate::container::{Container, ContainerInfo};
use crate::state::StateStore;

const BUSY_RETRIES: u32 = 5;
const BUSY_RETRY_DELAY: Duration = Duration::from_millis(20);

struct Slot<B: HostBackend> {
    container: Mutex<Container<B>>,
    exited: Condvar,
}

impl<B: HostBackend> Slot<B> {
    fn new(container: Container<B>) -> Self {
        Self {
            container: Mutex::new(container),
            exited: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Container<B>> {
        self.container.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

enum Entry<B: HostBackend> {
    /// Id reserved by an in-flight `create`.
    Creating,
    Ready(Arc<Slot<B>>),
}

/// Drives containers through `Created → Running → Stopped → Destroyed`.
pub struct Orchestrator<B: HostBackend> {
    backend: Arc<B>,
    config: RuntimeConfig,
    containers: RwLock<HashMap<ContainerId, Entry<B>>>,
    store: Option<StateStore>,
}

impl<B: HostBackend> std::fmt::Debug for Orchestrator<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl<B: HostBackend> Orchestrator<B> {
    /// Creates an orchestrator and prepares host-wide state.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot prepare the host.
    pub fn new(backend: B, config: RuntimeConfig) -> Result<Self> {
        backend.ensure_ready()?;
        Ok(Self {
            backend: Arc::new(backend),
            config,
            containers: RwLock::new(HashMap::new()),
            store: None,
        })
    }

    /// Mirrors every transition into `store`.
    #[must_use]
    pub fn with_state_store(mut self, store: StateStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Returns the host backend.
    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Returns the runtime configuration.
    #[must_use]
    pub const fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Creates a container, cancelling after `create_timeout_secs` if set.
    ///
    /// # Errors
    ///
    /// See [`Self::create_with_cancel`].
    pub fn create(&self, spec: ContainerSpec) -> Result<ContainerInfo> {
        let token = self
            .config
            .create_timeout_secs
            .map_or_else(CancelToken::new, |secs| {
                CancelToken::with_timeout(Duration::from_secs(secs))
            });
        self.create_with_cancel(spec, &token)
    }

    /// Prepares the root, the cgroup, and the network endpoint, leaving the
    /// container `Created`.
    ///
    /// The token is checked before each step. On failure or cancellation
    /// the completed steps are rolled back in reverse order; if every
    /// rollback step succeeds no trace of the container remains, otherwise
    /// a `Failed` record keeps the diagnostics.
    ///
    /// # Errors
    ///
    /// Returns [`StockadeError::Config`] for an invalid spec,
    /// [`StockadeError::AlreadyExists`] for a live id, and
    /// [`StockadeError::SetupFailed`] when a step fails or is cancelled.
    pub fn create_with_cancel(&self, spec: ContainerSpec, token: &CancelToken) -> Result<ContainerInfo> {
        spec.validate()?;
        let id = spec.id.clone();
        self.reserve(&id)?;
        tracing::info!(%id, "creating container");

        let mut container = Container::<B>::new(spec);
        let (step, source) = match self.run_setup(&mut container, token) {
            Ok(()) => {
                let info = container.info(&self.backend);
                self.publish(&id, container);
                self.persist(&info);
                tracing::info!(%id, "container created");
                return Ok(info);
            }
            Err(failure) => failure,
        };

        tracing::warn!(%id, %step, error = %source, "setup failed, rolling back");
        let rollback = self.release_resources(&mut container);
        if rollback.iter().all(RollbackOutcome::succeeded) {
            let _ = self.write_map().remove(&id);
            self.forget(&id);
        } else {
            container.diagnostics.push(format!("{step} failed: {source}"));
            record_failures(&mut container, &rollback);
            if let Err(e) = container.transition(LifecycleEvent::Fail) {
                tracing::warn!(%id, error = %e, "cannot mark container failed");
            }
            let info = container.info(&self.backend);
            self.publish(&id, container);
            self.persist(&info);
        }
        Err(StockadeError::SetupFailed {
            id: id.to_string(),
            step,
            source: Box::new(source),
            rollback,
        })
    }

    fn run_setup(
        &self,
        container: &mut Container<B>,
        token: &CancelToken,
    ) -> std::result::Result<(), (SetupStep, StockadeError)> {
        let backend = &self.backend;
        let at = |step: SetupStep| move |e: StockadeError| (step, e);

        token.check().map_err(at(SetupStep::PrepareRoot))?;
        let layers = container.spec.rootfs.layers();
        container.root = Some(
            backend
                .prepare_root(container.id(), &layers)
                .map_err(at(SetupStep::PrepareRoot))?,
        );

        token.check().map_err(at(SetupStep::CreateGroup))?;
        container.group = Some(
            backend
                .create_group(container.id(), &container.spec.resources)
                .map_err(at(SetupStep::CreateGroup))?,
        );

        if let Some(request) = &container.spec.network {
            token.check().map_err(at(SetupStep::AllocateNetwork))?;
            let endpoint = backend
                .allocate_network(&container.spec.id, request)
                .map_err(at(SetupStep::AllocateNetwork))?;
            container.endpoint = Some(endpoint);
        }
        Ok(())
    }

    /// Launches the entry process and releases it into its entrypoint.
    ///
    /// The process is cloned into fresh namespaces, attached to the cgroup,
    /// and given its network interface while still blocked. If any of that
    /// fails the process is killed and every resource is torn down; the
    /// container ends `Destroyed`, or `Failed` when teardown also failed.
    ///
    /// # Errors
    ///
    /// Returns [`StockadeError::NotFound`] for an unknown id,
    /// [`StockadeError::InvalidTransition`] unless the container is
    /// `Created`, and [`StockadeError::SetupFailed`] when launching fails.
    pub fn start(&self, id: &ContainerId) -> Result<ContainerInfo> {
        let slot = self.slot(id)?;
        let mut container = slot.lock();
        let _ = container.check(LifecycleEvent::Start)?;

        match self.launch(&mut container) {
            Ok(pid) => {
                container.transition(LifecycleEvent::Start)?;
                container.pid = Some(pid);
                container.started_at = Some(Utc::now());
                let info = container.info(&self.backend);
                self.persist(&info);
                drop(container);
                tracing::info!(%id, pid, "container started");
                self.spawn_reaper(id, &slot, pid);
                Ok(info)
            }
            Err(source) => {
                tracing::warn!(%id, error = %source, "launch failed, tearing down");
                let rollback = self.release_resources(&mut *container);
                let event = if rollback.iter().all(RollbackOutcome::succeeded) {
                    LifecycleEvent::Destroy
                } else {
                    container.diagnostics.push(format!("{} failed: {source}", SetupStep::Launch));
                    record_failures(&mut *container, &rollback);
                    LifecycleEvent::Fail
                };
                container.transition(event)?;
                let info = container.info(&self.backend);
                self.persist(&info);
                Err(StockadeError::SetupFailed {
                    id: id.to_string(),
                    step: SetupStep::Launch,
                    source: Box::new(source),
                    rollback,
                })
            }
        }
    }

    fn launch(&self, container: &mut Container<B>) -> Result<u32> {
        let backend = &self.backend;
        let namespaces = container
            .namespaces
            .insert(backend.create_namespaces(&container.spec.namespaces)?);
        let root = container.root.as_ref().ok_or_else(|| StockadeError::ProcessLaunch {
            message: "root filesystem is not prepared".into(),
        })?;
        let pending = backend.spawn(namespaces, root, &container.spec)?;
        let pid = backend.pending_pid(&pending);

        let wired = container
            .group
            .as_ref()
            .map_or(Ok(()), |group| backend.attach(group, pid))
            .and_then(|()| {
                container
                    .endpoint
                    .as_ref()
                    .map_or(Ok(()), |endpoint| backend.move_endpoint(endpoint, pid))
            });
        if let Err(e) = wired {
            backend.abort(pending);
            return Err(e);
        }
        backend.release(pending)
    }

    fn spawn_reaper(&self, id: &ContainerId, slot: &Arc<Slot<B>>, pid: u32) {
        let backend = Arc::clone(&self.backend);
        let thread_slot = Arc::clone(slot);
        let store = self.store.clone();
        let spawned = thread::Builder::new()
            .name(format!("reap-{id}"))
            .spawn(move || {
                let status = backend.wait(pid);
                record_exit(&*backend, &thread_slot, store.as_ref(), pid, status);
            });
        if let Err(e) = spawned {
            tracing::warn!(%id, pid, error = %e, "cannot spawn reaper, killing container");
            if let Err(e) = self.backend.signal(pid, Signal::SIGKILL) {
                tracing::warn!(%id, pid, error = %e, "cannot kill container");
            }
            let status = self.backend.wait(pid);
            record_exit(&*self.backend, slot, self.store.as_ref(), pid, status);
        }
    }

    /// Sends `signal` to the entry process and waits up to the configured
    /// grace period for it to exit, then sends `SIGKILL`.
    ///
    /// # Errors
    ///
    /// Returns [`StockadeError::InvalidTransition`] unless the container is
    /// `Running`, or an error if a signal cannot be delivered.
    pub fn stop(&self, id: &ContainerId, signal: Signal) -> Result<ExitStatus> {
        let slot = self.slot(id)?;
        let mut container = slot.lock();
        let pid = match (container.state, container.pid) {
            (LifecycleState::Running, Some(pid)) => pid,
            (state, _) => {
                return Err(StockadeError::InvalidTransition {
                    id: id.to_string(),
                    state: state.to_string(),
                    event: "stop".into(),
                });
            }
        };
        tracing::info!(%id, pid, %signal, "stopping container");
        self.backend.signal(pid, signal)?;

        let grace = Duration::from_secs(self.config.stop_timeout_secs);
        let (guard, _) = slot
            .exited
            .wait_timeout_while(container, grace, |c| c.state == LifecycleState::Running)
            .unwrap_or_else(PoisonError::into_inner);
        container = guard;

        if container.state == LifecycleState::Running {
            tracing::warn!(%id, pid, grace_secs = grace.as_secs(), "grace period elapsed, sending SIGKILL");
            self.backend.signal(pid, Signal::SIGKILL)?;
            container = slot
                .exited
                .wait_while(container, |c| c.state == LifecycleState::Running)
                .unwrap_or_else(PoisonError::into_inner);
        }
        exit_status_of(&*container)
    }

    /// Blocks until the entry process exits and returns its status.
    ///
    /// # Errors
    ///
    /// Returns [`StockadeError::InvalidTransition`] for a container that was
    /// never started.
    pub fn wait(&self, id: &ContainerId) -> Result<ExitStatus> {
        let slot = self.slot(id)?;
        let container = slot.lock();
        if container.state == LifecycleState::Created || container.started_at.is_none() {
            return Err(StockadeError::InvalidTransition {
                id: id.to_string(),
                state: container.state.to_string(),
                event: "wait".into(),
            });
        }
        let container = slot
            .exited
            .wait_while(container, |c| c.state == LifecycleState::Running)
            .unwrap_or_else(PoisonError::into_inner);
        exit_status_of(&*container)
    }

    /// Releases every resource of a `Created` or `Stopped` container.
    ///
    /// The network endpoint and the cgroup go first, then the namespace
    /// references, and the root filesystem last. Processes the entrypoint
    /// left behind in the cgroup are killed and the removal retried briefly.
    ///
    /// # Errors
    ///
    /// Returns [`StockadeError::InvalidTransition`] for a container in
    /// another state, or [`StockadeError::Teardown`] listing every failed
    /// step; the container is then `Failed`.
    pub fn destroy(&self, id: &ContainerId) -> Result<()> {
        let slot = self.slot(id)?;
        let mut container = slot.lock();
        let _ = container.check(LifecycleEvent::Destroy)?;
        tracing::info!(%id, "destroying container");

        let outcomes = self.release_resources(&mut *container);
        let failures: Vec<String> = outcomes
            .iter()
            .filter_map(|o| o.error.as_ref().map(|e| format!("{}: {e}", o.action)))
            .collect();
        if failures.is_empty() {
            container.transition(LifecycleEvent::Destroy)?;
            self.persist(&container.info(&self.backend));
            return Ok(());
        }
        container.diagnostics.extend(failures.iter().cloned());
        container.transition(LifecycleEvent::Fail)?;
        self.persist(&container.info(&self.backend));
        Err(StockadeError::Teardown {
            message: failures.join("; "),
        })
    }

    /// Returns the current state of a container.
    ///
    /// # Errors
    ///
    /// Returns [`StockadeError::NotFound`] for an unknown id.
    pub fn state(&self, id: &ContainerId) -> Result<LifecycleState> {
        Ok(self.slot(id)?.lock().state)
    }

    /// Returns a snapshot of a container.
    ///
    /// # Errors
    ///
    /// Returns [`StockadeError::NotFound`] for an unknown id.
    pub fn inspect(&self, id: &ContainerId) -> Result<ContainerInfo> {
        Ok(self.slot(id)?.lock().info(&self.backend))
    }

    /// Returns snapshots of every container, oldest first.
    #[must_use]
    pub fn list(&self) -> Vec<ContainerInfo> {
        let slots: Vec<Arc<Slot<B>>> = self
            .read_map()
            .values()
            .filter_map(|entry| match entry {
                Entry::Ready(slot) => Some(Arc::clone(slot)),
                Entry::Creating => None,
            })
            .collect();
        let mut infos: Vec<ContainerInfo> = slots
            .iter()
            .map(|slot| slot.lock().info(&self.backend))
            .collect();
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        infos
    }

    /// Reads the resource usage counters of a container's cgroup.
    ///
    /// # Errors
    ///
    /// Returns [`StockadeError::NotFound`] if the container or its cgroup is
    /// gone.
    pub fn usage(&self, id: &ContainerId) -> Result<ResourceUsage> {
        let slot = self.slot(id)?;
        let container = slot.lock();
        let group = container.group.as_ref().ok_or_else(|| StockadeError::NotFound {
            kind: "cgroup",
            id: id.to_string(),
        })?;
        self.backend.read_usage(group)
    }

    /// Forgets every `Destroyed` container and returns their ids.
    pub fn prune(&self) -> Vec<ContainerId> {
        let mut pruned = Vec::new();
        self.write_map().retain(|id, entry| {
            let destroyed = matches!(entry, Entry::Ready(slot) if slot.lock().state == LifecycleState::Destroyed);
            if destroyed {
                pruned.push(id.clone());
            }
            !destroyed
        });
        for id in &pruned {
            self.forget(id);
        }
        if !pruned.is_empty() {
            tracing::info!(count = pruned.len(), "pruned destroyed containers");
        }
        pruned
    }

    /// Releases whatever the container still holds, in teardown order, and
    /// reports each fallible step. Handles are dropped once released.
    fn release_resources(&self, container: &mut Container<B>) -> Vec<RollbackOutcome> {
        let backend = &self.backend;
        let mut outcomes = Vec::new();

        if let Some(endpoint) = container.endpoint.as_mut() {
            let result = backend.release_network(endpoint);
            if result.is_ok() {
                container.endpoint = None;
            }
            outcomes.push(outcome("release network", result));
        }
        if let Some(group) = container.group.as_mut() {
            let result = self.destroy_group(group);
            if result.is_ok() {
                container.group = None;
            }
            outcomes.push(outcome("destroy cgroup", result));
        }
        if let Some(mut namespaces) = container.namespaces.take() {
            backend.close_namespaces(&mut namespaces);
        }
        if let Some(root) = container.root.as_mut() {
            let result = backend.teardown_root(root);
            if result.is_ok() {
                container.root = None;
            }
            outcomes.push(outcome("teardown root", result));
        }
        outcomes
    }

    fn destroy_group(&self, group: &mut B::Group) -> Result<()> {
        let mut attempt = 0;
        loop {
            match self.backend.destroy_group(group) {
                Err(StockadeError::ResourceBusy { path }) if attempt < BUSY_RETRIES => {
                    attempt += 1;
                    tracing::debug!(path = %path.display(), attempt, "cgroup busy, killing leftover processes");
                    if let Err(e) = self.backend.kill_group(group) {
                        tracing::warn!(path = %path.display(), error = %e, "cannot kill leftover processes");
                    }
                    thread::sleep(BUSY_RETRY_DELAY);
                }
                other => return other,
            }
        }
    }

    fn slot(&self, id: &ContainerId) -> Result<Arc<Slot<B>>> {
        match self.read_map().get(id) {
            Some(Entry::Ready(slot)) => Ok(Arc::clone(slot)),
            Some(Entry::Creating) | None => Err(StockadeError::NotFound {
                kind: "container",
                id: id.to_string(),
            }),
        }
    }

    /// Claims `id` for an in-flight creation. A `Destroyed` record with the
    /// same id is replaced; any other record blocks the id.
    fn reserve(&self, id: &ContainerId) -> Result<()> {
        let mut map = self.write_map();
        let taken = match map.get(id) {
            Some(Entry::Creating) => true,
            Some(Entry::Ready(slot)) => slot.lock().state != LifecycleState::Destroyed,
            None => false,
        };
        if taken {
            return Err(StockadeError::AlreadyExists { id: id.to_string() });
        }
        let _ = map.insert(id.clone(), Entry::Creating);
        Ok(())
    }

    fn publish(&self, id: &ContainerId, container: Container<B>) {
        let _ = self
            .write_map()
            .insert(id.clone(), Entry::Ready(Arc::new(Slot::new(container))));
    }

    fn persist(&self, info: &ContainerInfo) {
        persist(self.store.as_ref(), info);
    }

    fn forget(&self, id: &ContainerId) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(e) = store.remove(id) {
            tracing::warn!(%id, error = %e, "cannot update state index");
        }
    }

    fn read_map(&self) -> std::sync::RwLockReadGuard<'_, HashMap<ContainerId, Entry<B>>> {
        self.containers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_map(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<ContainerId, Entry<B>>> {
        self.containers.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn outcome(action: &'static str, result: Result<()>) -> RollbackOutcome {
    RollbackOutcome {
        action,
        error: result.err().map(|e| e.to_string()),
    }
}

fn record_failures<B: HostBackend>(container: &mut Container<B>, rollback: &[RollbackOutcome]) {
    container.diagnostics.extend(
        rollback
            .iter()
            .filter(|o| !o.succeeded())
            .map(ToString::to_string),
    );
}

fn exit_status_of<B: HostBackend>(container: &Container<B>) -> Result<ExitStatus> {
    container.exit_status.ok_or_else(|| StockadeError::ProcessLaunch {
        message: format!("exit status of container {} is unknown", container.id()),
    })
}

fn persist(store: Option<&StateStore>, info: &ContainerInfo) {
    let Some(store) = store else {
        return;
    };
    if let Err(e) = store.upsert(info) {
        tracing::warn!(id = %info.id, error = %e, "cannot update state index");
    }
}

/// Records the exit observed by a reaper, reaps the process, and wakes every
/// waiter. The PID is freed only once the container no longer reads
/// `Running`, so `stop` never signals a recycled PID.
fn record_exit<B: HostBackend>(
    backend: &B,
    slot: &Slot<B>,
    store: Option<&StateStore>,
    pid: u32,
    status: Result<ExitStatus>,
) {
    let mut container = slot.lock();
    let id = container.id().clone();
    match status {
        Ok(status) => {
            tracing::info!(%id, %status, "container exited");
            let oom_killed = status == ExitStatus::Signaled(Signal::SIGKILL as i32)
                && container
                    .group
                    .as_ref()
                    .is_some_and(|group| backend.read_usage(group).is_ok_and(|u| u.oom_kills > 0));
            if oom_killed {
                container.diagnostics.push("killed by the OOM killer".into());
            }
            container.exit_status = Some(status);
        }
        Err(e) => {
            tracing::warn!(%id, error = %e, "cannot observe container exit");
            container.diagnostics.push(format!("wait failed: {e}"));
        }
    }
    container.pid = None;
    container.finished_at = Some(Utc::now());
    if let Err(e) = container.transition(LifecycleEvent::Exit) {
        tracing::warn!(%id, error = %e, "exit observed in unexpected state");
    }
    if let Err(e) = backend.reap(pid) {
        tracing::warn!(%id, pid, error = %e, "cannot reap container process");
    }
    persist(store, &container.info(backend));
    drop(container);
    slot.exited.notify_all();
}
