//! Network endpoint management.
//!
//! Gives each networked container a veth pair attached to a host bridge, a
//! unique address from the bridge's pool, and NAT/forwarding rules. The
//! container end is moved into the container's network namespace once the
//! process exists.

pub mod allocator;
pub mod command;
pub mod firewall;
pub mod link;

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, PoisonError};

use ipnetwork::Ipv4Network;
use stockade_common::config::NetworkConfig;
use stockade_common::error::{Result, StockadeError};
use stockade_common::spec::NetworkRequest;
use stockade_common::types::ContainerId;

use self::allocator::{AddressAllocator, Reservation};
use self::command::CommandRunner;
use self::firewall::FirewallRule;

/// A container's network attachment.
#[derive(Debug)]
pub struct NetworkEndpoint {
    /// Owning container.
    pub container_id: ContainerId,
    /// Bridge the host end is attached to.
    pub bridge: String,
    /// Host-side veth name.
    pub host_veth: String,
    /// Container-side veth name.
    pub container_veth: String,
    /// Container address and prefix.
    pub address: Ipv4Network,
    /// Default gateway inside the container.
    pub gateway: Ipv4Addr,
    /// Installed firewall rules.
    pub rules: Vec<FirewallRule>,
    reservation: Reservation,
    released: bool,
}

impl NetworkEndpoint {
    /// Returns whether [`NetworkManager::release`] already completed.
    #[must_use]
    pub const fn is_released(&self) -> bool {
        self.released
    }
}

/// Allocates and releases container network endpoints.
#[derive(Debug)]
pub struct NetworkManager {
    config: NetworkConfig,
    allocator: Arc<AddressAllocator>,
    runner: Arc<dyn CommandRunner>,
    bridge_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl NetworkManager {
    /// Creates a manager drawing addresses from `allocator` and running host
    /// tools through `runner`.
    #[must_use]
    pub fn new(
        config: NetworkConfig,
        allocator: Arc<AddressAllocator>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            config,
            allocator,
            runner,
            bridge_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the allocator this manager reserves from.
    #[must_use]
    pub fn allocator(&self) -> &Arc<AddressAllocator> {
        &self.allocator
    }

    /// Reserves an address and names, wires the host end to the bridge, and
    /// installs firewall rules.
    ///
    /// # Errors
    ///
    /// Returns [`StockadeError::NetworkAllocation`] if any step fails. Steps
    /// already completed are undone and the reservation is returned.
    pub fn allocate(&self, id: &ContainerId, request: &NetworkRequest) -> Result<NetworkEndpoint> {
        let static_ip = request.parsed_static_ip()?;
        let reservation = self.allocator.reserve(&request.bridge, static_ip)?;

        let mut veth_created = false;
        let mut installed = Vec::new();
        if let Err(e) = self.wire(id, &reservation, &mut veth_created, &mut installed) {
            self.undo(&reservation, veth_created, &installed);
            return Err(match e {
                e @ StockadeError::NetworkAllocation { .. } => e,
                other => StockadeError::NetworkAllocation {
                    message: other.to_string(),
                },
            });
        }

        tracing::info!(
            id = %id,
            bridge = %reservation.bridge,
            ip = %reservation.cidr(),
            veth = %reservation.host_veth,
            "network endpoint allocated"
        );
        Ok(NetworkEndpoint {
            container_id: id.clone(),
            bridge: reservation.bridge.clone(),
            host_veth: reservation.host_veth.clone(),
            container_veth: reservation.container_veth.clone(),
            address: reservation.cidr(),
            gateway: reservation.gateway,
            rules: installed,
            reservation,
            released: false,
        })
    }

    fn wire(
        &self,
        id: &ContainerId,
        reservation: &Reservation,
        veth_created: &mut bool,
        installed: &mut Vec<FirewallRule>,
    ) -> Result<()> {
        let runner = self.runner.as_ref();
        self.ensure_bridge(reservation)?;
        link::enable_ip_forward(runner)?;
        if !self.config.allow_inter_container {
            link::enable_bridge_filtering(runner)?;
        }

        link::create_veth_pair(runner, &reservation.host_veth, &reservation.container_veth)?;
        *veth_created = true;
        link::attach_to_bridge(runner, &reservation.host_veth, &reservation.bridge)?;

        for rule in firewall::container_rules(
            id.as_str(),
            reservation.ip,
            &reservation.bridge,
            self.config.egress_interface.as_deref(),
            self.config.allow_inter_container,
        ) {
            firewall::install(runner, &rule)?;
            installed.push(rule);
        }
        Ok(())
    }

    fn ensure_bridge(&self, reservation: &Reservation) -> Result<()> {
        let lock = {
            let mut locks = self.bridge_locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(reservation.bridge.clone()).or_default())
        };
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let gateway = Ipv4Network::new(reservation.gateway, reservation.prefix).map_err(|e| {
            StockadeError::NetworkAllocation {
                message: format!("invalid gateway for bridge {}: {e}", reservation.bridge),
            }
        })?;
        link::ensure_bridge(self.runner.as_ref(), &reservation.bridge, gateway)
    }

    fn undo(&self, reservation: &Reservation, veth_created: bool, installed: &[FirewallRule]) {
        let runner = self.runner.as_ref();
        for rule in installed.iter().rev() {
            if let Err(e) = firewall::remove(runner, rule) {
                tracing::warn!(error = %e, "failed to remove firewall rule during rollback");
            }
        }
        if veth_created {
            if let Err(e) = link::delete_link(runner, &reservation.host_veth) {
                tracing::warn!(veth = %reservation.host_veth, error = %e, "failed to delete veth during rollback");
            }
        }
        if let Err(e) = self.allocator.release(reservation) {
            tracing::warn!(ip = %reservation.ip, error = %e, "failed to release address during rollback");
        }
    }

    /// Moves the container end into the network namespace of `pid` and
    /// configures its address and default route.
    ///
    /// # Errors
    ///
    /// Returns [`StockadeError::NetworkAllocation`] if any `ip` invocation
    /// fails, or [`StockadeError::NotFound`] for a released endpoint.
    pub fn move_into_namespace(&self, endpoint: &NetworkEndpoint, pid: u32) -> Result<()> {
        if endpoint.released {
            return Err(StockadeError::NotFound {
                kind: "network endpoint",
                id: endpoint.container_id.to_string(),
            });
        }
        link::configure_in_netns(
            self.runner.as_ref(),
            pid,
            &endpoint.container_veth,
            endpoint.address,
            endpoint.gateway,
        )?;
        tracing::info!(id = %endpoint.container_id, pid, ip = %endpoint.address, "endpoint moved into namespace");
        Ok(())
    }

    /// Deletes the veth pair, removes the container's firewall rules, and
    /// returns the address and names to the allocator. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`StockadeError::Teardown`] listing every step that failed.
    /// The reservation is kept until every step succeeds.
    pub fn release(&self, endpoint: &mut NetworkEndpoint) -> Result<()> {
        if endpoint.released {
            return Ok(());
        }
        let runner = self.runner.as_ref();
        let mut failures = Vec::new();
        if let Err(e) = link::delete_link(runner, &endpoint.host_veth) {
            failures.push(format!("delete {}: {e}", endpoint.host_veth));
        }
        let mut remaining = Vec::new();
        for rule in endpoint.rules.drain(..) {
            if let Err(e) = firewall::remove(runner, &rule) {
                failures.push(format!("remove {} {} rule: {e}", rule.table, rule.chain));
                remaining.push(rule);
            }
        }
        endpoint.rules = remaining;
        if failures.is_empty() {
            if let Err(e) = self.allocator.release(&endpoint.reservation) {
                failures.push(format!("release {}: {e}", endpoint.address));
            }
        }
        if !failures.is_empty() {
            return Err(StockadeError::Teardown {
                message: failures.join("; "),
            });
        }
        endpoint.released = true;
        tracing::info!(id = %endpoint.container_id, ip = %endpoint.address, "network endpoint released");
        Ok(())
    }
}
