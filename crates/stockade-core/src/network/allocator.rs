//! IP address and veth name allocation.
//!
//! One [`AddressAllocator`] owns every bridge pool and the veth counter
//! behind a single lock, so concurrent creations can never receive the same
//! address or interface name. With a lease file the reservations are shared
//! by every runtime process on the host: each reservation and release runs
//! under an exclusive `flock(2)` on that file and rereads it first.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use ipnetwork::Ipv4Network;
use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};
use stockade_common::config::BridgeConfig;
use stockade_common::error::{Result, StockadeError};

/// An address and interface names held for one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    /// Bridge the address belongs to.
    pub bridge: String,
    /// Container address.
    pub ip: Ipv4Addr,
    /// Subnet prefix length.
    pub prefix: u8,
    /// Gateway address on the bridge.
    pub gateway: Ipv4Addr,
    /// Host-side veth name.
    pub host_veth: String,
    /// Container-side veth name.
    pub container_veth: String,
    veth_index: u32,
}

impl Reservation {
    /// Returns the container address with its subnet prefix.
    #[must_use]
    pub fn cidr(&self) -> Ipv4Network {
        Ipv4Network::new(self.ip, self.prefix).unwrap_or_else(|_| Ipv4Network::from(self.ip))
    }
}

#[derive(Debug)]
struct Pool {
    bridge: BridgeConfig,
    in_use: BTreeSet<u32>,
    cursor: u32,
}

impl Pool {
    fn next_free(&mut self) -> Option<u32> {
        let (start, end) = self.bridge.pool_bounds();
        if start > end {
            return None;
        }
        let cursor = self.cursor.clamp(start, end);
        let found = (cursor..=end)
            .chain(start..cursor)
            .find(|addr| !self.in_use.contains(addr))?;
        self.cursor = if found == end { start } else { found + 1 };
        Some(found)
    }

    fn check_static(&self, requested: Ipv4Network) -> Result<u32> {
        let ip = requested.ip();
        let subnet = self.bridge.subnet;
        let addr = u32::from(ip);
        let reserved = [
            u32::from(subnet.network()),
            u32::from(subnet.broadcast()),
            u32::from(self.bridge.gateway()),
        ];
        if !subnet.contains(ip) || reserved.contains(&addr) {
            return Err(StockadeError::NetworkAllocation {
                message: format!(
                    "static IP {ip} is not a usable address of bridge {} ({subnet})",
                    self.bridge.name
                ),
            });
        }
        if self.in_use.contains(&addr) {
            return Err(StockadeError::NetworkAllocation {
                message: format!("static IP {ip} is already in use"),
            });
        }
        Ok(addr)
    }
}

#[derive(Debug, Default)]
struct State {
    pools: HashMap<String, Pool>,
    veths_in_use: HashSet<u32>,
    next_veth: u32,
}

impl State {
    /// Replaces the in-memory view with the persisted leases.
    fn load(&mut self, leases: &Leases) {
        for (name, pool) in &mut self.pools {
            pool.in_use = leases
                .addresses
                .get(name)
                .map(|held| held.iter().map(|ip| u32::from(*ip)).collect())
                .unwrap_or_default();
            if let Some(cursor) = leases.cursors.get(name) {
                pool.cursor = u32::from(*cursor);
            }
        }
        self.veths_in_use = leases.veths.iter().copied().collect();
        self.next_veth = leases.next_veth;
    }

    /// Writes the pools back over `leases`, keeping entries for bridges
    /// this process does not know about.
    fn store(&self, leases: &mut Leases) {
        for (name, pool) in &self.pools {
            let held: BTreeSet<Ipv4Addr> = pool.in_use.iter().map(|addr| Ipv4Addr::from(*addr)).collect();
            if held.is_empty() {
                let _ = leases.addresses.remove(name);
            } else {
                let _ = leases.addresses.insert(name.clone(), held);
            }
            let _ = leases.cursors.insert(name.clone(), Ipv4Addr::from(pool.cursor));
        }
        leases.veths = self.veths_in_use.iter().copied().collect();
        leases.next_veth = self.next_veth;
    }
}

/// Reservations as kept in the lease file.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct Leases {
    addresses: BTreeMap<String, BTreeSet<Ipv4Addr>>,
    cursors: BTreeMap<String, Ipv4Addr>,
    veths: BTreeSet<u32>,
    next_veth: u32,
}

/// The lease file, locked exclusively until dropped.
struct LeaseFile<'a> {
    path: &'a Path,
    file: Flock<File>,
}

impl<'a> LeaseFile<'a> {
    fn lock(path: &'a Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| lease_error(path, &e))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| lease_error(path, &e))?;
        let file = Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, e)| lease_error(path, &e))?;
        Ok(Self { path, file })
    }

    fn read(&mut self) -> Result<Leases> {
        let mut text = String::new();
        let _ = self
            .file
            .seek(SeekFrom::Start(0))
            .and_then(|_| self.file.read_to_string(&mut text))
            .map_err(|e| lease_error(self.path, &e))?;
        if text.trim().is_empty() {
            return Ok(Leases::default());
        }
        serde_json::from_str(&text).map_err(|e| lease_error(self.path, &e))
    }

    fn write(&mut self, leases: &Leases) -> Result<()> {
        let text = serde_json::to_vec_pretty(leases).map_err(|e| lease_error(self.path, &e))?;
        self.file
            .set_len(0)
            .and_then(|()| self.file.seek(SeekFrom::Start(0)))
            .and_then(|_| self.file.write_all(&text))
            .and_then(|()| self.file.sync_data())
            .map_err(|e| lease_error(self.path, &e))
    }
}

fn lease_error(path: &Path, e: &dyn std::fmt::Display) -> StockadeError {
    StockadeError::NetworkAllocation {
        message: format!("lease file {}: {e}", path.display()),
    }
}

/// Hands out unique addresses and veth name pairs across all bridges.
#[derive(Debug)]
pub struct AddressAllocator {
    veth_prefix: String,
    lease_file: Option<PathBuf>,
    state: Mutex<State>,
}

impl AddressAllocator {
    /// Creates an allocator with one pool per configured bridge.
    #[must_use]
    pub fn new(bridges: &[BridgeConfig], veth_prefix: impl Into<String>) -> Self {
        let pools = bridges
            .iter()
            .map(|bridge| {
                let (start, _) = bridge.pool_bounds();
                let pool = Pool {
                    bridge: bridge.clone(),
                    in_use: BTreeSet::new(),
                    cursor: start,
                };
                (bridge.name.clone(), pool)
            })
            .collect();
        Self {
            veth_prefix: veth_prefix.into(),
            lease_file: None,
            state: Mutex::new(State {
                pools,
                ..State::default()
            }),
        }
    }

    /// Shares reservations with every allocator using the same `path`.
    #[must_use]
    pub fn with_lease_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.lease_file = Some(path.into());
        self
    }

    /// Reserves an address on `bridge` plus a fresh veth name pair.
    ///
    /// With `static_ip` set, exactly that address is reserved.
    ///
    /// # Errors
    ///
    /// Returns [`StockadeError::NetworkAllocation`] for an unknown bridge, an
    /// exhausted pool, an unusable or taken static address, or an unreadable
    /// lease file.
    pub fn reserve(&self, bridge: &str, static_ip: Option<Ipv4Network>) -> Result<Reservation> {
        let reservation = self.transact(|state| {
            let veth_index = next_veth_index(state)?;
            let pool = state
                .pools
                .get_mut(bridge)
                .ok_or_else(|| StockadeError::NetworkAllocation {
                    message: format!("unknown bridge {bridge}"),
                })?;

            let addr = match static_ip {
                Some(requested) => pool.check_static(requested)?,
                None => pool.next_free().ok_or_else(|| StockadeError::NetworkAllocation {
                    message: format!("address pool of bridge {bridge} is exhausted"),
                })?,
            };
            let _ = pool.in_use.insert(addr);
            let reservation = Reservation {
                bridge: bridge.to_owned(),
                ip: Ipv4Addr::from(addr),
                prefix: pool.bridge.subnet.prefix(),
                gateway: pool.bridge.gateway(),
                host_veth: format!("{}{veth_index}h", self.veth_prefix),
                container_veth: format!("{}{veth_index}c", self.veth_prefix),
                veth_index,
            };
            let _ = state.veths_in_use.insert(veth_index);
            Ok(reservation)
        })?;
        tracing::debug!(bridge, ip = %reservation.ip, veth = %reservation.host_veth, "address reserved");
        Ok(reservation)
    }

    /// Returns a reservation's address and names to the pools.
    ///
    /// # Errors
    ///
    /// Returns [`StockadeError::NetworkAllocation`] if the lease file cannot
    /// be updated; the lease is then still held.
    pub fn release(&self, reservation: &Reservation) -> Result<()> {
        self.transact(|state| {
            let _ = state.veths_in_use.remove(&reservation.veth_index);
            if let Some(pool) = state.pools.get_mut(&reservation.bridge) {
                let _ = pool.in_use.remove(&u32::from(reservation.ip));
            }
            Ok(())
        })?;
        tracing::debug!(ip = %reservation.ip, "address released");
        Ok(())
    }

    /// Returns how many addresses of `bridge` are held.
    ///
    /// # Errors
    ///
    /// Returns [`StockadeError::NetworkAllocation`] if the lease file cannot
    /// be read.
    pub fn reserved_count(&self, bridge: &str) -> Result<usize> {
        self.transact(|state| Ok(state.pools.get(bridge).map_or(0, |pool| pool.in_use.len())))
    }

    /// Runs `op` on the current reservations. With a lease file, the file is
    /// locked, loaded before `op`, and rewritten after it succeeds.
    fn transact<T>(&self, op: impl FnOnce(&mut State) -> Result<T>) -> Result<T> {
        let mut state = self.lock();
        let Some(path) = &self.lease_file else {
            return op(&mut state);
        };
        let mut file = LeaseFile::lock(path)?;
        let mut leases = file.read()?;
        state.load(&leases);
        let out = op(&mut state)?;
        state.store(&mut leases);
        file.write(&leases)?;
        Ok(out)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn next_veth_index(state: &mut State) -> Result<u32> {
    let start = state.next_veth;
    let mut candidate = start;
    loop {
        if !state.veths_in_use.contains(&candidate) {
            state.next_veth = candidate.wrapping_add(1);
            return Ok(candidate);
        }
        candidate = candidate.wrapping_add(1);
        if candidate == start {
            return Err(StockadeError::NetworkAllocation {
                message: "no veth names left".into(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn small_bridge() -> BridgeConfig {
        BridgeConfig::new("br-test", "10.8.0.0/24".parse().unwrap())
            .with_range(Ipv4Addr::new(10, 8, 0, 10), Ipv4Addr::new(10, 8, 0, 12))
    }

    #[test]
    fn reservations_are_unique_until_exhausted() {
        let alloc = AddressAllocator::new(&[small_bridge()], "stk");
        let a = alloc.reserve("br-test", None).unwrap();
        let b = alloc.reserve("br-test", None).unwrap();
        let c = alloc.reserve("br-test", None).unwrap();
        assert_eq!(a.ip, Ipv4Addr::new(10, 8, 0, 10));
        assert_ne!(a.ip, b.ip);
        assert_ne!(b.ip, c.ip);
        assert_ne!(a.host_veth, b.host_veth);
        assert_eq!(a.gateway, Ipv4Addr::new(10, 8, 0, 1));
        assert_eq!(a.cidr().to_string(), "10.8.0.10/24");

        let err = alloc.reserve("br-test", None).unwrap_err();
        assert!(matches!(err, StockadeError::NetworkAllocation { .. }));

        alloc.release(&b).unwrap();
        let d = alloc.reserve("br-test", None).unwrap();
        assert_eq!(d.ip, b.ip);
    }

    #[test]
    fn veth_names_fit_interface_limit() {
        let alloc = AddressAllocator::new(&[small_bridge()], "stkx");
        let r = alloc.reserve("br-test", None).unwrap();
        assert_eq!(r.host_veth, "stkx0h");
        assert_eq!(r.container_veth, "stkx0c");
        let longest = format!("stkx{}h", u32::MAX);
        assert!(longest.len() <= stockade_common::constants::MAX_IFNAME_LEN);
    }

    #[test]
    fn static_ip_must_be_free_and_inside_subnet() {
        let alloc = AddressAllocator::new(&[small_bridge()], "stk");
        let r = alloc
            .reserve("br-test", Some("10.8.0.50/24".parse().unwrap()))
            .unwrap();
        assert_eq!(r.ip, Ipv4Addr::new(10, 8, 0, 50));
        assert!(alloc.reserve("br-test", Some("10.8.0.50/24".parse().unwrap())).is_err());
        assert!(alloc.reserve("br-test", Some("10.9.0.5/24".parse().unwrap())).is_err());
        assert!(alloc.reserve("br-test", Some("10.8.0.1/24".parse().unwrap())).is_err());
    }

    #[test]
    fn unknown_bridge_is_rejected() {
        let alloc = AddressAllocator::new(&[small_bridge()], "stk");
        assert!(alloc.reserve("nope", None).is_err());
    }

    #[test]
    fn concurrent_reservations_never_collide() {
        let bridge = BridgeConfig::new("br-wide", "10.20.0.0/16".parse().unwrap());
        let alloc = Arc::new(AddressAllocator::new(&[bridge], "stk"));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let alloc = Arc::clone(&alloc);
                std::thread::spawn(move || {
                    (0..50)
                        .map(|_| alloc.reserve("br-wide", None).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let all: Vec<Reservation> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let ips: HashSet<_> = all.iter().map(|r| r.ip).collect();
        let names: HashSet<_> = all.iter().map(|r| r.host_veth.clone()).collect();
        assert_eq!(ips.len(), 400);
        assert_eq!(names.len(), 400);
        assert_eq!(alloc.reserved_count("br-wide").unwrap(), 400);
    }

    #[test]
    fn allocators_sharing_a_lease_file_never_collide() {
        let dir = tempfile::tempdir().unwrap();
        let leases = dir.path().join("run/leases.json");
        let first = AddressAllocator::new(&[small_bridge()], "stk").with_lease_file(&leases);
        let second = AddressAllocator::new(&[small_bridge()], "stk").with_lease_file(&leases);

        let a = first.reserve("br-test", None).unwrap();
        let b = second.reserve("br-test", None).unwrap();
        assert_ne!(a.ip, b.ip);
        assert_ne!(a.host_veth, b.host_veth);
        assert!(second.reserve("br-test", Some(a.cidr())).is_err());
        assert_eq!(first.reserved_count("br-test").unwrap(), 2);

        first.release(&a).unwrap();
        assert_eq!(second.reserved_count("br-test").unwrap(), 1);
        let c = second.reserve("br-test", Some(a.cidr())).unwrap();
        assert_eq!(c.ip, a.ip);
    }

    #[test]
    fn lease_file_keeps_unknown_bridges() {
        let dir = tempfile::tempdir().unwrap();
        let leases = dir.path().join("leases.json");
        let other = BridgeConfig::new("br-other", "10.9.0.0/24".parse().unwrap());
        let wide = AddressAllocator::new(&[small_bridge(), other], "stk").with_lease_file(&leases);
        let narrow = AddressAllocator::new(&[small_bridge()], "stk").with_lease_file(&leases);

        let kept = wide.reserve("br-other", None).unwrap();
        let _ = narrow.reserve("br-test", None).unwrap();
        assert_eq!(wide.reserved_count("br-other").unwrap(), 1);
        let next = wide.reserve("br-other", None).unwrap();
        assert_ne!(next.ip, kept.ip);
        assert_ne!(next.host_veth, kept.host_veth);
    }

    #[test]
    fn corrupt_lease_file_is_an_allocation_error() {
        let dir = tempfile::tempdir().unwrap();
        let leases = dir.path().join("leases.json");
        std::fs::write(&leases, "{ not json").unwrap();
        let alloc = AddressAllocator::new(&[small_bridge()], "stk").with_lease_file(&leases);
        assert!(matches!(
            alloc.reserve("br-test", None),
            Err(StockadeError::NetworkAllocation { .. })
        ));
    }

    #[test]
    fn concurrent_allocators_on_one_lease_file() {
        let dir = tempfile::tempdir().unwrap();
        let leases = dir.path().join("leases.json");
        let bridge = BridgeConfig::new("br-wide", "10.20.0.0/16".parse().unwrap());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let alloc = AddressAllocator::new(std::slice::from_ref(&bridge), "stk").with_lease_file(&leases);
                std::thread::spawn(move || {
                    (0..25)
                        .map(|_| alloc.reserve("br-wide", None).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let all: Vec<Reservation> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let ips: HashSet<_> = all.iter().map(|r| r.ip).collect();
        let names: HashSet<_> = all.iter().map(|r| r.host_veth.clone()).collect();
        assert_eq!(ips.len(), 100);
        assert_eq!(names.len(), 100);
    }
}
