//! Runtime configuration for the Stockade host runtime.
//!
//! Every field has a default so an empty file (or no file at all) yields a
//! working single-bridge setup.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};

use crate::constants;
use crate::error::{Result, StockadeError};

/// Root configuration for the Stockade runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Base directory for Stockade state and data.
    pub data_dir: PathBuf,
    /// Path to the JSON state index.
    pub state_file: PathBuf,
    /// Address and veth leases shared by every runtime process on the host.
    pub lease_file: PathBuf,
    /// Directory holding each container's upper, work, and merged dirs.
    pub layers_dir: PathBuf,
    /// Cgroup placement and limit policy.
    pub cgroup: CgroupConfig,
    /// Bridge pools and firewall policy.
    pub network: NetworkConfig,
    /// UID/GID mapping used when a user namespace is requested.
    pub id_map: IdMapConfig,
    /// Seconds `stop` waits after the first signal before sending `SIGKILL`.
    pub stop_timeout_secs: u64,
    /// Upper bound on container creation, after which it is cancelled.
    pub create_timeout_secs: Option<u64>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            data_dir: constants::data_dir().clone(),
            state_file: constants::default_state_file(),
            lease_file: constants::default_lease_file(),
            layers_dir: constants::default_layers_dir(),
            cgroup: CgroupConfig::default(),
            network: NetworkConfig::default(),
            id_map: IdMapConfig::default(),
            stop_timeout_secs: 10,
            create_timeout_secs: None,
        }
    }
}

impl RuntimeConfig {
    /// Loads a configuration file, filling unset fields with defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if the
    /// resulting configuration is inconsistent.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| StockadeError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: Self = serde_yaml::from_str(&text).map_err(|e| StockadeError::Config {
            message: format!("cannot parse {}: {e}", path.display()),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field consistency.
    ///
    /// # Errors
    ///
    /// Returns [`StockadeError::Config`] describing the first problem.
    pub fn validate(&self) -> Result<()> {
        let prefix = &self.network.veth_prefix;
        if prefix.is_empty() || prefix.len() > 4 || !prefix.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(StockadeError::Config {
                message: format!("veth_prefix must be 1-4 alphanumeric characters, got {prefix:?}"),
            });
        }
        for bridge in &self.network.bridges {
            bridge.validate()?;
        }
        if self.id_map.size == 0 {
            return Err(StockadeError::Config {
                message: "id_map.size must be positive".into(),
            });
        }
        Ok(())
    }
}

/// Cgroup placement and validation floors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CgroupConfig {
    /// Mount point of the cgroup v2 hierarchy.
    pub root: PathBuf,
    /// Parent group, relative to `root`, holding every container group.
    pub parent: String,
    /// Smallest accepted memory ceiling in bytes.
    pub min_memory_bytes: u64,
    /// Smallest accepted CPU quota in microseconds.
    pub min_cpu_quota_us: u64,
    /// CPU period used when the spec sets a quota but no period.
    pub default_cpu_period_us: u64,
}

impl Default for CgroupConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(constants::CGROUP_V2_PATH),
            parent: constants::CGROUP_PARENT.into(),
            min_memory_bytes: constants::DEFAULT_MIN_MEMORY_BYTES,
            min_cpu_quota_us: constants::DEFAULT_MIN_CPU_QUOTA_US,
            default_cpu_period_us: constants::DEFAULT_CPU_PERIOD_US,
        }
    }
}

/// Host-local networking policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Bridges containers may attach to, each with its own address pool.
    pub bridges: Vec<BridgeConfig>,
    /// Prefix of generated veth names.
    pub veth_prefix: String,
    /// Interface NAT traffic leaves through; any non-bridge interface if unset.
    pub egress_interface: Option<String>,
    /// Whether containers on the same bridge may reach each other.
    pub allow_inter_container: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bridges: vec![BridgeConfig::default()],
            veth_prefix: constants::DEFAULT_VETH_PREFIX.into(),
            egress_interface: None,
            allow_inter_container: false,
        }
    }
}

/// One bridge and its address pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Bridge interface name.
    pub name: String,
    /// Subnet; its first host address is the gateway on the bridge.
    pub subnet: Ipv4Network,
    /// First pool address; defaults to the host after the gateway.
    #[serde(default)]
    pub range_start: Option<Ipv4Addr>,
    /// Last pool address; defaults to the host before broadcast.
    #[serde(default)]
    pub range_end: Option<Ipv4Addr>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            name: constants::DEFAULT_BRIDGE.into(),
            subnet: Ipv4Network::new(Ipv4Addr::new(172, 30, 0, 0), 24)
                .unwrap_or_else(|_| Ipv4Network::from(Ipv4Addr::new(172, 30, 0, 0))),
            range_start: None,
            range_end: None,
        }
    }
}

impl BridgeConfig {
    /// Creates a bridge config covering the whole subnet.
    #[must_use]
    pub fn new(name: impl Into<String>, subnet: Ipv4Network) -> Self {
        Self {
            name: name.into(),
            subnet,
            range_start: None,
            range_end: None,
        }
    }

    /// Restricts the pool to `start..=end`.
    #[must_use]
    pub const fn with_range(mut self, start: Ipv4Addr, end: Ipv4Addr) -> Self {
        self.range_start = Some(start);
        self.range_end = Some(end);
        self
    }

    /// Returns the gateway address assigned to the bridge itself.
    #[must_use]
    pub fn gateway(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.subnet.network()).saturating_add(1))
    }

    /// Returns the inclusive pool bounds as integers.
    #[must_use]
    pub fn pool_bounds(&self) -> (u32, u32) {
        let network = u32::from(self.subnet.network());
        let broadcast = u32::from(self.subnet.broadcast());
        let start = self
            .range_start
            .map_or(network.saturating_add(2), u32::from);
        let end = self
            .range_end
            .map_or(broadcast.saturating_sub(1), u32::from);
        (start, end)
    }

    /// Checks that the pool lies inside the subnet and excludes the gateway.
    ///
    /// # Errors
    ///
    /// Returns [`StockadeError::Config`] if the bridge cannot host containers.
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: String| Err(StockadeError::Config { message });
        if self.name.is_empty() || self.name.len() > constants::MAX_IFNAME_LEN {
            return invalid(format!("bridge name {:?} is not a valid interface name", self.name));
        }
        if self.subnet.prefix() > 30 {
            return invalid(format!("bridge {} subnet {} is too small", self.name, self.subnet));
        }
        let (start, end) = self.pool_bounds();
        let network = u32::from(self.subnet.network());
        let broadcast = u32::from(self.subnet.broadcast());
        let gateway = u32::from(self.gateway());
        if start > end || start <= network || end >= broadcast || (start..=end).contains(&gateway) {
            return invalid(format!(
                "bridge {} pool {}-{} must lie inside {} and exclude the gateway",
                self.name,
                Ipv4Addr::from(start),
                Ipv4Addr::from(end),
                self.subnet
            ));
        }
        Ok(())
    }
}

/// Mapping from container root to an unprivileged host id range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdMapConfig {
    /// First host UID mapped to container UID 0.
    pub host_uid: u32,
    /// First host GID mapped to container GID 0.
    pub host_gid: u32,
    /// Number of consecutive ids mapped.
    pub size: u32,
}

impl Default for IdMapConfig {
    fn default() -> Self {
        Self {
            host_uid: 100_000,
            host_gid: 100_000,
            size: 65_536,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        RuntimeConfig::default().validate().unwrap();
    }

    #[test]
    fn default_bridge_pool_excludes_gateway_and_broadcast() {
        let bridge = BridgeConfig::default();
        assert_eq!(bridge.gateway(), Ipv4Addr::new(172, 30, 0, 1));
        let (start, end) = bridge.pool_bounds();
        assert_eq!(Ipv4Addr::from(start), Ipv4Addr::new(172, 30, 0, 2));
        assert_eq!(Ipv4Addr::from(end), Ipv4Addr::new(172, 30, 0, 254));
    }

    #[test]
    fn pool_covering_gateway_is_rejected() {
        let bridge = BridgeConfig::new("br0", "10.1.0.0/24".parse().unwrap())
            .with_range(Ipv4Addr::new(10, 1, 0, 1), Ipv4Addr::new(10, 1, 0, 9));
        assert!(bridge.validate().is_err());
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "stop_timeout_secs: 3\nnetwork:\n  bridges:\n    - name: br-test\n      subnet: 10.9.0.0/29\n",
        )
        .unwrap();
        let config = RuntimeConfig::load(&path).unwrap();
        assert_eq!(config.stop_timeout_secs, 3);
        assert_eq!(config.network.bridges[0].name, "br-test");
        assert_eq!(config.network.veth_prefix, constants::DEFAULT_VETH_PREFIX);
        assert_eq!(config.cgroup.parent, constants::CGROUP_PARENT);
    }

    #[test]
    fn long_veth_prefix_is_rejected() {
        let mut config = RuntimeConfig::default();
        config.network.veth_prefix = "toolong".into();
        assert!(config.validate().is_err());
    }
}
