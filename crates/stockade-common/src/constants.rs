//! System-wide constants and default paths.

use std::path::PathBuf;
use std::sync::OnceLock;

/// Default base directory for Stockade data on Linux with root access.
pub const SYSTEM_DATA_DIR: &str = "/var/lib/stockade";

/// Returns the data directory, preferring `/var/lib/stockade` when running
/// as root and `$HOME/.stockade` otherwise.
fn resolve_data_dir() -> PathBuf {
    let system = PathBuf::from(SYSTEM_DATA_DIR);
    if std::fs::create_dir_all(&system).is_ok() {
        return system;
    }
    if let Ok(home) = std::env::var("HOME") {
        let user_dir = PathBuf::from(home).join(".stockade");
        if std::fs::create_dir_all(&user_dir).is_ok() {
            return user_dir;
        }
    }
    system
}

static DATA_DIR: OnceLock<PathBuf> = OnceLock::new();

/// Returns the resolved data directory for this session.
pub fn data_dir() -> &'static PathBuf {
    DATA_DIR.get_or_init(resolve_data_dir)
}

/// Returns the default state index path.
pub fn default_state_file() -> PathBuf {
    data_dir().join("state.json")
}

/// Returns the default host-wide network lease file.
pub fn default_lease_file() -> PathBuf {
    data_dir().join("leases.json")
}

/// Returns the default directory holding per-container upper/work/merged dirs.
pub fn default_layers_dir() -> PathBuf {
    data_dir().join("containers")
}

/// Cgroups v2 unified hierarchy mount point.
pub const CGROUP_V2_PATH: &str = "/sys/fs/cgroup";

/// Name of the parent cgroup under which every container group is created.
pub const CGROUP_PARENT: &str = "stockade";

/// Default bridge name.
pub const DEFAULT_BRIDGE: &str = "stockade0";

/// Default bridge subnet.
pub const DEFAULT_SUBNET: &str = "172.30.0.0/24";

/// Default prefix for generated veth interface names.
pub const DEFAULT_VETH_PREFIX: &str = "stk";

/// Kernel limit on interface name length (`IFNAMSIZ` minus the NUL).
pub const MAX_IFNAME_LEN: usize = 15;

/// Prefix of the comment tag attached to every firewall rule.
pub const FIREWALL_TAG_PREFIX: &str = "stockade:";

/// Default CFS period in microseconds.
pub const DEFAULT_CPU_PERIOD_US: u64 = 100_000;

/// Smallest memory ceiling accepted by default (6 MiB).
pub const DEFAULT_MIN_MEMORY_BYTES: u64 = 6 * 1024 * 1024;

/// Smallest CPU quota accepted by default (1 ms).
pub const DEFAULT_MIN_CPU_QUOTA_US: u64 = 1_000;

/// Maximum container identifier length.
pub const MAX_ID_LEN: usize = 64;

/// `PATH` used for entrypoint lookup when the spec does not set one.
pub const DEFAULT_PATH_ENV: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Application name used in CLI output and state files.
pub const APP_NAME: &str = "stockade";
