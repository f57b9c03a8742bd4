//! CPU resource control via cgroups v2.
//!
//! Manages `cpu.max`, `cpu.weight`, and reads `cpu.stat`.

use std::path::Path;

use stockade_common::error::Result;

use super::write_control;

/// Smallest accepted cgroup v1 share value.
pub const MIN_SHARES: u64 = 2;
/// Largest accepted cgroup v1 share value.
pub const MAX_SHARES: u64 = 262_144;
/// Accepted CFS period range in microseconds.
pub const PERIOD_RANGE: std::ops::RangeInclusive<u64> = 1_000..=1_000_000;

/// Sets the CPU weight for a cgroup.
///
/// Weight is a value between 1 and 10000 that controls the relative
/// share of CPU time this cgroup receives under contention.
///
/// # Errors
///
/// Returns an error if writing to `cpu.weight` fails.
pub fn set_cpu_weight(cgroup_path: &Path, weight: u64) -> Result<()> {
    write_control(cgroup_path, "cpu.weight", &weight.to_string())?;
    tracing::debug!(weight, "CPU weight set");
    Ok(())
}

/// Sets the CPU bandwidth limit (max microseconds per period).
///
/// Writes `quota_us period_us` to `cpu.max`, where `quota_us` is the
/// maximum CPU time allowed per `period_us` window.
///
/// # Errors
///
/// Returns an error if writing to `cpu.max` fails.
pub fn set_cpu_max(cgroup_path: &Path, quota_us: u64, period_us: u64) -> Result<()> {
    write_control(cgroup_path, "cpu.max", &format!("{quota_us} {period_us}"))?;
    tracing::debug!(quota_us, period_us, "CPU max quota set");
    Ok(())
}

/// Converts cgroup v1 shares (2-262144) to a cgroup v2 weight (1-10000).
#[must_use]
pub const fn shares_to_weight(shares: u64) -> u64 {
    let clamped = if shares < MIN_SHARES {
        MIN_SHARES
    } else if shares > MAX_SHARES {
        MAX_SHARES
    } else {
        shares
    };
    1 + ((clamped - MIN_SHARES) * 9_999) / (MAX_SHARES - MIN_SHARES)
}

/// Extracts `usage_usec` from the contents of `cpu.stat`.
#[must_use]
pub fn parse_usage_usec(stat: &str) -> u64 {
    super::parse_keyed(stat, "usage_usec").unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shares_map_onto_weight_range() {
        assert_eq!(shares_to_weight(2), 1);
        assert_eq!(shares_to_weight(262_144), 10_000);
        assert_eq!(shares_to_weight(1024), 39);
        assert_eq!(shares_to_weight(0), 1);
    }

    #[test]
    fn reads_usage_from_cpu_stat() {
        let stat = "usage_usec 123456\nuser_usec 100000\nsystem_usec 23456\n";
        assert_eq!(parse_usage_usec(stat), 123_456);
        assert_eq!(parse_usage_usec(""), 0);
    }
}
