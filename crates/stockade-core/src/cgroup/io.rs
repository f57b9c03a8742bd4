//! I/O resource control via cgroups v2.
//!
//! Manages `io.weight` and sums the per-device counters in `io.stat`.

use std::path::Path;

use stockade_common::error::Result;

use super::write_control;

/// Accepted I/O weight range.
pub const WEIGHT_RANGE: std::ops::RangeInclusive<u16> = 1..=1000;

/// Sets the default I/O weight for a cgroup.
///
/// # Errors
///
/// Returns an error if writing to `io.weight` fails.
pub fn set_io_weight(cgroup_path: &Path, weight: u16) -> Result<()> {
    write_control(cgroup_path, "io.weight", &format!("default {weight}"))?;
    tracing::debug!(weight, "I/O weight set");
    Ok(())
}

/// Sums `rbytes` and `wbytes` across every device line of `io.stat`.
#[must_use]
pub fn parse_io_stat(stat: &str) -> (u64, u64) {
    let mut read = 0u64;
    let mut written = 0u64;
    for field in stat.split_whitespace() {
        if let Some(v) = field.strip_prefix("rbytes=") {
            read = read.saturating_add(v.parse().unwrap_or(0));
        } else if let Some(v) = field.strip_prefix("wbytes=") {
            written = written.saturating_add(v.parse().unwrap_or(0));
        }
    }
    (read, written)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sums_bytes_across_devices() {
        let stat = "8:0 rbytes=1024 wbytes=2048 rios=1 wios=2 dbytes=0 dios=0\n\
                    259:0 rbytes=10 wbytes=20 rios=1 wios=1 dbytes=0 dios=0\n";
        assert_eq!(parse_io_stat(stat), (1034, 2068));
        assert_eq!(parse_io_stat(""), (0, 0));
    }

    #[test]
    fn weight_uses_default_key() {
        let dir = tempfile::tempdir().unwrap();
        set_io_weight(dir.path(), 250).unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("io.weight")).unwrap(),
            "default 250"
        );
    }
}
