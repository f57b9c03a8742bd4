//! UTS namespace isolation.
//!
//! Allows the container to have its own hostname.

/// Sets the hostname inside the caller's UTS namespace.
///
/// Called from the cloned child, so it does not log.
///
/// # Errors
///
/// Returns the errno of the failed `sethostname(2)`.
pub fn set_hostname(hostname: &str) -> nix::Result<()> {
    nix::unistd::sethostname(hostname)
}
