//! Bridge and veth plumbing through `ip(8)`.

use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;
use stockade_common::error::Result;

use super::command::CommandRunner;

/// Returns whether a link with this name exists in the host namespace.
pub fn link_exists(runner: &dyn CommandRunner, name: &str) -> bool {
    runner.run("ip", &["link", "show", "dev", name]).is_ok()
}

/// Creates the bridge if needed, assigns the gateway address, and brings it up.
///
/// # Errors
///
/// Returns an error if any `ip` invocation fails.
pub fn ensure_bridge(runner: &dyn CommandRunner, name: &str, gateway: Ipv4Network) -> Result<()> {
    if !link_exists(runner, name) {
        let _ = runner.run("ip", &["link", "add", "name", name, "type", "bridge"])?;
        tracing::info!(bridge = name, "bridge created");
    }
    let addr = gateway.to_string();
    let _ = runner.run("ip", &["addr", "replace", &addr, "dev", name])?;
    let _ = runner.run("ip", &["link", "set", name, "up"])?;
    Ok(())
}

/// Creates a veth pair.
///
/// # Errors
///
/// Returns an error if the pair cannot be created.
pub fn create_veth_pair(runner: &dyn CommandRunner, host: &str, peer: &str) -> Result<()> {
    let _ = runner.run("ip", &["link", "add", host, "type", "veth", "peer", "name", peer])?;
    tracing::debug!(host, peer, "veth pair created");
    Ok(())
}

/// Enslaves an interface to a bridge and brings it up.
///
/// # Errors
///
/// Returns an error if either `ip` invocation fails.
pub fn attach_to_bridge(runner: &dyn CommandRunner, ifname: &str, bridge: &str) -> Result<()> {
    let _ = runner.run("ip", &["link", "set", ifname, "master", bridge])?;
    let _ = runner.run("ip", &["link", "set", ifname, "up"])?;
    Ok(())
}

/// Deletes a link if it exists. Deleting one end of a veth pair removes both.
///
/// # Errors
///
/// Returns an error if an existing link cannot be deleted.
pub fn delete_link(runner: &dyn CommandRunner, name: &str) -> Result<()> {
    if link_exists(runner, name) {
        let _ = runner.run("ip", &["link", "del", name])?;
        tracing::debug!(link = name, "link deleted");
    }
    Ok(())
}

/// Turns on IPv4 forwarding for the host.
///
/// # Errors
///
/// Returns an error if the sysctl cannot be written.
pub fn enable_ip_forward(runner: &dyn CommandRunner) -> Result<()> {
    let _ = runner.run("sysctl", &["-q", "-w", "net.ipv4.ip_forward=1"])?;
    Ok(())
}

/// Sends bridged IPv4 traffic through iptables so `FORWARD` rules also see
/// frames between two ports of the same bridge.
///
/// Loads `br_netfilter` first; the sysctl only exists once it is loaded.
///
/// # Errors
///
/// Returns an error if the sysctl cannot be set.
pub fn enable_bridge_filtering(runner: &dyn CommandRunner) -> Result<()> {
    if let Err(e) = runner.run("modprobe", &["br_netfilter"]) {
        tracing::debug!(error = %e, "cannot load br_netfilter, relying on the running kernel");
    }
    let _ = runner.run("sysctl", &["-q", "-w", "net.bridge.bridge-nf-call-iptables=1"])?;
    Ok(())
}

/// Moves `ifname` into the network namespace of `pid` and configures it
/// there: address, loopback, link up, default route.
///
/// # Errors
///
/// Returns an error if any step fails.
pub fn configure_in_netns(
    runner: &dyn CommandRunner,
    pid: u32,
    ifname: &str,
    address: Ipv4Network,
    gateway: Ipv4Addr,
) -> Result<()> {
    let pid = pid.to_string();
    let _ = runner.run("ip", &["link", "set", ifname, "netns", &pid])?;

    let addr = address.to_string();
    let gw = gateway.to_string();
    let in_ns = |args: &[&str]| -> Result<()> {
        let mut full = vec!["--target", pid.as_str(), "--net", "ip"];
        full.extend_from_slice(args);
        runner.run("nsenter", &full).map(|_| ())
    };
    in_ns(&["addr", "add", &addr, "dev", ifname])?;
    in_ns(&["link", "set", "lo", "up"])?;
    in_ns(&["link", "set", ifname, "up"])?;
    in_ns(&["route", "add", "default", "via", &gw])?;
    Ok(())
}
