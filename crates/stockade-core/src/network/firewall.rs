//! iptables rules for container egress and isolation.
//!
//! Every rule carries a `stockade:<id>` comment so it can be found and
//! removed per container.

use std::net::Ipv4Addr;

use stockade_common::constants::FIREWALL_TAG_PREFIX;
use stockade_common::error::Result;

use super::command::CommandRunner;

/// One iptables rule owned by a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallRule {
    /// Table (`nat` or `filter`).
    pub table: &'static str,
    /// Built-in chain.
    pub chain: &'static str,
    /// Match and target arguments, including the comment tag.
    pub args: Vec<String>,
}

impl FirewallRule {
    fn tagged(table: &'static str, chain: &'static str, tag: &str, args: &[&str]) -> Self {
        let mut args: Vec<String> = args.iter().map(|a| (*a).to_owned()).collect();
        args.extend(["-m", "comment", "--comment", tag].map(str::to_owned));
        Self { table, chain, args }
    }

    /// Returns the comment tag identifying the owning container.
    #[must_use]
    pub fn tag(&self) -> Option<&str> {
        self.args
            .windows(2)
            .find(|w| w[0] == "--comment")
            .map(|w| w[1].as_str())
    }

    fn command<'a>(&'a self, op: &'a str) -> Vec<&'a str> {
        let mut cmd = vec!["-t", self.table, op, self.chain];
        cmd.extend(self.args.iter().map(String::as_str));
        cmd
    }
}

/// Builds the rules a container on `bridge` with address `ip` needs.
#[must_use]
pub fn container_rules(
    id: &str,
    ip: Ipv4Addr,
    bridge: &str,
    egress: Option<&str>,
    allow_inter_container: bool,
) -> Vec<FirewallRule> {
    let tag = format!("{FIREWALL_TAG_PREFIX}{id}");
    let source = format!("{ip}/32");
    let out: Vec<&str> = match egress {
        Some(iface) => vec!["-o", iface],
        None => vec!["!", "-o", bridge],
    };

    let mut masquerade = vec!["-s", source.as_str()];
    masquerade.extend(&out);
    masquerade.extend(["-j", "MASQUERADE"]);

    let mut forward_out = vec!["-i", bridge, "-s", source.as_str()];
    forward_out.extend(&out);
    forward_out.extend(["-j", "ACCEPT"]);

    let forward_back = [
        "-o", bridge, "-d", source.as_str(), "-m", "conntrack", "--ctstate",
        "RELATED,ESTABLISHED", "-j", "ACCEPT",
    ];

    let mut rules = vec![
        FirewallRule::tagged("nat", "POSTROUTING", &tag, &masquerade),
        FirewallRule::tagged("filter", "FORWARD", &tag, &forward_out),
        FirewallRule::tagged("filter", "FORWARD", &tag, &forward_back),
    ];
    if !allow_inter_container {
        rules.push(FirewallRule::tagged(
            "filter",
            "FORWARD",
            &tag,
            &["-i", bridge, "-o", bridge, "-s", source.as_str(), "-j", "DROP"],
        ));
    }
    rules
}

/// Installs a rule. NAT rules are appended; filter rules are inserted first
/// in the chain so they take effect ahead of host policy.
///
/// # Errors
///
/// Returns an error if iptables rejects the rule.
pub fn install(runner: &dyn CommandRunner, rule: &FirewallRule) -> Result<()> {
    let op = if rule.table == "nat" { "-A" } else { "-I" };
    let _ = runner.run("iptables", &rule.command(op))?;
    tracing::debug!(table = rule.table, chain = rule.chain, "firewall rule installed");
    Ok(())
}

/// Removes a rule if it is still present. Returns whether it was removed.
///
/// # Errors
///
/// Returns an error if an existing rule cannot be deleted.
pub fn remove(runner: &dyn CommandRunner, rule: &FirewallRule) -> Result<bool> {
    if runner.run("iptables", &rule.command("-C")).is_err() {
        return Ok(false);
    }
    let _ = runner.run("iptables", &rule.command("-D"))?;
    tracing::debug!(table = rule.table, chain = rule.chain, "firewall rule removed");
    Ok(true)
}
