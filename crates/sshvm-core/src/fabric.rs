//! Host network fabric: the shared bridge, per-VM TAP devices, IPv4
//! forwarding, and the tagged packet-filter rule set.
//!
//! Everything here is idempotent: a restart after a crash must succeed
//! even when the bridge, forward bit, rules, or stale TAPs are still around.

use std::net::Ipv4Addr;
use std::process::{Command, Stdio};

use anyhow::{bail, Context, Result};
use ipnetwork::Ipv4Network;
use tracing::{debug, info, warn};

/// Comment tag attached to every packet-filter rule this process installs.
/// Teardown is a filter on this tag.
pub const RULE_TAG: &str = "ssh-hypervisor";

pub struct NetworkFabric {
    bridge: String,
    network: Ipv4Network,
    gateway: Ipv4Addr,
}

impl NetworkFabric {
    pub fn new(bridge: impl Into<String>, network: Ipv4Network, gateway: Ipv4Addr) -> Self {
        Self {
            bridge: bridge.into(),
            network,
            gateway,
        }
    }

    pub fn bridge(&self) -> &str {
        &self.bridge
    }

    /// Bring up the shared fabric. Safe to call on a host that already has
    /// leftovers from a previous run.
    pub fn setup(&self) -> Result<()> {
        // Drop rules a crashed predecessor left behind before reinstalling.
        self.remove_tagged_rules();
        self.ensure_bridge()?;
        enable_ip_forward()?;
        self.install_rules()?;
        info!(bridge = %self.bridge, network = %self.network, "host network fabric ready");
        Ok(())
    }

    /// Remove every rule carrying [`RULE_TAG`]. The bridge and the forward
    /// sysctl are left in place; re-creating them is cheap and idempotent.
    pub fn teardown(&self) {
        self.remove_tagged_rules();
        info!("removed tagged packet-filter rules");
    }

    fn ensure_bridge(&self) -> Result<()> {
        if link_exists(&self.bridge) {
            debug!(bridge = %self.bridge, "bridge already exists, skipping creation");
            return Ok(());
        }

        let addr = format!("{}/{}", self.gateway, self.network.prefix());
        run("ip", &["link", "add", &self.bridge, "type", "bridge"])
            .with_context(|| format!("create bridge {}", self.bridge))?;
        run("ip", &["addr", "add", &addr, "dev", &self.bridge])
            .with_context(|| format!("assign {addr} to {}", self.bridge))?;
        run("ip", &["link", "set", &self.bridge, "up"])
            .with_context(|| format!("bring up {}", self.bridge))?;

        info!(bridge = %self.bridge, %addr, "created VM bridge");
        Ok(())
    }

    fn install_rules(&self) -> Result<()> {
        for spec in self.forward_rules() {
            install_rule("filter", "FORWARD", &spec)?;
        }
        install_rule("nat", "POSTROUTING", &self.masquerade_rule())?;
        Ok(())
    }

    /// FORWARD accepts for traffic crossing the bridge boundary, both ways.
    fn forward_rules(&self) -> [Vec<String>; 2] {
        [
            args(&[
                "-i", &self.bridge, "!", "-o", &self.bridge, "-j", "ACCEPT", "-m", "comment",
                "--comment", RULE_TAG,
            ]),
            args(&[
                "!", "-i", &self.bridge, "-o", &self.bridge, "-j", "ACCEPT", "-m", "comment",
                "--comment", RULE_TAG,
            ]),
        ]
    }

    /// NAT for guest traffic leaving the host.
    fn masquerade_rule(&self) -> Vec<String> {
        args(&[
            "-s",
            &self.network.to_string(),
            "!",
            "-o",
            &self.bridge,
            "-j",
            "MASQUERADE",
            "-m",
            "comment",
            "--comment",
            RULE_TAG,
        ])
    }

    fn remove_tagged_rules(&self) {
        for (table, chain) in [("filter", "FORWARD"), ("nat", "POSTROUTING")] {
            if let Err(e) = remove_tagged_chain_rules(table, chain) {
                warn!(table, chain, error = %e, "could not clean tagged rules");
            }
        }
    }

    /// Create a TAP device, attach it to the bridge, bring it up.
    /// A stale device with the same name (prior crashed process) is deleted
    /// first so the name is always reusable.
    pub fn create_tap(&self, tap: &str) -> Result<()> {
        if link_exists(tap) {
            warn!(%tap, "stale TAP device found, deleting");
            run("ip", &["link", "del", tap]).with_context(|| format!("delete stale TAP {tap}"))?;
        }

        run("ip", &["tuntap", "add", "dev", tap, "mode", "tap"])
            .with_context(|| format!("create TAP {tap}"))?;

        // The device exists from here on; do not leak it on a failed attach.
        let attached = run("ip", &["link", "set", tap, "master", &self.bridge])
            .with_context(|| format!("attach {tap} to {}", self.bridge))
            .and_then(|_| run("ip", &["link", "set", tap, "up"]).with_context(|| format!("bring up {tap}")));
        if let Err(e) = attached {
            self.delete_tap(tap);
            return Err(e);
        }

        debug!(%tap, bridge = %self.bridge, "TAP device ready");
        Ok(())
    }

    /// Best-effort delete; a missing device is fine.
    pub fn delete_tap(&self, tap: &str) {
        let _ = run("ip", &["link", "del", tap]);
    }
}

/// Host offset of `ip` within `network`, as a 16-bit value. Names the TAP
/// device and seeds the guest MAC, so it must be unique per live VM; that
/// holds for any CIDR with a prefix of /16 or longer.
pub fn host_index(network: Ipv4Network, ip: Ipv4Addr) -> u16 {
    (u32::from(ip).wrapping_sub(u32::from(network.network())) & 0xffff) as u16
}

pub fn tap_name(index: u16) -> String {
    format!("sshvm-tap-{index}")
}

pub fn mac_address(index: u16) -> String {
    format!("02:FC:00:00:{:02X}:{:02X}", index >> 8, index & 0xff)
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

fn enable_ip_forward() -> Result<()> {
    std::fs::write("/proc/sys/net/ipv4/ip_forward", "1\n").context("enable net.ipv4.ip_forward")?;
    Ok(())
}

fn link_exists(name: &str) -> bool {
    Command::new("ip")
        .args(["link", "show", name])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Append a rule unless an identical one is already present.
fn install_rule(table: &str, chain: &str, spec: &[String]) -> Result<()> {
    let exists = Command::new("iptables")
        .args(["-t", table, "-C", chain])
        .args(spec)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false);
    if exists {
        return Ok(());
    }

    let status = Command::new("iptables")
        .args(["-t", table, "-A", chain])
        .args(spec)
        .status()
        .with_context(|| format!("spawn iptables -t {table} -A {chain}"))?;
    if !status.success() {
        bail!("iptables -t {table} -A {chain} {} failed", spec.join(" "));
    }
    Ok(())
}

fn remove_tagged_chain_rules(table: &str, chain: &str) -> Result<()> {
    let out = Command::new("iptables")
        .args(["-t", table, "-S", chain])
        .output()
        .with_context(|| format!("list {table}/{chain} rules"))?;
    if !out.status.success() {
        bail!("iptables -t {table} -S {chain} failed");
    }

    let listing = String::from_utf8_lossy(&out.stdout);
    for spec in tagged_rule_specs(&listing, chain) {
        let status = Command::new("iptables")
            .args(["-t", table, "-D", chain])
            .args(&spec)
            .status()
            .with_context(|| format!("spawn iptables -t {table} -D {chain}"))?;
        if !status.success() {
            // A rule may have been removed out from under us; keep going.
            warn!(table, chain, rule = %spec.join(" "), "failed to delete rule");
        }
    }
    Ok(())
}

/// Parse `iptables -S <chain>` output into the argument lists of the rules
/// carrying [`RULE_TAG`], ready to be replayed with `-D`.
fn tagged_rule_specs(listing: &str, chain: &str) -> Vec<Vec<String>> {
    let prefix = format!("-A {chain} ");
    listing
        .lines()
        .filter(|line| line.contains(RULE_TAG))
        .filter_map(|line| line.strip_prefix(prefix.as_str()))
        .map(|rest| rest.split_whitespace().map(str::to_string).collect())
        .collect()
}

fn run(cmd: &str, cmd_args: &[&str]) -> Result<()> {
    let status = Command::new(cmd)
        .args(cmd_args)
        .status()
        .with_context(|| format!("spawn {cmd}"))?;
    if !status.success() {
        bail!("{cmd} {} exited with {status}", cmd_args.join(" "));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fabric() -> NetworkFabric {
        let network: Ipv4Network = "192.168.100.0/24".parse().unwrap();
        NetworkFabric::new("sshvm-br0", network, "192.168.100.1".parse().unwrap())
    }

    #[test]
    fn test_host_index_within_slash24() {
        let network: Ipv4Network = "192.168.100.0/24".parse().unwrap();
        assert_eq!(host_index(network, "192.168.100.2".parse().unwrap()), 2);
        assert_eq!(host_index(network, "192.168.100.254".parse().unwrap()), 254);
    }

    #[test]
    fn test_host_index_within_slash16() {
        let network: Ipv4Network = "10.1.0.0/16".parse().unwrap();
        // Offset equals the low two octets for a /16.
        assert_eq!(
            host_index(network, "10.1.100.2".parse().unwrap()),
            100 * 256 + 2
        );
    }

    #[test]
    fn test_tap_name_and_mac() {
        assert_eq!(tap_name(2), "sshvm-tap-2");
        assert_eq!(mac_address(2), "02:FC:00:00:00:02");
        assert_eq!(tap_name(25602), "sshvm-tap-25602");
        assert_eq!(mac_address(25602), "02:FC:00:00:64:02");
        // Largest index still fits the 15-char interface name limit.
        assert_eq!(tap_name(u16::MAX).len(), 15);
    }

    #[test]
    fn test_forward_rules_are_tagged() {
        let f = fabric();
        for rule in f.forward_rules() {
            assert!(rule.contains(&RULE_TAG.to_string()));
            assert!(rule.contains(&"ACCEPT".to_string()));
        }
    }

    #[test]
    fn test_masquerade_rule_matches_cidr() {
        let f = fabric();
        let rule = f.masquerade_rule();
        assert!(rule.contains(&"192.168.100.0/24".to_string()));
        assert!(rule.contains(&"MASQUERADE".to_string()));
        assert!(rule.contains(&RULE_TAG.to_string()));
    }

    #[test]
    fn test_tagged_rule_specs_filters_and_strips() {
        let listing = "\
-P FORWARD ACCEPT
-A FORWARD -i sshvm-br0 ! -o sshvm-br0 -m comment --comment ssh-hypervisor -j ACCEPT
-A FORWARD -i docker0 -j ACCEPT
-A FORWARD ! -i sshvm-br0 -o sshvm-br0 -m comment --comment ssh-hypervisor -j ACCEPT
";
        let specs = tagged_rule_specs(listing, "FORWARD");
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0][0], "-i");
        assert_eq!(specs[1][0], "!");
        // Chain name and -A are stripped so the rule can be replayed with -D.
        assert!(!specs[0].contains(&"FORWARD".to_string()));
    }
}
