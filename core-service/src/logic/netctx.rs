//! Network context
//!
//! Host network state for management discovery and status reporting:
//! interfaces from `ip -o link/addr show`, traffic counters from
//! `/proc/net/dev`, and the hostname. Missing tools degrade to an empty
//! context with a warning; nothing here is fatal.

use std::collections::HashMap;
use std::net::IpAddr;
use std::process::Command;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static LINK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\d+:\s+(\S+?):\s+<([^>]*)>.*\bmtu\s+(\d+)").expect("link regex")
});

static MAC_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"link/\S+\s+([0-9a-f:]{17})").expect("mac regex"));

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceInfo {
    pub name: String,
    #[serde(default)]
    pub mac_address: Option<String>,
    pub state: String,
    pub mtu: u32,
    pub addresses: Vec<IpAddr>,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkContext {
    pub hostname: String,
    pub interfaces: Vec<InterfaceInfo>,
    pub captured_at: DateTime<Utc>,
}

impl NetworkContext {
    pub fn empty() -> Self {
        Self {
            hostname: "unknown".into(),
            interfaces: Vec::new(),
            captured_at: Utc::now(),
        }
    }

    /// Every address the host owns, loopback included; seed material for the
    /// never-block management set.
    pub fn host_addresses(&self) -> Vec<IpAddr> {
        self.interfaces
            .iter()
            .flat_map(|i| i.addresses.iter().copied())
            .collect()
    }

    /// Addresses of one named interface (management interface pinning).
    pub fn addresses_of(&self, interface: &str) -> Vec<IpAddr> {
        self.interfaces
            .iter()
            .filter(|i| i.name == interface)
            .flat_map(|i| i.addresses.iter().copied())
            .collect()
    }
}

/// Gather the current context. Every step degrades independently.
pub fn gather() -> NetworkContext {
    let link_output = run(&["ip", "-o", "link", "show"]);
    let addr_output = run(&["ip", "-o", "addr", "show"]);
    let stats = parse_proc_net_dev(
        &std::fs::read_to_string("/proc/net/dev").unwrap_or_default(),
    );

    let mut interfaces = match (link_output, addr_output) {
        (Some(link), Some(addr)) => parse_interfaces(&link, &addr, &stats),
        _ => {
            log::warn!("netctx: ip tool unavailable, reporting empty interface set");
            Vec::new()
        }
    };
    interfaces.sort_by(|a, b| a.name.cmp(&b.name));

    NetworkContext {
        hostname: hostname(),
        interfaces,
        captured_at: Utc::now(),
    }
}

fn run(argv: &[&str]) -> Option<String> {
    let output = Command::new(argv[0]).args(&argv[1..]).output().ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).to_string())
}

fn hostname() -> String {
    run(&["hostname"])
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".into())
}

fn parse_interfaces(
    link_output: &str,
    addr_output: &str,
    stats: &HashMap<String, (u64, u64)>,
) -> Vec<InterfaceInfo> {
    let mut interfaces: HashMap<String, InterfaceInfo> = HashMap::new();

    for line in link_output.lines() {
        let Some(caps) = LINK_RE.captures(line) else { continue };
        // veth@if12 style names carry a peer suffix
        let name = caps[1].split('@').next().unwrap_or(&caps[1]).to_string();
        let flags: Vec<&str> = caps[2].split(',').collect();
        let mtu: u32 = caps[3].parse().unwrap_or(1500);
        let mac = MAC_RE.captures(line).map(|m| m[1].to_string());
        let (rx, tx) = stats.get(&name).copied().unwrap_or((0, 0));
        interfaces.insert(
            name.clone(),
            InterfaceInfo {
                name,
                mac_address: mac,
                state: if flags.contains(&"UP") { "UP".into() } else { "DOWN".into() },
                mtu,
                addresses: Vec::new(),
                rx_bytes: rx,
                tx_bytes: tx,
            },
        );
    }

    // Format: 2: eth0    inet 192.0.2.10/24 brd ... scope global eth0
    for line in addr_output.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 4 {
            continue;
        }
        let name = parts[1].split('@').next().unwrap_or(parts[1]).to_string();
        if parts[2] != "inet" && parts[2] != "inet6" {
            continue;
        }
        let Some(addr) = parts[3].split('/').next() else { continue };
        let Ok(addr) = addr.parse::<IpAddr>() else { continue };
        interfaces
            .entry(name.clone())
            .or_insert_with(|| InterfaceInfo {
                name,
                mac_address: None,
                state: "UNKNOWN".into(),
                mtu: 1500,
                addresses: Vec::new(),
                rx_bytes: 0,
                tx_bytes: 0,
            })
            .addresses
            .push(addr);
    }

    interfaces.into_values().collect()
}

fn parse_proc_net_dev(content: &str) -> HashMap<String, (u64, u64)> {
    let mut stats = HashMap::new();
    for line in content.lines().skip(2) {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() >= 10 {
            let name = parts[0].trim_end_matches(':').to_string();
            let rx = parts[1].parse().unwrap_or(0);
            let tx = parts[9].parse().unwrap_or(0);
            stats.insert(name, (rx, tx));
        }
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINK: &str = "\
1: lo: <LOOPBACK,UP,LOWER_UP> mtu 65536 qdisc noqueue state UNKNOWN mode DEFAULT group default qlen 1000\\    link/loopback 00:00:00:00:00:00 brd 00:00:00:00:00:00
2: eth0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 qdisc fq_codel state UP mode DEFAULT group default qlen 1000\\    link/ether 52:54:00:12:34:56 brd ff:ff:ff:ff:ff:ff";

    const ADDR: &str = "\
1: lo    inet 127.0.0.1/8 scope host lo\\       valid_lft forever preferred_lft forever
2: eth0    inet 192.0.2.10/24 brd 192.0.2.255 scope global eth0\\       valid_lft forever preferred_lft forever
2: eth0    inet6 2001:db8::10/64 scope global \\       valid_lft forever preferred_lft forever";

    const PROC: &str = "\
Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
    lo:  123456     100    0    0    0     0          0         0   123456     100    0    0    0     0       0          0
  eth0: 9876543    5000    0    0    0     0          0         0  1234567    3000    0    0    0     0       0          0";

    #[test]
    fn parses_interfaces_with_addresses_and_stats() {
        let stats = parse_proc_net_dev(PROC);
        let mut interfaces = parse_interfaces(LINK, ADDR, &stats);
        interfaces.sort_by(|a, b| a.name.cmp(&b.name));

        assert_eq!(interfaces.len(), 2);
        let eth0 = interfaces.iter().find(|i| i.name == "eth0").unwrap();
        assert_eq!(eth0.state, "UP");
        assert_eq!(eth0.mtu, 1500);
        assert_eq!(eth0.mac_address.as_deref(), Some("52:54:00:12:34:56"));
        assert_eq!(eth0.addresses.len(), 2);
        assert_eq!(eth0.rx_bytes, 9_876_543);
    }

    #[test]
    fn host_addresses_cover_all_interfaces() {
        let stats = parse_proc_net_dev(PROC);
        let interfaces = parse_interfaces(LINK, ADDR, &stats);
        let ctx = NetworkContext {
            hostname: "test".into(),
            interfaces,
            captured_at: Utc::now(),
        };
        let addrs = ctx.host_addresses();
        assert!(addrs.contains(&"127.0.0.1".parse().unwrap()));
        assert!(addrs.contains(&"192.0.2.10".parse().unwrap()));
        assert_eq!(ctx.addresses_of("eth0").len(), 2);
    }

    #[test]
    fn proc_net_dev_header_skipped() {
        let stats = parse_proc_net_dev(PROC);
        assert_eq!(stats.get("lo"), Some(&(123_456, 123_456)));
    }
}
