//! Never-Block List
//!
//! Subjects autonomous logic must never target, no matter the evidence:
//! administrator-listed IPs, CIDRs and hostnames, plus the host's own
//! addresses and the management endpoint discovered at startup. Hostnames
//! are resolved once and cached; re-resolution happens on config reload.

use std::net::{IpAddr, ToSocketAddrs};

use ipnetwork::IpNetwork;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::logic::error::{CoreError, CoreResult};
use crate::logic::policy::validate::is_valid_interface_name;
use crate::logic::policy::{AddrSpec, PolicyRule};

// ============================================================================
// ENTRIES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind")]
pub enum NeverBlockEntry {
    Cidr { net: IpNetwork },
    Hostname { name: String, resolved: Vec<IpAddr> },
    Interface { name: String },
}

impl NeverBlockEntry {
    pub fn kind_str(&self) -> &'static str {
        match self {
            NeverBlockEntry::Cidr { .. } => "cidr",
            NeverBlockEntry::Hostname { .. } => "hostname",
            NeverBlockEntry::Interface { .. } => "interface",
        }
    }

    pub fn display(&self) -> String {
        match self {
            NeverBlockEntry::Cidr { net } => net.to_string(),
            NeverBlockEntry::Hostname { name, .. } => name.clone(),
            NeverBlockEntry::Interface { name } => format!("iface:{}", name),
        }
    }

    /// Parse an operator-supplied entry: bare IP, CIDR, `iface:<name>`, or a
    /// hostname (resolved and cached).
    pub fn parse(text: &str) -> CoreResult<Self> {
        let text = text.trim();
        if let Some(name) = text.strip_prefix("iface:") {
            if !is_valid_interface_name(name) {
                return Err(CoreError::validation(format!(
                    "{:?} is not a valid interface name",
                    name
                )));
            }
            return Ok(NeverBlockEntry::Interface { name: name.to_string() });
        }
        if let Ok(net) = text.parse::<IpNetwork>() {
            return Ok(NeverBlockEntry::Cidr { net });
        }
        if let Ok(addr) = text.parse::<IpAddr>() {
            return Ok(NeverBlockEntry::Cidr { net: host_net(addr) });
        }
        // hostname: resolve now, fail when nothing comes back
        let resolved = resolve_host(text)?;
        Ok(NeverBlockEntry::Hostname { name: text.to_string(), resolved })
    }

    fn covers(&self, ip: IpAddr) -> bool {
        match self {
            NeverBlockEntry::Cidr { net } => net.contains(ip),
            NeverBlockEntry::Hostname { resolved, .. } => resolved.contains(&ip),
            NeverBlockEntry::Interface { .. } => false,
        }
    }
}

fn nets_overlap(a: &IpNetwork, b: &IpNetwork) -> bool {
    a.is_ipv4() == b.is_ipv4() && (a.contains(b.network()) || b.contains(a.network()))
}

fn host_net(addr: IpAddr) -> IpNetwork {
    let prefix = if addr.is_ipv4() { 32 } else { 128 };
    IpNetwork::new(addr, prefix).expect("host prefix")
}

fn resolve_host(name: &str) -> CoreResult<Vec<IpAddr>> {
    let addrs: Vec<IpAddr> = format!("{}:0", name)
        .to_socket_addrs()
        .map_err(|e| CoreError::validation(format!("cannot resolve {}: {}", name, e)))?
        .map(|sa| sa.ip())
        .collect();
    if addrs.is_empty() {
        return Err(CoreError::validation(format!("{} resolved to nothing", name)));
    }
    Ok(addrs)
}

// ============================================================================
// LIST
// ============================================================================

#[derive(Default)]
pub struct NeverBlockList {
    entries: RwLock<Vec<NeverBlockEntry>>,
    /// Host-owned and management addresses discovered at startup
    management: RwLock<Vec<IpNetwork>>,
}

impl NeverBlockList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace_entries(&self, entries: Vec<NeverBlockEntry>) {
        *self.entries.write() = entries;
    }

    pub fn add(&self, entry: NeverBlockEntry) {
        let mut entries = self.entries.write();
        if !entries.contains(&entry) {
            entries.push(entry);
        }
    }

    pub fn remove(&self, display: &str) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|e| e.display() != display);
        entries.len() != before
    }

    pub fn entries(&self) -> Vec<NeverBlockEntry> {
        self.entries.read().clone()
    }

    pub fn set_management(&self, nets: Vec<IpNetwork>) {
        *self.management.write() = nets;
    }

    /// Why an address must not be targeted, if any reason exists.
    pub fn match_ip(&self, ip: IpAddr) -> Option<String> {
        if let Some(entry) = self.entries.read().iter().find(|e| e.covers(ip)) {
            return Some(entry.display());
        }
        self.management
            .read()
            .iter()
            .find(|net| net.contains(ip))
            .map(|net| format!("management:{}", net))
    }

    /// Check an address range (an autonomous rule's subject) against the
    /// administrator entries; a single covered address inside the range is
    /// enough to refuse.
    pub fn match_entries_net(&self, net: &IpNetwork) -> Option<String> {
        self.entries
            .read()
            .iter()
            .find(|e| match e {
                NeverBlockEntry::Cidr { net: entry_net } => nets_overlap(entry_net, net),
                NeverBlockEntry::Hostname { resolved, .. } => {
                    resolved.iter().any(|ip| net.contains(*ip))
                }
                NeverBlockEntry::Interface { .. } => false,
            })
            .map(|e| e.display())
    }

    /// Self-lockout check: would this range touch the management plane?
    pub fn match_management_net(&self, net: &IpNetwork) -> Option<String> {
        self.management
            .read()
            .iter()
            .find(|m| nets_overlap(m, net))
            .map(|m| format!("management:{}", m))
    }

    /// Both checks; used by the deployment pre-apply gate.
    pub fn match_net(&self, net: &IpNetwork) -> Option<String> {
        self.match_entries_net(net)
            .or_else(|| self.match_management_net(net))
    }

    /// Pre-apply check: does any address match of this rule touch the list?
    pub fn match_rule(&self, rule: &PolicyRule) -> Option<String> {
        if !rule.action.is_deny() {
            return None;
        }
        for spec in [&rule.source, &rule.destination].into_iter().flatten() {
            if let AddrSpec::Network(net) = spec {
                if let Some(hit) = self.match_net(net) {
                    return Some(hit);
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::policy::{Action, Direction, Origin};

    fn list_with(entry: &str) -> NeverBlockList {
        let list = NeverBlockList::new();
        list.add(NeverBlockEntry::parse(entry).unwrap());
        list
    }

    #[test]
    fn bare_ip_becomes_host_cidr() {
        let entry = NeverBlockEntry::parse("10.0.0.1").unwrap();
        assert_eq!(entry.display(), "10.0.0.1/32");
    }

    #[test]
    fn cidr_bounds_inclusive() {
        let list = list_with("10.0.0.0/24");
        assert!(list.match_ip("10.0.0.0".parse().unwrap()).is_some());
        assert!(list.match_ip("10.0.0.255".parse().unwrap()).is_some());
        assert!(list.match_ip("10.0.1.0".parse().unwrap()).is_none());
    }

    #[test]
    fn interface_entries_parse_and_validate() {
        assert!(NeverBlockEntry::parse("iface:eth0").is_ok());
        assert!(NeverBlockEntry::parse("iface:not a name").is_err());
    }

    #[test]
    fn rule_touching_entry_is_matched() {
        let list = list_with("10.0.0.1/32");
        let mut rule = PolicyRule::new(Direction::Input, Action::Drop, Origin::DaemonAuto);
        rule.source = Some(AddrSpec::Network("10.0.0.0/24".parse().unwrap()));
        assert!(list.match_rule(&rule).is_some());

        rule.source = Some(AddrSpec::Network("203.0.113.0/24".parse().unwrap()));
        assert!(list.match_rule(&rule).is_none());
    }

    #[test]
    fn management_addresses_are_protected() {
        let list = NeverBlockList::new();
        list.set_management(vec!["192.0.2.10/32".parse().unwrap()]);
        let hit = list.match_ip("192.0.2.10".parse().unwrap()).unwrap();
        assert!(hit.starts_with("management:"));
    }

    #[test]
    fn remove_by_display_form() {
        let list = list_with("10.0.0.1");
        assert!(list.remove("10.0.0.1/32"));
        assert!(list.match_ip("10.0.0.1".parse().unwrap()).is_none());
    }
}
