//! nftables reference adapter
//!
//! Speaks to the kernel through the `nft` userspace tool with explicit
//! argument vectors (never a shell). Atomic replace is a single `nft -f` load
//! of a complete image that begins with `flush ruleset`; there is no code
//! path that flushes and loads in separate transactions.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Output};
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::constants;
use crate::logic::backend::{
    nft_parse, AdapterHealth, ApplyReceipt, BackendAdapter, BackendOptions, BackupRef,
    Capabilities, DeltaOp, EvaluationOrder, ImportResult, Verdict,
};
use crate::logic::error::AdapterError;
use crate::logic::policy::{
    Action, AddrSpec, Direction, Family, PolicyRule, PortSpec, Protocol, RenderedRule,
    RulesetImage,
};

pub const BACKEND_NAME: &str = "nftables";

/// Shared with any hypothetical iptables-legacy adapter: both drive the same
/// in-kernel netfilter machinery, so they must never be active together.
pub const KERNEL_SUBSYSTEM: &str = "netfilter";

const DEFAULT_TABLE: &str = "netwarden";
const LOG_PREFIX: &str = "netwarden ";

/// Registry constructor.
pub fn construct(options: &BackendOptions) -> Result<Arc<dyn BackendAdapter>, AdapterError> {
    Ok(Arc::new(NftablesAdapter::new(options)))
}

pub struct NftablesAdapter {
    nft_bin: String,
    table: String,
    backup_dir: PathBuf,
}

impl NftablesAdapter {
    pub fn new(options: &BackendOptions) -> Self {
        let backup_dir = options
            .get("backup_dir")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                dirs::data_local_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("netwarden")
                    .join(constants::BACKUP_DIR)
            });
        Self {
            nft_bin: options.get("nft_bin").cloned().unwrap_or_else(|| "nft".into()),
            table: options.get("table").cloned().unwrap_or_else(|| DEFAULT_TABLE.into()),
            backup_dir,
        }
    }

    fn run(&self, args: &[&str]) -> Result<Output, AdapterError> {
        let output = Command::new(&self.nft_bin)
            .args(args)
            .output()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    AdapterError::unavailable(format!("{} not found", self.nft_bin))
                }
                std::io::ErrorKind::PermissionDenied => {
                    AdapterError::permission(format!("cannot execute {}", self.nft_bin))
                }
                _ => AdapterError::system(e.to_string()),
            })?;
        Ok(output)
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output, AdapterError> {
        let output = self.run(args)?;
        if output.status.success() {
            return Ok(output);
        }
        Err(classify_failure(&String::from_utf8_lossy(&output.stderr)))
    }

    fn run_file(&self, flag_check: bool, content: &str) -> Result<Output, AdapterError> {
        let mut tmp = tempfile::Builder::new()
            .prefix("netwarden-")
            .suffix(".nft")
            .tempfile()
            .map_err(|e| AdapterError::system(format!("temp file: {}", e)))?;
        tmp.write_all(content.as_bytes())
            .map_err(|e| AdapterError::system(format!("temp file: {}", e)))?;
        let path = tmp.path().to_string_lossy().to_string();

        if flag_check {
            self.run(&["--check", "-f", path.as_str()])
        } else {
            self.run(&["-f", path.as_str()])
        }
    }

    /// Rule body (match expressions + statements + verdict + comment),
    /// without the `add rule <family> <table> <chain>` preamble.
    fn render_body(&self, rule: &PolicyRule) -> String {
        let mut parts: Vec<String> = Vec::new();

        // Family pin when no address match carries it
        let addr_pins_family =
            rule.source.as_ref().and_then(AddrSpec::network).is_some()
                || rule.destination.as_ref().and_then(AddrSpec::network).is_some();
        match rule.family {
            Family::Ipv4 if !addr_pins_family => parts.push("meta nfproto ipv4".into()),
            Family::Ipv6 if !addr_pins_family => parts.push("meta nfproto ipv6".into()),
            _ => {}
        }

        if let Some(src) = &rule.source {
            parts.push(render_addr_match("saddr", src));
        }
        if let Some(dst) = &rule.destination {
            parts.push(render_addr_match("daddr", dst));
        }

        let has_ports = rule.source_port.is_some() || rule.destination_port.is_some();
        match rule.protocol {
            Protocol::Tcp | Protocol::Udp if has_ports => {
                let proto = rule.protocol.as_str();
                if let Some(sport) = &rule.source_port {
                    parts.push(format!("{} sport {}", proto, render_ports(sport)));
                }
                if let Some(dport) = &rule.destination_port {
                    parts.push(format!("{} dport {}", proto, render_ports(dport)));
                }
            }
            Protocol::Tcp | Protocol::Udp | Protocol::Icmp => {
                parts.push(format!("meta l4proto {}", rule.protocol.as_str()));
            }
            Protocol::Any => {}
        }

        if rule.stateful && rule.action == Action::Accept {
            parts.push("ct state new".into());
        }

        if let Some(limit) = &rule.rate_limit {
            let unit = match limit.per_secs {
                1 => "second",
                60 => "minute",
                3600 => "hour",
                _ => "day",
            };
            parts.push(format!("limit rate {}/{}", limit.count, unit));
        }

        if rule.log {
            parts.push(format!("log prefix \"{}\"", LOG_PREFIX));
        }

        parts.push("counter".into());
        parts.push(rule.action.as_str().into());

        let mut tag = format!("nw:{}", rule.id);
        if let Some(comment) = &rule.comment {
            tag.push(' ');
            tag.push_str(comment);
        }
        parts.push(format!("comment \"{}\"", tag));

        parts.join(" ")
    }

    fn chain_for(direction: Direction) -> &'static str {
        direction.as_str()
    }
}

fn render_addr_match(side: &str, spec: &AddrSpec) -> String {
    match spec {
        AddrSpec::Network(net) => {
            let proto = if net.is_ipv4() { "ip" } else { "ip6" };
            format!("{} {} {}", proto, side, net)
        }
        AddrSpec::Set(name) => format!("ip {} @{}", side, name),
    }
}

fn render_ports(spec: &PortSpec) -> String {
    match spec.canonical() {
        PortSpec::Single(p) => p.to_string(),
        PortSpec::Range(a, b) => format!("{}-{}", a, b),
        PortSpec::List(ports) => {
            let joined: Vec<String> = ports.iter().map(|p| p.to_string()).collect();
            format!("{{ {} }}", joined.join(", "))
        }
    }
}

/// Map nft stderr onto the typed error taxonomy.
fn classify_failure(stderr: &str) -> AdapterError {
    let lower = stderr.to_ascii_lowercase();
    if lower.contains("permission denied") || lower.contains("operation not permitted") {
        AdapterError::permission(stderr.trim().to_string())
    } else if lower.contains("resource busy")
        || lower.contains("temporarily unavailable")
        || lower.contains("try again")
    {
        AdapterError::transient(stderr.trim().to_string())
    } else if lower.contains("syntax error")
        || lower.contains("error:")
        || lower.contains("unexpected")
    {
        AdapterError::syntax(stderr.trim().to_string())
    } else {
        AdapterError::system(stderr.trim().to_string())
    }
}

/// Split an nft statement into argv tokens, honoring double quotes so a
/// comment stays one token.
fn split_statement(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for c in text.chars() {
        match c {
            '"' => in_quotes = !in_quotes,
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

impl BackendAdapter for NftablesAdapter {
    fn name(&self) -> &str {
        BACKEND_NAME
    }

    fn kernel_subsystem(&self) -> &str {
        KERNEL_SUBSYSTEM
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_deny: true,
            supports_stateful: true,
            supports_rate_limit: true,
            supports_ipv6: true,
            supports_priority: true,
            evaluation_order: EvaluationOrder::FirstMatch,
            supports_atomic_replace: true,
            supports_delta_ops: true,
        }
    }

    fn render(&self, rule: &PolicyRule) -> Result<RenderedRule, AdapterError> {
        let body = self.render_body(rule);
        let text = format!(
            "add rule inet {} {} {}",
            self.table,
            Self::chain_for(rule.direction),
            body
        );
        Ok(RenderedRule {
            backend_name: BACKEND_NAME.into(),
            text,
            rule_id: Some(rule.id),
        })
    }

    fn render_image(&self, rules: &[PolicyRule]) -> Result<RulesetImage, AdapterError> {
        let mut by_chain: HashMap<Direction, Vec<&PolicyRule>> = HashMap::new();
        for rule in rules {
            by_chain.entry(rule.direction).or_default().push(rule);
        }
        for list in by_chain.values_mut() {
            // stable: priority first, insertion order breaks ties
            list.sort_by_key(|r| r.priority);
        }

        let mut text = String::from("flush ruleset\n\n");
        text.push_str(&format!("table inet {} {{\n", self.table));
        for direction in [Direction::Input, Direction::Output, Direction::Forward] {
            let chain = Self::chain_for(direction);
            text.push_str(&format!("\tchain {} {{\n", chain));
            text.push_str(&format!(
                "\t\ttype filter hook {} priority 0; policy accept;\n",
                chain
            ));
            text.push_str("\t\tct state established,related accept\n");
            if let Some(list) = by_chain.get(&direction) {
                for rule in list {
                    text.push_str("\t\t");
                    text.push_str(&self.render_body(rule));
                    text.push('\n');
                }
            }
            text.push_str("\t}\n");
        }
        text.push_str("}\n");

        Ok(RulesetImage { backend_name: BACKEND_NAME.into(), text })
    }

    fn validate(&self, image: &RulesetImage) -> Result<Verdict, AdapterError> {
        let output = self.run_file(true, &image.text)?;
        if output.status.success() {
            return Ok(Verdict::ok());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        for line in stderr.lines().filter(|l| !l.trim().is_empty()) {
            if line.to_ascii_lowercase().contains("warning") {
                warnings.push(line.to_string());
            } else {
                errors.push(line.to_string());
            }
        }
        if errors.is_empty() {
            errors.push(stderr.trim().to_string());
        }
        Ok(Verdict { valid: false, errors, warnings })
    }

    fn snapshot(&self) -> Result<BackupRef, AdapterError> {
        let output = self.run_checked(&["list", "ruleset"])?;
        let text = String::from_utf8_lossy(&output.stdout).to_string();

        std::fs::create_dir_all(&self.backup_dir)
            .map_err(|e| AdapterError::system(format!("backup dir: {}", e)))?;
        let taken_at = Utc::now();
        let filename = format!(
            "backup_{}_{}.nft",
            taken_at.format("%Y%m%d_%H%M%S"),
            Uuid::new_v4().simple()
        );
        let path = self.backup_dir.join(filename);
        std::fs::write(&path, text)
            .map_err(|e| AdapterError::system(format!("write backup: {}", e)))?;

        Ok(BackupRef {
            backend_name: BACKEND_NAME.into(),
            path: path.to_string_lossy().to_string(),
            taken_at,
        })
    }

    fn apply_atomic(&self, image: &RulesetImage) -> Result<ApplyReceipt, AdapterError> {
        if !image.text.trim_start().starts_with("flush ruleset") {
            return Err(AdapterError::syntax(
                "atomic image must begin with a flush directive",
            ));
        }
        let output = self.run_file(false, &image.text)?;
        if !output.status.success() {
            return Err(classify_failure(&String::from_utf8_lossy(&output.stderr)));
        }
        let rules_applied = nft_parse::count_rule_lines(&image.text);
        Ok(ApplyReceipt {
            backend_name: BACKEND_NAME.into(),
            applied_at: Utc::now(),
            rules_applied,
        })
    }

    fn apply_delta(&self, delta: &DeltaOp) -> Result<ApplyReceipt, AdapterError> {
        match delta {
            DeltaOp::Add(rendered) => {
                let tokens = split_statement(&rendered.text);
                let args: Vec<&str> = tokens.iter().map(String::as_str).collect();
                self.run_checked(&args)?;
            }
            DeltaOp::Remove(rendered) => {
                let rule_id = rendered.rule_id.ok_or_else(|| {
                    AdapterError::system("delta remove needs a rule id in the rendered form")
                })?;
                let output = self.run_checked(&["-a", "list", "ruleset"])?;
                let listing = String::from_utf8_lossy(&output.stdout);
                let found = nft_parse::find_handle(&listing, rule_id).ok_or_else(|| {
                    AdapterError::system(format!("rule {} not present in live ruleset", rule_id))
                })?;
                let handle = found.handle.unwrap_or_default().to_string();
                self.run_checked(&[
                    "delete",
                    "rule",
                    found.family.as_str(),
                    found.table.as_str(),
                    found.chain.as_str(),
                    "handle",
                    handle.as_str(),
                ])?;
            }
        }
        Ok(ApplyReceipt {
            backend_name: BACKEND_NAME.into(),
            applied_at: Utc::now(),
            rules_applied: 1,
        })
    }

    fn restore(&self, backup: &BackupRef) -> Result<bool, AdapterError> {
        let Ok(saved) = std::fs::read_to_string(&backup.path) else {
            return Ok(false);
        };
        // One transaction: flush directive and the saved ruleset in a single
        // load, never flush-then-load.
        let image = format!("flush ruleset\n\n{}", saved);
        let output = self.run_file(false, &image)?;
        if !output.status.success() {
            return Err(classify_failure(&String::from_utf8_lossy(&output.stderr)));
        }
        Ok(true)
    }

    fn list_rules(&self) -> Result<Vec<RenderedRule>, AdapterError> {
        let output = self.run_checked(&["list", "ruleset"])?;
        let text = String::from_utf8_lossy(&output.stdout);
        Ok(nft_parse::extract_rules(&text)
            .into_iter()
            .map(|line| RenderedRule {
                backend_name: BACKEND_NAME.into(),
                rule_id: line.rule_id,
                text: line.raw,
            })
            .collect())
    }

    fn import_rules(&self) -> Result<ImportResult, AdapterError> {
        let output = self.run_checked(&["list", "ruleset"])?;
        let text = String::from_utf8_lossy(&output.stdout);
        Ok(nft_parse::lift_ruleset(&text))
    }

    fn health(&self) -> AdapterHealth {
        // Listing the ruleset needs the same privileges as writing it, so a
        // successful list is evidence for both.
        match self.run(&["list", "ruleset"]) {
            Ok(output) if output.status.success() => {
                AdapterHealth { reachable: true, writable: true }
            }
            Ok(_) => AdapterHealth { reachable: true, writable: false },
            Err(_) => AdapterHealth { reachable: false, writable: false },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::policy::{Origin, RateLimit};

    fn adapter() -> NftablesAdapter {
        NftablesAdapter::new(&BackendOptions::new())
    }

    fn block_rule() -> PolicyRule {
        let mut rule = PolicyRule::new(Direction::Input, Action::Drop, Origin::DaemonAuto);
        rule.family = Family::Ipv4;
        rule.source = Some(AddrSpec::Network("203.0.113.7/32".parse().unwrap()));
        rule.protocol = Protocol::Tcp;
        rule.destination_port = Some(PortSpec::Single(22));
        rule.comment = Some("brute force".into());
        rule
    }

    #[test]
    fn renders_full_add_statement() {
        let rendered = adapter().render(&block_rule()).unwrap();
        assert!(rendered.text.starts_with("add rule inet netwarden input "));
        assert!(rendered.text.contains("ip saddr 203.0.113.7/32"));
        assert!(rendered.text.contains("tcp dport 22"));
        assert!(rendered.text.contains("counter drop"));
        assert!(rendered.rule_id.is_some());
    }

    #[test]
    fn rendered_comment_carries_rule_id() {
        let rule = block_rule();
        let rendered = adapter().render(&rule).unwrap();
        assert!(rendered.text.contains(&format!("nw:{} brute force", rule.id)));
    }

    #[test]
    fn image_begins_with_flush_directive() {
        let image = adapter().render_image(&[block_rule()]).unwrap();
        assert!(image.text.starts_with("flush ruleset\n"));
        assert!(image.text.contains("table inet netwarden {"));
        assert!(image.text.contains("type filter hook input priority 0"));
    }

    #[test]
    fn empty_image_is_a_valid_atomic_flush() {
        let image = adapter().render_image(&[]).unwrap();
        assert!(image.text.starts_with("flush ruleset\n"));
        // chains are still declared, just empty of managed rules
        assert!(image.text.contains("chain forward"));
    }

    #[test]
    fn image_orders_rules_by_priority() {
        let mut first = block_rule();
        first.priority = 10;
        first.comment = Some("later".into());
        let mut second = block_rule();
        second.priority = -5;
        second.comment = Some("earlier".into());
        let image = adapter().render_image(&[first, second]).unwrap();
        let earlier = image.text.find("earlier").unwrap();
        let later = image.text.find("later").unwrap();
        assert!(earlier < later);
    }

    #[test]
    fn rate_limit_renders_in_nft_units() {
        let mut rule = block_rule();
        rule.rate_limit = Some(RateLimit { count: 10, per_secs: 60 });
        let rendered = adapter().render(&rule).unwrap();
        assert!(rendered.text.contains("limit rate 10/minute"));
    }

    #[test]
    fn family_pin_used_when_no_address_match() {
        let mut rule = PolicyRule::new(Direction::Input, Action::Drop, Origin::User);
        rule.family = Family::Ipv6;
        let rendered = adapter().render(&rule).unwrap();
        assert!(rendered.text.contains("meta nfproto ipv6"));
    }

    #[test]
    fn statement_splitter_keeps_quoted_comment_whole() {
        let tokens = split_statement(
            "add rule inet netwarden input drop comment \"nw:abc scanner seen twice\"",
        );
        assert_eq!(tokens.last().unwrap(), "nw:abc scanner seen twice");
        assert_eq!(tokens[0], "add");
    }

    #[test]
    fn stderr_classification() {
        assert_eq!(
            classify_failure("Error: Operation not permitted").kind,
            crate::logic::error::AdapterErrorKind::Permission
        );
        assert_eq!(
            classify_failure("netlink: Resource busy").kind,
            crate::logic::error::AdapterErrorKind::Transient
        );
        assert_eq!(
            classify_failure("/tmp/x.nft:3:1-5: syntax error").kind,
            crate::logic::error::AdapterErrorKind::Syntax
        );
    }
}
