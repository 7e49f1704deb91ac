//! nftables ruleset text parsing
//!
//! Lifts `nft list ruleset` output back into structured form: raw rule lines
//! with their table/chain context, and a best-effort translation into the
//! neutral model. Constructs the model cannot express come back as warnings,
//! never silently dropped.

use once_cell::sync::Lazy;
use regex::Regex;
use uuid::Uuid;

use crate::logic::backend::ImportResult;
use crate::logic::policy::{
    Action, AddrSpec, Direction, Family, Origin, PolicyRule, PortSpec, Protocol,
};

static TABLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^table\s+(\w+)\s+(\S+)\s*\{?").expect("table regex"));

static CHAIN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^chain\s+(\S+)\s*\{?").expect("chain regex"));

static HANDLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"#\s*handle\s+(\d+)\s*$").expect("handle regex"));

static RULE_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"comment\s+"nw:([0-9a-fA-F-]{36})"#).expect("rule id regex"));

static SADDR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:ip6?\s+)?saddr\s+(\S+)").expect("saddr regex"));

static DADDR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:ip6?\s+)?daddr\s+(\S+)").expect("daddr regex"));

static SPORT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"sport\s+([0-9{,\s}-]+)").expect("sport regex"));

static DPORT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"dport\s+([0-9{,\s}-]+)").expect("dport regex"));

static PROTO_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(tcp|udp|icmpv6|icmp)\b").expect("proto regex"));

static ACTION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(accept|drop|reject|jump|goto|return)\b").expect("action regex"));

static LIMIT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"limit\s+rate\s+(\d+)/(second|minute|hour|day)").expect("limit regex")
});

static COMMENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"comment\s+"([^"]*)""#).expect("comment regex"));

/// One rule line with its surrounding context.
#[derive(Debug, Clone)]
pub struct RuleLine {
    pub family: String,
    pub table: String,
    pub chain: String,
    pub raw: String,
    pub handle: Option<u64>,
    pub rule_id: Option<Uuid>,
}

/// Walk a `nft list ruleset` dump, yielding rule lines with context. Chain
/// declarations (`type ... hook ...`, `policy ...`) are not rules.
pub fn extract_rules(text: &str) -> Vec<RuleLine> {
    let mut rules = Vec::new();
    let mut family = String::new();
    let mut table = String::new();
    let mut chain = String::new();
    let mut in_chain = false;

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(caps) = TABLE_RE.captures(line) {
            family = caps[1].to_string();
            table = caps[2].to_string();
            in_chain = false;
            continue;
        }
        if let Some(caps) = CHAIN_RE.captures(line) {
            chain = caps[1].to_string();
            in_chain = true;
            continue;
        }
        if line == "}" {
            if in_chain {
                in_chain = false;
            }
            continue;
        }
        if !in_chain || line.starts_with("type ") || line.starts_with("policy ") {
            continue;
        }

        let handle = HANDLE_RE
            .captures(line)
            .and_then(|c| c[1].parse::<u64>().ok());
        let rule_id = RULE_ID_RE
            .captures(line)
            .and_then(|c| Uuid::parse_str(&c[1]).ok());
        rules.push(RuleLine {
            family: family.clone(),
            table: table.clone(),
            chain: chain.clone(),
            raw: HANDLE_RE.replace(line, "").trim().to_string(),
            handle,
            rule_id,
        });
    }
    rules
}

/// Locate the live handle of a managed rule by its embedded id. Input must
/// come from `nft -a list ruleset`.
pub fn find_handle(listing: &str, rule_id: Uuid) -> Option<RuleLine> {
    extract_rules(listing)
        .into_iter()
        .find(|line| line.rule_id == Some(rule_id) && line.handle.is_some())
}

/// Rule-ish lines in an image (used for receipts).
pub fn count_rule_lines(image: &str) -> usize {
    extract_rules(image).len()
}

/// Best-effort lift of a ruleset dump into the neutral model.
pub fn lift_ruleset(text: &str) -> ImportResult {
    let mut rules = Vec::new();
    let mut warnings = Vec::new();

    for line in extract_rules(text) {
        match lift_rule(&line) {
            Ok(rule) => rules.push(rule),
            Err(reason) => warnings.push(format!(
                "{}/{}/{}: {}: {}",
                line.family, line.table, line.chain, reason, line.raw
            )),
        }
    }
    ImportResult { rules, warnings }
}

fn lift_rule(line: &RuleLine) -> Result<PolicyRule, String> {
    let body = &line.raw;

    // Constructs with no neutral-model counterpart
    if body.contains('@') {
        return Err("references a named set".into());
    }
    if body.contains("jump") || body.contains("goto") {
        return Err("chain jump is not expressible".into());
    }
    if body.starts_with("ct state established,related") {
        return Err("conntrack preamble, not a policy rule".into());
    }

    let direction = match line.chain.as_str() {
        "input" => Direction::Input,
        "output" => Direction::Output,
        "forward" => Direction::Forward,
        other => return Err(format!("chain {} has no direction mapping", other)),
    };

    let action = match ACTION_RE
        .captures(body)
        .map(|c| c[1].to_string())
        .as_deref()
    {
        Some("accept") => Action::Accept,
        Some("drop") => Action::Drop,
        Some("reject") => Action::Reject,
        Some(other) => return Err(format!("verdict {} is not expressible", other)),
        None => return Err("no verdict found".into()),
    };

    let family = match line.family.as_str() {
        "ip" => Family::Ipv4,
        "ip6" => Family::Ipv6,
        "inet" => Family::Both,
        other => return Err(format!("family {} not supported", other)),
    };

    let mut rule = PolicyRule::new(direction, action, Origin::Imported);
    rule.family = family;
    if let Some(id) = line.rule_id {
        rule.id = id;
    }

    if let Some(caps) = SADDR_RE.captures(body) {
        rule.source = Some(parse_addr(&caps[1])?);
    }
    if let Some(caps) = DADDR_RE.captures(body) {
        rule.destination = Some(parse_addr(&caps[1])?);
    }

    if let Some(caps) = PROTO_RE.captures(body) {
        rule.protocol = Protocol::parse(&caps[1]).unwrap_or(Protocol::Any);
    }
    if let Some(caps) = SPORT_RE.captures(body) {
        rule.source_port = Some(parse_ports(caps[1].trim())?);
    }
    if let Some(caps) = DPORT_RE.captures(body) {
        rule.destination_port = Some(parse_ports(caps[1].trim())?);
    }

    if let Some(caps) = LIMIT_RE.captures(body) {
        let count: u32 = caps[1].parse().map_err(|_| "bad limit count".to_string())?;
        let per_secs = match &caps[2] {
            "second" => 1,
            "minute" => 60,
            "hour" => 3600,
            _ => 86_400,
        };
        rule.rate_limit = Some(crate::logic::policy::RateLimit { count, per_secs });
    }

    rule.log = body.contains("log ");
    rule.stateful = body.contains("ct state new");

    if let Some(caps) = COMMENT_RE.captures(body) {
        let comment = caps[1].to_string();
        // strip our own id tag back off
        let stripped = comment
            .strip_prefix(&format!("nw:{}", rule.id))
            .map(|rest| rest.trim_start().to_string())
            .unwrap_or(comment);
        if !stripped.is_empty() {
            rule.comment = Some(stripped);
        }
    }

    rule.family = refine_family(rule.family, &rule.source, &rule.destination);
    Ok(rule)
}

/// `inet` tables hold rules that may still be pinned to one family by their
/// address matches.
fn refine_family(family: Family, src: &Option<AddrSpec>, dst: &Option<AddrSpec>) -> Family {
    if family != Family::Both {
        return family;
    }
    let nets: Vec<_> = [src, dst]
        .iter()
        .filter_map(|s| s.as_ref().and_then(AddrSpec::network))
        .collect();
    if !nets.is_empty() && nets.iter().all(|n| n.is_ipv4()) {
        Family::Ipv4
    } else if !nets.is_empty() && nets.iter().all(|n| !n.is_ipv4()) {
        Family::Ipv6
    } else {
        Family::Both
    }
}

fn parse_addr(token: &str) -> Result<AddrSpec, String> {
    let token = token.trim_end_matches(',');
    if let Ok(net) = token.parse() {
        return Ok(AddrSpec::Network(net));
    }
    if let Ok(addr) = token.parse::<std::net::IpAddr>() {
        return Ok(AddrSpec::host(addr));
    }
    Err(format!("address {} not parseable", token))
}

fn parse_ports(token: &str) -> Result<PortSpec, String> {
    let token = token.trim().trim_start_matches('{').trim_end_matches('}').trim();
    if let Some((a, b)) = token.split_once('-') {
        let a: u16 = a.trim().parse().map_err(|_| "bad port range".to_string())?;
        let b: u16 = b.trim().parse().map_err(|_| "bad port range".to_string())?;
        return Ok(PortSpec::Range(a, b));
    }
    if token.contains(',') {
        let ports: Result<Vec<u16>, _> =
            token.split(',').map(|p| p.trim().parse::<u16>()).collect();
        return ports
            .map(PortSpec::List)
            .map_err(|_| "bad port list".to_string());
    }
    token
        .parse::<u16>()
        .map(PortSpec::Single)
        .map_err(|_| format!("port {} not parseable", token))
}
