//! Rule validation
//!
//! Two layers: model validation (field consistency, invariants) and offline
//! structural checks that keep anything shell-hostile out of rendered text.
//! Rejection, not sanitization: rewriting a field to make it safe would
//! silently change the rule's semantics.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::logic::error::{CoreError, CoreResult};
use crate::logic::policy::types::{Action, AddrSpec, Origin, PolicyRule, PortSpec};

/// Characters that could smuggle shell or ruleset syntax through a comment
const DANGEROUS_CHARS: &[char] = &[';', '|', '&', '$', '`', '\\', '"', '{', '}'];

/// Longest comment we will carry into rendered text
const MAX_COMMENT_LEN: usize = 128;

/// Linux IFNAMSIZ - 1
pub const MAX_IFACE_LEN: usize = 15;

static SET_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*$").expect("set name regex"));

static IFACE_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9_.-]+$").expect("iface name regex"));

/// Full model validation. Returns the first violation found.
pub fn validate_rule(rule: &PolicyRule) -> CoreResult<()> {
    if rule.action == Action::Accept && rule.origin != Origin::User {
        return Err(CoreError::validation(
            "accept rules require user origin",
        ));
    }

    validate_addr(rule, rule.source.as_ref(), "source")?;
    validate_addr(rule, rule.destination.as_ref(), "destination")?;

    if !rule.protocol.carries_ports()
        && (rule.source_port.is_some() || rule.destination_port.is_some())
    {
        return Err(CoreError::validation(format!(
            "protocol {} does not carry ports",
            rule.protocol.as_str()
        )));
    }
    validate_ports(rule.source_port.as_ref(), "source_port")?;
    validate_ports(rule.destination_port.as_ref(), "destination_port")?;

    if let Some(limit) = &rule.rate_limit {
        if limit.count == 0 {
            return Err(CoreError::validation("rate limit count must be positive"));
        }
        // rendered as <n>/{second,minute,hour,day}
        if !matches!(limit.per_secs, 1 | 60 | 3600 | 86_400) {
            return Err(CoreError::validation(
                "rate limit window must be 1s, 60s, 3600s or 86400s",
            ));
        }
    }

    if let Some(comment) = &rule.comment {
        validate_comment(comment)?;
    }

    Ok(())
}

fn validate_addr(rule: &PolicyRule, spec: Option<&AddrSpec>, field: &str) -> CoreResult<()> {
    match spec {
        None => Ok(()),
        Some(AddrSpec::Network(net)) => {
            if !rule.family.admits(&net.ip()) {
                return Err(CoreError::validation(format!(
                    "{} {} does not fit family {}",
                    field,
                    net,
                    rule.family.as_str()
                )));
            }
            Ok(())
        }
        Some(AddrSpec::Set(name)) => {
            if !SET_NAME_RE.is_match(name) || name.len() > 64 {
                return Err(CoreError::validation(format!(
                    "{} set name {:?} is not a valid identifier",
                    field, name
                )));
            }
            Ok(())
        }
    }
}

fn validate_ports(spec: Option<&PortSpec>, field: &str) -> CoreResult<()> {
    let Some(spec) = spec else { return Ok(()) };
    match spec {
        PortSpec::Single(p) => {
            if *p == 0 {
                return Err(CoreError::validation(format!("{}: port 0 is invalid", field)));
            }
        }
        PortSpec::Range(a, b) => {
            if *a == 0 || a > b {
                return Err(CoreError::validation(format!(
                    "{}: range {}-{} is invalid",
                    field, a, b
                )));
            }
        }
        PortSpec::List(ports) => {
            if ports.is_empty() {
                return Err(CoreError::validation(format!("{}: empty port list", field)));
            }
            if ports.iter().any(|p| *p == 0) {
                return Err(CoreError::validation(format!("{}: port 0 is invalid", field)));
            }
        }
    }
    Ok(())
}

/// Comment rules: printable, bounded, free of control characters and of
/// anything the rendering syntax or a shell could interpret.
pub fn validate_comment(comment: &str) -> CoreResult<()> {
    if comment.len() > MAX_COMMENT_LEN {
        return Err(CoreError::validation(format!(
            "comment exceeds {} bytes",
            MAX_COMMENT_LEN
        )));
    }
    if comment.chars().any(|c| c.is_control()) {
        return Err(CoreError::validation("comment contains control characters"));
    }
    if let Some(bad) = comment.chars().find(|c| DANGEROUS_CHARS.contains(c)) {
        return Err(CoreError::validation(format!(
            "comment contains forbidden character {:?}",
            bad
        )));
    }
    Ok(())
}

/// True when the text is free of shell metacharacters. Applied to every
/// field that reaches a rendered image.
pub fn is_shell_safe(text: &str) -> bool {
    !text.chars().any(|c| DANGEROUS_CHARS[..6].contains(&c))
}

/// Validate a network interface identifier (never-block entries).
pub fn is_valid_interface_name(name: &str) -> bool {
    !name.is_empty() && name.len() <= MAX_IFACE_LEN && IFACE_NAME_RE.is_match(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::policy::types::{Direction, Family, Protocol, RateLimit};

    fn base_rule() -> PolicyRule {
        PolicyRule::new(Direction::Input, Action::Drop, Origin::User)
    }

    #[test]
    fn accept_requires_user_origin() {
        let mut rule = PolicyRule::new(Direction::Input, Action::Accept, Origin::DaemonAuto);
        assert!(validate_rule(&rule).is_err());
        rule.origin = Origin::User;
        assert!(validate_rule(&rule).is_ok());
    }

    #[test]
    fn family_and_address_must_agree() {
        let mut rule = base_rule();
        rule.family = Family::Ipv6;
        rule.source = Some(AddrSpec::Network("10.0.0.0/8".parse().unwrap()));
        assert!(validate_rule(&rule).is_err());
        rule.family = Family::Ipv4;
        assert!(validate_rule(&rule).is_ok());
    }

    #[test]
    fn ports_need_a_port_protocol() {
        let mut rule = base_rule();
        rule.protocol = Protocol::Icmp;
        rule.destination_port = Some(PortSpec::Single(22));
        assert!(validate_rule(&rule).is_err());
        rule.protocol = Protocol::Tcp;
        assert!(validate_rule(&rule).is_ok());
    }

    #[test]
    fn port_zero_and_inverted_range_rejected() {
        let mut rule = base_rule();
        rule.protocol = Protocol::Tcp;
        rule.destination_port = Some(PortSpec::Single(0));
        assert!(validate_rule(&rule).is_err());
        rule.destination_port = Some(PortSpec::Range(2000, 1000));
        assert!(validate_rule(&rule).is_err());
    }

    #[test]
    fn rate_window_must_be_renderable() {
        let mut rule = base_rule();
        rule.rate_limit = Some(RateLimit { count: 10, per_secs: 17 });
        assert!(validate_rule(&rule).is_err());
        rule.rate_limit = Some(RateLimit { count: 10, per_secs: 60 });
        assert!(validate_rule(&rule).is_ok());
    }

    #[test]
    fn hostile_comments_rejected() {
        assert!(validate_comment("block ssh scanner").is_ok());
        assert!(validate_comment("x; nft flush ruleset").is_err());
        assert!(validate_comment("quote\"breakout").is_err());
        assert!(validate_comment("tab\there").is_err());
    }

    #[test]
    fn interface_names_follow_ifnamsiz() {
        assert!(is_valid_interface_name("eth0"));
        assert!(is_valid_interface_name("enp3s0.100"));
        assert!(!is_valid_interface_name(""));
        assert!(!is_valid_interface_name("way-too-long-interface"));
        assert!(!is_valid_interface_name("bad name"));
    }
}
