//! Line parsers
//!
//! Each log source declares one parser. Parsers are pure: a line either
//! becomes a `SecurityEvent` or is ignored.

use std::net::IpAddr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::logic::events::{EventKind, EventSeverity, SecurityEvent};

static SSHD_FAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Failed (?:password|publickey|keyboard-interactive\S*) for (?:invalid user )?(\S+) from (\S+) port (\d+)")
        .expect("sshd fail regex")
});

static SSHD_INVALID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Invalid user (\S+) from (\S+)").expect("sshd invalid regex"));

static AUTH_FAILURE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"authentication failure.*rhost=(\S+)").expect("pam failure regex")
});

static NFT_SRC_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"netwarden .*\bSRC=(\S+)").expect("nft src regex"));

static NFT_DPT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bDPT=(\d+)").expect("nft dpt regex"));

/// Which parser a source uses; selected per source in the config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Parser {
    /// OpenSSH auth failures
    SshdAuth,
    /// PAM-style auth.log failures
    AuthLog,
    /// Kernel log lines produced by our own logging rules
    NftLog,
}

impl Parser {
    pub fn as_str(&self) -> &'static str {
        match self {
            Parser::SshdAuth => "sshd-auth",
            Parser::AuthLog => "auth-log",
            Parser::NftLog => "nft-log",
        }
    }

    pub fn parse(&self, source_name: &str, line: &str) -> Option<SecurityEvent> {
        match self {
            Parser::SshdAuth => parse_sshd(source_name, line),
            Parser::AuthLog => parse_auth_log(source_name, line),
            Parser::NftLog => parse_nft_log(source_name, line),
        }
    }
}

fn parse_ip(token: &str) -> Option<IpAddr> {
    token.trim().parse().ok()
}

fn parse_sshd(source_name: &str, line: &str) -> Option<SecurityEvent> {
    if let Some(caps) = SSHD_FAIL_RE.captures(line) {
        let user = &caps[1];
        let ip = parse_ip(&caps[2])?;
        return Some(
            SecurityEvent::new(source_name, EventKind::AuthFail, EventSeverity::Medium, line)
                .with_source_ip(ip)
                .with_target(format!("sshd:{}", user)),
        );
    }
    if let Some(caps) = SSHD_INVALID_RE.captures(line) {
        let user = &caps[1];
        let ip = parse_ip(&caps[2])?;
        return Some(
            SecurityEvent::new(source_name, EventKind::AuthFail, EventSeverity::Medium, line)
                .with_source_ip(ip)
                .with_target(format!("sshd:{}", user)),
        );
    }
    None
}

fn parse_auth_log(source_name: &str, line: &str) -> Option<SecurityEvent> {
    let caps = AUTH_FAILURE_RE.captures(line)?;
    let ip = parse_ip(&caps[1])?;
    Some(
        SecurityEvent::new(source_name, EventKind::AuthFail, EventSeverity::Medium, line)
            .with_source_ip(ip),
    )
}

fn parse_nft_log(source_name: &str, line: &str) -> Option<SecurityEvent> {
    let caps = NFT_SRC_RE.captures(line)?;
    let ip = parse_ip(&caps[1])?;
    let mut event =
        SecurityEvent::new(source_name, EventKind::PortScanHit, EventSeverity::Low, line)
            .with_source_ip(ip);
    if let Some(dpt) = NFT_DPT_RE.captures(line) {
        event = event.with_target(format!("dport:{}", &dpt[1]));
    }
    Some(event)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sshd_failed_password_parses() {
        let line = "Jan 12 03:14:07 host sshd[812]: Failed password for root from 203.0.113.7 port 53211 ssh2";
        let event = Parser::SshdAuth.parse("sshd", line).unwrap();
        assert_eq!(event.kind, EventKind::AuthFail);
        assert_eq!(event.source_ip.unwrap().to_string(), "203.0.113.7");
        assert_eq!(event.target.as_deref(), Some("sshd:root"));
    }

    #[test]
    fn sshd_invalid_user_parses() {
        let line = "Jan 12 03:14:09 host sshd[813]: Invalid user admin from 203.0.113.7 port 53212";
        let event = Parser::SshdAuth.parse("sshd", line).unwrap();
        assert_eq!(event.target.as_deref(), Some("sshd:admin"));
    }

    #[test]
    fn unrelated_lines_ignored() {
        assert!(Parser::SshdAuth
            .parse("sshd", "Accepted publickey for deploy from 10.0.0.2 port 22")
            .is_none());
    }

    #[test]
    fn pam_rhost_parses() {
        let line = "pam_unix(sshd:auth): authentication failure; logname= uid=0 rhost=198.51.100.4";
        let event = Parser::AuthLog.parse("auth", line).unwrap();
        assert_eq!(event.source_ip.unwrap().to_string(), "198.51.100.4");
    }

    #[test]
    fn nft_log_line_parses_with_dport() {
        let line = "kernel: netwarden IN=eth0 SRC=198.51.100.9 DST=10.0.0.5 PROTO=TCP SPT=55555 DPT=23";
        let event = Parser::NftLog.parse("kernel", line).unwrap();
        assert_eq!(event.kind, EventKind::PortScanHit);
        assert_eq!(event.target.as_deref(), Some("dport:23"));
    }

    #[test]
    fn ipv6_source_addresses_parse() {
        let line = "Failed password for root from 2001:db8::7 port 40000 ssh2";
        let event = Parser::SshdAuth.parse("sshd", line).unwrap();
        assert!(event.source_ip.unwrap().is_ipv6());
    }
}
