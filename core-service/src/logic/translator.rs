//! Translator client
//!
//! HTTP client for the external model inference endpoint. Two calls: `draft`
//! turns operator text into a draft rule document for the propose path, and
//! `classify` is the correlator's optional slow path. Both are blocking
//! (callers run them under `spawn_blocking`) and both carry a timeout; the
//! slow path degrades silently, the draft path fails with a typed error.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::logic::correlator::{ThreatAssessment, ThreatKind};
use crate::logic::error::{AdapterError, CoreError, CoreResult};
use crate::logic::policy::{
    Action, AddrSpec, Direction, Family, Origin, PolicyRule, PortSpec, Protocol,
};

/// Draft rule document as produced by the translator. Field-for-field a
/// loose `PolicyRule`; everything is re-validated before it becomes one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DraftRule {
    pub direction: Direction,
    pub action: Action,
    #[serde(default)]
    pub family: Option<Family>,
    #[serde(default)]
    pub source: Option<AddrSpec>,
    #[serde(default)]
    pub destination: Option<AddrSpec>,
    #[serde(default)]
    pub protocol: Option<Protocol>,
    #[serde(default)]
    pub source_port: Option<PortSpec>,
    #[serde(default)]
    pub destination_port: Option<PortSpec>,
    #[serde(default)]
    pub rate_limit: Option<crate::logic::policy::RateLimit>,
    #[serde(default)]
    pub log: bool,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DraftPolicy {
    pub rule: DraftRule,
    pub explanation: String,
}

impl DraftRule {
    /// Lift into the neutral model. Translator output is operator intent,
    /// so the origin is `user`.
    pub fn into_policy_rule(self) -> PolicyRule {
        let mut rule = PolicyRule::new(self.direction, self.action, Origin::User);
        if let Some(family) = self.family {
            rule.family = family;
        }
        rule.source = self.source;
        rule.destination = self.destination;
        if let Some(protocol) = self.protocol {
            rule.protocol = protocol;
        }
        rule.source_port = self.source_port;
        rule.destination_port = self.destination_port;
        rule.rate_limit = self.rate_limit;
        rule.log = self.log;
        rule.comment = self.comment;
        rule
    }
}

#[derive(Debug, Serialize)]
struct ClassifyRequest<'a> {
    kind: &'a str,
    subject: String,
    score: f64,
    event_count: u64,
    distinct_sources: usize,
}

#[derive(Debug, Deserialize)]
struct ClassifyResponse {
    confirmed: bool,
    #[serde(default)]
    kind: Option<String>,
}

pub struct TranslatorClient {
    base_url: String,
    timeout: Duration,
}

impl TranslatorClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self { base_url: base_url.into(), timeout }
    }

    /// Ask the inference endpoint for a draft rule for free-text intent.
    pub fn draft(&self, text: &str, ruleset_context: &str) -> CoreResult<DraftPolicy> {
        let url = format!("{}/v1/draft", self.base_url);
        let response = ureq::post(&url)
            .timeout(self.timeout)
            .send_json(serde_json::json!({
                "intent": text,
                "active_ruleset": ruleset_context,
            }))
            .map_err(|e| {
                CoreError::adapter(AdapterError::unavailable(format!(
                    "translator unreachable: {}",
                    e
                )))
            })?;
        response.into_json::<DraftPolicy>().map_err(|e| {
            CoreError::adapter(AdapterError::system(format!(
                "translator returned an unreadable draft: {}",
                e
            )))
        })
    }

    /// Slow-path classification of an ambiguous assessment. Every failure
    /// maps to None; the fast path must keep working without this endpoint.
    pub fn classify(&self, assessment: &ThreatAssessment) -> Option<ThreatKind> {
        let url = format!("{}/v1/classify", self.base_url);
        let request = ClassifyRequest {
            kind: assessment.kind.as_str(),
            subject: assessment.subject.to_string(),
            score: assessment.score,
            event_count: assessment.event_count,
            distinct_sources: assessment.distinct_sources,
        };
        let response = ureq::post(&url)
            .timeout(self.timeout)
            .send_json(serde_json::to_value(&request).ok()?)
            .ok()?;
        let parsed: ClassifyResponse = response.into_json().ok()?;
        if !parsed.confirmed {
            return None;
        }
        match parsed.kind.as_deref() {
            Some("brute-force") => Some(ThreatKind::BruteForce),
            Some("port-scan") => Some(ThreatKind::PortScan),
            Some("rate-spike") => Some(ThreatKind::RateSpike),
            Some("feed-hit") => Some(ThreatKind::FeedHit),
            _ => Some(assessment.kind),
        }
    }
}
