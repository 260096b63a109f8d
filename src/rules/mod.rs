//! Rule-based traffic routing
//!
//! Rules are evaluated by the daemon core; the admin API only edits them.
//! A rule is an ordered list of AND-combined conditions plus an action.

pub mod engine;

pub use engine::RuleEngine;

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// What to do with matched traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Direct connection (bypass the tunnel)
    Direct,
    /// Route through the tunnel
    Proxy,
    /// Drop the connection silently
    Block,
    /// Refuse with the proxy protocol's error reply
    Reject,
}

/// How a condition matches traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchType {
    /// Exact domain match
    #[serde(rename = "domain")]
    Domain,
    /// Suffix match (value itself or any subdomain)
    #[serde(rename = "domain_suffix")]
    DomainSuffix,
    /// Substring match
    #[serde(rename = "domain_keyword")]
    DomainKeyword,
    /// GeoSite category (e.g. "google")
    #[serde(rename = "geosite")]
    GeoSite,
    /// Exact IP match
    #[serde(rename = "ip")]
    Ip,
    /// CIDR range
    #[serde(rename = "ip_cidr")]
    IpCidr,
    /// GeoIP country code (e.g. "CN")
    #[serde(rename = "geoip")]
    GeoIp,
    /// Port number, list or range ("80,443" or "1000-2000")
    #[serde(rename = "port")]
    Port,
    /// Process name (platform-specific)
    #[serde(rename = "process")]
    Process,
}

/// A single match criterion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchCondition {
    #[serde(rename = "type")]
    pub match_type: MatchType,
    pub value: String,
    /// Negate the condition's result
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub not: bool,
}

/// A single routing rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    /// Unique identifier (caller-assigned)
    pub id: String,
    /// Human-readable name
    pub name: String,
    /// Higher priority is evaluated first
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Match conditions, AND-combined in declaration order
    pub matches: Vec<MatchCondition>,
    pub action: Action,
    /// Reserved for a specific outbound tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

fn default_enabled() -> bool {
    true
}

/// Connection info offered to the rule engine
#[derive(Debug, Clone, Default)]
pub struct MatchRequest {
    /// Target domain, empty when only the IP is known
    pub domain: String,
    /// Target IP, absent when only the domain is known
    pub ip: Option<IpAddr>,
    /// Target port
    pub port: u16,
    /// Process name, may be empty
    pub process: String,
    /// User id, may be zero
    pub uid: u32,
}

impl MatchRequest {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ..Default::default()
        }
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.ip = Some(ip);
        self
    }

    pub fn with_process(mut self, process: impl Into<String>) -> Self {
        self.process = process.into();
        self
    }
}

/// Outcome of rule matching
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MatchResult {
    pub action: Action,
    pub rule_id: String,
    pub rule_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_json_round_trip() {
        let rule = Rule {
            id: "r1".into(),
            name: "CN direct".into(),
            priority: 100,
            enabled: true,
            matches: vec![MatchCondition {
                match_type: MatchType::GeoIp,
                value: "CN".into(),
                not: false,
            }],
            action: Action::Direct,
            target: None,
        };

        let json = serde_json::to_string(&rule).unwrap();
        let parsed: Rule = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, rule);
    }

    #[test]
    fn test_rule_json_wire_names() {
        let json = r#"{
            "id": "r2",
            "name": "ads",
            "priority": 50,
            "enabled": true,
            "matches": [
                {"type": "domain_suffix", "value": "doubleclick.net"},
                {"type": "ip_cidr", "value": "10.0.0.0/8", "not": true}
            ],
            "action": "block"
        }"#;
        let rule: Rule = serde_json::from_str(json).unwrap();
        assert_eq!(rule.matches[0].match_type, MatchType::DomainSuffix);
        assert_eq!(rule.matches[1].match_type, MatchType::IpCidr);
        assert!(rule.matches[1].not);
        assert_eq!(rule.action, Action::Block);
    }

    #[test]
    fn test_enabled_defaults_true() {
        let json = r#"{"id":"x","name":"x","matches":[{"type":"port","value":"80"}],"action":"proxy"}"#;
        let rule: Rule = serde_json::from_str(json).unwrap();
        assert!(rule.enabled);
        assert_eq!(rule.priority, 0);
    }
}
