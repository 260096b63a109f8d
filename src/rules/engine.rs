//! Rule engine
//!
//! Readers snapshot the current rule list under a short read lease and
//! evaluate against their local copy, so `match_request` never blocks on
//! writers and never suspends. Writers replace the list atomically. Geo
//! databases are immutable once published; reloads swap the Arc.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use ipnet::IpNet;
use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::geo::{GeoIpDatabase, GeoSiteDatabase};

use super::{Action, MatchCondition, MatchRequest, MatchResult, MatchType, Rule};

/// Evaluates rules against connection requests.
pub struct RuleEngine {
    rules: RwLock<Arc<Vec<Rule>>>,
    match_count: RwLock<HashMap<String, u64>>,
    geoip: RwLock<Option<Arc<GeoIpDatabase>>>,
    geosite: RwLock<Option<Arc<GeoSiteDatabase>>>,
    default_action: Action,
}

impl RuleEngine {
    pub fn new(default_action: Action) -> Self {
        Self {
            rules: RwLock::new(Arc::new(Vec::new())),
            match_count: RwLock::new(HashMap::new()),
            geoip: RwLock::new(None),
            geosite: RwLock::new(None),
            default_action,
        }
    }

    pub fn default_action(&self) -> Action {
        self.default_action
    }

    /// Publish geo databases. Passing a fresh database replaces the old one
    /// atomically for subsequent matches.
    pub fn set_geoip(&self, db: Arc<GeoIpDatabase>) {
        *self.geoip.write() = Some(db);
    }

    pub fn set_geosite(&self, db: Arc<GeoSiteDatabase>) {
        *self.geosite.write() = Some(db);
    }

    /// Replace all rules atomically after validating every one.
    pub fn update_rules(&self, rules: Vec<Rule>) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for rule in &rules {
            validate_rule(rule)?;
            if !seen.insert(rule.id.as_str()) {
                return Err(Error::Rule(format!("duplicate rule id: {}", rule.id)));
            }
        }
        *self.rules.write() = Arc::new(rules);
        Ok(())
    }

    /// Add a single rule.
    pub fn add_rule(&self, rule: Rule) -> Result<()> {
        validate_rule(&rule)?;
        let mut guard = self.rules.write();
        if guard.iter().any(|r| r.id == rule.id) {
            return Err(Error::Rule(format!("duplicate rule id: {}", rule.id)));
        }
        let mut rules = guard.as_ref().clone();
        rules.push(rule);
        *guard = Arc::new(rules);
        Ok(())
    }

    /// Remove a rule by id. Returns whether a rule was removed.
    pub fn remove_rule(&self, id: &str) -> bool {
        let mut guard = self.rules.write();
        if !guard.iter().any(|r| r.id == id) {
            return false;
        }
        let rules: Vec<Rule> = guard.iter().filter(|r| r.id != id).cloned().collect();
        *guard = Arc::new(rules);
        true
    }

    /// Current rules (copy).
    pub fn get_rules(&self) -> Vec<Rule> {
        self.rules.read().as_ref().clone()
    }

    /// Per-rule match counters (copy).
    pub fn get_match_stats(&self) -> HashMap<String, u64> {
        self.match_count.read().clone()
    }

    /// Evaluate rules against a request. Deterministic for a fixed rule
    /// list; the first fully matching rule in priority order wins.
    pub fn match_request(&self, req: &MatchRequest) -> Result<MatchResult> {
        let rules = Arc::clone(&self.rules.read());
        let geoip = self.geoip.read().clone();
        let geosite = self.geosite.read().clone();

        // priority descending; the stable sort keeps declaration order
        // within a priority band
        let mut sorted: Vec<&Rule> = rules.iter().collect();
        sorted.sort_by(|a, b| b.priority.cmp(&a.priority));

        for rule in sorted {
            if !rule.enabled {
                continue;
            }
            if self.evaluate_rule(rule, req, geoip.as_deref(), geosite.as_deref())? {
                self.record_match(&rule.id);
                return Ok(MatchResult {
                    action: rule.action,
                    rule_id: rule.id.clone(),
                    rule_name: rule.name.clone(),
                });
            }
        }

        Ok(MatchResult {
            action: self.default_action,
            rule_id: String::new(),
            rule_name: "default".into(),
        })
    }

    fn evaluate_rule(
        &self,
        rule: &Rule,
        req: &MatchRequest,
        geoip: Option<&GeoIpDatabase>,
        geosite: Option<&GeoSiteDatabase>,
    ) -> Result<bool> {
        for cond in &rule.matches {
            let mut matched = evaluate_condition(cond, req, geoip, geosite)?;
            if cond.not {
                matched = !matched;
            }
            if !matched {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn record_match(&self, rule_id: &str) {
        *self
            .match_count
            .write()
            .entry(rule_id.to_string())
            .or_insert(0) += 1;
    }
}

fn validate_rule(rule: &Rule) -> Result<()> {
    if rule.id.is_empty() {
        return Err(Error::Rule("rule id is required".into()));
    }
    if rule.name.is_empty() {
        return Err(Error::Rule(format!("rule {}: name is required", rule.id)));
    }
    if rule.matches.is_empty() {
        return Err(Error::Rule(format!(
            "rule {}: at least one match condition is required",
            rule.id
        )));
    }
    Ok(())
}

fn evaluate_condition(
    cond: &MatchCondition,
    req: &MatchRequest,
    geoip: Option<&GeoIpDatabase>,
    geosite: Option<&GeoSiteDatabase>,
) -> Result<bool> {
    match cond.match_type {
        MatchType::Domain => {
            Ok(!req.domain.is_empty() && req.domain.eq_ignore_ascii_case(&cond.value))
        }
        MatchType::DomainSuffix => {
            if req.domain.is_empty() {
                return Ok(false);
            }
            let domain = req.domain.to_lowercase();
            let value = cond.value.trim_start_matches('.').to_lowercase();
            Ok(domain == value || domain.ends_with(&format!(".{}", value)))
        }
        MatchType::DomainKeyword => Ok(req
            .domain
            .to_lowercase()
            .contains(&cond.value.to_lowercase())),
        MatchType::GeoSite => Ok(match geosite {
            Some(db) => !req.domain.is_empty() && db.matches(&cond.value, &req.domain),
            None => false,
        }),
        MatchType::Ip => {
            let target: IpAddr = cond
                .value
                .parse()
                .map_err(|_| Error::Rule(format!("invalid IP: {}", cond.value)))?;
            Ok(req
                .ip
                .map(|ip| canonical_ip(ip) == canonical_ip(target))
                .unwrap_or(false))
        }
        MatchType::IpCidr => {
            let net: IpNet = cond
                .value
                .parse()
                .map_err(|_| Error::Rule(format!("invalid CIDR: {}", cond.value)))?;
            Ok(req
                .ip
                .map(|ip| net.contains(&canonical_ip(ip)))
                .unwrap_or(false))
        }
        MatchType::GeoIp => Ok(match (geoip, req.ip) {
            (Some(db), Some(ip)) => db
                .lookup(ip)
                .map(|code| code.eq_ignore_ascii_case(&cond.value))
                .unwrap_or(false),
            _ => false,
        }),
        MatchType::Port => match_port(req.port, &cond.value),
        MatchType::Process => {
            Ok(!req.process.is_empty() && req.process.eq_ignore_ascii_case(&cond.value))
        }
    }
}

/// Net-equality canonical form: IPv4-mapped IPv6 compares equal to IPv4.
fn canonical_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(IpAddr::V4)
            .unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    }
}

/// Port spec: comma-separated singletons and inclusive ranges.
/// An inverted range ("2000-1000") parses but never matches.
fn match_port(port: u16, spec: &str) -> Result<bool> {
    for part in spec.split(',') {
        let part = part.trim();
        if let Some((start, end)) = part.split_once('-') {
            let start: u16 = start
                .trim()
                .parse()
                .map_err(|_| Error::Rule(format!("invalid port range: {}", part)))?;
            let end: u16 = end
                .trim()
                .parse()
                .map_err(|_| Error::Rule(format!("invalid port range: {}", part)))?;
            if port >= start && port <= end {
                return Ok(true);
            }
        } else {
            let single: u16 = part
                .parse()
                .map_err(|_| Error::Rule(format!("invalid port: {}", part)))?;
            if port == single {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(id: &str, priority: i32, matches: Vec<MatchCondition>, action: Action) -> Rule {
        Rule {
            id: id.into(),
            name: id.into(),
            priority,
            enabled: true,
            matches,
            action,
            target: None,
        }
    }

    fn cond(match_type: MatchType, value: &str) -> MatchCondition {
        MatchCondition {
            match_type,
            value: value.into(),
            not: false,
        }
    }

    #[test]
    fn test_default_action_when_no_match() {
        let engine = RuleEngine::new(Action::Proxy);
        let result = engine
            .match_request(&MatchRequest::new(443).with_domain("example.com"))
            .unwrap();
        assert_eq!(result.action, Action::Proxy);
        assert_eq!(result.rule_id, "");
        assert_eq!(result.rule_name, "default");
    }

    #[test]
    fn test_domain_suffix_semantics() {
        let engine = RuleEngine::new(Action::Direct);
        engine
            .update_rules(vec![rule(
                "g",
                0,
                vec![cond(MatchType::DomainSuffix, "google.com")],
                Action::Proxy,
            )])
            .unwrap();

        let matched = |domain: &str| {
            engine
                .match_request(&MatchRequest::new(443).with_domain(domain))
                .unwrap()
                .action
        };
        assert_eq!(matched("mail.google.com"), Action::Proxy);
        assert_eq!(matched("google.com"), Action::Proxy);
        assert_eq!(matched("GOOGLE.com"), Action::Proxy);
        assert_eq!(matched("notgoogle.com"), Action::Direct);
        assert_eq!(matched("google.com.evil.com"), Action::Direct);
    }

    #[test]
    fn test_geoip_routing() {
        let mut db = GeoIpDatabase::new();
        db.insert("CN", &[114, 114, 0, 0], 16);

        let engine = RuleEngine::new(Action::Proxy);
        engine.set_geoip(Arc::new(db));
        engine
            .update_rules(vec![rule(
                "cn",
                100,
                vec![cond(MatchType::GeoIp, "CN")],
                Action::Direct,
            )])
            .unwrap();

        let result = engine
            .match_request(
                &MatchRequest::new(53).with_ip("114.114.114.114".parse().unwrap()),
            )
            .unwrap();
        assert_eq!(result.action, Action::Direct);
        assert_eq!(result.rule_id, "cn");

        let result = engine
            .match_request(&MatchRequest::new(53).with_ip("8.8.8.8".parse().unwrap()))
            .unwrap();
        assert_eq!(result.action, Action::Proxy);
        assert_eq!(result.rule_name, "default");
    }

    #[test]
    fn test_port_ranges() {
        let engine = RuleEngine::new(Action::Direct);
        engine
            .update_rules(vec![rule(
                "p",
                0,
                vec![cond(MatchType::Port, "8000-8100,9000")],
                Action::Block,
            )])
            .unwrap();

        let action = |port: u16| {
            engine
                .match_request(&MatchRequest::new(port))
                .unwrap()
                .action
        };
        for port in [8000, 8050, 8100, 9000] {
            assert_eq!(action(port), Action::Block, "port {}", port);
        }
        for port in [7999, 8101, 9001] {
            assert_eq!(action(port), Action::Direct, "port {}", port);
        }
    }

    #[test]
    fn test_inverted_range_never_matches() {
        assert!(!match_port(1500, "2000-1000").unwrap());
        assert!(match_port(80, "80").unwrap());
        assert!(match_port(443, "80,443").unwrap());
        assert!(match_port(1500, "1000-2000").unwrap());
        assert!(match_port(8080, "1000-2000,8080").unwrap());
        assert!(match_port(999, "1000-2000").is_ok());
        assert!(match_port(80, "http").is_err());
        assert!(match_port(80, "10-x").is_err());
    }

    #[test]
    fn test_condition_parse_error_surfaces() {
        let engine = RuleEngine::new(Action::Direct);
        engine
            .update_rules(vec![rule(
                "bad",
                0,
                vec![cond(MatchType::IpCidr, "not-a-cidr")],
                Action::Block,
            )])
            .unwrap();

        let result =
            engine.match_request(&MatchRequest::new(80).with_ip("1.2.3.4".parse().unwrap()));
        assert!(matches!(result, Err(Error::Rule(_))));
    }

    #[test]
    fn test_priority_order_and_negation() {
        let engine = RuleEngine::new(Action::Direct);
        engine
            .update_rules(vec![
                rule(
                    "low",
                    1,
                    vec![cond(MatchType::DomainKeyword, "example")],
                    Action::Proxy,
                ),
                rule(
                    "high",
                    10,
                    vec![MatchCondition {
                        match_type: MatchType::DomainSuffix,
                        value: "example.org".into(),
                        not: true,
                    }],
                    Action::Block,
                ),
            ])
            .unwrap();

        // "high" wins for anything that is not *.example.org
        let result = engine
            .match_request(&MatchRequest::new(80).with_domain("example.com"))
            .unwrap();
        assert_eq!(result.rule_id, "high");

        // negated condition excludes example.org, falling to "low"
        let result = engine
            .match_request(&MatchRequest::new(80).with_domain("www.example.org"))
            .unwrap();
        assert_eq!(result.rule_id, "low");
    }

    #[test]
    fn test_and_combination() {
        let engine = RuleEngine::new(Action::Direct);
        engine
            .update_rules(vec![rule(
                "both",
                0,
                vec![
                    cond(MatchType::DomainSuffix, "example.com"),
                    cond(MatchType::Port, "443"),
                ],
                Action::Proxy,
            )])
            .unwrap();

        let result = engine
            .match_request(&MatchRequest::new(443).with_domain("www.example.com"))
            .unwrap();
        assert_eq!(result.action, Action::Proxy);

        let result = engine
            .match_request(&MatchRequest::new(80).with_domain("www.example.com"))
            .unwrap();
        assert_eq!(result.action, Action::Direct);
    }

    #[test]
    fn test_ip_equality_with_mapped_v6() {
        let engine = RuleEngine::new(Action::Direct);
        engine
            .update_rules(vec![rule(
                "ip",
                0,
                vec![cond(MatchType::Ip, "8.8.8.8")],
                Action::Proxy,
            )])
            .unwrap();

        let mapped: IpAddr = "::ffff:8.8.8.8".parse().unwrap();
        let result = engine
            .match_request(&MatchRequest::new(53).with_ip(mapped))
            .unwrap();
        assert_eq!(result.action, Action::Proxy);
    }

    #[test]
    fn test_validation_rejects_bad_rules() {
        let engine = RuleEngine::new(Action::Direct);
        let bad = Rule {
            id: String::new(),
            name: "x".into(),
            priority: 0,
            enabled: true,
            matches: vec![cond(MatchType::Port, "80")],
            action: Action::Direct,
            target: None,
        };
        assert!(engine.update_rules(vec![bad]).is_err());

        let no_matches = rule("x", 0, vec![], Action::Direct);
        assert!(engine.add_rule(no_matches).is_err());

        let ok = rule("x", 0, vec![cond(MatchType::Port, "80")], Action::Direct);
        engine.add_rule(ok.clone()).unwrap();
        assert!(engine.add_rule(ok).is_err(), "duplicate id rejected");
    }

    #[test]
    fn test_crud_and_stats() {
        let engine = RuleEngine::new(Action::Direct);
        engine
            .add_rule(rule("a", 0, vec![cond(MatchType::Port, "80")], Action::Block))
            .unwrap();
        assert_eq!(engine.get_rules().len(), 1);

        engine.match_request(&MatchRequest::new(80)).unwrap();
        engine.match_request(&MatchRequest::new(80)).unwrap();
        engine.match_request(&MatchRequest::new(81)).unwrap();
        assert_eq!(engine.get_match_stats().get("a"), Some(&2));

        assert!(engine.remove_rule("a"));
        assert!(!engine.remove_rule("a"));
        assert!(engine.get_rules().is_empty());
    }

    #[test]
    fn test_disabled_rule_skipped() {
        let engine = RuleEngine::new(Action::Direct);
        let mut disabled = rule("d", 0, vec![cond(MatchType::Port, "80")], Action::Block);
        disabled.enabled = false;
        engine.update_rules(vec![disabled]).unwrap();
        let result = engine.match_request(&MatchRequest::new(80)).unwrap();
        assert_eq!(result.action, Action::Direct);
    }
}
