//! Domain matcher
//!
//! One matcher per geosite category, combining four strategies: exact
//! (full), suffix, keyword (substring) and regex. All stored strings are
//! lowercased on ingest; suffixes keep a leading dot so that
//! `google.com.evil.com` does not match a `google.com` suffix.

use std::collections::HashSet;

use regex::Regex;

use crate::error::{Error, Result};

/// Multi-strategy domain matcher.
#[derive(Debug, Default)]
pub struct DomainMatcher {
    full: HashSet<String>,
    suffixes: Vec<String>,
    keywords: Vec<String>,
    patterns: Vec<Regex>,
}

impl DomainMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_full(&mut self, domain: &str) {
        self.full.insert(domain.to_lowercase());
    }

    pub fn add_suffix(&mut self, domain: &str) {
        let domain = domain.to_lowercase();
        if domain.starts_with('.') {
            self.suffixes.push(domain);
        } else {
            self.suffixes.push(format!(".{}", domain));
        }
    }

    pub fn add_keyword(&mut self, keyword: &str) {
        self.keywords.push(keyword.to_lowercase());
    }

    pub fn add_regex(&mut self, pattern: &str) -> Result<()> {
        let re = Regex::new(pattern)
            .map_err(|e| Error::Geo(format!("invalid regex {:?}: {}", pattern, e)))?;
        self.patterns.push(re);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.full.is_empty()
            && self.suffixes.is_empty()
            && self.keywords.is_empty()
            && self.patterns.is_empty()
    }

    /// Check a query domain against all strategies.
    pub fn matches(&self, domain: &str) -> bool {
        let domain = domain.to_lowercase();

        if self.full.contains(&domain) {
            return true;
        }
        // suffix entries carry a leading dot; the dot-stripped form matches
        // the bare domain itself
        if self
            .suffixes
            .iter()
            .any(|s| domain == s[1..] || domain.ends_with(s.as_str()))
        {
            return true;
        }
        if self.keywords.iter().any(|k| domain.contains(k)) {
            return true;
        }
        self.patterns.iter().any(|re| re.is_match(&domain))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_match() {
        let mut m = DomainMatcher::new();
        m.add_full("Example.COM");
        assert!(m.matches("example.com"));
        assert!(m.matches("EXAMPLE.com"));
        assert!(!m.matches("www.example.com"));
    }

    #[test]
    fn test_suffix_match() {
        let mut m = DomainMatcher::new();
        m.add_suffix("google.com");
        assert!(m.matches("google.com"));
        assert!(m.matches("mail.google.com"));
        assert!(m.matches("a.b.google.com"));
        assert!(!m.matches("notgoogle.com"));
        assert!(!m.matches("google.com.evil.com"));
    }

    #[test]
    fn test_keyword_match() {
        let mut m = DomainMatcher::new();
        m.add_keyword("tracker");
        assert!(m.matches("tracker.example.com"));
        assert!(m.matches("my-tracker-cdn.net"));
        assert!(!m.matches("example.com"));
    }

    #[test]
    fn test_regex_match() {
        let mut m = DomainMatcher::new();
        m.add_regex(r"^ads?\d*\.").unwrap();
        assert!(m.matches("ad1.example.com"));
        assert!(m.matches("ads.example.com"));
        assert!(!m.matches("badads.example.com"));

        assert!(m.add_regex("(unclosed").is_err());
    }
}
