//! Geo databases for rule matching
//!
//! Two immutable-after-load databases back the rule engine: a GeoIP
//! database mapping IP ranges to country codes via per-country bit tries,
//! and a GeoSite database mapping domains to category labels via
//! multi-strategy matchers. Both load the V2Ray geodata format, raw or
//! gzipped, and are replaced wholesale on reload.

pub mod matcher;
pub mod proto;
pub mod trie;

pub use matcher::DomainMatcher;

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;

use tracing::{debug, warn};

use crate::error::{Error, Result};

use proto::{DomainKind, GeoIpEntry, GeoSiteEntry};
use trie::IpTrie;

/// IPv4 and IPv6 tries for one country
#[derive(Debug, Default)]
struct CountryTries {
    v4: IpTrie,
    v6: IpTrie,
}

/// GeoIP database: country code → IP tries.
#[derive(Debug, Default)]
pub struct GeoIpDatabase {
    countries: HashMap<String, CountryTries>,
}

impl GeoIpDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a geoip.dat file (raw or gzipped protobuf).
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)
            .map_err(|e| Error::Geo(format!("read {:?}: {}", path, e)))?;
        let raw = proto::unwrap_gzip(&data)?;
        let db = Self::from_entries(proto::parse_geoip_list(&raw)?);
        debug!("Loaded {} countries from {:?}", db.countries.len(), path);
        Ok(db)
    }

    pub fn from_entries(entries: Vec<GeoIpEntry>) -> Self {
        let mut db = Self::new();
        for entry in entries {
            if entry.country_code.is_empty() {
                continue;
            }
            for cidr in &entry.cidrs {
                db.insert(&entry.country_code, &cidr.ip, cidr.prefix);
            }
        }
        db
    }

    /// Insert one CIDR under a country code.
    pub fn insert(&mut self, code: &str, ip: &[u8], prefix: u8) {
        let tries = self
            .countries
            .entry(code.to_uppercase())
            .or_default();
        match ip.len() {
            4 => tries.v4.insert(ip, prefix),
            16 => tries.v6.insert(ip, prefix),
            n => warn!("Ignoring CIDR with {}-byte address for {}", n, code),
        }
    }

    /// Country code for an IP, preferring the longest matching prefix and
    /// breaking ties by lexicographic country code.
    pub fn lookup(&self, ip: IpAddr) -> Option<&str> {
        let mut best: Option<(u16, &str)> = None;
        for (code, tries) in &self.countries {
            if let Some(depth) = Self::match_depth(tries, ip) {
                let better = match best {
                    None => true,
                    Some((best_depth, best_code)) => {
                        depth > best_depth || (depth == best_depth && code.as_str() < best_code)
                    }
                };
                if better {
                    best = Some((depth, code));
                }
            }
        }
        best.map(|(_, code)| code)
    }

    /// Check whether an IP falls inside one specific country's ranges.
    pub fn contains(&self, code: &str, ip: IpAddr) -> bool {
        self.countries
            .get(&code.to_uppercase())
            .and_then(|tries| Self::match_depth(tries, ip))
            .is_some()
    }

    fn match_depth(tries: &CountryTries, ip: IpAddr) -> Option<u16> {
        match ip {
            IpAddr::V4(v4) => tries.v4.match_depth(&v4.octets()),
            IpAddr::V6(v6) => {
                // IPv4-mapped queries consult the v4 trie first
                if let Some(v4) = v6.to_ipv4_mapped() {
                    if let Some(depth) = tries.v4.match_depth(&v4.octets()) {
                        return Some(depth);
                    }
                }
                tries.v6.match_depth(&v6.octets())
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.countries.is_empty()
    }

    pub fn countries(&self) -> impl Iterator<Item = &str> {
        self.countries.keys().map(String::as_str)
    }
}

/// GeoSite database: category → domain matcher.
#[derive(Debug, Default)]
pub struct GeoSiteDatabase {
    categories: HashMap<String, DomainMatcher>,
}

impl GeoSiteDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a geosite.dat file (raw or gzipped protobuf).
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)
            .map_err(|e| Error::Geo(format!("read {:?}: {}", path, e)))?;
        let raw = proto::unwrap_gzip(&data)?;
        let db = Self::from_entries(proto::parse_geosite_list(&raw)?);
        debug!("Loaded {} categories from {:?}", db.categories.len(), path);
        Ok(db)
    }

    pub fn from_entries(entries: Vec<GeoSiteEntry>) -> Self {
        let mut db = Self::new();
        for entry in entries {
            if entry.country_code.is_empty() {
                continue;
            }
            let matcher = db
                .categories
                .entry(entry.country_code.to_lowercase())
                .or_default();
            for rule in &entry.domains {
                match rule.kind {
                    DomainKind::Full => matcher.add_full(&rule.value),
                    DomainKind::RootDomain => matcher.add_suffix(&rule.value),
                    DomainKind::Plain => matcher.add_keyword(&rule.value),
                    DomainKind::Regex => {
                        if let Err(e) = matcher.add_regex(&rule.value) {
                            warn!("Skipping geosite rule: {}", e);
                        }
                    }
                }
            }
        }
        db
    }

    /// Check a domain against one category.
    pub fn matches(&self, category: &str, domain: &str) -> bool {
        self.categories
            .get(&category.to_lowercase())
            .map(|m| m.matches(domain))
            .unwrap_or(false)
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }

    pub fn categories(&self) -> impl Iterator<Item = &str> {
        self.categories.keys().map(String::as_str)
    }
}
