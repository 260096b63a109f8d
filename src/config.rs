//! Configuration persistence
//!
//! The daemon keeps two JSON documents next to its executable: the session
//! configuration (`config.json`) and the rule list (`rules.json`). Field
//! names of the session config are fixed by the admin API contract.
//! Command-line flags override loaded values only when explicitly given.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::rules::Rule;

pub const CONFIG_FILE_NAME: &str = "config.json";
pub const RULES_FILE_NAME: &str = "rules.json";

/// Persisted session configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// SOCKS5 listen address
    #[serde(rename = "ListenAddr")]
    pub listen_addr: String,

    /// Optional HTTP CONNECT listen address
    #[serde(rename = "HttpProxyAddr", default)]
    pub http_proxy_addr: String,

    /// WebTransport tunnel endpoint URL
    #[serde(rename = "URL")]
    pub url: String,

    /// Pre-shared key
    #[serde(rename = "PSK")]
    pub psk: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:1080".to_string(),
            http_proxy_addr: String::new(),
            url: String::new(),
            psk: String::new(),
        }
    }
}

/// Handles configuration load/save.
pub struct ConfigManager {
    config_path: PathBuf,
    rules_path: PathBuf,
    lock: Mutex<()>,
}

impl ConfigManager {
    /// Manager rooted at the executable's directory.
    pub fn new() -> Result<Self> {
        let exe = std::env::current_exe()?;
        let dir = exe
            .parent()
            .ok_or_else(|| Error::Config("executable has no parent directory".into()))?;
        Ok(Self::with_dir(dir))
    }

    /// Manager rooted at an explicit directory.
    pub fn with_dir(dir: &Path) -> Self {
        Self {
            config_path: dir.join(CONFIG_FILE_NAME),
            rules_path: dir.join(RULES_FILE_NAME),
            lock: Mutex::new(()),
        }
    }

    /// Load the session config. A missing file is not an error.
    pub fn load(&self) -> Result<Option<SessionConfig>> {
        let _guard = self.lock.lock();
        read_json(&self.config_path)
    }

    /// Save the session config.
    pub fn save(&self, config: &SessionConfig) -> Result<()> {
        let _guard = self.lock.lock();
        write_json(&self.config_path, config)
    }

    /// Load the persisted rule list. A missing file is not an error.
    pub fn load_rules(&self) -> Result<Option<Vec<Rule>>> {
        let _guard = self.lock.lock();
        read_json(&self.rules_path)
    }

    /// Save the rule list.
    pub fn save_rules(&self, rules: &[Rule]) -> Result<()> {
        let _guard = self.lock.lock();
        write_json(&self.rules_path, &rules)
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let data = match std::fs::read_to_string(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::Config(format!("read {:?}: {}", path, e))),
    };
    serde_json::from_str(&data)
        .map(Some)
        .map_err(|e| Error::Config(format!("parse {:?}: {}", path, e)))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let data = serde_json::to_string_pretty(value)
        .map_err(|e| Error::Config(format!("serialize: {}", e)))?;
    std::fs::write(path, data).map_err(|e| Error::Config(format!("write {:?}: {}", path, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{Action, MatchCondition, MatchType};

    #[test]
    fn test_config_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ConfigManager::with_dir(dir.path());

        assert!(manager.load().unwrap().is_none());

        let config = SessionConfig {
            listen_addr: "127.0.0.1:1080".into(),
            http_proxy_addr: "127.0.0.1:1081".into(),
            url: "https://relay.example.com/v1/api/sync".into(),
            psk: "secret".into(),
        };
        manager.save(&config).unwrap();
        assert_eq!(manager.load().unwrap().unwrap(), config);
    }

    #[test]
    fn test_config_wire_field_names() {
        let config = SessionConfig {
            listen_addr: "127.0.0.1:1080".into(),
            http_proxy_addr: String::new(),
            url: "https://example.com".into(),
            psk: "k".into(),
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"ListenAddr\""));
        assert!(json.contains("\"HttpProxyAddr\""));
        assert!(json.contains("\"URL\""));
        assert!(json.contains("\"PSK\""));
    }

    #[test]
    fn test_rules_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ConfigManager::with_dir(dir.path());

        assert!(manager.load_rules().unwrap().is_none());

        let rules = vec![Rule {
            id: "r1".into(),
            name: "block ads".into(),
            priority: 10,
            enabled: true,
            matches: vec![MatchCondition {
                match_type: MatchType::DomainKeyword,
                value: "adserver".into(),
                not: false,
            }],
            action: Action::Block,
            target: None,
        }];
        manager.save_rules(&rules).unwrap();
        assert_eq!(manager.load_rules().unwrap().unwrap(), rules);
    }

    #[test]
    fn test_corrupt_config_is_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE_NAME), "{not json").unwrap();
        let manager = ConfigManager::with_dir(dir.path());
        assert!(manager.load().is_err());
    }
}
