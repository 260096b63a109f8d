//! Prometheus-based metrics module
//!
//! Process-global counters exposed via the admin API's /metrics endpoint.

use lazy_static::lazy_static;
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // === Session Metrics ===

    /// Total local connections accepted
    pub static ref SESSIONS_TOTAL: IntCounter = IntCounter::new(
        "aether_sessions_total",
        "Total number of local connections accepted"
    ).unwrap();

    /// Currently active sessions
    pub static ref SESSIONS_ACTIVE: IntGauge = IntGauge::new(
        "aether_sessions_active",
        "Number of currently active sessions"
    ).unwrap();

    /// Sessions that failed before relay started
    pub static ref SESSIONS_FAILED: IntCounter = IntCounter::new(
        "aether_sessions_failed",
        "Total number of sessions that failed before relaying"
    ).unwrap();

    // === Traffic Metrics ===

    /// Bytes sent into the tunnel or direct connection
    pub static ref TRAFFIC_BYTES_UPLOADED: IntCounter = IntCounter::new(
        "aether_traffic_bytes_uploaded_total",
        "Total bytes uploaded"
    ).unwrap();

    /// Bytes received from the tunnel or direct connection
    pub static ref TRAFFIC_BYTES_DOWNLOADED: IntCounter = IntCounter::new(
        "aether_traffic_bytes_downloaded_total",
        "Total bytes downloaded"
    ).unwrap();

    // === Rule Metrics ===

    /// Routing decisions by action
    pub static ref RULE_DECISIONS: IntCounterVec = IntCounterVec::new(
        Opts::new("aether_rule_decisions_total", "Routing decisions by action"),
        &["action"]
    ).unwrap();
}

/// Initialize and register all metrics with the global registry
pub fn init_metrics() {
    REGISTRY.register(Box::new(SESSIONS_TOTAL.clone())).ok();
    REGISTRY.register(Box::new(SESSIONS_ACTIVE.clone())).ok();
    REGISTRY.register(Box::new(SESSIONS_FAILED.clone())).ok();
    REGISTRY.register(Box::new(TRAFFIC_BYTES_UPLOADED.clone())).ok();
    REGISTRY
        .register(Box::new(TRAFFIC_BYTES_DOWNLOADED.clone()))
        .ok();
    REGISTRY.register(Box::new(RULE_DECISIONS.clone())).ok();
}

/// Format bytes to human readable string
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * 1024;
    const GB: u64 = 1024 * 1024 * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(500), "500 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1024 * 1024), "1.00 MB");
    }
}
