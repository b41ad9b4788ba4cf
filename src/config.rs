//! Configuration for region sync.
//!
//! This module defines all configuration types needed to run a region's sync
//! subsystem. Configuration is passed to [`SyncEngine::new()`](crate::SyncEngine::new)
//! and can be constructed programmatically, deserialized from JSON/YAML, or
//! read from the process environment with [`SyncConfig::from_env()`].
//!
//! # Quick Start
//!
//! ```rust
//! use region_sync::config::{SyncConfig, PeerConfig};
//!
//! let config = SyncConfig {
//!     local_region: "us-east".into(),
//!     peers: vec![
//!         PeerConfig::for_testing("eu-west", "http://eu-west.internal:8080"),
//!     ],
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! SyncConfig
//! ├── local_region: String          # This region's identifier
//! ├── settings: SyncSettings
//! │   ├── outbound: OutboundConfig  # Per-peer push loop
//! │   ├── probe: ProbeConfig        # Liveness probing + island mode grace
//! │   └── query: QueryConfig        # Scatter-gather reads
//! ├── peers: Vec<PeerConfig>        # Remote regions
//! └── change_log: ChangeLogConfig   # SQLite change log
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! local_region: "us-east"
//!
//! settings:
//!   outbound:
//!     interval: "5s"
//!     batch_size: 100
//!     request_timeout: "3s"
//!   probe:
//!     interval: "2s"
//!     timeout: "500ms"
//!     isolation_grace: "60s"
//!
//! peers:
//!   - region_id: "eu-west"
//!     base_url: "http://eu-west.internal:8080"
//!
//! change_log:
//!   sqlite_path: "/var/lib/app/change_log.db"
//! ```

use crate::error::{ReplicationError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use tracing::warn;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config: passed to SyncEngine::new()
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `SyncEngine::new()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// The identity of the local region.
    /// Stamped on every locally produced change log entry.
    pub local_region: String,

    /// Loop cadences, timeouts and batch sizes.
    #[serde(default)]
    pub settings: SyncSettings,

    /// The remote regions to replicate with.
    #[serde(default)]
    pub peers: Vec<PeerConfig>,

    /// Change log persistence settings.
    #[serde(default)]
    pub change_log: ChangeLogConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            local_region: "local".to_string(),
            settings: SyncSettings::default(),
            peers: Vec::new(),
            change_log: ChangeLogConfig::default(),
        }
    }
}

impl SyncConfig {
    /// Create a minimal config for testing.
    pub fn for_testing(local_region: &str) -> Self {
        Self {
            local_region: local_region.to_string(),
            settings: SyncSettings::default(),
            peers: Vec::new(),
            change_log: ChangeLogConfig::in_memory(),
        }
    }

    /// Region ids of every configured peer, in config order.
    pub fn peer_ids(&self) -> Vec<String> {
        self.peers.iter().map(|p| p.region_id.clone()).collect()
    }

    /// Check the config for mistakes that would make replication misbehave.
    pub fn validate(&self) -> Result<()> {
        if self.local_region.trim().is_empty() {
            return Err(ReplicationError::Config("local_region must not be empty".into()));
        }

        let mut seen = HashSet::new();
        for peer in &self.peers {
            if peer.region_id == self.local_region {
                return Err(ReplicationError::Config(format!(
                    "peer {} has the same id as the local region",
                    peer.region_id
                )));
            }
            if !seen.insert(peer.region_id.as_str()) {
                return Err(ReplicationError::Config(format!(
                    "duplicate peer {}",
                    peer.region_id
                )));
            }
            if !(peer.base_url.starts_with("http://") || peer.base_url.starts_with("https://")) {
                return Err(ReplicationError::Config(format!(
                    "peer {} has a non-HTTP base_url: {}",
                    peer.region_id, peer.base_url
                )));
            }
        }

        // tokio intervals panic on a zero period
        if self.settings.outbound.interval_duration().is_zero() {
            return Err(ReplicationError::Config("outbound.interval must be > 0".into()));
        }
        if self.settings.probe.interval_duration().is_zero() {
            return Err(ReplicationError::Config("probe.interval must be > 0".into()));
        }

        if self.settings.outbound.batch_size == 0 {
            return Err(ReplicationError::Config("outbound.batch_size must be > 0".into()));
        }

        if self.settings.probe.timeout_duration() >= self.settings.outbound.request_timeout_duration() {
            return Err(ReplicationError::Config(
                "probe.timeout must be shorter than outbound.request_timeout".into(),
            ));
        }

        Ok(())
    }

    /// Build a config from the process environment.
    ///
    /// | Variable | Meaning | Default |
    /// |----------|---------|---------|
    /// | `REGION` | local region id | required |
    /// | `REMOTE_REGIONS` | JSON list of peers (objects or `"id=url"`) | `[]` |
    /// | `SYNC_INTERVAL` | outbound tick, seconds | 5 |
    /// | `REQUEST_TIMEOUT` | outbound push timeout, seconds | 3 |
    /// | `ISOLATION_THRESHOLD` | island mode grace, seconds | 60 |
    /// | `CHANGE_LOG_PATH` | SQLite file | `change_log.db` |
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable lookup.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let local_region = lookup("REGION")
            .filter(|r| !r.trim().is_empty())
            .ok_or_else(|| ReplicationError::Config("REGION is not set".into()))?;

        let peers = match lookup("REMOTE_REGIONS") {
            Some(raw) if !raw.trim().is_empty() => {
                let entries: Vec<PeerEntry> = serde_json::from_str(&raw).map_err(|e| {
                    ReplicationError::Config(format!("REMOTE_REGIONS is not a JSON list: {}", e))
                })?;
                entries
                    .into_iter()
                    .map(PeerEntry::into_config)
                    .collect::<Result<Vec<_>>>()?
            }
            _ => Vec::new(),
        };

        let mut settings = SyncSettings::default();
        if let Some(secs) = parse_secs(&lookup, "SYNC_INTERVAL")? {
            settings.outbound.interval = format!("{}s", secs);
        }
        if let Some(secs) = parse_secs(&lookup, "REQUEST_TIMEOUT")? {
            settings.outbound.request_timeout = format!("{}s", secs);
        }
        if let Some(secs) = parse_secs(&lookup, "ISOLATION_THRESHOLD")? {
            settings.probe.isolation_grace = format!("{}s", secs);
        }

        let mut change_log = ChangeLogConfig::default();
        if let Some(path) = lookup("CHANGE_LOG_PATH") {
            change_log.sqlite_path = path;
        }

        let config = Self {
            local_region,
            settings,
            peers,
            change_log,
        };
        config.validate()?;
        Ok(config)
    }
}

fn parse_secs(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<u64>> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ReplicationError::Config(format!("{} must be whole seconds, got {:?}", key, raw))),
    }
}

/// `REMOTE_REGIONS` accepts full peer objects or `"<region_id>=<base_url>"`.
///
/// The id must equal the peer's own `REGION`: inbound entries are tagged
/// with the sender's region id, and a mismatch would queue every received
/// entry to be sent straight back. A bare URL is rejected for that reason.
#[derive(Deserialize)]
#[serde(untagged)]
enum PeerEntry {
    Full(PeerConfig),
    Short(String),
}

impl PeerEntry {
    fn into_config(self) -> Result<PeerConfig> {
        match self {
            PeerEntry::Full(config) => Ok(config),
            PeerEntry::Short(raw) => match raw.split_once('=') {
                Some((region_id, url)) if !region_id.trim().is_empty() && !region_id.contains("://") => {
                    Ok(PeerConfig {
                        region_id: region_id.trim().to_string(),
                        base_url: url.trim().trim_end_matches('/').to_string(),
                    })
                }
                _ => Err(ReplicationError::Config(format!(
                    "REMOTE_REGIONS entry {:?} needs the peer's region id: use \"<region_id>=<base_url>\"",
                    raw
                ))),
            },
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SyncSettings
// ═══════════════════════════════════════════════════════════════════════════════

/// Tunables for the background loops and read fan-out.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SyncSettings {
    #[serde(default)]
    pub outbound: OutboundConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub query: QueryConfig,
}

/// Parse a humantime string, falling back (with a warning) on bad input.
fn parse_duration_or(field: &str, raw: &str, fallback: Duration) -> Duration {
    match humantime::parse_duration(raw) {
        Ok(d) => d,
        Err(e) => {
            warn!(field, value = raw, error = %e, "Invalid duration, using default");
            fallback
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// OutboundConfig: per-peer push loop
// ═══════════════════════════════════════════════════════════════════════════════

/// Outbound replication loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundConfig {
    /// How often each peer's loop scans for unsent entries (e.g. "5s").
    #[serde(default = "default_outbound_interval")]
    pub interval: String,

    /// Maximum entries per push request.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Timeout for a single push request (e.g. "3s").
    #[serde(default = "default_request_timeout")]
    pub request_timeout: String,
}

fn default_outbound_interval() -> String {
    "5s".to_string()
}

fn default_batch_size() -> usize {
    100
}

fn default_request_timeout() -> String {
    "3s".to_string()
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            interval: default_outbound_interval(),
            batch_size: default_batch_size(),
            request_timeout: default_request_timeout(),
        }
    }
}

impl OutboundConfig {
    pub fn interval_duration(&self) -> Duration {
        parse_duration_or("outbound.interval", &self.interval, Duration::from_secs(5))
    }

    pub fn request_timeout_duration(&self) -> Duration {
        parse_duration_or("outbound.request_timeout", &self.request_timeout, Duration::from_secs(3))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ProbeConfig: liveness probing and island mode
// ═══════════════════════════════════════════════════════════════════════════════

/// Partition detector configuration.
///
/// The probe timeout should be much shorter than the outbound request
/// timeout; [`SyncConfig::validate`] enforces that it is at least shorter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// How often every peer is probed.
    #[serde(default = "default_probe_interval")]
    pub interval: String,

    /// Timeout for a single liveness probe.
    #[serde(default = "default_probe_timeout")]
    pub timeout: String,

    /// How long every peer must stay unreachable before island mode.
    #[serde(default = "default_isolation_grace")]
    pub isolation_grace: String,
}

fn default_probe_interval() -> String {
    "2s".to_string()
}

fn default_probe_timeout() -> String {
    "500ms".to_string()
}

fn default_isolation_grace() -> String {
    "60s".to_string()
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            interval: default_probe_interval(),
            timeout: default_probe_timeout(),
            isolation_grace: default_isolation_grace(),
        }
    }
}

impl ProbeConfig {
    pub fn interval_duration(&self) -> Duration {
        parse_duration_or("probe.interval", &self.interval, Duration::from_secs(2))
    }

    pub fn timeout_duration(&self) -> Duration {
        parse_duration_or("probe.timeout", &self.timeout, Duration::from_millis(500))
    }

    pub fn isolation_grace_duration(&self) -> Duration {
        parse_duration_or("probe.isolation_grace", &self.isolation_grace, Duration::from_secs(60))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// QueryConfig: scatter-gather reads
// ═══════════════════════════════════════════════════════════════════════════════

/// Query router configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Per-peer timeout for an all-regions read.
    #[serde(default = "default_fanout_timeout")]
    pub fanout_timeout: String,
}

fn default_fanout_timeout() -> String {
    "2s".to_string()
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            fanout_timeout: default_fanout_timeout(),
        }
    }
}

impl QueryConfig {
    pub fn fanout_timeout_duration(&self) -> Duration {
        parse_duration_or("query.fanout_timeout", &self.fanout_timeout, Duration::from_secs(2))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PeerConfig: one remote region
// ═══════════════════════════════════════════════════════════════════════════════

/// A remote region this region replicates with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    /// The peer's region id (also used in `synced_to`).
    pub region_id: String,

    /// Base URL of the peer's sync endpoints, e.g. `http://eu-west:8080`.
    pub base_url: String,
}

impl PeerConfig {
    /// Create a peer config for testing.
    pub fn for_testing(region_id: &str, base_url: &str) -> Self {
        Self {
            region_id: region_id.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ChangeLogConfig: SQLite change log
// ═══════════════════════════════════════════════════════════════════════════════

/// Change log persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeLogConfig {
    /// Path to the SQLite database holding records and the change log.
    pub sqlite_path: String,

    /// Whether to use WAL mode for SQLite (recommended).
    #[serde(default = "default_true")]
    pub wal_mode: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ChangeLogConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "change_log.db".to_string(),
            wal_mode: true,
        }
    }
}

impl ChangeLogConfig {
    /// Create an in-memory config for testing.
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            wal_mode: false,
        }
    }

    pub fn is_in_memory(&self) -> bool {
        self.sqlite_path == ":memory:"
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_outbound_defaults() {
        let config = OutboundConfig::default();
        assert_eq!(config.interval_duration(), Duration::from_secs(5));
        assert_eq!(config.request_timeout_duration(), Duration::from_secs(3));
        assert_eq!(config.batch_size, 100);
    }

    #[test]
    fn test_probe_defaults() {
        let config = ProbeConfig::default();
        assert_eq!(config.isolation_grace_duration(), Duration::from_secs(60));
        assert!(config.timeout_duration() < OutboundConfig::default().request_timeout_duration());
    }

    #[test]
    fn test_duration_various_formats() {
        let test_cases = [
            ("5s", Duration::from_secs(5)),
            ("1m", Duration::from_secs(60)),
            ("500ms", Duration::from_millis(500)),
            ("2min", Duration::from_secs(120)),
        ];

        for (input, expected) in test_cases {
            let config = OutboundConfig {
                interval: input.to_string(),
                ..Default::default()
            };
            assert_eq!(config.interval_duration(), expected, "Failed for input: {}", input);
        }
    }

    #[test]
    fn test_duration_invalid_fallback() {
        let config = ProbeConfig {
            isolation_grace: "soon".to_string(),
            ..Default::default()
        };
        assert_eq!(config.isolation_grace_duration(), Duration::from_secs(60));
    }

    #[test]
    fn test_change_log_in_memory() {
        let config = ChangeLogConfig::in_memory();
        assert!(config.is_in_memory());
        assert!(!config.wal_mode);
        assert!(!ChangeLogConfig::default().is_in_memory());
    }

    #[test]
    fn test_for_testing_config() {
        let config = SyncConfig::for_testing("us-east");
        assert_eq!(config.local_region, "us-east");
        assert!(config.peers.is_empty());
        assert!(config.change_log.is_in_memory());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_self_peer() {
        let mut config = SyncConfig::for_testing("us-east");
        config.peers.push(PeerConfig::for_testing("us-east", "http://localhost:1"));
        assert!(matches!(config.validate(), Err(ReplicationError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_duplicate_peer() {
        let mut config = SyncConfig::for_testing("us-east");
        config.peers.push(PeerConfig::for_testing("eu-west", "http://a:1"));
        config.peers.push(PeerConfig::for_testing("eu-west", "http://b:1"));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_validate_rejects_slow_probe() {
        let mut config = SyncConfig::for_testing("us-east");
        config.settings.probe.timeout = "5s".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        let mut config = SyncConfig::for_testing("us-east");
        config.settings.outbound.batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_vars_full() {
        let config = SyncConfig::from_vars(vars(&[
            ("REGION", "us-east"),
            (
                "REMOTE_REGIONS",
                r#"[{"region_id":"eu-west","base_url":"http://eu:8080"},"ap-south=http://ap-south:8080/"]"#,
            ),
            ("SYNC_INTERVAL", "7"),
            ("REQUEST_TIMEOUT", "4"),
            ("ISOLATION_THRESHOLD", "90"),
            ("CHANGE_LOG_PATH", "/tmp/x.db"),
        ]))
        .unwrap();

        assert_eq!(config.local_region, "us-east");
        assert_eq!(config.peers.len(), 2);
        assert_eq!(config.peers[0].region_id, "eu-west");
        assert_eq!(config.peers[1].region_id, "ap-south");
        assert_eq!(config.peers[1].base_url, "http://ap-south:8080");
        assert_eq!(config.settings.outbound.interval_duration(), Duration::from_secs(7));
        assert_eq!(config.settings.outbound.request_timeout_duration(), Duration::from_secs(4));
        assert_eq!(config.settings.probe.isolation_grace_duration(), Duration::from_secs(90));
        assert_eq!(config.change_log.sqlite_path, "/tmp/x.db");
    }

    #[test]
    fn test_from_vars_rejects_bare_url_peer() {
        for entry in [r#"["http://ap-south:8080"]"#, r#"["=http://ap-south:8080"]"#] {
            let err = SyncConfig::from_vars(vars(&[("REGION", "us-east"), ("REMOTE_REGIONS", entry)])).unwrap_err();
            assert!(matches!(err, ReplicationError::Config(_)));
            assert!(err.to_string().contains("region id"), "{}", err);
        }
    }

    #[test]
    fn test_validate_rejects_zero_intervals() {
        let mut config = SyncConfig::for_testing("us-east");
        config.settings.outbound.interval = "0s".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("outbound.interval"));

        let mut config = SyncConfig::for_testing("us-east");
        config.settings.probe.interval = "0ms".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("probe.interval"));
    }

    #[test]
    fn test_from_vars_rejects_zero_sync_interval() {
        let err = SyncConfig::from_vars(vars(&[("REGION", "us-east"), ("SYNC_INTERVAL", "0")])).unwrap_err();
        assert!(matches!(err, ReplicationError::Config(_)));
        assert!(err.to_string().contains("outbound.interval"));
    }

    #[test]
    fn test_from_vars_requires_region() {
        let err = SyncConfig::from_vars(vars(&[])).unwrap_err();
        assert!(err.to_string().contains("REGION"));
    }

    #[test]
    fn test_from_vars_rejects_bad_interval() {
        let err = SyncConfig::from_vars(vars(&[("REGION", "a"), ("SYNC_INTERVAL", "fast")])).unwrap_err();
        assert!(err.to_string().contains("SYNC_INTERVAL"));
    }

    #[test]
    fn test_config_json_roundtrip() {
        let config = SyncConfig {
            local_region: "us-east".to_string(),
            settings: SyncSettings::default(),
            peers: vec![
                PeerConfig::for_testing("eu-west", "http://eu:8080"),
                PeerConfig::for_testing("ap-south", "http://ap:8080"),
            ],
            change_log: ChangeLogConfig::default(),
        };

        let json = serde_json::to_string(&config).unwrap();
        let parsed: SyncConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.local_region, "us-east");
        assert_eq!(parsed.peer_ids(), vec!["eu-west", "ap-south"]);
        assert_eq!(parsed.settings.outbound.batch_size, 100);
    }

    #[test]
    fn test_minimal_json_uses_defaults() {
        let parsed: SyncConfig = serde_json::from_str(r#"{"local_region":"eu-west"}"#).unwrap();
        assert_eq!(parsed.settings.probe.isolation_grace, "60s");
        assert_eq!(parsed.change_log.sqlite_path, "change_log.db");
        assert!(parsed.peers.is_empty());
    }
}
