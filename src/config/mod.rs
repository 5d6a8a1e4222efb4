//! Configuration for a system database node.

use crate::error::{Result, SysdbError};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name used when none is configured.
pub const DEFAULT_SYSTEM_NAME: &str = "daos_server";

/// Port of the control-plane listener used in the development profile.
pub const DEFAULT_CONTROL_PORT: u16 = 10001;

/// Main configuration for a system database node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SysdbConfig {
    /// Node configuration.
    #[serde(default)]
    pub node: NodeConfig,
    /// System database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl SysdbConfig {
    /// Load configuration from a file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SysdbError::Config(format!("Failed to read config file: {}", e))
        })?;

        let config: Self = serde_json::from_str(&content).map_err(|e| {
            SysdbError::Config(format!("Failed to parse config: {}", e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.database.system_name.trim().is_empty() {
            return Err(SysdbError::InvalidConfig {
                field: "database.system_name".to_string(),
                reason: "System name must not be empty".to_string(),
            });
        }

        for (i, replica) in self.database.replicas.iter().enumerate() {
            if self.database.replicas[..i].contains(replica) {
                return Err(SysdbError::InvalidConfig {
                    field: "database.replicas".to_string(),
                    reason: format!("Duplicate replica address {}", replica),
                });
            }
        }

        if self.database.replicas.len() % 2 == 0 && !self.database.replicas.is_empty() {
            return Err(SysdbError::InvalidConfig {
                field: "database.replicas".to_string(),
                reason: "Replica count must be odd".to_string(),
            });
        }

        if self.database.control_addr.is_some() && self.database.raft_dir.as_os_str().is_empty() {
            return Err(SysdbError::InvalidConfig {
                field: "database.raft_dir".to_string(),
                reason: "Replicas require a raft directory".to_string(),
            });
        }

        if self.database.apply_timeout.is_zero() {
            return Err(SysdbError::InvalidConfig {
                field: "database.apply_timeout".to_string(),
                reason: "Apply timeout must be non-zero".to_string(),
            });
        }

        Ok(())
    }

    /// Single-replica development configuration.
    pub fn development() -> Self {
        let addr = SocketAddr::from(([127, 0, 0, 1], DEFAULT_CONTROL_PORT));
        Self {
            node: NodeConfig {
                name: "dev-node".to_string(),
            },
            database: DatabaseConfig {
                replicas: vec![addr],
                control_addr: Some(addr),
                raft_dir: PathBuf::from("/tmp/sysdb/raft"),
                ..DatabaseConfig::default()
            },
            observability: ObservabilityConfig {
                log_level: "debug".to_string(),
                json_logs: false,
            },
        }
    }
}

/// Node-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Human-readable node name.
    pub name: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "sysdb-node".to_string(),
        }
    }
}

/// System database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Control addresses of every replica. The first one bootstraps.
    #[serde(default)]
    pub replicas: Vec<SocketAddr>,
    /// This node's control address; the node is a replica when it is listed
    /// in `replicas`.
    #[serde(default)]
    pub control_addr: Option<SocketAddr>,
    /// Directory holding consensus state.
    #[serde(default)]
    pub raft_dir: PathBuf,
    #[serde(default = "default_system_name")]
    pub system_name: String,
    /// How long a write waits for its entry to commit.
    #[serde(with = "humantime_serde", default = "default_apply_timeout")]
    pub apply_timeout: Duration,
    /// Consensus log lines containing any of these substrings are dropped.
    #[serde(default)]
    pub suppressed_log_messages: Vec<String>,
}

fn default_system_name() -> String {
    DEFAULT_SYSTEM_NAME.to_string()
}

fn default_apply_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            replicas: Vec::new(),
            control_addr: None,
            raft_dir: PathBuf::new(),
            system_name: default_system_name(),
            apply_timeout: default_apply_timeout(),
            suppressed_log_messages: Vec::new(),
        }
    }
}

impl DatabaseConfig {
    /// Replica addresses as strings, leaving out `exclude`.
    pub fn string_replicas(&self, exclude: Option<SocketAddr>) -> Vec<String> {
        self.replicas
            .iter()
            .filter(|r| Some(**r) != exclude)
            .map(|r| r.to_string())
            .collect()
    }

    pub fn is_replica_addr(&self, addr: &SocketAddr) -> bool {
        self.replicas.contains(addr)
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level.
    pub log_level: String,
    /// Enable JSON logging.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Serde helper for Duration using humantime format.
pub mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}ms", duration.as_millis()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub(crate) fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        } else if let Some(s_val) = s.strip_suffix('s') {
            s_val
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|e| e.to_string())
        } else if let Some(m) = s.strip_suffix('m') {
            m.parse::<u64>()
                .map(|v| Duration::from_secs(v * 60))
                .map_err(|e| e.to_string())
        } else {
            s.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SysdbConfig::default();
        assert_eq!(config.database.system_name, DEFAULT_SYSTEM_NAME);
        assert!(config.database.replicas.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_development_config() {
        let config = SysdbConfig::development();
        assert_eq!(config.database.replicas.len(), 1);
        assert_eq!(config.database.control_addr, Some(config.database.replicas[0]));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_even_replica_count_rejected() {
        let mut config = SysdbConfig::development();
        config.database.replicas.push("127.0.0.2:10001".parse().unwrap());
        match config.validate() {
            Err(SysdbError::InvalidConfig { field, .. }) => assert_eq!(field, "database.replicas"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_duration_formats() {
        use humantime_serde::parse_duration;
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("40").unwrap(), Duration::from_millis(40));
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn test_string_replicas_excludes_self() {
        let config = SysdbConfig::development();
        let me = config.database.control_addr;
        assert!(config.database.string_replicas(me).is_empty());
        assert_eq!(config.database.string_replicas(None), vec!["127.0.0.1:10001"]);
    }
}
