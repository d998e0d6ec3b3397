//! WolfCoord Configuration
//!
//! This module provides configuration structures for the WolfCoord
//! coordination layer.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::cleanup::CleanupTarget;
use crate::coordination::{join_path, validate_path};

/// Main WolfCoord configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WolfCoordConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Coordination service configuration
    #[serde(default)]
    pub coordination: CoordinationConfig,

    /// Application namespace configuration
    pub application: ApplicationConfig,

    /// Leader election configuration
    #[serde(default)]
    pub election: ElectionConfig,

    /// Shutdown cleanup configuration
    #[serde(default)]
    pub cleanup: CleanupConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier
    pub id: String,
}

/// Coordination service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationConfig {
    /// Coordination service connect string
    #[serde(default = "default_connect_string")]
    pub connect_string: String,

    /// Session timeout in milliseconds; an outage outlasting it expires
    /// the session
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,

    /// Bound on the candidate delete issued when an election stops
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
}

/// Application namespace configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,

    /// Identifier of this application run
    #[serde(default = "default_run_id")]
    pub run_id: String,

    /// Optional namespace prefix shared by all applications
    #[serde(default)]
    pub namespace: Option<String>,
}

/// Leader election configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ElectionConfig {
    /// Election path (defaults to `<app root>/election`)
    #[serde(default)]
    pub path: Option<String>,
}

/// Shutdown cleanup configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    /// Remove the application namespace on shutdown
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Instance marker level, relative to the application root
    #[serde(default = "default_instances_dir")]
    pub instances_dir: String,

    /// Service discovery level, relative to the application root
    #[serde(default = "default_discovery_dir")]
    pub discovery_dir: String,

    /// Bound on each cleanup call in milliseconds
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_connect_string() -> String {
    "memory://local".to_string()
}

fn default_session_timeout_ms() -> u64 {
    10_000
}

fn default_operation_timeout_ms() -> u64 {
    5_000
}

fn default_run_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_instances_dir() -> String {
    "instances".to_string()
}

fn default_discovery_dir() -> String {
    "discovery".to_string()
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            connect_string: default_connect_string(),
            session_timeout_ms: default_session_timeout_ms(),
            operation_timeout_ms: default_operation_timeout_ms(),
        }
    }
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            instances_dir: default_instances_dir(),
            discovery_dir: default_discovery_dir(),
            operation_timeout_ms: default_operation_timeout_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl WolfCoordConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: WolfCoordConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.id.is_empty() {
            return Err(crate::Error::Config("node.id cannot be empty".into()));
        }

        if self.application.name.is_empty() || self.application.name.contains('/') {
            return Err(crate::Error::Config(
                "application.name must be a non-empty path segment".into(),
            ));
        }

        if self.application.run_id.is_empty() || self.application.run_id.contains('/') {
            return Err(crate::Error::Config(
                "application.run_id must be a non-empty path segment".into(),
            ));
        }

        if let Some(namespace) = &self.application.namespace {
            validate_path(namespace)
                .map_err(|e| crate::Error::Config(format!("application.namespace: {}", e)))?;
        }

        if let Some(path) = &self.election.path {
            validate_path(path)
                .map_err(|e| crate::Error::Config(format!("election.path: {}", e)))?;
        }

        for (key, dir) in [
            ("cleanup.instances_dir", &self.cleanup.instances_dir),
            ("cleanup.discovery_dir", &self.cleanup.discovery_dir),
        ] {
            if dir.is_empty() || dir.contains('/') {
                return Err(crate::Error::Config(format!(
                    "{} must be a single path segment",
                    key
                )));
            }
        }

        if self.coordination.session_timeout_ms == 0
            || self.coordination.operation_timeout_ms == 0
            || self.cleanup.operation_timeout_ms == 0
        {
            return Err(crate::Error::Config("timeouts must be greater than zero".into()));
        }

        Ok(())
    }

    /// Root of this application run's namespace
    pub fn app_root(&self) -> String {
        let base = self.application.namespace.as_deref().unwrap_or("/");
        join_path(&join_path(base, &self.application.name), &self.application.run_id)
    }

    /// Election path
    pub fn election_path(&self) -> String {
        self.election
            .path
            .clone()
            .unwrap_or_else(|| join_path(&self.app_root(), "election"))
    }

    /// Levels removed on shutdown
    pub fn cleanup_target(&self) -> CleanupTarget {
        CleanupTarget::with_dirs(
            &self.app_root(),
            &self.cleanup.instances_dir,
            &self.cleanup.discovery_dir,
        )
    }

    /// Get session timeout as Duration
    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.coordination.session_timeout_ms)
    }

    /// Get operation timeout as Duration
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.coordination.operation_timeout_ms)
    }

    /// Get cleanup call timeout as Duration
    pub fn cleanup_timeout(&self) -> Duration {
        Duration::from_millis(self.cleanup.operation_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[node]
id = "node-1"

[coordination]
connect_string = "zk-1:2181,zk-2:2181"
session_timeout_ms = 15000

[application]
name = "ingest"
run_id = "run-42"
namespace = "/wolfcoord"

[cleanup]
operation_timeout_ms = 2000
"#;

        let config = WolfCoordConfig::from_str(toml).unwrap();
        assert_eq!(config.node.id, "node-1");
        assert_eq!(config.session_timeout(), Duration::from_secs(15));
        assert_eq!(config.operation_timeout(), Duration::from_secs(5));
        assert_eq!(config.cleanup_timeout(), Duration::from_secs(2));
        assert_eq!(config.app_root(), "/wolfcoord/ingest/run-42");
        assert_eq!(config.election_path(), "/wolfcoord/ingest/run-42/election");

        let target = config.cleanup_target();
        assert_eq!(target.instances, "/wolfcoord/ingest/run-42/instances");
        assert_eq!(target.discovery, "/wolfcoord/ingest/run-42/discovery");
        assert_eq!(target.root, "/wolfcoord/ingest/run-42");
    }

    #[test]
    fn test_defaults() {
        let toml = r#"
[node]
id = "node-1"

[application]
name = "ingest"
"#;

        let config = WolfCoordConfig::from_str(toml).unwrap();
        assert_eq!(config.coordination.connect_string, "memory://local");
        assert!(config.cleanup.enabled);
        assert_eq!(config.logging.level, "info");
        assert!(config.app_root().starts_with("/ingest/"));
    }

    #[test]
    fn test_explicit_election_path() {
        let toml = r#"
[node]
id = "node-1"

[application]
name = "ingest"
run_id = "r1"

[election]
path = "/elections/ingest"
"#;

        let config = WolfCoordConfig::from_str(toml).unwrap();
        assert_eq!(config.election_path(), "/elections/ingest");
    }

    #[test]
    fn test_rejects_invalid() {
        let base = |extra: &str| {
            format!(
                "[node]\nid = \"node-1\"\n\n[application]\nname = \"ingest\"\nrun_id = \"r1\"\n{}",
                extra
            )
        };

        assert!(WolfCoordConfig::from_str(&base("")).is_ok());
        assert!(WolfCoordConfig::from_str(&base("\n[election]\npath = \"relative\"\n")).is_err());
        assert!(WolfCoordConfig::from_str(&base("\n[cleanup]\ninstances_dir = \"a/b\"\n")).is_err());
        assert!(WolfCoordConfig::from_str(&base("\n[coordination]\nsession_timeout_ms = 0\n")).is_err());
        assert!(WolfCoordConfig::from_str("[node]\nid = \"\"\n[application]\nname = \"x\"\n").is_err());
        assert!(matches!(
            WolfCoordConfig::from_str("not toml ["),
            Err(crate::Error::ConfigParse(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wolfcoord.toml");
        std::fs::write(&path, "[node]\nid = \"n\"\n[application]\nname = \"app\"\nrun_id = \"r\"\n").unwrap();

        let config = WolfCoordConfig::from_file(&path).unwrap();
        assert_eq!(config.app_root(), "/app/r");

        assert!(matches!(
            WolfCoordConfig::from_file(&dir.path().join("missing.toml")),
            Err(crate::Error::Io(_))
        ));
    }
}
