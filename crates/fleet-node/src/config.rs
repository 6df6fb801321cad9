//! Node configuration from the environment.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use fleet_learning::LearningConfig;
use fleet_metadata::NetworkAddress;

use crate::error::{Error, Result};

/// Configuration for a fleet node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Data directory for storage and metadata files
    pub data_dir: PathBuf,

    /// Gossip listen address
    pub listen_addr: SocketAddr,

    /// HTTP status API listen address
    pub api_addr: SocketAddr,

    /// Host other nodes should dial; the port is the gossip port
    pub public_host: String,

    /// Metadata files of teachers to bootstrap from
    pub teacher_metadata: Vec<PathBuf>,

    /// Write our own metadata file into the data directory on startup
    pub save_metadata: bool,

    pub learning: LearningConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./fleet-data"),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 9151)),
            api_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            public_host: "127.0.0.1".to_string(),
            teacher_metadata: Vec::new(),
            save_metadata: true,
            learning: LearningConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Create config from `FLEET_*` environment variables with sensible defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`NodeConfig::from_env`] over an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(dir) = lookup("FLEET_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(addr) = lookup("FLEET_LISTEN_ADDR") {
            config.listen_addr = parse("FLEET_LISTEN_ADDR", &addr)?;
        }
        if let Some(addr) = lookup("FLEET_API_ADDR") {
            config.api_addr = parse("FLEET_API_ADDR", &addr)?;
        }
        if let Some(host) = lookup("FLEET_PUBLIC_HOST") {
            config.public_host = host.trim().to_string();
        }
        if let Some(files) = lookup("FLEET_TEACHER_METADATA") {
            config.teacher_metadata = files
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(PathBuf::from)
                .collect();
        }
        if let Some(ms) = lookup("FLEET_LEARNING_INTERVAL_MS") {
            let ms: u64 = parse("FLEET_LEARNING_INTERVAL_MS", &ms)?;
            config.learning = config.learning.with_interval(Duration::from_millis(ms));
        }
        if let Some(flag) = lookup("FLEET_ABORT_ON_LEARNING_ERROR") {
            if parse_flag("FLEET_ABORT_ON_LEARNING_ERROR", &flag)? {
                let max = config.learning.max_consecutive_failures;
                config.learning = config.learning.abort_on_learning_error(max);
            }
        }
        if let Some(flag) = lookup("FLEET_SAVE_METADATA") {
            config.save_metadata = parse_flag("FLEET_SAVE_METADATA", &flag)?;
        }

        Ok(config)
    }

    /// The endpoint we announce.
    pub fn public_address(&self) -> NetworkAddress {
        NetworkAddress::new(self.public_host.clone(), self.listen_addr.port())
    }

    /// Where our own metadata file goes.
    pub fn metadata_path(&self) -> PathBuf {
        self.data_dir
            .join(format!("node-metadata-{}", self.listen_addr.port()))
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| Error::Config(format!("invalid {key} {value:?}: {e}")))
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::Config(format!("invalid {key} {value:?}: expected a boolean"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> Result<NodeConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        NodeConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_without_environment() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.listen_addr.port(), 9151);
        assert!(config.teacher_metadata.is_empty());
        assert!(config.save_metadata);
        assert!(!config.learning.abort_on_learning_error);
    }

    #[test]
    fn reads_every_variable() {
        let config = config_from(&[
            ("FLEET_DATA_DIR", "/var/lib/fleet"),
            ("FLEET_LISTEN_ADDR", "0.0.0.0:9200"),
            ("FLEET_API_ADDR", "127.0.0.1:8181"),
            ("FLEET_PUBLIC_HOST", "node1.example"),
            ("FLEET_TEACHER_METADATA", "a/node-metadata-9151, ,b/node-metadata-9152"),
            ("FLEET_LEARNING_INTERVAL_MS", "250"),
            ("FLEET_ABORT_ON_LEARNING_ERROR", "true"),
            ("FLEET_SAVE_METADATA", "0"),
        ])
        .unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/var/lib/fleet"));
        assert_eq!(config.api_addr.port(), 8181);
        assert_eq!(config.public_address(), NetworkAddress::new("node1.example", 9200));
        assert_eq!(config.teacher_metadata.len(), 2);
        assert_eq!(config.learning.interval, Duration::from_millis(250));
        assert!(config.learning.abort_on_learning_error);
        assert!(!config.save_metadata);
        assert_eq!(
            config.metadata_path(),
            PathBuf::from("/var/lib/fleet/node-metadata-9200")
        );
    }

    #[test]
    fn invalid_values_are_config_errors() {
        assert!(matches!(
            config_from(&[("FLEET_LISTEN_ADDR", "not an address")]),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            config_from(&[("FLEET_LEARNING_INTERVAL_MS", "-5")]),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            config_from(&[("FLEET_SAVE_METADATA", "maybe")]),
            Err(Error::Config(_))
        ));
    }
}
