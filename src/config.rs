//! Coordinator configuration
//!
//! Read from a TOML file (path in `FLEET_CONFIG`, default `fleet.toml`) and
//! then overridden from the environment. A missing file is not an error.
//!
//! ```toml
//! probe_timeout_secs = 5
//! download_timeout_secs = 300
//!
//! [[servers]]
//! name = "PC1"
//! address = "http://192.168.1.100:7860"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::client::{DEFAULT_DOWNLOAD_PATH, DEFAULT_STATUS_PATH};
use crate::error::{FleetError, Result};
use crate::registry::{Endpoint, Registry};

pub const DEFAULT_CONFIG_PATH: &str = "fleet.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub name: String,
    pub address: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub servers: Vec<ServerConfig>,
    pub probe_timeout_secs: u64,
    pub download_timeout_secs: u64,
    pub fleet_deadline_secs: Option<u64>,
    pub status_path: String,
    pub download_path: String,
    /// Hosts a source URL may point at; empty accepts any host
    pub catalog_hosts: Vec<String>,
    pub default_api_key: Option<String>,
}

impl Default for FleetConfig {
    fn default() -> Self {
        FleetConfig {
            servers: Vec::new(),
            probe_timeout_secs: 5,
            download_timeout_secs: 300,
            fleet_deadline_secs: None,
            status_path: DEFAULT_STATUS_PATH.to_string(),
            download_path: DEFAULT_DOWNLOAD_PATH.to_string(),
            catalog_hosts: vec!["civitai.com".to_string()],
            default_api_key: None,
        }
    }
}

impl FleetConfig {
    /// File named by `FLEET_CONFIG` (or the default path), then env overrides
    pub fn load() -> Result<Self> {
        let path = std::env::var("FLEET_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut config = if Path::new(&path).exists() {
            Self::from_file(&path)?
        } else {
            tracing::info!("No config file at {}, using defaults", path);
            FleetConfig::default()
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
            .map_err(|e| FleetError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| FleetError::Config(e.to_string()))
    }

    /// Apply overrides from a key lookup (the process environment in `load`)
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(servers) = lookup("FLEET_SERVERS") {
            self.servers = parse_server_list(&servers)?;
        }
        if let Some(v) = lookup("FLEET_PROBE_TIMEOUT_SECS") {
            self.probe_timeout_secs = parse_secs("FLEET_PROBE_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("FLEET_DOWNLOAD_TIMEOUT_SECS") {
            self.download_timeout_secs = parse_secs("FLEET_DOWNLOAD_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("FLEET_DEADLINE_SECS") {
            self.fleet_deadline_secs = Some(parse_secs("FLEET_DEADLINE_SECS", &v)?);
        }
        if let Some(key) = lookup("CIVITAI_API_KEY") {
            let key = key.trim();
            if !key.is_empty() {
                self.default_api_key = Some(key.to_string());
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.probe_timeout_secs == 0 || self.download_timeout_secs == 0 {
            return Err(FleetError::Config("timeouts must be greater than zero".to_string()));
        }
        if self.probe_timeout_secs >= self.download_timeout_secs {
            return Err(FleetError::Config(format!(
                "probe timeout ({}s) must be shorter than download timeout ({}s)",
                self.probe_timeout_secs, self.download_timeout_secs
            )));
        }
        if self.fleet_deadline_secs == Some(0) {
            return Err(FleetError::Config("fleet deadline must be greater than zero".to_string()));
        }
        self.build_registry().map(|_| ())
    }

    pub fn build_registry(&self) -> Result<Registry> {
        let endpoints = self
            .servers
            .iter()
            .map(|s| Endpoint::new(&s.name, &s.address))
            .collect::<Result<Vec<_>>>()?;
        Registry::from_endpoints(endpoints)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    pub fn fleet_deadline(&self) -> Option<Duration> {
        self.fleet_deadline_secs.map(Duration::from_secs)
    }
}

/// `PC1=http://192.168.1.100:7860,PC2=http://192.168.1.101:7860`
fn parse_server_list(value: &str) -> Result<Vec<ServerConfig>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|pair| {
            let (name, address) = pair.split_once('=').ok_or_else(|| {
                FleetError::Config(format!("FLEET_SERVERS entry '{}' is not name=url", pair))
            })?;
            Ok(ServerConfig {
                name: name.trim().to_string(),
                address: address.trim().to_string(),
            })
        })
        .collect()
}

fn parse_secs(key: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .map_err(|_| FleetError::Config(format!("{} must be a whole number of seconds, got '{}'", key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = FleetConfig::default();
        assert_eq!(config.probe_timeout(), Duration::from_secs(5));
        assert_eq!(config.download_timeout(), Duration::from_secs(300));
        assert_eq!(config.fleet_deadline(), None);
        assert_eq!(config.status_path, "/civitai/status");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = FleetConfig::from_toml(
            r#"
            download_timeout_secs = 600

            [[servers]]
            name = "PC1"
            address = "http://192.168.1.100:7860"

            [[servers]]
            name = "PC2"
            address = "http://192.168.1.101:7860"
            "#,
        )
        .unwrap();

        assert_eq!(config.download_timeout_secs, 600);
        assert_eq!(config.probe_timeout_secs, 5);
        let registry = config.build_registry().unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.all()[1].name, "PC2");
    }

    #[test]
    fn test_duplicate_servers_rejected() {
        let config = FleetConfig::from_toml(
            r#"
            [[servers]]
            name = "PC1"
            address = "http://a:7860"
            [[servers]]
            name = "PC1"
            address = "http://b:7860"
            "#,
        )
        .unwrap();
        assert!(matches!(config.validate(), Err(FleetError::DuplicateEndpoint(_))));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("FLEET_SERVERS", "A=http://10.0.0.1:7860, B=http://10.0.0.2:7860"),
            ("FLEET_PROBE_TIMEOUT_SECS", "2"),
            ("FLEET_DEADLINE_SECS", "900"),
            ("CIVITAI_API_KEY", "saved"),
        ]
        .into_iter()
        .collect();

        let mut config = FleetConfig::default();
        config
            .apply_env(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.servers[1].address, "http://10.0.0.2:7860");
        assert_eq!(config.probe_timeout_secs, 2);
        assert_eq!(config.fleet_deadline(), Some(Duration::from_secs(900)));
        assert_eq!(config.default_api_key.as_deref(), Some("saved"));
    }

    #[test]
    fn test_bad_env_values() {
        let mut config = FleetConfig::default();
        assert!(config
            .apply_env(|k| (k == "FLEET_PROBE_TIMEOUT_SECS").then(|| "soon".to_string()))
            .is_err());
        assert!(config
            .apply_env(|k| (k == "FLEET_SERVERS").then(|| "no-equals-sign".to_string()))
            .is_err());
    }

    #[test]
    fn test_probe_must_be_shorter_than_download() {
        let config = FleetConfig {
            probe_timeout_secs: 30,
            download_timeout_secs: 30,
            ..FleetConfig::default()
        };
        assert!(matches!(config.validate(), Err(FleetError::Config(_))));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("fleet.toml");
        std::fs::write(&path, "catalog_hosts = []\nfleet_deadline_secs = 60\n").unwrap();

        let config = FleetConfig::from_file(&path).unwrap();
        assert!(config.catalog_hosts.is_empty());
        assert_eq!(config.fleet_deadline_secs, Some(60));

        std::fs::write(&path, "probe_timeout_secs = \"five\"").unwrap();
        assert!(matches!(FleetConfig::from_file(&path), Err(FleetError::Config(_))));
    }
}
