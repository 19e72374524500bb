use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the bwmon daemon.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// How often to sample the interface counters. Default: 1s.
    #[serde(default = "default_update_interval", with = "humantime_serde")]
    pub update_interval: Duration,

    /// Directory holding one `<iface>.db` store per interface.
    /// Default: /opt/bwmon/.
    #[serde(default = "default_storage_location")]
    pub storage_location: PathBuf,

    /// Live window capacity. Default: 120; non-positive values fall back
    /// to the engine default.
    #[serde(default = "default_live_size")]
    pub live_size: i64,

    /// HTTP listen address. Default: "0.0.0.0:80".
    #[serde(default = "default_bind_address")]
    pub web_server_bind_address: String,

    /// Static web assets directory. Default: /opt/bwmon/www/.
    #[serde(default = "default_web_root")]
    pub web_root: PathBuf,

    /// Interfaces to monitor.
    #[serde(default)]
    pub interfaces: Vec<InterfaceConfig>,
}

/// One monitored interface.
#[derive(Debug, Clone, Deserialize)]
pub struct InterfaceConfig {
    /// Interface name under the sysfs network root (e.g. "eth0").
    pub name: String,

    /// Optional display name used by the query surface.
    #[serde(default)]
    pub alias: Option<String>,
}

// --- Default value functions ---

fn default_update_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_storage_location() -> PathBuf {
    PathBuf::from("/opt/bwmon/")
}

fn default_live_size() -> i64 {
    120
}

fn default_bind_address() -> String {
    "0.0.0.0:80".to_string()
}

fn default_web_root() -> PathBuf {
    PathBuf::from("/opt/bwmon/www/")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            update_interval: default_update_interval(),
            storage_location: default_storage_location(),
            live_size: default_live_size(),
            web_server_bind_address: default_bind_address(),
            web_root: default_web_root(),
            interfaces: Vec::new(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.update_interval.is_zero() {
            bail!("update_interval must be positive");
        }

        if self.web_server_bind_address.is_empty() {
            bail!("web_server_bind_address is required");
        }

        if self.interfaces.is_empty() {
            bail!("at least one interface is required");
        }

        let mut seen = HashSet::with_capacity(self.interfaces.len());
        for iface in &self.interfaces {
            if iface.name.is_empty() {
                bail!("interface name must not be empty");
            }
            if !seen.insert(iface.name.as_str()) {
                bail!("duplicate interface: {}", iface.name);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            interfaces: vec![InterfaceConfig {
                name: "eth0".to_string(),
                alias: None,
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.update_interval, Duration::from_secs(1));
        assert_eq!(cfg.storage_location, PathBuf::from("/opt/bwmon/"));
        assert_eq!(cfg.live_size, 120);
        assert_eq!(cfg.web_server_bind_address, "0.0.0.0:80");
        assert_eq!(cfg.web_root, PathBuf::from("/opt/bwmon/www/"));
        assert!(cfg.interfaces.is_empty());
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
update_interval: 5s
storage_location: /var/lib/bwmon
live_size: 30
web_server_bind_address: "127.0.0.1:8080"
interfaces:
  - name: eth0
    alias: uplink
  - name: wlan0
"#;
        let cfg: Config = serde_yaml::from_str(yaml).expect("parse yaml");
        cfg.validate().expect("valid");

        assert_eq!(cfg.update_interval, Duration::from_secs(5));
        assert_eq!(cfg.storage_location, PathBuf::from("/var/lib/bwmon"));
        assert_eq!(cfg.live_size, 30);
        assert_eq!(cfg.interfaces.len(), 2);
        assert_eq!(cfg.interfaces[0].name, "eth0");
        assert_eq!(cfg.interfaces[0].alias.as_deref(), Some("uplink"));
        assert_eq!(cfg.interfaces[1].alias, None);
    }

    #[test]
    fn test_validation_requires_interfaces() {
        let cfg = Config::default();
        let err = cfg.validate().expect_err("no interfaces");
        assert!(err.to_string().contains("interface"));
    }

    #[test]
    fn test_validation_rejects_duplicate_interfaces() {
        let mut cfg = valid_config();
        cfg.interfaces.push(InterfaceConfig {
            name: "eth0".to_string(),
            alias: Some("again".to_string()),
        });
        let err = cfg.validate().expect_err("duplicate");
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_validation_rejects_empty_interface_name() {
        let mut cfg = valid_config();
        cfg.interfaces[0].name.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_zero_interval() {
        let mut cfg = valid_config();
        cfg.update_interval = Duration::ZERO;
        let err = cfg.validate().expect_err("zero interval");
        assert!(err.to_string().contains("update_interval"));
    }

    #[test]
    fn test_validation_rejects_empty_bind_address() {
        let mut cfg = valid_config();
        cfg.web_server_bind_address.clear();
        assert!(cfg.validate().is_err());
    }
}
