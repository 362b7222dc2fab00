// Configuration loading

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::Ipv6Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_DIR: &str = "portname";
const CONFIG_FILE: &str = "config.json";

/// Configuration file structure. Every field is optional in the file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Unique local prefix for service addresses; only the upper 64 bits count
    pub ula_prefix: Ipv6Addr,

    /// Prefix length the addresses are configured with
    pub address_prefix_len: u8,

    /// Candidate uplinks, first existing one wins
    pub uplink_interfaces: Vec<String>,

    /// Port every proxy listens on
    pub listen_port: u16,

    /// Program base names that are never exposed
    pub skip_commands: Vec<String>,

    /// Dynamic DNS upsert endpoint (plain HTTP)
    pub dyndns_endpoint: String,

    pub dyndns_timeout_secs: u64,

    /// Re-run discovery this often; None = once at startup
    pub rescan_interval_secs: Option<u64>,

    /// procfs mount used to attribute sockets to processes
    pub proc_root: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ula_prefix: Ipv6Addr::new(0xfdf5, 0x3606, 0x2a21, 0, 0, 0, 0, 0),
            address_prefix_len: 48,
            uplink_interfaces: vec!["eth0".to_string(), "lan0".to_string()],
            listen_port: 80,
            skip_commands: vec!["init".to_string()],
            dyndns_endpoint: "http://router7/dyndns".to_string(),
            dyndns_timeout_secs: 10,
            rescan_interval_secs: None,
            proc_root: PathBuf::from("/proc"),
        }
    }
}

impl Config {
    /// Default config file location (e.g. ~/.config/portname/config.json)
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR).join(CONFIG_FILE))
    }

    /// Load configuration from `path`, or from the default location.
    ///
    /// A missing file at the default location means defaults; a missing
    /// file that was asked for explicitly is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match Self::default_path() {
                Some(path) if path.exists() => path,
                _ => {
                    log::debug!("Config file not found, using defaults");
                    return Ok(Config::default());
                }
            },
        };

        let contents =
            fs::read_to_string(&path).context(format!("Failed to read config file: {:?}", path))?;
        let config: Config =
            serde_json::from_str(&contents).context(format!("Failed to parse config file: {:?}", path))?;
        config.validate()?;

        log::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.address_prefix_len > 128 {
            bail!("address_prefix_len must be at most 128, got {}", self.address_prefix_len);
        }
        if self.uplink_interfaces.is_empty() {
            bail!("uplink_interfaces must name at least one interface");
        }
        if self.dyndns_timeout_secs == 0 {
            bail!("dyndns_timeout_secs must be positive");
        }
        Ok(())
    }

    pub fn dyndns_timeout(&self) -> Duration {
        Duration::from_secs(self.dyndns_timeout_secs)
    }

    /// Rescan period, if periodic rescanning is enabled
    pub fn rescan_interval(&self) -> Option<Duration> {
        self.rescan_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    /// Effective configuration as pretty-printed JSON
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize config")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_file(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("portname-{}-{}", std::process::id(), name));
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.ula_prefix, "fdf5:3606:2a21::".parse::<Ipv6Addr>().unwrap());
        assert_eq!(config.address_prefix_len, 48);
        assert_eq!(config.uplink_interfaces, vec!["eth0", "lan0"]);
        assert_eq!(config.listen_port, 80);
        assert_eq!(config.skip_commands, vec!["init"]);
        assert_eq!(config.rescan_interval(), None);
        assert_eq!(config.proc_root, Path::new("/proc"));
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let path = temp_file(
            "partial.json",
            r#"{"uplink_interfaces": ["br0"], "rescan_interval_secs": 30, "proc_root": "/host/proc"}"#,
        );

        let config = Config::load(Some(&path)).unwrap();

        assert_eq!(config.uplink_interfaces, vec!["br0"]);
        assert_eq!(config.rescan_interval(), Some(Duration::from_secs(30)));
        assert_eq!(config.listen_port, 80);
        assert_eq!(config.dyndns_endpoint, "http://router7/dyndns");
        assert_eq!(config.proc_root, Path::new("/host/proc"));
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_config_serialization() {
        let mut config = Config::default();
        config.skip_commands.push("sshd".to_string());
        config.rescan_interval_secs = Some(60);

        let json = config.to_json().unwrap();
        let parsed: Config = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed, config);
        assert!(json.contains("\"ula_prefix\": \"fdf5:3606:2a21::\""));
    }

    #[test]
    fn test_explicit_missing_file_is_an_error() {
        assert!(Config::load(Some(Path::new("/nonexistent/portname.json"))).is_err());
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let path = temp_file("invalid.json", r#"{"uplink_interfaces": []}"#);
        assert!(Config::load(Some(&path)).is_err());
        fs::remove_file(path).unwrap();

        let path = temp_file("garbage.json", "not json");
        assert!(Config::load(Some(&path)).is_err());
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_zero_rescan_interval_disables_rescanning() {
        let config = Config {
            rescan_interval_secs: Some(0),
            ..Config::default()
        };
        assert_eq!(config.rescan_interval(), None);
    }
}
