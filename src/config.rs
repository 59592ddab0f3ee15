// ring-node/src/config.rs
// ============================================================================
// Configuration: one toml file, read once at startup and handed down
// ============================================================================

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::transport::{TransportSettings, DEFAULT_MAX_FRAME_LEN};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Rendezvous service host
    pub discovery_host: String,

    /// Rendezvous service port
    pub discovery_port: u16,

    /// Host advertised to other peers
    pub host: String,

    /// Port to listen on (0 picks a free one)
    pub port: u16,

    /// Peers keep their files under `<storage_root>/peer-<id>/`
    pub storage_root: String,

    /// Store client: base for relative paths
    pub workdir: String,

    /// Store client: where retrieved files land
    pub reads_dir: String,

    /// Default log filter when RUST_LOG is unset
    pub log_level: String,

    /// How long lookups wait for the join to finish (0 waits forever)
    pub join_timeout_secs: u64,

    pub connect_timeout_ms: u64,

    /// Pause around file handoff when leaving
    pub leave_grace_ms: u64,

    pub max_frame_len: usize,
}

/// Values given on the command line; `None` keeps what the file says.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub discovery: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub storage_root: Option<String>,
    pub workdir: Option<String>,
}

impl NodeConfig {
    /// A configuration with every default filled in.
    pub fn generate() -> Self {
        Self {
            discovery_host: "127.0.0.1".to_string(),
            discovery_port: 32096,
            host: "127.0.0.1".to_string(),
            port: 0,
            storage_root: std::env::temp_dir().join("ring-node").to_string_lossy().into_owned(),
            workdir: "data".to_string(),
            reads_dir: "reads".to_string(),
            log_level: "info".to_string(),
            join_timeout_secs: 60,
            connect_timeout_ms: 3000,
            leave_grace_ms: 1000,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    /// Get the config file path - checks current directory first
    pub fn config_path() -> Result<PathBuf> {
        for local in ["ring-node.toml", ".ring-node.toml"] {
            let local = PathBuf::from(local);
            if local.exists() {
                return Ok(local);
            }
        }

        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        let ring_dir = config_dir.join("ring-node");
        std::fs::create_dir_all(&ring_dir)?;

        Ok(ring_dir.join("config.toml"))
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            anyhow::bail!(
                "Config file not found at {}. Run 'ring-node init' first.",
                path.display()
            );
        }

        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config: {}", e))?;

        tracing::debug!("Loaded config from: {}", path.display());
        Ok(config)
    }

    /// Load config or write out the defaults if there is none yet
    pub fn load_or_create() -> Result<Self> {
        match Self::load() {
            Ok(config) => Ok(config),
            Err(_) => {
                tracing::info!("No config found, writing defaults...");
                let config = Self::generate();
                config.save()?;
                Ok(config)
            }
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        tracing::debug!("Configuration saved to {}", path.display());
        Ok(())
    }

    /// Apply overrides in memory. Returns whether anything changed.
    pub fn apply(&mut self, overrides: ConfigOverrides) -> Result<bool> {
        let mut changed = false;

        if let Some(discovery) = overrides.discovery {
            let (host, port) = split_address(&discovery)?;
            if self.discovery_host != host || self.discovery_port != port {
                self.discovery_host = host;
                self.discovery_port = port;
                changed = true;
            }
        }

        if let Some(host) = overrides.host {
            if self.host != host {
                self.host = host;
                changed = true;
            }
        }

        if let Some(port) = overrides.port {
            if self.port != port {
                self.port = port;
                changed = true;
            }
        }

        if let Some(root) = overrides.storage_root {
            if self.storage_root != root {
                self.storage_root = root;
                changed = true;
            }
        }

        if let Some(workdir) = overrides.workdir {
            if self.workdir != workdir {
                self.workdir = workdir;
                changed = true;
            }
        }

        Ok(changed)
    }

    pub fn validate(&self) -> Result<()> {
        if self.discovery_host.is_empty() || self.host.is_empty() {
            anyhow::bail!("Hosts must not be empty");
        }

        if self.discovery_port == 0 {
            anyhow::bail!("Invalid discovery port");
        }

        if self.storage_root.is_empty() {
            anyhow::bail!("Storage root must not be empty");
        }

        if self.max_frame_len < 1024 {
            anyhow::bail!("max_frame_len must be at least 1024 bytes");
        }

        // Lengths go on the wire as u32.
        if self.max_frame_len > u32::MAX as usize {
            anyhow::bail!("max_frame_len must not exceed {} bytes", u32::MAX);
        }

        if self.connect_timeout_ms == 0 {
            anyhow::bail!("connect_timeout_ms must be greater than 0");
        }

        Ok(())
    }

    pub fn discovery_address(&self) -> String {
        format!("{}:{}", self.discovery_host, self.discovery_port)
    }

    pub fn join_timeout(&self) -> Option<Duration> {
        (self.join_timeout_secs > 0).then(|| Duration::from_secs(self.join_timeout_secs))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn leave_grace(&self) -> Duration {
        Duration::from_millis(self.leave_grace_ms)
    }

    pub fn transport_settings(&self) -> TransportSettings {
        TransportSettings {
            connect_timeout: self.connect_timeout(),
            max_frame_len: self.max_frame_len,
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self::generate()
    }
}

/// Split `host:port`.
pub fn split_address(address: &str) -> Result<(String, u16)> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| anyhow::anyhow!("Expected host:port, got {:?}", address))?;
    if host.is_empty() {
        anyhow::bail!("Missing host in {:?}", address);
    }
    let port = port
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid port in {:?}", address))?;
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_config() {
        let config = NodeConfig::generate();
        assert_eq!(config.discovery_port, 32096);
        assert_eq!(config.port, 0);
        assert_eq!(config.discovery_address(), "127.0.0.1:32096");
        assert_eq!(config.join_timeout(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_validate_config() {
        let mut config = NodeConfig::generate();
        assert!(config.validate().is_ok());
        config.discovery_port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_frame_length_bounds() {
        let mut config = NodeConfig::generate();
        config.max_frame_len = 512;
        assert!(config.validate().is_err());
        config.max_frame_len = u32::MAX as usize;
        assert!(config.validate().is_ok());
        if let Some(too_big) = (u32::MAX as usize).checked_add(1) {
            config.max_frame_len = too_big;
            assert!(config.validate().is_err());
        }
    }

    #[test]
    fn test_zero_join_timeout_is_unbounded() {
        let config = NodeConfig {
            join_timeout_secs: 0,
            ..NodeConfig::generate()
        };
        assert_eq!(config.join_timeout(), None);
    }

    #[test]
    fn test_apply_overrides() {
        let mut config = NodeConfig::generate();
        let changed = config
            .apply(ConfigOverrides {
                discovery: Some("10.1.1.1:4000".to_string()),
                port: Some(5000),
                ..Default::default()
            })
            .unwrap();
        assert!(changed);
        assert_eq!(config.discovery_address(), "10.1.1.1:4000");
        assert_eq!(config.port, 5000);
        assert!(!config.apply(ConfigOverrides::default()).unwrap());
        assert!(config
            .apply(ConfigOverrides {
                discovery: Some("no-port".to_string()),
                ..Default::default()
            })
            .is_err());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ring-node.toml");
        let mut config = NodeConfig::generate();
        config.log_level = "debug".to_string();
        config.save_to(&path).unwrap();
        assert_eq!(NodeConfig::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.toml");
        std::fs::write(&path, "port = 7000\n").unwrap();
        let config = NodeConfig::load_from(&path).unwrap();
        assert_eq!(config.port, 7000);
        assert_eq!(config.leave_grace_ms, 1000);
    }
}
