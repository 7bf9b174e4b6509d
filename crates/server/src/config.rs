//! Daemon and helper configuration management

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub usb: UsbSettings,
    #[serde(default)]
    pub ipc: IpcSettings,
    #[serde(default)]
    pub helper: HelperSettings,
    #[serde(default)]
    pub state: StateSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// USB/IP listen address
    pub bind_addr: String,
    /// Maximum concurrent USB/IP client connections
    pub max_connections: usize,
    pub log_level: String,
    pub service_mode: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3240".to_string(),
            max_connections: 64,
            log_level: "info".to_string(),
            service_mode: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UsbSettings {
    /// VID:PID patterns of exportable devices; empty exports everything
    pub filters: Vec<String>,
    /// Per-transfer timeout handed to libusb
    pub transfer_timeout_ms: u64,
}

impl Default for UsbSettings {
    fn default() -> Self {
        Self {
            filters: Vec::new(),
            transfer_timeout_ms: 5000,
        }
    }
}

impl UsbSettings {
    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcSettings {
    /// Unix socket the helper listens on
    pub socket_path: PathBuf,
    /// Identity the daemon presents to the helper
    pub client_id: String,
    /// Identities the helper accepts
    pub allowed_clients: Vec<String>,
    pub request_timeout_secs: u64,
    /// Helper-side connection cap
    pub max_connections: usize,
    /// Cap on in-flight requests, on both sides
    pub max_pending_requests: usize,
}

impl Default for IpcSettings {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/run/usbipd/helper.sock"),
            client_id: "usbipd".to_string(),
            allowed_clients: vec!["usbipd".to_string()],
            request_timeout_secs: 30,
            max_connections: 8,
            max_pending_requests: 256,
        }
    }
}

impl IpcSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn socket_path(&self) -> PathBuf {
        expand_path(&self.socket_path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HelperSettings {
    /// Helper bundle to install; `None` disables the privileged path
    pub bundle_path: Option<PathBuf>,
    /// Program run to install the bundle (receives the bundle path last)
    pub install_program: String,
    pub install_args: Vec<String>,
    pub install_timeout_secs: u64,
    /// Exit status meaning "waiting for the administrator to approve"
    pub approval_exit_code: i32,
    pub max_install_attempts: u32,
    /// Delay between reconnect attempts after the helper connection drops
    pub reconnect_interval_secs: u64,
    pub max_reconnect_attempts: u32,
}

impl Default for HelperSettings {
    fn default() -> Self {
        Self {
            bundle_path: None,
            install_program: "/usr/libexec/usbipd/install-helper".to_string(),
            install_args: Vec::new(),
            install_timeout_secs: 30,
            approval_exit_code: 77,
            max_install_attempts: 3,
            reconnect_interval_secs: 2,
            max_reconnect_attempts: 5,
        }
    }
}

impl HelperSettings {
    pub fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.install_timeout_secs)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs)
    }

    pub fn bundle_path(&self) -> Option<PathBuf> {
        self.bundle_path.as_deref().map(expand_path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateSettings {
    /// Directory holding `claims.json` and `installation.json`
    pub dir: PathBuf,
    /// How long a restored claim waits for its client to re-import
    pub restore_grace_secs: u64,
}

impl Default for StateSettings {
    fn default() -> Self {
        let dir = dirs::state_dir()
            .or_else(dirs::data_local_dir)
            .map(|d| d.join("usbipd"))
            .unwrap_or_else(|| PathBuf::from("/var/lib/usbipd"));
        Self {
            dir,
            restore_grace_secs: 60,
        }
    }
}

impl StateSettings {
    pub fn dir(&self) -> PathBuf {
        expand_path(&self.dir)
    }

    pub fn claims_path(&self) -> PathBuf {
        self.dir().join("claims.json")
    }

    pub fn installation_path(&self) -> PathBuf {
        self.dir().join("installation.json")
    }

    pub fn restore_grace(&self) -> Duration {
        Duration::from_secs(self.restore_grace_secs)
    }
}

fn expand_path(path: &Path) -> PathBuf {
    PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).as_ref())
}

impl ServerConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            expand_path(&p)
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/usbipd/server.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config = Self::from_toml(&content)
            .with_context(|| format!("Invalid config file: {}", config_path.display()))?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Parse and validate a TOML document
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: ServerConfig = toml::from_str(content).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usbipd").join("server.toml")
        } else {
            PathBuf::from(".config/usbipd/server.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.server.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.server.log_level,
                valid_levels.join(", ")
            ));
        }

        self.server
            .bind_addr
            .parse::<std::net::SocketAddr>()
            .map_err(|e| anyhow!("Invalid bind_addr '{}': {}", self.server.bind_addr, e))?;

        for filter in &self.usb.filters {
            Self::validate_filter(filter)?;
        }

        let nonzero = [
            ("server.max_connections", self.server.max_connections as u64),
            ("usb.transfer_timeout_ms", self.usb.transfer_timeout_ms),
            ("ipc.request_timeout_secs", self.ipc.request_timeout_secs),
            ("ipc.max_connections", self.ipc.max_connections as u64),
            ("ipc.max_pending_requests", self.ipc.max_pending_requests as u64),
            ("helper.install_timeout_secs", self.helper.install_timeout_secs),
            ("state.restore_grace_secs", self.state.restore_grace_secs),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(anyhow!("{} must be greater than 0", name));
            }
        }

        if self.ipc.client_id.is_empty() {
            return Err(anyhow!("ipc.client_id must not be empty"));
        }
        if self.ipc.allowed_clients.iter().any(String::is_empty) {
            return Err(anyhow!("Empty client ID in ipc.allowed_clients list"));
        }

        Ok(())
    }

    /// Validate a USB device filter pattern (VID:PID)
    pub(crate) fn validate_filter(filter: &str) -> Result<()> {
        let parts: Vec<&str> = filter.split(':').collect();
        if parts.len() != 2 {
            return Err(anyhow!(
                "Invalid filter format '{}', expected VID:PID (e.g., '0x1234:0x5678' or '0x1234:*')",
                filter
            ));
        }

        let (vid, pid) = (parts[0], parts[1]);
        if vid != "*" {
            Self::validate_hex_id(vid, "VID")?;
        }
        if pid != "*" {
            Self::validate_hex_id(pid, "PID")?;
        }

        Ok(())
    }

    fn validate_hex_id(id: &str, name: &str) -> Result<()> {
        let hex_part = id
            .strip_prefix("0x")
            .or_else(|| id.strip_prefix("0X"))
            .ok_or_else(|| {
                anyhow!(
                    "Invalid {} '{}', must start with '0x' (e.g., '0x1234')",
                    name,
                    id
                )
            })?;

        if hex_part.is_empty() || hex_part.len() > 4 {
            return Err(anyhow!(
                "Invalid {} '{}', hex part must be 1-4 digits",
                name,
                id
            ));
        }

        u16::from_str_radix(hex_part, 16)
            .map_err(|_| anyhow!("Invalid {} '{}', not a valid hex number", name, id))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.server.log_level, "info");
        assert_eq!(config.server.bind_addr, "0.0.0.0:3240");
        assert_eq!(config.ipc.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.helper.install_timeout(), Duration::from_secs(30));
        assert!(config.helper.bundle_path.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_filter_valid() {
        assert!(ServerConfig::validate_filter("0x1234:0x5678").is_ok());
        assert!(ServerConfig::validate_filter("0x1234:*").is_ok());
        assert!(ServerConfig::validate_filter("*:0x5678").is_ok());
        assert!(ServerConfig::validate_filter("*:*").is_ok());
    }

    #[test]
    fn test_validate_filter_invalid() {
        assert!(ServerConfig::validate_filter("1234:5678").is_err());
        assert!(ServerConfig::validate_filter("0x1234").is_err());
        assert!(ServerConfig::validate_filter("0xGHIJ:0x5678").is_err());
        assert!(ServerConfig::validate_filter("0x12345:0x5678").is_err());
    }

    #[test]
    fn test_zero_caps_rejected() {
        let mut config = ServerConfig::default();
        config.ipc.max_pending_requests = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("ipc.max_pending_requests"));

        let mut config = ServerConfig::default();
        config.state.restore_grace_secs = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("state.restore_grace_secs"));
    }

    #[test]
    fn test_partial_state_section_keeps_grace_default() {
        let config: ServerConfig = toml::from_str("[state]\ndir = \"/tmp/usbipd-state\"\n").unwrap();
        assert_eq!(config.state.dir, PathBuf::from("/tmp/usbipd-state"));
        assert_eq!(config.state.restore_grace(), Duration::from_secs(60));
    }

    #[test]
    fn test_state_paths() {
        let state = StateSettings {
            dir: PathBuf::from("/tmp/usbipd-state"),
            restore_grace_secs: 60,
        };
        assert_eq!(
            state.claims_path(),
            PathBuf::from("/tmp/usbipd-state/claims.json")
        );
        assert_eq!(
            state.installation_path(),
            PathBuf::from("/tmp/usbipd-state/installation.json")
        );
    }
}
