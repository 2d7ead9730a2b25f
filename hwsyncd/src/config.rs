use hwsync_common::tracing;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

/// Default location of the daemon configuration
pub const DEFAULT_CONFIG_PATH: &str = "/etc/hwsyncd/config.yaml";

/// Errors raised while reading or writing configuration and settings files
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl ConfigError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Configuration manager for the hwsync daemon
pub struct ConfigManager {
    pub config_path: PathBuf,
    pub config: DaemonConfig,
}

/// Daemon configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub daemon: DaemonOptions,
    pub backlight: BacklightOptions,
    pub display: DisplayOptions,
    pub settings: SettingsOptions,
    pub security: SecurityOptions,
}

/// Daemon-specific settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonOptions {
    pub socket_path: PathBuf,
    pub log_level: String,
}

impl Default for DaemonOptions {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(hwsync_common::ipc_client::DEFAULT_SOCKET_PATH),
            log_level: "info".to_string(),
        }
    }
}

/// Keyboard backlight discovery and synchronization settings.
///
/// Directories are relative to `sysfs_root`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BacklightOptions {
    pub sysfs_root: PathBuf,
    pub platform_leds_dir: PathBuf,
    pub per_key_driver_dirs: Vec<PathBuf>,
    pub poll_interval_ms: u64,
    pub settle_delay_ms: u64,
    pub discovery_attempts: u32,
    pub discovery_retry_delay_ms: u64,
    pub lid_suppression: bool,
}

impl Default for BacklightOptions {
    fn default() -> Self {
        Self {
            sysfs_root: PathBuf::from("/"),
            platform_leds_dir: PathBuf::from("sys/devices/platform/tuxedo_keyboard/leds"),
            per_key_driver_dirs: vec![
                PathBuf::from("sys/bus/hid/drivers/tuxedo-keyboard-ite"),
                PathBuf::from("sys/bus/hid/drivers/ite_829x"),
                PathBuf::from("sys/bus/hid/drivers/ite_8291"),
            ],
            poll_interval_ms: 1500,
            settle_delay_ms: 500,
            discovery_attempts: 5,
            discovery_retry_delay_ms: 1000,
            lid_suppression: true,
        }
    }
}

impl BacklightOptions {
    /// Backlight options rooted at `sysfs_root` instead of `/`
    pub fn with_sysfs_root<P: AsRef<Path>>(sysfs_root: P) -> Self {
        Self {
            sysfs_root: sysfs_root.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    pub fn platform_leds_dir(&self) -> PathBuf {
        self.sysfs_root.join(&self.platform_leds_dir)
    }

    pub fn per_key_driver_dirs(&self) -> Vec<PathBuf> {
        self.per_key_driver_dirs
            .iter()
            .map(|dir| self.sysfs_root.join(dir))
            .collect()
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn discovery_retry_delay(&self) -> Duration {
        Duration::from_millis(self.discovery_retry_delay_ms)
    }
}

/// Display mode controller settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayOptions {
    pub proc_root: PathBuf,
    pub command: String,
    /// Owner of the processes scanned for a graphical session, defaults to the daemon's uid
    pub session_uid: Option<u32>,
}

impl Default for DisplayOptions {
    fn default() -> Self {
        Self {
            proc_root: PathBuf::from("/proc"),
            command: "xrandr".to_string(),
            session_uid: None,
        }
    }
}

/// User settings persistence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsOptions {
    pub settings_file: PathBuf,
}

impl Default for SettingsOptions {
    fn default() -> Self {
        Self {
            settings_file: PathBuf::from("/etc/hwsyncd/settings.yaml"),
        }
    }
}

/// Security settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityOptions {
    pub socket_group: String,
    pub socket_permissions: String,
}

impl Default for SecurityOptions {
    fn default() -> Self {
        Self {
            socket_group: "users".to_string(),
            socket_permissions: "0660".to_string(),
        }
    }
}

impl SecurityOptions {
    /// Socket mode bits parsed from the octal string, e.g. `"0660"`
    pub fn socket_mode(&self) -> Option<u32> {
        let digits = self.socket_permissions.trim().trim_start_matches("0o");
        u32::from_str_radix(digits, 8).ok().filter(|mode| *mode <= 0o7777)
    }
}

impl ConfigManager {
    /// Create a configuration manager for `config_path`, holding defaults until loaded
    pub fn new<P: AsRef<Path>>(config_path: P) -> Self {
        Self {
            config_path: config_path.as_ref().to_path_buf(),
            config: DaemonConfig::default(),
        }
    }

    /// Load configuration from disk, writing the defaults if the file does not exist
    pub async fn load_config(&mut self) -> Result<(), ConfigError> {
        info!("Loading configuration from {}", self.config_path.display());

        match fs::read_to_string(&self.config_path).await {
            Ok(content) => {
                self.config = serde_yaml::from_str(&content)?;
                debug!("Loaded configuration from disk");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Configuration file not found, using defaults");
                self.config = DaemonConfig::default();
                self.save_config().await?;
            }
            Err(e) => return Err(ConfigError::io(&self.config_path, e)),
        }

        Ok(())
    }

    /// Save configuration to disk
    pub async fn save_config(&self) -> Result<(), ConfigError> {
        info!("Saving configuration to {}", self.config_path.display());

        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| ConfigError::io(parent, e))?;
        }

        let content = serde_yaml::to_string(&self.config)?;
        fs::write(&self.config_path, content)
            .await
            .map_err(|e| ConfigError::io(&self.config_path, e))?;

        debug!("Configuration saved");
        Ok(())
    }

    /// Get a reference to the configuration
    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }
}
