//! Persisted user settings consumed by the synchronization workers

use async_trait::async_trait;
use hwsync_common::{tracing, BacklightZoneState, ColorMode};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tokio::fs;
use tracing::debug;

use crate::config::ConfigError;

/// User-facing keyboard backlight settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub keyboard_backlight_control_enabled: bool,
    pub keyboard_backlight_color_mode: ColorMode,
    pub keyboard_backlight_brightness: Option<u32>,
    /// One `0xRRGGBB00` value per zone
    pub keyboard_backlight_color: Option<Vec<u32>>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            keyboard_backlight_control_enabled: true,
            keyboard_backlight_color_mode: ColorMode::Static,
            keyboard_backlight_brightness: None,
            keyboard_backlight_color: None,
        }
    }
}

impl Settings {
    /// Copy mode, brightness and per-zone colors from a backlight state.
    ///
    /// Zone 0 provides mode and brightness. Returns false for an empty state,
    /// which leaves the settings untouched.
    pub fn record_backlight_state(&mut self, states: &[BacklightZoneState]) -> bool {
        let Some(primary) = states.first() else {
            return false;
        };
        self.keyboard_backlight_color_mode = primary.mode;
        self.keyboard_backlight_brightness = Some(primary.brightness);
        self.keyboard_backlight_color = Some(states.iter().map(BacklightZoneState::packed_color).collect());
        true
    }
}

/// Where settings are read from and written to
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn read(&self) -> Result<Settings, ConfigError>;
    async fn write(&self, settings: &Settings) -> Result<(), ConfigError>;
}

/// Settings persisted as a YAML file
pub struct YamlSettingsStore {
    path: PathBuf,
}

impl YamlSettingsStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SettingsStore for YamlSettingsStore {
    async fn read(&self) -> Result<Settings, ConfigError> {
        match fs::read_to_string(&self.path).await {
            Ok(content) => Ok(serde_yaml::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No settings at {}, using defaults", self.path.display());
                Ok(Settings::default())
            }
            Err(e) => Err(ConfigError::io(&self.path, e)),
        }
    }

    async fn write(&self, settings: &Settings) -> Result<(), ConfigError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| ConfigError::io(parent, e))?;
        }
        let content = serde_yaml::to_string(settings)?;
        fs::write(&self.path, content)
            .await
            .map_err(|e| ConfigError::io(&self.path, e))?;
        debug!("Settings saved to {}", self.path.display());
        Ok(())
    }
}

/// In-process settings, remembering every write
#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    current: Mutex<Settings>,
    writes: Mutex<Vec<Settings>>,
}

impl MemorySettingsStore {
    pub fn new(settings: Settings) -> Self {
        Self {
            current: Mutex::new(settings),
            writes: Mutex::new(Vec::new()),
        }
    }

    pub fn current(&self) -> Settings {
        self.current.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Every settings value written so far, oldest first
    pub fn writes(&self) -> Vec<Settings> {
        self.writes.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl SettingsStore for MemorySettingsStore {
    async fn read(&self) -> Result<Settings, ConfigError> {
        Ok(self.current())
    }

    async fn write(&self, settings: &Settings) -> Result<(), ConfigError> {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = settings.clone();
        self.writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(settings.clone());
        Ok(())
    }
}
