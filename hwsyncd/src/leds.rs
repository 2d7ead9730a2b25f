//! Keyboard backlight LED class files
//!
//! Layout discovery, capability probing, and reading/writing the per-zone
//! `brightness` and `multi_intensity` files.

use hwsync_common::{tracing, BacklightCapabilities, BacklightZoneState, Rgb};
use std::fmt::Display;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

use crate::config::BacklightOptions;
use crate::settings::Settings;
use crate::worker::{WorkerError, WorkerResult};

const WHITE_ZONE: &str = "white:kbd_backlight";
const RGB_ZONE: &str = "rgb:kbd_backlight";

const BRIGHTNESS: &str = "brightness";
const MAX_BRIGHTNESS: &str = "max_brightness";
const MULTI_INTENSITY: &str = "multi_intensity";
const BUFFER_INPUT: &str = "device/controls/buffer_input";

/// Zone index encoded in an RGB LED directory name.
///
/// `rgb:kbd_backlight` is zone 0, `rgb:kbd_backlight_N` is zone N.
pub fn zone_index(name: &str) -> Option<u32> {
    let start = name.find(RGB_ZONE)?;
    let suffix = &name[start + RGB_ZONE.len()..];
    if suffix.is_empty() {
        return Some(0);
    }
    suffix.strip_prefix('_')?.parse().ok()
}

/// Sort LED directory names by zone index, unparseable names last
pub fn sort_zone_names(names: &mut [String]) {
    names.sort_by_key(|name| zone_index(name).unwrap_or(u32::MAX));
}

/// Where the backlight control files of this machine live
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedLayout {
    pub white: PathBuf,
    pub rgb_zones: Vec<PathBuf>,
}

impl LedLayout {
    /// Resolve the layout under the configured sysfs tree.
    ///
    /// Per-key zones exposed by the HID keyboard drivers replace the default
    /// platform zones when any are present.
    pub async fn discover(options: &BacklightOptions) -> Self {
        let platform = options.platform_leds_dir();
        let mut rgb_zones = vec![
            platform.join(RGB_ZONE),
            platform.join(format!("{}_1", RGB_ZONE)),
            platform.join(format!("{}_2", RGB_ZONE)),
        ];

        let per_key = per_key_zones(&options.per_key_driver_dirs()).await;
        if !per_key.is_empty() {
            debug!("Found {} per-key LED zones", per_key.len());
            rgb_zones = per_key;
        }

        Self {
            white: platform.join(WHITE_ZONE),
            rgb_zones,
        }
    }

    /// Determine capabilities, `None` if no backlight is present
    pub async fn probe(&self) -> WorkerResult<Option<BacklightCapabilities>> {
        let white_max = self.white.join(MAX_BRIGHTNESS);
        if exists(&white_max).await {
            info!("Detected white only keyboard backlight");
            return Ok(Some(BacklightCapabilities::white(read_u32(&white_max).await?)));
        }

        let Some(primary) = self.rgb_zones.first() else {
            info!("Detected no keyboard backlight");
            return Ok(None);
        };
        let primary_max = primary.join(MAX_BRIGHTNESS);
        if !exists(&primary_max).await {
            info!("Detected no keyboard backlight");
            return Ok(None);
        }
        let max_brightness = read_u32(&primary_max).await?;

        if self.rgb_zones.len() > 3 {
            info!("Detected per-key RGB keyboard backlight");
            return Ok(Some(BacklightCapabilities::rgb(self.rgb_zones.len() as u32, max_brightness)));
        }

        let mut zones = 1;
        for zone in &self.rgb_zones[1..] {
            if exists(&zone.join(MAX_BRIGHTNESS)).await {
                zones += 1;
            }
        }
        info!("Detected {} zone RGB keyboard backlight", zones);
        Ok(Some(BacklightCapabilities::rgb(zones, max_brightness)))
    }

    /// Read brightness and color of every zone, capped at the zone count
    pub async fn read_states(&self, capabilities: &BacklightCapabilities) -> WorkerResult<Vec<BacklightZoneState>> {
        let white_brightness = self.white.join(BRIGHTNESS);
        if exists(&white_brightness).await {
            return Ok(vec![BacklightZoneState::white(read_u32(&white_brightness).await?)]);
        }

        let mut states = Vec::new();
        for zone in &self.rgb_zones {
            if states.len() >= capabilities.zones as usize {
                break;
            }
            let brightness_path = zone.join(BRIGHTNESS);
            if !exists(&brightness_path).await {
                continue;
            }
            let brightness = read_u32(&brightness_path).await?;

            let intensity_path = zone.join(MULTI_INTENSITY);
            let state = if exists(&intensity_path).await {
                let raw = read_trimmed(&intensity_path).await?;
                let color = raw.parse::<Rgb>().map_err(|_| WorkerError::Parse {
                    path: intensity_path.clone(),
                    value: raw.clone(),
                })?;
                BacklightZoneState::rgb(brightness, color)
            } else {
                BacklightZoneState::white(brightness)
            };
            states.push(state);
        }
        Ok(states)
    }

    /// Push settings to the hardware.
    ///
    /// Input buffering on the first RGB zone is held for the whole update so
    /// the keyboard does not show the intermediate writes.
    pub async fn apply(&self, capabilities: &BacklightCapabilities, settings: &Settings) -> WorkerResult<()> {
        let buffered = self.rgb_zones.first();
        if let Some(zone) = buffered {
            buffer_input(zone, true).await?;
        }

        let result = self.write_values(capabilities, settings).await;

        if let Some(zone) = buffered {
            buffer_input(zone, false).await?;
        }
        result
    }

    async fn write_values(&self, capabilities: &BacklightCapabilities, settings: &Settings) -> WorkerResult<()> {
        let colors: Vec<Rgb> = match &settings.keyboard_backlight_color {
            Some(colors) if colors.len() == capabilities.zones as usize => {
                colors.iter().copied().map(Rgb::from_packed).collect()
            }
            Some(colors) => {
                debug!(
                    "Stored colors cover {} zones, hardware has {}; using white",
                    colors.len(),
                    capabilities.zones
                );
                vec![Rgb::WHITE; self.rgb_zones.len()]
            }
            None => vec![Rgb::WHITE; self.rgb_zones.len()],
        };

        for (zone, color) in self.rgb_zones.iter().zip(colors) {
            let path = zone.join(MULTI_INTENSITY);
            if exists(&path).await {
                write_value(&path, color).await?;
            }
        }

        let brightness = settings
            .keyboard_backlight_brightness
            .unwrap_or(capabilities.max_brightness / 2);

        let white = self.white.join(BRIGHTNESS);
        if exists(&white).await {
            write_value(&white, brightness).await?;
        }
        for zone in &self.rgb_zones {
            let path = zone.join(BRIGHTNESS);
            if exists(&path).await {
                write_value(&path, brightness).await?;
            }
        }
        Ok(())
    }
}

/// Per-key RGB zones of every keyboard bound to one of `driver_dirs`
async fn per_key_zones(driver_dirs: &[PathBuf]) -> Vec<PathBuf> {
    let mut zones = Vec::new();
    for driver in driver_dirs {
        for device in sorted_entries(driver).await {
            let leds = driver.join(&device).join("leds");
            if !exists(&leds).await {
                continue;
            }
            let mut names: Vec<String> = sorted_entries(&leds)
                .await
                .into_iter()
                .filter(|name| name.contains(RGB_ZONE))
                .collect();
            sort_zone_names(&mut names);
            zones.extend(names.into_iter().map(|name| leds.join(name)));
        }
    }
    zones
}

/// Entry names of `dir` in lexical order; missing directories have none
async fn sorted_entries(dir: &Path) -> Vec<String> {
    let mut names = Vec::new();
    let Ok(mut entries) = fs::read_dir(dir).await else {
        return names;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    names.sort();
    names
}

async fn buffer_input(zone: &Path, on: bool) -> WorkerResult<()> {
    let path = zone.join(BUFFER_INPUT);
    if exists(&path).await {
        write_value(&path, if on { 1 } else { 0 }).await?;
    }
    Ok(())
}

async fn exists(path: &Path) -> bool {
    fs::metadata(path).await.is_ok()
}

async fn read_trimmed(path: &Path) -> WorkerResult<String> {
    let raw = fs::read_to_string(path).await.map_err(|source| WorkerError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(raw.trim().to_string())
}

async fn read_u32(path: &Path) -> WorkerResult<u32> {
    let raw = read_trimmed(path).await?;
    raw.parse().map_err(|_| WorkerError::Parse {
        path: path.to_path_buf(),
        value: raw,
    })
}

async fn write_value(path: &Path, value: impl Display) -> WorkerResult<()> {
    fs::write(path, value.to_string())
        .await
        .map_err(|source| WorkerError::Io {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
pub(crate) mod fixtures {
    use std::fs;
    use std::path::{Path, PathBuf};

    pub const PLATFORM: &str = "sys/devices/platform/tuxedo_keyboard/leds";

    /// Create an LED class directory with the given attribute files
    pub fn led(root: &Path, dir: &str, files: &[(&str, &str)]) -> PathBuf {
        let path = root.join(dir);
        fs::create_dir_all(&path).unwrap();
        for (name, content) in files {
            let file = path.join(name);
            fs::create_dir_all(file.parent().unwrap()).unwrap();
            fs::write(file, content).unwrap();
        }
        path
    }

    pub fn rgb_zone(root: &Path, name: &str) -> PathBuf {
        led(
            root,
            &format!("{}/{}", PLATFORM, name),
            &[("max_brightness", "50\n"), ("brightness", "10\n"), ("multi_intensity", "1 2 3\n")],
        )
    }

    pub fn read(path: &Path) -> String {
        fs::read_to_string(path).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_zone_index() {
        assert_eq!(zone_index("rgb:kbd_backlight"), Some(0));
        assert_eq!(zone_index("rgb:kbd_backlight_1"), Some(1));
        assert_eq!(zone_index("rgb:kbd_backlight_15"), Some(15));
        assert_eq!(zone_index("rgb:kbd_backlight_x"), None);
        assert_eq!(zone_index("white:kbd_backlight"), None);
    }

    #[test]
    fn test_zone_sort_is_numeric() {
        let mut names: Vec<String> = ["rgb:kbd_backlight_2", "rgb:kbd_backlight", "rgb:kbd_backlight_1"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        sort_zone_names(&mut names);
        assert_eq!(names, vec!["rgb:kbd_backlight", "rgb:kbd_backlight_1", "rgb:kbd_backlight_2"]);

        let mut names: Vec<String> = ["rgb:kbd_backlight_10", "rgb:kbd_backlight_9"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        sort_zone_names(&mut names);
        assert_eq!(names, vec!["rgb:kbd_backlight_9", "rgb:kbd_backlight_10"]);
    }

    #[tokio::test]
    async fn test_white_only_capabilities() {
        let root = TempDir::new().unwrap();
        led(
            root.path(),
            &format!("{}/white:kbd_backlight", PLATFORM),
            &[("max_brightness", "2\n"), ("brightness", "1\n")],
        );
        let layout = LedLayout::discover(&BacklightOptions::with_sysfs_root(root.path())).await;

        let caps = layout.probe().await.unwrap().unwrap();
        assert_eq!(caps.zones, 1);
        assert_eq!(caps.max_brightness, 2);
        assert!(!caps.has_rgb());

        let states = layout.read_states(&caps).await.unwrap();
        assert_eq!(states, vec![BacklightZoneState::white(1)]);
        assert_eq!(states[0].color(), None);
    }

    #[tokio::test]
    async fn test_two_of_three_rgb_zones() {
        let root = TempDir::new().unwrap();
        rgb_zone(root.path(), "rgb:kbd_backlight");
        rgb_zone(root.path(), "rgb:kbd_backlight_1");
        let layout = LedLayout::discover(&BacklightOptions::with_sysfs_root(root.path())).await;
        assert_eq!(layout.rgb_zones.len(), 3);

        let caps = layout.probe().await.unwrap().unwrap();
        assert_eq!(caps.zones, 2);
        assert_eq!(caps.max_brightness, 50);
        assert_eq!(caps.max_red, Some(255));

        let states = layout.read_states(&caps).await.unwrap();
        assert_eq!(states.len(), 2);
        assert_eq!(states[1].color(), Some(Rgb::new(1, 2, 3)));
    }

    #[tokio::test]
    async fn test_no_backlight() {
        let root = TempDir::new().unwrap();
        let layout = LedLayout::discover(&BacklightOptions::with_sysfs_root(root.path())).await;
        assert_eq!(layout.probe().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_per_key_zones_replace_platform_zones() {
        let root = TempDir::new().unwrap();
        rgb_zone(root.path(), "rgb:kbd_backlight");
        let device = "sys/bus/hid/drivers/ite_829x/0003:048D:600B.0001/leds";
        for name in ["rgb:kbd_backlight_10", "rgb:kbd_backlight", "rgb:kbd_backlight_2", "rgb:kbd_backlight_1", "input3::capslock"] {
            led(root.path(), &format!("{}/{}", device, name), &[("max_brightness", "50"), ("brightness", "0")]);
        }

        let layout = LedLayout::discover(&BacklightOptions::with_sysfs_root(root.path())).await;
        let names: Vec<String> = layout
            .rgb_zones
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(
            names,
            vec!["rgb:kbd_backlight", "rgb:kbd_backlight_1", "rgb:kbd_backlight_2", "rgb:kbd_backlight_10"]
        );

        let caps = layout.probe().await.unwrap().unwrap();
        assert_eq!(caps.zones, 4);
    }

    #[tokio::test]
    async fn test_apply_writes_colors_and_brightness() {
        let root = TempDir::new().unwrap();
        let zone0 = rgb_zone(root.path(), "rgb:kbd_backlight");
        let zone1 = rgb_zone(root.path(), "rgb:kbd_backlight_1");
        let buffer = zone0.join(BUFFER_INPUT);
        std::fs::create_dir_all(buffer.parent().unwrap()).unwrap();
        std::fs::write(&buffer, "0").unwrap();

        let layout = LedLayout::discover(&BacklightOptions::with_sysfs_root(root.path())).await;
        let caps = layout.probe().await.unwrap().unwrap();
        let settings = Settings {
            keyboard_backlight_brightness: Some(33),
            keyboard_backlight_color: Some(vec![Rgb::new(255, 0, 0).to_packed(), Rgb::new(0, 128, 255).to_packed()]),
            ..Settings::default()
        };

        layout.apply(&caps, &settings).await.unwrap();

        assert_eq!(read(&zone0.join(MULTI_INTENSITY)), "255 0 0");
        assert_eq!(read(&zone1.join(MULTI_INTENSITY)), "0 128 255");
        assert_eq!(read(&zone0.join(BRIGHTNESS)), "33");
        assert_eq!(read(&zone1.join(BRIGHTNESS)), "33");
        // Buffering is released after the update
        assert_eq!(read(&buffer), "0");
    }

    #[tokio::test]
    async fn test_apply_defaults() {
        let root = TempDir::new().unwrap();
        let zone0 = rgb_zone(root.path(), "rgb:kbd_backlight");
        let layout = LedLayout::discover(&BacklightOptions::with_sysfs_root(root.path())).await;
        let caps = layout.probe().await.unwrap().unwrap();

        // Three colors for a one-zone keyboard do not match
        let settings = Settings {
            keyboard_backlight_color: Some(vec![0, 0, 0]),
            ..Settings::default()
        };
        layout.apply(&caps, &settings).await.unwrap();

        assert_eq!(read(&zone0.join(MULTI_INTENSITY)), "255 255 255");
        assert_eq!(read(&zone0.join(BRIGHTNESS)), "25");
    }

    #[tokio::test]
    async fn test_apply_is_idempotent() {
        let root = TempDir::new().unwrap();
        let zone0 = rgb_zone(root.path(), "rgb:kbd_backlight");
        let zone1 = rgb_zone(root.path(), "rgb:kbd_backlight_1");
        let layout = LedLayout::discover(&BacklightOptions::with_sysfs_root(root.path())).await;
        let caps = layout.probe().await.unwrap().unwrap();
        let settings = Settings {
            keyboard_backlight_brightness: Some(12),
            keyboard_backlight_color: Some(vec![0x10203000, 0x40506000]),
            ..Settings::default()
        };

        let snapshot = || {
            [&zone0, &zone1]
                .iter()
                .flat_map(|zone| [read(&zone.join(MULTI_INTENSITY)), read(&zone.join(BRIGHTNESS))])
                .collect::<Vec<_>>()
        };

        layout.apply(&caps, &settings).await.unwrap();
        let first = snapshot();
        layout.apply(&caps, &settings).await.unwrap();
        assert_eq!(snapshot(), first);
        assert_eq!(first, vec!["16 32 48", "12", "64 80 96", "12"]);
    }

    #[tokio::test]
    async fn test_malformed_intensity_is_an_error() {
        let root = TempDir::new().unwrap();
        let zone0 = rgb_zone(root.path(), "rgb:kbd_backlight");
        std::fs::write(zone0.join(MULTI_INTENSITY), "garbage").unwrap();
        let layout = LedLayout::discover(&BacklightOptions::with_sysfs_root(root.path())).await;
        let caps = layout.probe().await.unwrap().unwrap();

        assert!(matches!(layout.read_states(&caps).await, Err(WorkerError::Parse { .. })));
    }
}
