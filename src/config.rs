//! Replay-tool configuration: display geometry, filter toggles, device
//! descriptions and virtual-key layout, loaded from a TOML file.

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::device::DeviceClasses;
use crate::orientation::Rotation;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub display: Option<DisplayConfig>,
    #[serde(default)]
    pub filters: FilterConfig,
    #[serde(default)]
    pub excluded: Vec<String>,
    #[serde(default, rename = "virtual-keys")]
    pub virtual_keys: Vec<VirtualKeyConfig>,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DisplayConfig {
    pub width: i32,
    pub height: i32,
    #[serde(default)]
    pub orientation: Rotation,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilterConfig {
    /// Enables the bad-touch and averaging filters.
    #[serde(default)]
    pub touch: bool,
    #[serde(default)]
    pub jumpy: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VirtualKeyConfig {
    /// Name of the device this key belongs to.
    pub device: String,
    pub scan_code: u16,
    /// Key center and extent in display coordinates.
    pub center_x: i32,
    pub center_y: i32,
    pub width: i32,
    pub height: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceClassName {
    Keyboard,
    Alphakey,
    Touchscreen,
    Multitouch,
    Trackball,
    Dpad,
}

impl DeviceClassName {
    pub fn to_class(self) -> DeviceClasses {
        match self {
            DeviceClassName::Keyboard => DeviceClasses::KEYBOARD,
            DeviceClassName::Alphakey => DeviceClasses::ALPHAKEY,
            DeviceClassName::Touchscreen => DeviceClasses::TOUCHSCREEN,
            DeviceClassName::Multitouch => DeviceClasses::TOUCHSCREEN_MT,
            DeviceClassName::Trackball => DeviceClasses::TRACKBALL,
            DeviceClassName::Dpad => DeviceClasses::DPAD,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AxisRangeConfig {
    pub min: i32,
    pub max: i32,
    #[serde(default)]
    pub flat: i32,
    #[serde(default)]
    pub fuzz: i32,
}

#[derive(Debug, Default, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AxesConfig {
    pub x: Option<AxisRangeConfig>,
    pub y: Option<AxisRangeConfig>,
    pub pressure: Option<AxisRangeConfig>,
    pub size: Option<AxisRangeConfig>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeymapEntry {
    pub scan: u16,
    pub key: i32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceConfig {
    pub id: i32,
    pub name: String,
    pub classes: Vec<DeviceClassName>,
    #[serde(default)]
    pub axes: AxesConfig,
    #[serde(default)]
    pub keymap: Vec<KeymapEntry>,
}

impl DeviceConfig {
    pub fn device_classes(&self) -> DeviceClasses {
        self.classes
            .iter()
            .fold(DeviceClasses::empty(), |acc, c| acc | c.to_class())
    }
}

pub fn load(cli_path: Option<&Path>) -> FileConfig {
    cli_path
        .and_then(load_from_path)
        .or_else(load_from_default_paths)
        .unwrap_or_default()
}

pub fn load_from_path(path: &Path) -> Option<FileConfig> {
    let content = std::fs::read_to_string(path).ok()?;
    match toml::from_str(&content) {
        Ok(config) => {
            log::debug!("Loaded config from {}", path.display());
            Some(config)
        }
        Err(e) => {
            log::warn!("Failed to parse {}: {}", path.display(), e);
            None
        }
    }
}

pub fn load_from_default_paths() -> Option<FileConfig> {
    for path in default_config_paths() {
        if path.exists() {
            if let Some(config) = load_from_path(&path) {
                return Some(config);
            }
        }
    }
    None
}

fn default_config_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    paths.push(PathBuf::from("evreader.toml"));

    if let Ok(home) = std::env::var("HOME") {
        paths.push(
            PathBuf::from(home)
                .join(".config")
                .join("evreader")
                .join("config.toml"),
        );
    }

    paths
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_config() {
        let config: FileConfig = toml::from_str(
            r#"
            excluded = ["aux-keys"]

            [display]
            width = 1024
            height = 768
            orientation = "90"

            [filters]
            touch = true

            [[virtual-keys]]
            device = "panel"
            scan_code = 158
            center_x = 100
            center_y = 800
            width = 80
            height = 60

            [[devices]]
            id = 1
            name = "panel"
            classes = ["touchscreen", "multitouch"]
            keymap = [{ scan = 158, key = 4 }]

            [devices.axes]
            x = { min = 0, max = 1023 }
            y = { min = 0, max = 767 }
            "#,
        )
        .expect("config should parse");

        let display = config.display.expect("display section");
        assert_eq!(display.width, 1024);
        assert_eq!(display.orientation, Rotation::Rot90);
        assert!(config.filters.touch);
        assert!(!config.filters.jumpy);
        assert_eq!(config.excluded, vec!["aux-keys".to_string()]);
        assert_eq!(config.virtual_keys.len(), 1);

        let device = &config.devices[0];
        assert_eq!(
            device.device_classes(),
            DeviceClasses::TOUCHSCREEN | DeviceClasses::TOUCHSCREEN_MT
        );
        assert_eq!(device.axes.x.map(|a| a.max), Some(1023));
        assert_eq!(device.keymap[0].key, 4);
    }

    #[test]
    fn empty_config_is_fine() {
        let config: FileConfig = toml::from_str("").expect("empty config should parse");
        assert!(config.display.is_none());
        assert!(config.devices.is_empty());
    }
}
