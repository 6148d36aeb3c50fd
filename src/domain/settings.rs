use crate::domain::models::Side;
use crate::infrastructure::bluetooth::protocol;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_false")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_false(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_false(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "imu_link".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// A peripheral the user has connected before, with its placement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownPeripheral {
    pub id: String,
    pub side: Side,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,

    // BLE Settings
    #[serde(default = "default_service_uuid")]
    pub ble_service_uuid: String,
    #[serde(default = "default_data_uuid")]
    pub ble_data_char_uuid: String,
    #[serde(default = "default_name_marker")]
    pub device_name_marker: String,
    #[serde(default = "default_scan_duration_ms")]
    pub scan_duration_ms: u64,

    // Sync Settings
    #[serde(default)]
    pub sync_interval_ms: Option<u64>,
    #[serde(default)]
    pub sync_side: Option<Side>,

    #[serde(default)]
    pub known_peripherals: Vec<KnownPeripheral>,

    // Debug Settings
    #[serde(default = "default_false")]
    pub debug_raw_data_logging: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_settings: LogSettings::default(),
            ble_service_uuid: default_service_uuid(),
            ble_data_char_uuid: default_data_uuid(),
            device_name_marker: default_name_marker(),
            scan_duration_ms: default_scan_duration_ms(),
            sync_interval_ms: None,
            sync_side: None,
            known_peripherals: Vec::new(),
            debug_raw_data_logging: false,
        }
    }
}

impl Settings {
    pub fn known_side(&self, peripheral_id: &str) -> Option<Side> {
        self.known_peripherals
            .iter()
            .find(|p| p.id == peripheral_id)
            .map(|p| p.side)
    }
}

fn default_service_uuid() -> String {
    protocol::SERVICE_UUID.to_string()
}
fn default_data_uuid() -> String {
    protocol::DATA_CHAR_UUID.to_string()
}
fn default_name_marker() -> String {
    protocol::DEVICE_NAME_MARKER.to_string()
}
fn default_scan_duration_ms() -> u64 {
    5000
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::from_path(settings_path))
    }

    /// Load from an explicit file, falling back to defaults if it is missing or unreadable
    pub fn from_path(settings_path: impl Into<PathBuf>) -> Self {
        let settings_path = settings_path.into();
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();
        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("ImuLink");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.settings_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    /// Remember which side a peripheral was connected as
    pub fn remember_peripheral(&mut self, id: &str, side: Side) -> anyhow::Result<()> {
        let known = &mut self.settings.known_peripherals;
        match known.iter_mut().find(|p| p.id == id) {
            Some(entry) if entry.side == side => return Ok(()),
            Some(entry) => entry.side = side,
            None => known.push(KnownPeripheral {
                id: id.to_string(),
                side,
            }),
        }
        self.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_fields_take_defaults() {
        let settings: Settings = serde_json::from_str(r#"{"scan_duration_ms": 1200}"#).unwrap();
        assert_eq!(settings.scan_duration_ms, 1200);
        assert_eq!(settings.ble_service_uuid, protocol::SERVICE_UUID);
        assert_eq!(settings.device_name_marker, "esp32");
        assert_eq!(settings.log_settings.level, "info");
        assert!(settings.sync_interval_ms.is_none());
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let service = SettingsService::from_path(dir.path().join("absent.json"));
        assert_eq!(service.get().scan_duration_ms, 5000);
    }

    #[test]
    fn test_remember_peripheral_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        fs::create_dir_all(dir.path().join("nested")).unwrap();
        fs::write(&path, r#"{"sync_interval_ms": 1000}"#).unwrap();

        let mut service = SettingsService::from_path(&path);
        assert_eq!(service.get().sync_interval_ms, Some(1000));
        service.remember_peripheral("AA:BB", Side::Left).unwrap();
        service.remember_peripheral("CC:DD", Side::Right).unwrap();
        service.remember_peripheral("AA:BB", Side::Right).unwrap();

        let reloaded = SettingsService::from_path(&path);
        let settings = reloaded.get();
        assert_eq!(settings.sync_interval_ms, Some(1000));
        assert_eq!(settings.known_peripherals.len(), 2);
        assert_eq!(settings.known_side("AA:BB"), Some(Side::Right));
        assert_eq!(settings.known_side("CC:DD"), Some(Side::Right));
        assert_eq!(settings.known_side("EE:FF"), None);
    }
}
