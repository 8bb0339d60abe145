use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Environment variable overriding `Settings::local_name`.
pub const LOCAL_NAME_ENV: &str = "BLUETOOTH_CHAT_LOCAL_NAME";

/// Serial Port Profile service UUID. Both peers must agree on it out of band.
pub const SERVICE_UUID: &str = "00001101-0000-1000-8000-00805F9B34FB";

/// Default cap on a single inbound payload (64 KiB)
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 64 * 1024;

/// Largest payload cap a settings file may ask for (16 MiB)
pub const MAX_PAYLOAD_BYTES_LIMIT: usize = 16 * 1024 * 1024;

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// Level name or any `EnvFilter` directive, e.g. `bluetooth_chat=debug`
    pub level: String,
    pub console: bool,
    /// Also write to rolling files under `directory`
    pub file: bool,
    pub directory: PathBuf,
    pub file_prefix: String,
    /// `minutely`, `hourly`, `daily` or `never`
    pub rotation: String,
    pub source_location: bool,
    pub thread_ids: bool,
    pub target: bool,
    pub ansi: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            console: true,
            file: false,
            directory: PathBuf::from("logs"),
            file_prefix: "bluetooth_chat".to_string(),
            rotation: "daily".to_string(),
            source_location: false,
            thread_ids: false,
            target: true,
            ansi: true,
        }
    }
}

/// Persisted chat settings. Missing keys take their defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Sender label for outgoing messages. Falls back to the adapter name.
    pub local_name: Option<String>,

    /// RFCOMM service record both peers rendezvous on
    pub service_uuid: String,

    /// Longest inbound payload accepted before the channel is torn down
    pub max_payload_bytes: usize,

    pub log_settings: LogSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            local_name: None,
            service_uuid: SERVICE_UUID.to_string(),
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            log_settings: LogSettings::default(),
        }
    }
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    /// Load settings from the per-user config directory, falling back to defaults.
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::load_from(settings_path))
    }

    /// Load settings from an explicit path. A missing or unreadable file yields defaults.
    pub fn load_from(settings_path: impl Into<PathBuf>) -> Self {
        let settings_path = settings_path.into();
        let mut settings = match Self::load_from_file(&settings_path) {
            Ok(settings) => settings,
            Err(e) => {
                debug!("Using default settings ({}): {}", settings_path.display(), e);
                Settings::default()
            }
        };
        Self::apply_env_overrides(&mut settings);

        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("BluetoothChat");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    fn apply_env_overrides(settings: &mut Settings) {
        match std::env::var(LOCAL_NAME_ENV) {
            Ok(name) if !name.trim().is_empty() => settings.local_name = Some(name),
            Ok(_) => warn!("{} is set but empty, ignoring", LOCAL_NAME_ENV),
            Err(_) => {}
        }
    }

    pub fn save(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.settings_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("bluetooth_chat_settings_{}_{}", name, std::process::id()))
            .join("settings.json")
    }

    #[test]
    fn test_defaults_use_serial_port_profile() {
        let settings = Settings::default();
        assert_eq!(settings.service_uuid, "00001101-0000-1000-8000-00805F9B34FB");
        assert_eq!(settings.max_payload_bytes, DEFAULT_MAX_PAYLOAD_BYTES);
        assert!(settings.local_name.is_none());
    }

    #[test]
    fn test_payload_limits_are_ordered() {
        assert!(DEFAULT_MAX_PAYLOAD_BYTES > 0);
        assert!(DEFAULT_MAX_PAYLOAD_BYTES <= MAX_PAYLOAD_BYTES_LIMIT);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let settings: Settings = serde_json::from_str(r#"{"local_name":"Desk"}"#).unwrap();
        assert_eq!(settings.local_name.as_deref(), Some("Desk"));
        assert_eq!(settings.service_uuid, SERVICE_UUID);
        assert_eq!(settings.log_settings.level, "info");
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let service = SettingsService::load_from(scratch_path("missing"));
        assert_eq!(service.get().max_payload_bytes, DEFAULT_MAX_PAYLOAD_BYTES);
    }

    #[test]
    fn test_save_and_reload() {
        let path = scratch_path("roundtrip");
        let mut service = SettingsService::load_from(path.clone());
        service.get_mut().max_payload_bytes = 1024;
        service.save().unwrap();

        let reloaded = SettingsService::load_from(path.clone());
        assert_eq!(reloaded.get().max_payload_bytes, 1024);

        let _ = fs::remove_dir_all(path.parent().unwrap());
    }
}
