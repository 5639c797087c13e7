use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_true")]
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
            file_logging_enabled: default_true(),
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
    "headphone_link".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,

    // Simple command service
    #[serde(default = "default_service_uuid")]
    pub ble_service_uuid: String,
    #[serde(default = "default_command_uuid")]
    pub ble_command_char_uuid: String,
    #[serde(default = "default_status_uuid")]
    pub ble_status_char_uuid: String,
    #[serde(default = "default_document_uuid")]
    pub ble_document_char_uuid: String,

    // Frame protocol service
    #[serde(default = "default_frame_service_uuid")]
    pub frame_service_uuid: String,
    #[serde(default = "default_frame_command_uuid")]
    pub frame_command_char_uuid: String,
    #[serde(default = "default_frame_response_uuid")]
    pub frame_response_char_uuid: String,
    #[serde(default = "default_frame_data_uuid")]
    pub frame_data_char_uuid: String,

    // Protocol tuning
    #[serde(default = "default_max_payload")]
    pub max_payload: usize,
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
    #[serde(default = "default_scan_grace_ms")]
    pub scan_grace_ms: u64,
    #[serde(default = "default_status_poll_interval_ms")]
    pub status_poll_interval_ms: u64,
    #[serde(default = "default_receive_size_hint")]
    pub receive_size_hint: usize,

    // Received artifacts
    #[serde(default)]
    pub artifact_dir: Option<String>,

    #[serde(default)]
    pub last_connected_device: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_settings: LogSettings::default(),

            ble_service_uuid: default_service_uuid(),
            ble_command_char_uuid: default_command_uuid(),
            ble_status_char_uuid: default_status_uuid(),
            ble_document_char_uuid: default_document_uuid(),

            frame_service_uuid: default_frame_service_uuid(),
            frame_command_char_uuid: default_frame_command_uuid(),
            frame_response_char_uuid: default_frame_response_uuid(),
            frame_data_char_uuid: default_frame_data_uuid(),

            max_payload: default_max_payload(),
            response_timeout_ms: default_response_timeout_ms(),
            scan_grace_ms: default_scan_grace_ms(),
            status_poll_interval_ms: default_status_poll_interval_ms(),
            receive_size_hint: default_receive_size_hint(),

            artifact_dir: None,
            last_connected_device: None,
        }
    }
}

impl Settings {
    /// Reject values the protocol cannot work with
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_payload == 0 || self.max_payload > u16::MAX as usize {
            anyhow::bail!("max_payload must be between 1 and {}", u16::MAX);
        }
        if self.response_timeout_ms == 0 {
            anyhow::bail!("response_timeout_ms must be positive");
        }
        if self.scan_grace_ms == 0 || self.status_poll_interval_ms == 0 {
            anyhow::bail!("scan and poll intervals must be positive");
        }
        if self.receive_size_hint == 0 {
            anyhow::bail!("receive_size_hint must be positive");
        }
        Ok(())
    }

    /// Directory where completed inbound transfers are written
    pub fn artifact_dir(&self) -> PathBuf {
        match &self.artifact_dir {
            Some(dir) => PathBuf::from(dir),
            None => dirs::download_dir()
                .or_else(dirs::home_dir)
                .unwrap_or_else(|| PathBuf::from("."))
                .join("HeadphoneLink"),
        }
    }
}

fn default_service_uuid() -> String {
    "0000ffe0-0000-1000-8000-00805f9b34fb".to_string()
}
fn default_command_uuid() -> String {
    "0000ffe1-0000-1000-8000-00805f9b34fb".to_string()
}
fn default_status_uuid() -> String {
    "0000ffe2-0000-1000-8000-00805f9b34fb".to_string()
}
fn default_document_uuid() -> String {
    "0000ffe3-0000-1000-8000-00805f9b34fb".to_string()
}
fn default_frame_service_uuid() -> String {
    "00001100-d102-11e1-9b23-00025b00a5a5".to_string()
}
fn default_frame_command_uuid() -> String {
    "00001101-d102-11e1-9b23-00025b00a5a5".to_string()
}
fn default_frame_response_uuid() -> String {
    "00001102-d102-11e1-9b23-00025b00a5a5".to_string()
}
fn default_frame_data_uuid() -> String {
    "00001103-d102-11e1-9b23-00025b00a5a5".to_string()
}
fn default_max_payload() -> usize {
    12
}
fn default_response_timeout_ms() -> u64 {
    5000
}
fn default_scan_grace_ms() -> u64 {
    2000
}
fn default_status_poll_interval_ms() -> u64 {
    1000
}
fn default_receive_size_hint() -> usize {
    1024 * 1024
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::with_path(settings_path))
    }

    /// Load settings from an explicit file, falling back to defaults
    pub fn with_path(settings_path: PathBuf) -> Self {
        let settings = match Self::load_from_file(&settings_path) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::debug!("Using default settings ({})", e);
                Settings::default()
            }
        };

        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("HeadphoneLink");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings: Settings = serde_json::from_str(&contents)?;
        settings.validate()?;
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

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn remember_device(&mut self, id: &str) -> anyhow::Result<()> {
        if self.settings.last_connected_device.as_deref() != Some(id) {
            self.settings.last_connected_device = Some(id.to_string());
            self.save()?;
        }
        Ok(())
    }
}
