use config::{Config, ConfigError, File as ConfigFile};
use serde_derive::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::Path;
use tracing_subscriber::filter::LevelFilter;

use crate::errors::AppError;

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct MiscSettings {
    log_level: String,
    pub log_to_file: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct BLESettings {
    // Empty accepts any heart rate monitor
    pub device_name_prefix: String,
    pub min_scan_interval_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct AnnounceSettings {
    pub assist_on_start: bool,
    pub min_interval_secs: u64,
    pub min_delta: u16,
    pub settle_delay_ms: u64,
    // Text-to-speech program, the phrase is appended to command_args.
    // Empty means announcements are only logged.
    pub command: String,
    pub command_args: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct DummySettings {
    pub low_bpm: u16,
    pub high_bpm: u16,
    pub bpm_speed: f32,
    pub loops_before_dc: u16,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Settings {
    pub ble: BLESettings,
    pub announce: AnnounceSettings,
    pub dummy: DummySettings,
    pub misc: MiscSettings,
}

impl Settings {
    pub fn load(config_path: &Path, required: bool) -> Result<Self, ConfigError> {
        let default_log_level = if cfg!(debug_assertions) {
            "debug"
        } else {
            "info"
        };

        let s = Config::builder()
            .add_source(ConfigFile::from(config_path).required(required))
            .set_default("ble.device_name_prefix", "")?
            .set_default("ble.min_scan_interval_ms", 1000)?
            .set_default("announce.assist_on_start", true)?
            .set_default("announce.min_interval_secs", 30)?
            .set_default("announce.min_delta", 7)?
            .set_default("announce.settle_delay_ms", 200)?
            .set_default("announce.command", "")?
            .set_default("announce.command_args", Vec::<String>::new())?
            .set_default("dummy.low_bpm", 50)?
            .set_default("dummy.high_bpm", 120)?
            .set_default("dummy.bpm_speed", 1.5)?
            .set_default("dummy.loops_before_dc", 2)?
            .set_default("misc.log_level", default_log_level)?
            .set_default("misc.log_to_file", true)?
            .build()?;

        s.try_deserialize()
    }

    pub fn save(&self, config_path: &Path) -> Result<(), AppError> {
        let toml_string = toml::to_string(self)?;

        let mut file = File::create(config_path)?;
        file.write_all(toml_string.as_bytes())?;

        Ok(())
    }

    pub fn get_log_level(&self) -> LevelFilter {
        match self.misc.log_level.to_lowercase().as_str() {
            "off" => LevelFilter::OFF,
            "error" => LevelFilter::ERROR,
            "warn" => LevelFilter::WARN,
            "info" => LevelFilter::INFO,
            "debug" => LevelFilter::DEBUG,
            "trace" => LevelFilter::TRACE,
            _ => LevelFilter::INFO,
        }
    }
}
