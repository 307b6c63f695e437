use std::path::PathBuf;
use std::process::ExitStatus;

use thiserror::Error;

/// Represents all possible errors that can occur during the app's lifecycle
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Failed to create directory \"{path}\": {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Error parsing config: {0}")]
    Config(#[from] config::ConfigError),
    #[error("Bluetooth Error: {0}")]
    Bt(#[from] btleplug::Error),
    #[error("TOML Serialization Error: {0}")]
    TomlSer(#[from] toml::ser::Error),
    // My errors
    #[error("Failed to get working directory")]
    WorkDir,
    #[error("Malformed Heart Rate payload: needed {expected} bytes, got {actual}")]
    MalformedPayload { expected: usize, actual: usize },
    #[error("No Bluetooth adapters found! Make sure it's plugged in and enabled.")]
    NoAdapter,
    #[error("Bluetooth adapter is turned off")]
    AdapterOff,
    #[error("Scan result is missing its platform peripheral")]
    MissingPeripheral,
    #[error("Scan is not running")]
    ScanNotRunning,
    #[error("Scan results ended without a match")]
    ScanEnded,
    #[error("Adapter state events closed")]
    AdapterEventsClosed,
    #[error("Device is not connected")]
    NotConnected,
    #[error("Announcer command \"{command}\" failed: {status}")]
    Announcer { command: String, status: ExitStatus },
}
