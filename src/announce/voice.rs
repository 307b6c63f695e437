use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use super::{Announcer, AudioFocus, DecomposedValue};
use crate::errors::AppError;
use crate::settings::AnnounceSettings;

/// Writes announcements to the log instead of speaking them.
#[derive(Debug, Default)]
pub struct LogAnnouncer;

#[async_trait]
impl Announcer for LogAnnouncer {
    async fn announce(&self, value: DecomposedValue) -> Result<(), AppError> {
        info!("Announcing: {value}");
        Ok(())
    }
}

/// Speaks through an external text-to-speech program, e.g. `espeak`.
/// The phrase is passed as the last argument.
#[derive(Debug, Clone)]
pub struct CommandAnnouncer {
    command: String,
    args: Vec<String>,
}

impl CommandAnnouncer {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }
}

#[async_trait]
impl Announcer for CommandAnnouncer {
    async fn announce(&self, value: DecomposedValue) -> Result<(), AppError> {
        let phrase = value.phrase();
        debug!("Running {} for {phrase:?}", self.command);
        let status = Command::new(&self.command)
            .args(&self.args)
            .arg(&phrase)
            .kill_on_drop(true)
            .status()
            .await?;
        if status.success() {
            Ok(())
        } else {
            Err(AppError::Announcer {
                command: self.command.clone(),
                status,
            })
        }
    }
}

/// Picks the command announcer if one is configured.
pub fn announcer_from_settings(settings: &AnnounceSettings) -> Arc<dyn Announcer> {
    if settings.command.trim().is_empty() {
        info!("No announcement command configured, announcements go to the log");
        Arc::new(LogAnnouncer)
    } else {
        info!("Announcing with \"{}\"", settings.command);
        Arc::new(CommandAnnouncer::new(
            settings.command.trim(),
            settings.command_args.clone(),
        ))
    }
}

/// Desktops have no audio focus arbitration.
#[derive(Debug, Default)]
pub struct AlwaysFocused;

#[async_trait]
impl AudioFocus for AlwaysFocused {
    async fn request_focus(&self) -> bool {
        true
    }

    fn abandon_focus(&self) {}
}
