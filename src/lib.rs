#![deny(unused_must_use)]

use std::path::PathBuf;
use std::sync::Arc;

use args::{SubCommands, TopLevelCmd};
use errors::AppError;
use settings::Settings;
use state::State;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use rolling_file::{BasicRollingFileAppender, RollingConditionBasic};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{filter, prelude::*};
use tracing_subscriber::fmt::time::ChronoLocal;

#[cfg(not(any(debug_assertions, feature = "portable")))]
use directories::BaseDirs;

pub mod announce;
pub mod args;
pub mod ble;
pub mod conflated;
pub mod control;
pub mod errors;
pub mod heart_rate;
pub mod platform;
pub mod settings;
pub mod state;
pub mod worker;

use announce::voice::{announcer_from_settings, AlwaysFocused};
use announce::AnnouncementThrottler;
use ble::hardware::BtleplugBackend;
use ble::simulated::SimulatedBackend;
use heart_rate::dummy::dummy_thread;
use platform::{GrantedPermission, LoggingKeepAlive};
use worker::{Collaborators, Worker, WorkerOptions};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Moves into the working directory and returns the config file path to use.
pub fn prepare_environment(arg_config: &TopLevelCmd) -> Result<PathBuf, AppError> {
    // Resolve before changing directory
    let config_override = arg_config
        .config_override
        .as_ref()
        .map(|p| std::path::absolute(p))
        .transpose()?;

    let working_directory = determine_working_directory()?;
    if !working_directory.exists() {
        std::fs::create_dir_all(&working_directory).map_err(|e| AppError::CreateDir {
            path: working_directory.clone(),
            source: e,
        })?;
    }
    std::env::set_current_dir(&working_directory)?;

    match config_override {
        Some(path) => Ok(path),
        None => {
            let config_name = std::env::current_exe()?
                .with_extension("toml")
                .file_name()
                .ok_or(AppError::WorkDir)?
                .to_owned();
            Ok(working_directory.join(config_name))
        }
    }
}

/// Installs the global subscriber. Keep the returned guard alive, file logs
/// are flushed when it drops.
pub fn init_logging(settings: &Settings) -> Result<Option<WorkerGuard>, AppError> {
    let level = settings.get_log_level();

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_timer(ChronoLocal::new(TIME_FORMAT.to_owned()))
        .with_filter(level);

    let (file_layer, guard) = if settings.misc.log_to_file {
        let log_name = std::env::current_exe()?
            .with_extension("log")
            .file_name()
            .ok_or(AppError::WorkDir)?
            .to_owned();
        let file_appender = BasicRollingFileAppender::new(
            log_name,
            RollingConditionBasic::new().max_size(1024 * 1024 * 5),
            2,
        )?;
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_file(false)
            .with_ansi(false)
            .with_target(true)
            .with_timer(ChronoLocal::new(TIME_FORMAT.to_owned()))
            .with_line_number(true)
            .with_filter(level);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    // bluez chatters a lot at debug
    let env_filter = filter::EnvFilter::new("trace,bluez_async=info,dbus=info");
    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();

    Ok(guard)
}

pub async fn run_headless(
    arg_config: TopLevelCmd,
    mut settings: Settings,
    parent_token: CancellationToken,
) -> Result<(), AppError> {
    info!("Starting app... v{}", env!("CARGO_PKG_VERSION"));
    if arg_config.no_assist {
        settings.announce.assist_on_start = false;
    }

    let permission = Arc::new(GrantedPermission::default());
    let keep_alive = Arc::new(LoggingKeepAlive::default());
    let (collaborators, simulation) = match arg_config.subcommands {
        Some(SubCommands::Dummy(_)) => {
            info!("Using a simulated heart rate monitor");
            let sim = SimulatedBackend::new();
            let collaborators = Collaborators::simulated(&sim, permission, keep_alive);
            (collaborators, Some(sim))
        }
        Some(SubCommands::Ble(_)) | None => {
            let backend = Arc::new(BtleplugBackend::new().await?);
            let collaborators = Collaborators::from_backend(backend, permission, keep_alive);
            (collaborators, None)
        }
    };

    let (announce_tx, announce_rx) = conflated::channel();
    let (worker, handle) = Worker::build(
        collaborators,
        WorkerOptions::from_settings(&settings),
        announce_tx,
    );
    let throttler = AnnouncementThrottler::new(
        &settings.announce,
        Arc::new(AlwaysFocused),
        announcer_from_settings(&settings.announce),
    );

    // The console shows every state, so it stays subscribed until shutdown
    let console = handle.subscribe("console");

    let worker_thread = async {
        worker.run(parent_token.clone()).await;
        parent_token.cancel();
    };
    let dummy = async {
        if let Some(sim) = simulation {
            dummy_thread(sim, settings.dummy.clone(), parent_token.clone()).await;
        }
    };
    tokio::join!(
        worker_thread,
        throttler.run(announce_rx, parent_token.clone()),
        console_thread(handle.observe_state(), parent_token.clone()),
        dummy,
    );

    drop(console);
    handle.stop(true);

    if handle.current_state() == Some(State::NoBluetooth) {
        return Err(AppError::NoAdapter);
    }
    info!("Shutting down gracefully...");
    Ok(())
}

async fn console_thread(mut states: watch::Receiver<Option<State>>, cancel_token: CancellationToken) {
    loop {
        tokio::select! {
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = states.borrow_and_update().clone();
                match state {
                    Some(State::NoBluetooth) => warn!("{}", State::NoBluetooth),
                    Some(state) => info!("{state}"),
                    None => {}
                }
            }
            _ = cancel_token.cancelled() => {
                info!("Shutting down console thread!");
                break;
            }
        }
    }
}

/// Returns the directory that logs, config, and other files should be placed in by default.
// If the app is built with the portable feature, it will just return it's parent directory.
// If there is a config file present adjacent to the executable, the executable's parent path is returned.
// Otherwise, it will return the `directories` `config_dir` output.
//
// Debug builds are always portable. Release builds can optionally have the "portable" feature enabled.
fn determine_working_directory() -> Result<PathBuf, AppError> {
    let portable = is_portable();
    let exe_path = std::env::current_exe()?;
    let exe_parent = exe_path.parent().ok_or(AppError::WorkDir)?.to_path_buf();
    let config_path = exe_path.with_extension("toml");

    if portable || config_path.exists() {
        Ok(exe_parent)
    } else {
        get_user_dir().ok_or(AppError::WorkDir)
    }
}

#[cfg(any(debug_assertions, feature = "portable"))]
fn is_portable() -> bool {
    true
}

#[cfg(not(any(debug_assertions, feature = "portable")))]
fn is_portable() -> bool {
    false
}

#[cfg(any(debug_assertions, feature = "portable"))]
fn get_user_dir() -> Option<PathBuf> {
    None
}

#[cfg(not(any(debug_assertions, feature = "portable")))]
fn get_user_dir() -> Option<PathBuf> {
    if let Some(base_dirs) = BaseDirs::new() {
        let mut config_dir = base_dirs.config_dir().to_owned();
        config_dir.push(env!("CARGO_PKG_NAME"));
        Some(config_dir)
    } else {
        None
    }
}
