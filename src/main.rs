use pace_assistant::args::TopLevelCmd;
use pace_assistant::errors::AppError;
use pace_assistant::settings::Settings;
use pace_assistant::{init_logging, prepare_environment, run_headless};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

// Everything that touches session state runs on this one thread
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), AppError> {
    let arg_config: TopLevelCmd = argh::from_env();

    let config_path = prepare_environment(&arg_config)?;
    let settings = Settings::load(&config_path, arg_config.config_required)?;
    if !arg_config.no_save {
        settings.save(&config_path)?;
    }
    let _log_guard = init_logging(&settings)?;
    info!("Loaded config from: {}", config_path.display());

    let parent_token = CancellationToken::new();
    let ctrl_c_token = parent_token.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Couldn't listen for Ctrl-C: {e}");
            return;
        }
        info!("Ctrl-C received, shutting down");
        ctrl_c_token.cancel();
    });

    run_headless(arg_config, settings, parent_token).await
}
