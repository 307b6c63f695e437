use argh::FromArgs;
use std::path::PathBuf;

#[derive(FromArgs, Debug, Default)]
/// Monitors a BLE heart rate sensor and announces the rate out loud
pub struct TopLevelCmd {
    /// specify config file path, creates file if it doesn't exist
    #[argh(option, short = 'c')]
    pub config_override: Option<PathBuf>,
    /// config file must exist, including "config_override" files
    #[argh(switch, short = 'r')]
    pub config_required: bool,
    /// use config file as-is (don't save over it)
    #[argh(switch, short = 'n')]
    pub no_save: bool,
    /// start with announcements off, regardless of config
    #[argh(switch)]
    pub no_assist: bool,
    #[argh(subcommand)]
    pub subcommands: Option<SubCommands>,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand)]
pub enum SubCommands {
    Ble(BleCmd),
    Dummy(DummyCmd),
}

/// connect to a BLE device with the HR Measure characteristic (default)
#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "ble")]
pub struct BleCmd {}

/// run against a simulated heart rate monitor
#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "dummy")]
pub struct DummyCmd {}
