use std::fmt;

use tokio::time::Instant;

/// What the session is doing, as shown to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State {
    /// No adapter on this machine. Terminal.
    NoBluetooth,
    AdapterOff,
    NoPermission,
    Scanning,
    Monitoring {
        beat: u16,
        device_name: String,
    },
    Assisting {
        beat: u16,
        device_name: String,
        assist_start_time: Instant,
    },
}

impl State {
    pub fn beat(&self) -> Option<u16> {
        match self {
            State::Monitoring { beat, .. } | State::Assisting { beat, .. } => Some(*beat),
            _ => None,
        }
    }

    pub fn device_name(&self) -> Option<&str> {
        match self {
            State::Monitoring { device_name, .. } | State::Assisting { device_name, .. } => {
                Some(device_name)
            }
            _ => None,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::NoBluetooth => write!(f, "This device has no Bluetooth adapter"),
            State::AdapterOff => write!(f, "Bluetooth is turned off"),
            State::NoPermission => write!(f, "Waiting for Bluetooth permission"),
            State::Scanning => write!(f, "Looking for a heart rate monitor..."),
            State::Monitoring { beat, device_name } => {
                write!(f, "{device_name}: {}.{} beats per 6 seconds", beat / 10, beat % 10)
            }
            State::Assisting {
                beat,
                device_name,
                assist_start_time,
            } => write!(
                f,
                "{device_name}: {}.{} beats per 6 seconds (assisting for {}s)",
                beat / 10,
                beat % 10,
                assist_start_time.elapsed().as_secs()
            ),
        }
    }
}
