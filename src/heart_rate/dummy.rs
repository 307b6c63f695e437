use super::{rr_from_bpm, HEART_RATE_SERVICE_UUID};
use crate::ble::simulated::SimulatedBackend;
use crate::ble::DeviceInfo;
use crate::settings::DummySettings;

use std::time::Duration;
use tracing::{info, warn};

use tokio::time;
use tokio_util::sync::CancellationToken;

pub const DUMMY_DEVICE_ID: &str = "00:00:00:00:00:00";

pub fn dummy_device() -> DeviceInfo {
    DeviceInfo::new(
        DUMMY_DEVICE_ID,
        Some("Dummy HRM"),
        vec![HEART_RATE_SERVICE_UUID],
    )
}

/// Builds a Heart Rate Measurement payload with a single RR interval.
pub fn encode_hrm(bpm: u16) -> Vec<u8> {
    let rr = (rr_from_bpm(bpm).as_secs_f32() * 1024.0) as u16;
    let [rr_lo, rr_hi] = rr.to_le_bytes();
    match u8::try_from(bpm) {
        Ok(bpm) => vec![0x10, bpm, rr_lo, rr_hi],
        Err(_) => {
            let [lo, hi] = bpm.to_le_bytes();
            vec![0x11, lo, hi, rr_lo, rr_hi]
        }
    }
}

/// Walks back and forth between two bounds, one beat per step.
#[derive(Debug)]
struct Sweep {
    low: u16,
    high: u16,
    heart_rate: u16,
    rising: bool,
}

impl Sweep {
    fn new(a: u16, b: u16) -> Self {
        let (low, high) = (a.min(b), a.max(b));
        Self {
            low,
            high,
            heart_rate: low.saturating_sub(1),
            rising: true,
        }
    }

    /// Returns the next rate, and whether it turned around at a bound.
    fn step(&mut self) -> (u16, bool) {
        let turned = if self.rising {
            self.heart_rate = self.heart_rate.saturating_add(1);
            self.heart_rate >= self.high
        } else {
            self.heart_rate = self.heart_rate.saturating_sub(1);
            self.heart_rate <= self.low
        };
        if turned {
            self.rising = !self.rising;
        }
        (self.heart_rate, turned)
    }
}

/// Plays a heart rate monitor on the simulated adapter: sweeps between the
/// configured bounds, and every `loops_before_dc` sweeps goes out of range
/// for one sweep.
pub async fn dummy_thread(
    sim: SimulatedBackend,
    dummy_settings: DummySettings,
    cancel_token: CancellationToken,
) {
    let bpm_update_per_sec = Duration::from_secs_f32(1.0 / dummy_settings.bpm_speed.max(0.01));
    let mut bpm_update_interval = time::interval(bpm_update_per_sec);
    let mut sweep = Sweep::new(dummy_settings.low_bpm, dummy_settings.high_bpm);
    let loops_before_dc = dummy_settings.loops_before_dc;

    let mut loops: u16 = 0;
    let mut out_of_range = false;

    sim.advertise(dummy_device());
    info!("Dummy HRM advertising");

    loop {
        tokio::select! {
            _ = bpm_update_interval.tick() => {
                let (heart_rate, turned) = sweep.step();
                if turned {
                    loops += 1;
                    if loops > loops_before_dc {
                        loops = 0;
                    }
                }
                let lost = loops == loops_before_dc && loops_before_dc != 0;
                if lost != out_of_range {
                    out_of_range = lost;
                    if lost {
                        warn!("Simulating lost connection");
                        sim.stop_advertising(DUMMY_DEVICE_ID);
                        sim.disconnect();
                    } else {
                        info!("Dummy HRM back in range");
                        sim.advertise(dummy_device());
                    }
                }
                if !lost {
                    sim.notify_heart_rate(&encode_hrm(heart_rate));
                }
            }
            _ = cancel_token.cancelled() => {
                info!("Shutting down Dummy thread!");
                break;
            }
        }
    }
}
