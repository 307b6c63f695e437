pub mod dummy;
pub mod measurement;

use std::time::Duration;

use uuid::Uuid;

use crate::ble::CharacteristicId;

pub const HEART_RATE_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000180d_0000_1000_8000_00805f9b34fb);
pub const HEART_RATE_MEASUREMENT_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x00002a37_0000_1000_8000_00805f9b34fb);

pub const HEART_RATE_MEASUREMENT: CharacteristicId = CharacteristicId::new(
    HEART_RATE_SERVICE_UUID,
    HEART_RATE_MEASUREMENT_CHARACTERISTIC_UUID,
);

/// A single decoded Heart Rate Measurement notification.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeartRateMeasurement {
    pub heart_rate: u16,
    /// Seconds between beats, oldest first
    pub rr_intervals: Vec<f32>,
}

// Used by the dummy sensor, which has no real beats to time
pub fn rr_from_bpm(bpm: u16) -> Duration {
    // Make sure it's at least 1 to prevent a potential divide by zero
    let bpm = bpm.max(1);
    Duration::from_secs_f32(60.0 / bpm as f32)
}
