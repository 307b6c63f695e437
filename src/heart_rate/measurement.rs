use super::HeartRateMeasurement;
use crate::errors::AppError;

const FLAG_HR_IS_U16: u8 = 1 << 0;
//const FLAG_SENSOR_CONTACT: u8 = 1 << 1;
//const FLAG_SENSOR_CONTACT_SUPPORTED: u8 = 1 << 2;
const FLAG_ENERGY_EXPENDED: u8 = 1 << 3;

/// RR intervals are reported in 1/1024ths of a second
const RR_UNITS_PER_SECOND: f32 = 1024.0;

/// Decodes a Heart Rate Measurement (0x2A37) payload.
///
/// Everything after the heart rate (and the energy expended field, when
/// flagged) is read as little-endian RR intervals. A dangling odd byte is
/// ignored.
pub fn parse_hrm(data: &[u8]) -> Result<HeartRateMeasurement, AppError> {
    let flags = *data.first().ok_or(AppError::MalformedPayload {
        expected: 2,
        actual: 0,
    })?;

    let hr_is_u16 = flags & FLAG_HR_IS_U16 != 0;
    let energy_expended = flags & FLAG_ENERGY_EXPENDED != 0;

    let hr_end = if hr_is_u16 { 3 } else { 2 };
    let rr_offset = hr_end + if energy_expended { 2 } else { 0 };

    if data.len() < rr_offset {
        return Err(AppError::MalformedPayload {
            expected: rr_offset,
            actual: data.len(),
        });
    }

    let heart_rate = if hr_is_u16 {
        u16::from_le_bytes([data[1], data[2]])
    } else {
        data[1] as u16
    };

    let rr_intervals = data[rr_offset..]
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]) as f32 / RR_UNITS_PER_SECOND)
        .collect();

    Ok(HeartRateMeasurement {
        heart_rate,
        rr_intervals,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eight_bit_heart_rate() {
        for value in [0u8, 1, 72, 180, 255] {
            let hrm = parse_hrm(&[0x00, value]).unwrap();
            assert_eq!(hrm.heart_rate, value as u16);
            assert!(hrm.rr_intervals.is_empty());
        }
    }

    #[test]
    fn sixteen_bit_heart_rate_is_little_endian() {
        let hrm = parse_hrm(&[0x01, 0x2C, 0x01]).unwrap();
        assert_eq!(hrm.heart_rate, 300);
        assert!(hrm.rr_intervals.is_empty());
    }

    #[test]
    fn rr_intervals_follow_heart_rate() {
        // 0x10 is the "RR present" flag, which doesn't change the layout
        let hrm = parse_hrm(&[0x10, 60, 0x00, 0x04, 0x00, 0x02]).unwrap();
        assert_eq!(hrm.heart_rate, 60);
        assert_eq!(hrm.rr_intervals, vec![1.0, 0.5]);
    }

    #[test]
    fn energy_expended_is_skipped() {
        let hrm = parse_hrm(&[0x18, 80, 0xFF, 0xFF, 0x00, 0x04]).unwrap();
        assert_eq!(hrm.heart_rate, 80);
        assert_eq!(hrm.rr_intervals, vec![1.0]);

        let hrm = parse_hrm(&[0x09, 0x50, 0x00, 0x12, 0x34]).unwrap();
        assert_eq!(hrm.heart_rate, 80);
        assert!(hrm.rr_intervals.is_empty());
    }

    #[test]
    fn dangling_byte_is_ignored() {
        let hrm = parse_hrm(&[0x00, 70, 0x00, 0x04, 0x7F]).unwrap();
        assert_eq!(hrm.rr_intervals, vec![1.0]);
    }

    #[test]
    fn short_payloads_are_malformed() {
        let cases: [(&[u8], usize); 5] = [
            (&[], 2),
            (&[0x00], 2),
            (&[0x01, 0x48], 3),
            (&[0x08, 0x48, 0x00], 4),
            (&[0x09, 0x48, 0x00, 0x00], 5),
        ];
        for (payload, needed) in cases {
            match parse_hrm(payload) {
                Err(AppError::MalformedPayload { expected, actual }) => {
                    assert_eq!(expected, needed, "payload {payload:?}");
                    assert_eq!(actual, payload.len());
                }
                other => panic!("expected MalformedPayload for {payload:?}, got {other:?}"),
            }
        }
    }
}
