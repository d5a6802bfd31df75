//! Xiaomi Mi Body Composition Scale 2 (broadcast only).
//!
//! Service data on `0x181B`, 13 bytes:
//!
//! | Bytes | Field |
//! |-------|-------|
//! | 0 | control: bit 0 = pounds |
//! | 1 | control: `0x02` impedance present, `0x20` stabilized, `0x40` jin, `0x80` load removed |
//! | 2-8 | timestamp (ignored) |
//! | 9-10 | impedance, u16 LE |
//! | 11-12 | weight, u16 LE |

use bytes::Buf;

use blescale_types::uuids::BODY_COMPOSITION_SERVICE;
use blescale_types::{DeviceInfo, Reading, WeightUnit};

use super::{ScaleAdapter, plausible};

const FRAME_LEN: usize = 13;
const IMPEDANCE_PRESENT: u8 = 0x02;
const STABILIZED: u8 = 0x20;
const JIN: u8 = 0x40;
const LOAD_REMOVED: u8 = 0x80;
const MAX_IMPEDANCE: u16 = 3000;

/// Xiaomi Mi Body Composition Scale 2.
#[derive(Debug, Default)]
pub struct MiScale2;

impl ScaleAdapter for MiScale2 {
    fn name(&self) -> &'static str {
        "mi-scale-2"
    }

    fn matches(&self, info: &DeviceInfo) -> bool {
        info.service_data_for(&BODY_COMPOSITION_SERVICE).is_some()
            || info.name_starts_with(&["MIBFS"])
    }

    fn parse_broadcast(&self, info: &DeviceInfo) -> Option<Reading> {
        decode(info.service_data_for(&BODY_COMPOSITION_SERVICE)?)
    }

    fn is_complete(&self, _reading: &Reading) -> bool {
        true
    }
}

fn decode(data: &[u8]) -> Option<Reading> {
    if data.len() < FRAME_LEN {
        return None;
    }

    let control0 = data[0];
    let control1 = data[1];
    if control1 & STABILIZED == 0 || control1 & LOAD_REMOVED != 0 {
        return None;
    }

    let mut buf = &data[9..];
    let impedance = buf.get_u16_le();
    let raw = f64::from(buf.get_u16_le());

    let unit = if control0 & 0x01 != 0 {
        WeightUnit::Lb
    } else if control1 & JIN != 0 {
        WeightUnit::Jin
    } else {
        WeightUnit::Kg
    };
    let value = if unit == WeightUnit::Kg {
        raw / 200.0
    } else {
        raw / 100.0
    };
    let kg = unit.to_kg(value);
    if !plausible(kg) {
        return None;
    }

    let impedance = if control1 & IMPEDANCE_PRESENT != 0 && impedance > 0 && impedance < MAX_IMPEDANCE
    {
        u32::from(impedance)
    } else {
        0
    };

    Some(Reading::new(kg, impedance))
}

#[cfg(test)]
mod tests {
    use super::*;

    // 75.50 kg (15100 = 0x3AFC), impedance 500 (0x01F4)
    const STABLE: [u8; 13] = [
        0x02, 0x26, 0xE8, 0x07, 0x06, 0x0F, 0x08, 0x1E, 0x00, 0xF4, 0x01, 0xFC, 0x3A,
    ];

    fn info(frame: &[u8]) -> DeviceInfo {
        DeviceInfo::new()
            .with_name("MIBFS")
            .with_service_data(BODY_COMPOSITION_SERVICE, frame.to_vec())
    }

    #[test]
    fn test_stable_frame_with_impedance() {
        let reading = MiScale2.parse_broadcast(&info(&STABLE)).unwrap();
        assert!((reading.weight - 75.5).abs() < 1e-9);
        assert_eq!(reading.impedance, 500);
    }

    #[test]
    fn test_settling_frame_is_ignored() {
        let mut frame = STABLE;
        frame[1] = 0x06;
        assert!(MiScale2.parse_broadcast(&info(&frame)).is_none());
    }

    #[test]
    fn test_removed_frame_is_ignored() {
        let mut frame = STABLE;
        frame[1] |= LOAD_REMOVED;
        assert!(MiScale2.parse_broadcast(&info(&frame)).is_none());
    }

    #[test]
    fn test_impedance_flag_clear() {
        let mut frame = STABLE;
        frame[1] = 0x24;
        let reading = MiScale2.parse_broadcast(&info(&frame)).unwrap();
        assert_eq!(reading.impedance, 0);
    }

    #[test]
    fn test_pound_frame_is_normalized() {
        // 166.45 lb (16645 = 0x4105)
        let mut frame = STABLE;
        frame[0] = 0x03;
        frame[11] = 0x05;
        frame[12] = 0x41;
        let reading = MiScale2.parse_broadcast(&info(&frame)).unwrap();
        assert!((reading.weight - 75.501).abs() < 0.01);
    }

    #[test]
    fn test_short_frame() {
        assert!(MiScale2.parse_broadcast(&info(&STABLE[..12])).is_none());
    }

    #[test]
    fn test_matches_without_service_data() {
        assert!(MiScale2.matches(&DeviceInfo::new().with_name("MIBFS")));
        assert!(!MiScale2.matches(&DeviceInfo::new().with_name("MI_SCALE")));
    }
}
