//! Xiaomi Mi Smart Scale (v1, broadcast only).
//!
//! Service data on `0x181D`, 10 bytes: control byte 0 (`0x01` pounds,
//! `0x10` jin, `0x20` stabilized, `0x80` load removed), weight u16 LE at 1-2,
//! then a timestamp.

use blescale_types::uuids::WEIGHT_SCALE_SERVICE;
use blescale_types::{DeviceInfo, Reading, WeightUnit};

use super::{ScaleAdapter, plausible};

const FRAME_LEN: usize = 10;

/// Xiaomi Mi Smart Scale v1.
#[derive(Debug, Default)]
pub struct MiScale;

impl ScaleAdapter for MiScale {
    fn name(&self) -> &'static str {
        "mi-scale"
    }

    fn matches(&self, info: &DeviceInfo) -> bool {
        info.service_data_for(&WEIGHT_SCALE_SERVICE)
            .is_some_and(|d| d.len() >= FRAME_LEN)
            || info.name_starts_with(&["MI_SCALE", "MI SCALE2"])
    }

    fn parse_broadcast(&self, info: &DeviceInfo) -> Option<Reading> {
        let data = info.service_data_for(&WEIGHT_SCALE_SERVICE)?;
        if data.len() < FRAME_LEN {
            return None;
        }

        let control = data[0];
        if control & 0x20 == 0 || control & 0x80 != 0 {
            return None;
        }

        let raw = f64::from(u16::from_le_bytes([data[1], data[2]]));
        let kg = if control & 0x01 != 0 {
            WeightUnit::Lb.to_kg(raw / 100.0)
        } else if control & 0x10 != 0 {
            WeightUnit::Jin.to_kg(raw / 100.0)
        } else {
            raw / 200.0
        };

        plausible(kg).then(|| Reading::weight_only(kg))
    }

    fn is_complete(&self, _reading: &Reading) -> bool {
        true
    }
}
