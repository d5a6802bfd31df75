//! Yunmai family (GATT).
//!
//! Frames start with `0x0D`. Byte 3 is `0x01` for a live weight and `0x02`
//! for the final result; weight is u32 BE at 13-16 in hundredths of a
//! kilogram, and result frames add resistance as u16 BE at 17-18.

use blescale_types::uuids::{YUNMAI_NOTIFY, YUNMAI_WRITE};
use blescale_types::{DeviceInfo, Reading};
use uuid::Uuid;

use super::{GattProfile, ScaleAdapter, plausible};

const FRAME_START: u8 = 0x0D;
const KIND_LIVE: u8 = 0x01;
const KIND_RESULT: u8 = 0x02;

/// Yunmai smart scale.
#[derive(Debug, Default)]
pub struct Yunmai {
    final_received: bool,
}

fn weight_at(frame: &[u8]) -> Option<f64> {
    let raw = u32::from_be_bytes([frame[13], frame[14], frame[15], frame[16]]);
    let kg = f64::from(raw) / 100.0;
    plausible(kg).then_some(kg)
}

impl ScaleAdapter for Yunmai {
    fn name(&self) -> &'static str {
        "yunmai"
    }

    fn matches(&self, info: &DeviceInfo) -> bool {
        info.name_starts_with(&["YUNMAI", "YMBS"])
    }

    fn gatt(&self) -> Option<GattProfile> {
        Some(GattProfile {
            write: Some(YUNMAI_WRITE),
            ..GattProfile::notify_only(YUNMAI_NOTIFY)
        })
    }

    fn parse_notification(&mut self, _characteristic: Uuid, frame: &[u8]) -> Option<Reading> {
        if frame.len() < 17 || frame[0] != FRAME_START {
            return None;
        }

        match frame[3] {
            KIND_LIVE => {
                self.final_received = false;
                weight_at(frame).map(Reading::weight_only)
            }
            KIND_RESULT if frame.len() >= 19 => {
                let weight = weight_at(frame)?;
                let resistance = u16::from_be_bytes([frame[17], frame[18]]);
                self.final_received = true;
                Some(Reading::new(weight, u32::from(resistance)))
            }
            _ => None,
        }
    }

    fn is_complete(&self, _reading: &Reading) -> bool {
        self.final_received
    }

    fn reset(&mut self) {
        self.final_received = false;
    }
}
