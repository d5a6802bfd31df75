//! ES-CS20M (GATT, start/data/stop protocol).
//!
//! - `0x11` control frame: byte 5 `0x01` starts a measurement, `0x00` stops it.
//! - `0x14` weight frame: u16 BE at 8-9, hundredths of a kilogram.
//! - `0x15` impedance frame: u16 BE at 9-10.
//!
//! A measurement completes on the stop frame, provided a weight frame came
//! before it.

use bytes::Buf;

use blescale_types::uuids::{ESCS20M_NOTIFY, ESCS20M_SERVICE, ESCS20M_WRITE};
use blescale_types::{DeviceInfo, Reading};
use uuid::Uuid;

use super::{GattProfile, ScaleAdapter, plausible};

/// Start command, written once after subscribing.
pub const START_COMMAND: [u8; 10] = [0x55, 0xAA, 0x90, 0x00, 0x04, 0x01, 0x00, 0x00, 0x00, 0x94];

const FRAME_CONTROL: u8 = 0x11;
const FRAME_WEIGHT: u8 = 0x14;
const FRAME_IMPEDANCE: u8 = 0x15;

/// ES-CS20M scale.
#[derive(Debug, Default)]
pub struct EsCs20m {
    weight: Option<f64>,
    impedance: u32,
    stopped: bool,
}

impl EsCs20m {
    fn current(&self) -> Option<Reading> {
        self.weight.map(|w| Reading::new(w, self.impedance))
    }
}

impl ScaleAdapter for EsCs20m {
    fn name(&self) -> &'static str {
        "es-cs20m"
    }

    fn matches(&self, info: &DeviceInfo) -> bool {
        info.name_starts_with(&["ES-CS20M"]) || info.has_service(&ESCS20M_SERVICE)
    }

    fn gatt(&self) -> Option<GattProfile> {
        Some(GattProfile {
            write: Some(ESCS20M_WRITE),
            unlock: Some(START_COMMAND.to_vec()),
            ..GattProfile::notify_only(ESCS20M_NOTIFY)
        })
    }

    fn parse_notification(&mut self, _characteristic: Uuid, frame: &[u8]) -> Option<Reading> {
        match frame.first().copied() {
            Some(FRAME_CONTROL) if frame.len() >= 6 => match frame[5] {
                0x01 => {
                    self.reset();
                    None
                }
                0x00 => {
                    self.stopped = true;
                    self.current()
                }
                _ => None,
            },
            Some(FRAME_WEIGHT) if frame.len() >= 10 => {
                let mut buf = &frame[8..];
                let kg = f64::from(buf.get_u16()) / 100.0;
                if !plausible(kg) {
                    return None;
                }
                self.weight = Some(kg);
                self.current()
            }
            Some(FRAME_IMPEDANCE) if frame.len() >= 11 => {
                let mut buf = &frame[9..];
                self.impedance = u32::from(buf.get_u16());
                self.current()
            }
            _ => None,
        }
    }

    fn is_complete(&self, _reading: &Reading) -> bool {
        self.stopped && self.weight.is_some()
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}
