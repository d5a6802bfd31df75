//! QN / Renpho family (GATT).
//!
//! The scale stays silent until it receives the unlock command, and goes back
//! to sleep unless the command is repeated, so it is written every 2 seconds
//! until the measurement completes.
//!
//! Frames on the notify characteristic:
//!
//! - `0x12`: configuration; byte 10 selects the weight divisor (`1` → 100, else 10).
//! - `0x10`: measurement; weight u16 BE at 3-4, byte 5 `1` = stable,
//!   impedance u16 BE at 8-9 (`0` while still measuring).

use std::time::Duration;

use blescale_types::uuids::{
    QN_ALT_NOTIFY, QN_ALT_SERVICE, QN_ALT_WRITE, QN_NOTIFY, QN_SERVICE, QN_WRITE,
};
use blescale_types::{DeviceInfo, Reading};
use tracing::trace;
use uuid::Uuid;

use super::{GattProfile, ScaleAdapter, plausible};

/// Unlock command with kilograms selected; last byte is the checksum.
pub const UNLOCK_COMMAND: [u8; 9] = [0x13, 0x09, 0x15, 0x01, 0x10, 0x00, 0x00, 0x00, 0x42];

const FRAME_CONFIG: u8 = 0x12;
const FRAME_MEASUREMENT: u8 = 0x10;

/// QN / Renpho smart scale.
#[derive(Debug)]
pub struct QnScale {
    divisor: f64,
    stable: bool,
}

impl Default for QnScale {
    fn default() -> Self {
        Self {
            divisor: 100.0,
            stable: false,
        }
    }
}

impl QnScale {
    fn scale_weight(&self, raw: u16) -> Option<f64> {
        let raw = f64::from(raw);
        let weight = raw / self.divisor;
        if plausible(weight) {
            return Some(weight);
        }

        let alternate = if self.divisor == 100.0 { 10.0 } else { 100.0 };
        let rescaled = raw / alternate;
        if plausible(rescaled) {
            trace!(raw, divisor = alternate, "Rescaled QN weight with alternate divisor");
            Some(rescaled)
        } else {
            None
        }
    }
}

impl ScaleAdapter for QnScale {
    fn name(&self) -> &'static str {
        "qn-scale"
    }

    fn matches(&self, info: &DeviceInfo) -> bool {
        if info.name_starts_with(&["YUNMAI", "YMBS"]) {
            return false;
        }
        info.name_starts_with(&["QN-", "Renpho", "R-A"])
            || info.has_service(&QN_ALT_SERVICE)
            || info.has_service(&QN_SERVICE)
    }

    fn gatt(&self) -> Option<GattProfile> {
        Some(GattProfile {
            notify: QN_NOTIFY,
            alt_notify: Some(QN_ALT_NOTIFY),
            write: Some(QN_WRITE),
            alt_write: Some(QN_ALT_WRITE),
            unlock: Some(UNLOCK_COMMAND.to_vec()),
            unlock_interval: Some(Duration::from_secs(2)),
            write_with_response: true,
        })
    }

    fn parse_notification(&mut self, _characteristic: Uuid, frame: &[u8]) -> Option<Reading> {
        match frame.first().copied() {
            Some(FRAME_CONFIG) if frame.len() >= 11 => {
                self.divisor = if frame[10] == 1 { 100.0 } else { 10.0 };
                None
            }
            Some(FRAME_MEASUREMENT) if frame.len() >= 10 => {
                let raw = u16::from_be_bytes([frame[3], frame[4]]);
                let weight = self.scale_weight(raw)?;
                let impedance = u16::from_be_bytes([frame[8], frame[9]]);
                self.stable = frame[5] == 1;
                Some(Reading::new(weight, u32::from(impedance)))
            }
            _ => None,
        }
    }

    fn is_complete(&self, reading: &Reading) -> bool {
        self.stable && reading.weight > 0.0
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}
