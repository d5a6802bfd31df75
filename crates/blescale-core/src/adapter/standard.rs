//! Bluetooth SIG Weight Scale profile.
//!
//! Weights arrive in whatever unit the scale is set to; this adapter reports
//! that unit and leaves conversion to the extraction layer.

use blescale_types::uuids::{WEIGHT_MEASUREMENT, WEIGHT_SCALE_SERVICE};
use blescale_types::{DeviceInfo, Reading, WeightMeasurement, WeightUnit};
use tracing::debug;
use uuid::Uuid;

use super::{GattProfile, ScaleAdapter, plausible};

/// Generic Weight Scale service (`0x181D` / `0x2A9D`).
#[derive(Debug, Default)]
pub struct StandardWeight {
    unit: WeightUnit,
}

impl ScaleAdapter for StandardWeight {
    fn name(&self) -> &'static str {
        "standard-weight"
    }

    fn matches(&self, info: &DeviceInfo) -> bool {
        info.has_service(&WEIGHT_SCALE_SERVICE)
    }

    fn gatt(&self) -> Option<GattProfile> {
        Some(GattProfile::notify_only(WEIGHT_MEASUREMENT))
    }

    fn parse_notification(&mut self, _characteristic: Uuid, frame: &[u8]) -> Option<Reading> {
        let measurement = match WeightMeasurement::from_bytes(frame) {
            Ok(m) => m,
            Err(e) => {
                debug!("Ignoring weight measurement frame: {}", e);
                return None;
            }
        };
        if !plausible(measurement.unit.to_kg(measurement.weight)) {
            return None;
        }
        self.unit = measurement.unit;
        Some(Reading::weight_only(measurement.weight))
    }

    fn is_complete(&self, _reading: &Reading) -> bool {
        true
    }

    fn normalizes_weight(&self) -> bool {
        false
    }

    fn unit(&self) -> WeightUnit {
        self.unit
    }

    fn reset(&mut self) {
        self.unit = WeightUnit::Kg;
    }
}
