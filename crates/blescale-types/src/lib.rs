//! Platform-agnostic types for BLE smart scales.
//!
//! This crate provides the data model shared by the acquisition engine
//! (blescale-core) and the service binary (blescale-service).
//!
//! # Features
//!
//! - Weight readings and unit conversion
//! - Advertisement-derived device descriptions
//! - User profiles and body-composition results
//! - UUID constants for supported scales
//!
//! # Example
//!
//! ```
//! use blescale_types::{Reading, WeightUnit};
//!
//! let reading = Reading::new(154.0, 0).normalized_from(WeightUnit::Lb);
//! assert!((reading.weight - 69.85).abs() < 0.01);
//! ```

pub mod error;
pub mod types;
pub mod uuid;

pub use error::{ParseError, ParseResult};
pub use types::{
    BodyComposition, DeviceInfo, Gender, ManufacturerData, Reading, UserProfile,
    WeightMeasurement, WeightUnit,
};
pub use self::uuid as uuids;

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn weight_measurement_never_panics(data in proptest::collection::vec(any::<u8>(), 0..32)) {
            let _ = WeightMeasurement::from_bytes(&data);
        }

        #[test]
        fn unit_conversion_inverts(kg in 0.0f64..500.0) {
            for unit in [WeightUnit::Kg, WeightUnit::Lb, WeightUnit::Jin, WeightUnit::St] {
                let back = unit.to_kg(unit.from_kg(kg));
                prop_assert!((back - kg).abs() < 1e-9);
            }
        }

        #[test]
        fn uuid_normalize_accepts_own_wire_form(short in any::<u16>()) {
            let uuid = uuids::from_short(short);
            prop_assert_eq!(uuids::normalize(&uuids::to_wire(&uuid)), Some(uuid));
            prop_assert_eq!(uuids::normalize(&format!("{short:04x}")), Some(uuid));
        }
    }
}
