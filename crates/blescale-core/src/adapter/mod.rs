//! Scale adapters: one decoder per BLE scale protocol.
//!
//! An adapter recognizes a device from its advertisement ([`ScaleAdapter::matches`])
//! and turns either the advertisement itself or a stream of GATT notification
//! frames into a [`Reading`]. Adapters carry per-session parser state; the
//! [`AdapterRegistry`] builds a fresh instance for every match, and the
//! extraction layer still calls [`ScaleAdapter::reset`] when a GATT session
//! starts.
//!
//! # Supported scales
//!
//! | Adapter | Path | Completion |
//! |---------|------|------------|
//! | `mi-scale-2` | broadcast (service data `0x181B`) | stabilized flag |
//! | `mi-scale` | broadcast (service data `0x181D`) | stabilized flag |
//! | `qn-scale` | GATT `0xFFE1`/`0xFFF1` | stable flag in weight frame |
//! | `yunmai` | GATT `0xFFE4` | final-result frame |
//! | `es-cs20m` | GATT `0x2A10` | stop frame after a weight frame |
//! | `standard-weight` | GATT `0x2A9D` | every indication |

mod escs20m;
mod mi_scale;
mod mi_scale2;
mod qn;
mod registry;
mod standard;
mod yunmai;

use std::fmt::Debug;
use std::time::Duration;

use blescale_types::{BodyComposition, DeviceInfo, Reading, UserProfile, WeightUnit};
use uuid::Uuid;

pub use escs20m::{EsCs20m, START_COMMAND as ESCS20M_START_COMMAND};
pub use mi_scale::MiScale;
pub use mi_scale2::MiScale2;
pub use qn::{QnScale, UNLOCK_COMMAND as QN_UNLOCK_COMMAND};
pub use registry::{AdapterFactory, AdapterRegistry};
pub use standard::StandardWeight;
pub use yunmai::Yunmai;

/// Lightest plausible reading, kilograms.
pub const MIN_WEIGHT_KG: f64 = 2.0;

/// Heaviest plausible reading, kilograms.
pub const MAX_WEIGHT_KG: f64 = 300.0;

/// Whether a normalized weight lies inside the sanity band.
pub fn plausible(kg: f64) -> bool {
    kg.is_finite() && (MIN_WEIGHT_KG..=MAX_WEIGHT_KG).contains(&kg)
}

/// GATT characteristics and wake-up behavior an adapter needs.
#[derive(Debug, Clone, PartialEq)]
pub struct GattProfile {
    /// Notify characteristic.
    pub notify: Uuid,
    /// Notify characteristic used by a protocol sub-variant.
    pub alt_notify: Option<Uuid>,
    /// Write characteristic paired with `notify`.
    pub write: Option<Uuid>,
    /// Write characteristic paired with `alt_notify`.
    pub alt_write: Option<Uuid>,
    /// Command written once after subscribing.
    pub unlock: Option<Vec<u8>>,
    /// Repeat the unlock command at this interval until completion.
    pub unlock_interval: Option<Duration>,
    /// Whether writes request an acknowledgement.
    pub write_with_response: bool,
}

impl GattProfile {
    /// Profile with only a notify characteristic.
    pub fn notify_only(notify: Uuid) -> Self {
        Self {
            notify,
            alt_notify: None,
            write: None,
            alt_write: None,
            unlock: None,
            unlock_interval: None,
            write_with_response: true,
        }
    }

    /// Every notify characteristic worth looking for, primary first.
    pub fn notify_candidates(&self) -> Vec<Uuid> {
        std::iter::once(self.notify).chain(self.alt_notify).collect()
    }

    /// Pick the notify/write pair the session actually exposes.
    ///
    /// Returns `None` if neither notify characteristic is present.
    pub fn resolve(&self, has: impl Fn(&Uuid) -> bool) -> Option<ResolvedProfile> {
        if has(&self.notify) {
            return Some(ResolvedProfile {
                notify: self.notify,
                write: self.write.filter(|w| has(w)),
            });
        }
        let alt = self.alt_notify.filter(|n| has(n))?;
        Some(ResolvedProfile {
            notify: alt,
            write: self.alt_write.or(self.write).filter(|w| has(w)),
        })
    }
}

/// The characteristics chosen for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedProfile {
    /// Notify characteristic to subscribe to.
    pub notify: Uuid,
    /// Write characteristic for the unlock command, if any.
    pub write: Option<Uuid>,
}

/// Contract every scale protocol decoder implements.
///
/// `matches` must be a pure function of the [`DeviceInfo`] and must tolerate
/// missing fields: the proxied transport rarely knows service UUIDs before
/// connecting, and never fills service data.
pub trait ScaleAdapter: Send + Sync + Debug {
    /// Stable adapter name used in logs and errors.
    fn name(&self) -> &'static str;

    /// Whether this adapter recognizes the device.
    fn matches(&self, info: &DeviceInfo) -> bool;

    /// Decode a complete reading straight from the advertisement.
    ///
    /// Returns `None` when no broadcast payload is present or the scale has
    /// not settled yet.
    fn parse_broadcast(&self, _info: &DeviceInfo) -> Option<Reading> {
        None
    }

    /// Characteristics needed for a GATT session, or `None` for
    /// broadcast-only scales.
    fn gatt(&self) -> Option<GattProfile> {
        None
    }

    /// Feed one notification frame. Returns a reading whenever the frame
    /// carried new measurement data; completion is reported by
    /// [`ScaleAdapter::is_complete`].
    fn parse_notification(&mut self, _characteristic: Uuid, _frame: &[u8]) -> Option<Reading> {
        None
    }

    /// Whether `reading` is the final one for this measurement.
    fn is_complete(&self, reading: &Reading) -> bool;

    /// Whether weights are already in kilograms.
    fn normalizes_weight(&self) -> bool {
        true
    }

    /// Unit of the weights this adapter returns when it does not normalize.
    fn unit(&self) -> WeightUnit {
        WeightUnit::Kg
    }

    /// Forget all per-session parser state.
    fn reset(&mut self) {}

    /// Derive body composition for `reading`.
    fn compute_metrics(&self, reading: &Reading, profile: &UserProfile) -> BodyComposition {
        crate::composition::compute(reading, profile, profile.age())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blescale_types::uuids;
    use proptest::prelude::*;

    #[test]
    fn test_plausible_band() {
        assert!(plausible(2.0));
        assert!(plausible(300.0));
        assert!(!plausible(1.99));
        assert!(!plausible(300.01));
        assert!(!plausible(f64::NAN));
    }

    #[test]
    fn test_resolve_prefers_primary() {
        let profile = QnScale::default().gatt().unwrap();
        let resolved = profile.resolve(|_| true).unwrap();
        assert_eq!(resolved.notify, uuids::QN_NOTIFY);
        assert_eq!(resolved.write, Some(uuids::QN_WRITE));
    }

    #[test]
    fn test_resolve_falls_back_to_alternate_pair() {
        let profile = QnScale::default().gatt().unwrap();
        let present = [uuids::QN_ALT_NOTIFY, uuids::QN_ALT_WRITE];
        let resolved = profile.resolve(|u| present.contains(u)).unwrap();
        assert_eq!(resolved.notify, uuids::QN_ALT_NOTIFY);
        assert_eq!(resolved.write, Some(uuids::QN_ALT_WRITE));
    }

    #[test]
    fn test_resolve_missing_notify() {
        let profile = QnScale::default().gatt().unwrap();
        assert!(profile.resolve(|u| *u == uuids::QN_WRITE).is_none());
        assert_eq!(
            profile.notify_candidates(),
            vec![uuids::QN_NOTIFY, uuids::QN_ALT_NOTIFY]
        );
    }

    fn all_adapters() -> Vec<Box<dyn ScaleAdapter>> {
        vec![
            Box::new(MiScale2),
            Box::new(MiScale),
            Box::new(QnScale::default()),
            Box::new(Yunmai::default()),
            Box::new(EsCs20m::default()),
            Box::new(StandardWeight::default()),
        ]
    }

    fn check(adapter: &dyn ScaleAdapter, reading: Option<Reading>) -> Result<(), TestCaseError> {
        if let Some(reading) = reading {
            let kg = crate::extract::normalize(adapter, reading, None).weight;
            prop_assert!(plausible(kg), "{} produced {} kg", adapter.name(), kg);
        }
        Ok(())
    }

    proptest! {
        #[test]
        fn decoders_survive_arbitrary_frames(
            frames in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..24), 1..8),
        ) {
            for mut adapter in all_adapters() {
                let Some(profile) = adapter.gatt() else { continue };
                for frame in &frames {
                    let reading = adapter.parse_notification(profile.notify, frame);
                    check(adapter.as_ref(), reading)?;
                    if let Some(reading) = reading {
                        let _ = adapter.is_complete(&reading);
                    }
                }
            }
        }

        #[test]
        fn decoders_survive_arbitrary_service_data(data in prop::collection::vec(any::<u8>(), 0..24)) {
            let info = DeviceInfo::new()
                .with_service_data(uuids::BODY_COMPOSITION_SERVICE, data.clone())
                .with_service_data(uuids::WEIGHT_SCALE_SERVICE, data);
            for adapter in all_adapters() {
                let _ = adapter.matches(&info);
                check(adapter.as_ref(), adapter.parse_broadcast(&info))?;
            }
        }
    }
}
