//! Bluetooth UUIDs used by supported scales.
//!
//! Most scale vendors use 16-bit identifiers expanded onto the Bluetooth
//! base UUID. The helpers at the bottom of this module convert between the
//! short form, the full [`Uuid`], and the dashless 32-digit form used on the
//! remote-radio wire.

use uuid::Uuid;

/// The Bluetooth base UUID (`00000000-0000-1000-8000-00805f9b34fb`).
pub const BLUETOOTH_BASE: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;

/// Expand a 16-bit assigned number onto the Bluetooth base UUID.
#[must_use]
pub const fn from_short(short: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE | ((short as u128) << 96))
}

// --- Bluetooth SIG services and characteristics ---

/// Weight Scale service (also advertised by Xiaomi Mi Scale v1).
pub const WEIGHT_SCALE_SERVICE: Uuid = from_short(0x181D);

/// Body Composition service (advertised by Xiaomi Mi Scale 2).
pub const BODY_COMPOSITION_SERVICE: Uuid = from_short(0x181B);

/// Weight Measurement characteristic (indicate).
pub const WEIGHT_MEASUREMENT: Uuid = from_short(0x2A9D);

// --- QN / Renpho family ---

/// QN primary vendor service.
pub const QN_SERVICE: Uuid = from_short(0xFFE0);

/// QN primary notify characteristic.
pub const QN_NOTIFY: Uuid = from_short(0xFFE1);

/// QN primary write characteristic.
pub const QN_WRITE: Uuid = from_short(0xFFE3);

/// QN alternate vendor service (newer firmware).
pub const QN_ALT_SERVICE: Uuid = from_short(0xFFF0);

/// QN alternate notify characteristic.
pub const QN_ALT_NOTIFY: Uuid = from_short(0xFFF1);

/// QN alternate write characteristic.
pub const QN_ALT_WRITE: Uuid = from_short(0xFFF2);

// --- Yunmai ---

/// Yunmai measurement notify characteristic.
pub const YUNMAI_NOTIFY: Uuid = from_short(0xFFE4);

/// Yunmai command characteristic.
pub const YUNMAI_WRITE: Uuid = from_short(0xFFE9);

// --- ES-CS20M ---

/// ES-CS20M vendor service.
pub const ESCS20M_SERVICE: Uuid = from_short(0x1A10);

/// ES-CS20M notify characteristic.
pub const ESCS20M_NOTIFY: Uuid = from_short(0x2A10);

/// ES-CS20M command characteristic.
pub const ESCS20M_WRITE: Uuid = from_short(0x2A11);

// --- Manufacturer IDs ---

/// Xiaomi (Anhui Huami) company identifier.
pub const XIAOMI_COMPANY_ID: u16 = 0x0157;

/// Return the 16-bit assigned number if `uuid` lies on the Bluetooth base.
#[must_use]
pub fn short_id(uuid: &Uuid) -> Option<u16> {
    let value = uuid.as_u128();
    let mask: u128 = !(0xFFFF_FFFFu128 << 96);
    if value & mask == BLUETOOTH_BASE && (value >> 112) == 0 {
        Some((value >> 96) as u16)
    } else {
        None
    }
}

/// Format a UUID the way the remote radio puts it on the wire:
/// 32 lowercase hex digits without dashes.
#[must_use]
pub fn to_wire(uuid: &Uuid) -> String {
    uuid.simple().to_string()
}

/// Parse any of the UUID spellings seen in the wild.
///
/// Accepts 4-digit (`"181d"`, `"0x181D"`), 8-digit (`"0000181d"`),
/// 32-digit dashless, and canonical dashed forms. Returns `None` for
/// anything else.
#[must_use]
pub fn normalize(raw: &str) -> Option<Uuid> {
    let trimmed = raw.trim();
    let hex = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);

    match hex.len() {
        4 => u16::from_str_radix(hex, 16).ok().map(from_short),
        8 => u32::from_str_radix(hex, 16)
            .ok()
            .map(|v| Uuid::from_u128(BLUETOOTH_BASE | ((v as u128) << 96))),
        32 | 36 => Uuid::parse_str(hex).ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_short_expands_onto_base() {
        assert_eq!(
            WEIGHT_SCALE_SERVICE.to_string(),
            "0000181d-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            QN_NOTIFY.to_string(),
            "0000ffe1-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_short_id_round_trip() {
        assert_eq!(short_id(&WEIGHT_MEASUREMENT), Some(0x2A9D));
        assert_eq!(short_id(&ESCS20M_WRITE), Some(0x2A11));

        let vendor = Uuid::parse_str("f0cd1400-95da-4f4b-9ac8-aa55d312af0c").unwrap();
        assert_eq!(short_id(&vendor), None);
    }

    #[test]
    fn test_to_wire_is_dashless_lowercase() {
        assert_eq!(to_wire(&QN_WRITE), "0000ffe300001000800000805f9b34fb");
    }

    #[test]
    fn test_normalize_accepts_all_spellings() {
        assert_eq!(normalize("181d"), Some(WEIGHT_SCALE_SERVICE));
        assert_eq!(normalize("0x181D"), Some(WEIGHT_SCALE_SERVICE));
        assert_eq!(normalize("0000181d"), Some(WEIGHT_SCALE_SERVICE));
        assert_eq!(
            normalize("0000181d00001000800000805f9b34fb"),
            Some(WEIGHT_SCALE_SERVICE)
        );
        assert_eq!(
            normalize("0000181D-0000-1000-8000-00805F9B34FB"),
            Some(WEIGHT_SCALE_SERVICE)
        );
    }

    #[test]
    fn test_normalize_rejects_garbage() {
        assert_eq!(normalize(""), None);
        assert_eq!(normalize("xyz1"), None);
        assert_eq!(normalize("12345"), None);
    }
}
