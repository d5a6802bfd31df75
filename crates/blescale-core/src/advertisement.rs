//! Advertisements as seen by either transport.

use blescale_types::DeviceInfo;

/// Bluetooth address type, as reported by the remote radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AddressType {
    /// Public device address.
    #[default]
    Public,
    /// Random (static or private) address.
    Random,
}

impl AddressType {
    /// Wire value used in `connect` requests (`0` public, `1` random).
    pub fn as_wire(self) -> u8 {
        match self {
            AddressType::Public => 0,
            AddressType::Random => 1,
        }
    }

    /// Decode the wire value; only bit 0 is significant.
    pub fn from_wire(value: u8) -> Self {
        if value & 1 == 1 {
            AddressType::Random
        } else {
            AddressType::Public
        }
    }
}

/// One advertisement from a nearby device.
///
/// The address doubles as the handle used to open a GATT session: each
/// transport resolves it against the devices it has discovered.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Advertisement {
    /// MAC address, or the platform identifier where MACs are hidden.
    pub address: String,
    /// Received signal strength, dBm.
    pub rssi: Option<i16>,
    /// Address type, when the transport knows it.
    pub address_type: Option<AddressType>,
    /// What the adapters match against.
    pub info: DeviceInfo,
}

impl Advertisement {
    /// Create an advertisement for `address` with the given device info.
    pub fn new(address: impl Into<String>, info: DeviceInfo) -> Self {
        Self {
            address: address.into(),
            rssi: None,
            address_type: None,
            info,
        }
    }

    /// Set the RSSI.
    #[must_use]
    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = Some(rssi);
        self
    }

    /// Set the address type.
    #[must_use]
    pub fn with_address_type(mut self, address_type: AddressType) -> Self {
        self.address_type = Some(address_type);
        self
    }

    /// Case-insensitive address comparison.
    pub fn address_matches(&self, address: &str) -> bool {
        self.address.eq_ignore_ascii_case(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_type_wire() {
        assert_eq!(AddressType::from_wire(0), AddressType::Public);
        assert_eq!(AddressType::from_wire(1), AddressType::Random);
        assert_eq!(AddressType::from_wire(3), AddressType::Random);
        assert_eq!(AddressType::Random.as_wire(), 1);
    }

    #[test]
    fn test_address_matches_ignores_case() {
        let adv = Advertisement::new("aa:bb:cc:dd:ee:ff", DeviceInfo::new());
        assert!(adv.address_matches("AA:BB:CC:DD:EE:FF"));
        assert!(!adv.address_matches("AA:BB:CC:DD:EE:00"));
    }
}
