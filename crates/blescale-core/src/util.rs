//! Identifier helpers for the local radio.

use btleplug::platform::PeripheralId;

/// Address reported by platforms that hide MAC addresses (macOS).
const HIDDEN_ADDRESS: &str = "00:00:00:00:00:00";

/// Whether `address` is a real MAC rather than the hidden placeholder.
pub fn is_real_address(address: &str) -> bool {
    !address.is_empty() && address != HIDDEN_ADDRESS
}

/// Format a peripheral ID without its `PeripheralId(..)` wrapper.
pub fn format_peripheral_id(id: &PeripheralId) -> String {
    format!("{:?}", id)
        .trim_start_matches("PeripheralId(")
        .trim_end_matches(')')
        .to_string()
}

/// The MAC address where the platform exposes one, otherwise the platform
/// peripheral id.
pub fn create_identifier(address: &str, peripheral_id: &PeripheralId) -> String {
    if is_real_address(address) {
        address.to_string()
    } else {
        format_peripheral_id(peripheral_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hidden_address() {
        assert!(is_real_address("AA:BB:CC:DD:EE:FF"));
        assert!(!is_real_address("00:00:00:00:00:00"));
        assert!(!is_real_address(""));
    }
}
