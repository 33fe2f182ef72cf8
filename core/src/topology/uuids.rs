//! Bluetooth UUID helpers
//!
//! Profiles captured by different tools spell UUIDs differently (`180a`,
//! `0x180A`, `0000180a-0000-1000-8000-00805f9b34fb`). Everything is normalized
//! to a full 128-bit [`Uuid`] at load time.

use uuid::Uuid;

/// Bluetooth Base UUID (0000xxxx-0000-1000-8000-00805F9B34FB)
pub const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_00805F9B34FB;

/// Client Characteristic Configuration descriptor
pub const CCCD_UUID: Uuid = uuid_from_u16(0x2902);

/// Generic Access service
pub const GENERIC_ACCESS_UUID: Uuid = uuid_from_u16(0x1800);

/// Generic Attribute service
pub const GENERIC_ATTRIBUTE_UUID: Uuid = uuid_from_u16(0x1801);

/// Expand a 16-bit assigned number into a full UUID
pub const fn uuid_from_u16(short: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

/// Expand a 32-bit assigned number into a full UUID
pub const fn uuid_from_u32(short: u32) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

/// Return the 16-bit alias if `uuid` is derived from the base UUID
pub fn short_uuid(uuid: &Uuid) -> Option<u16> {
    let value = uuid.as_u128();
    let low_mask = (1u128 << 96) - 1;
    if value & low_mask != BLUETOOTH_BASE_UUID & low_mask {
        return None;
    }
    let high = (value >> 96) as u32;
    u16::try_from(high).ok()
}

/// Parse a UUID in short (`180a`, `0x180A`, `0000180a`) or full form
pub fn parse_uuid(text: &str) -> Option<Uuid> {
    let trimmed = text.trim();
    let hex_part = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);

    match hex_part.len() {
        4 => u16::from_str_radix(hex_part, 16).ok().map(uuid_from_u16),
        8 => u32::from_str_radix(hex_part, 16).ok().map(uuid_from_u32),
        _ => Uuid::parse_str(hex_part).ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_forms_expand_to_base_uuid() {
        let expected = Uuid::parse_str("0000180a-0000-1000-8000-00805f9b34fb").expect("uuid");
        assert_eq!(parse_uuid("180a"), Some(expected));
        assert_eq!(parse_uuid("0x180A"), Some(expected));
        assert_eq!(parse_uuid("0000180a"), Some(expected));
        assert_eq!(parse_uuid("0000180A-0000-1000-8000-00805F9B34FB"), Some(expected));
    }

    #[test]
    fn test_short_uuid_detection() {
        assert_eq!(short_uuid(&CCCD_UUID), Some(0x2902));
        let vendor = Uuid::parse_str("6e400001-b5a3-f393-e0a9-e50e24dcca9e").expect("uuid");
        assert_eq!(short_uuid(&vendor), None);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(parse_uuid("zzzz"), None);
        assert_eq!(parse_uuid("12345"), None);
        assert_eq!(parse_uuid(""), None);
    }
}
