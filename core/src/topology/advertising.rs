//! Advertisement payload model and AD-structure codec
//!
//! The relay mirrors the target's advertisement byte-for-byte when the profile
//! captured it, and otherwise synthesizes one from the name and service list.
//! Unknown AD types are carried through untouched so a decode/encode cycle
//! never loses data the victim's scanner might key on.

use super::uuids::{short_uuid, uuid_from_u16};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Legacy advertising PDU payload limit
pub const LEGACY_ADV_MAX: usize = 31;

/// LE General Discoverable, BR/EDR not supported
pub const DEFAULT_FLAGS: u8 = 0x06;

const AD_FLAGS: u8 = 0x01;
const AD_INCOMPLETE_UUID16: u8 = 0x02;
const AD_COMPLETE_UUID16: u8 = 0x03;
const AD_INCOMPLETE_UUID128: u8 = 0x06;
const AD_COMPLETE_UUID128: u8 = 0x07;
const AD_SHORT_NAME: u8 = 0x08;
const AD_COMPLETE_NAME: u8 = 0x09;
const AD_TX_POWER: u8 = 0x0A;
const AD_SERVICE_DATA16: u8 = 0x16;
const AD_APPEARANCE: u8 = 0x19;
const AD_MANUFACTURER: u8 = 0xFF;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AdvertisingError {
    #[error("Truncated AD structure at offset {0}")]
    Truncated(usize),
    #[error("Malformed AD structure 0x{ad_type:02X}: {reason}")]
    Malformed { ad_type: u8, reason: String },
    #[error("Advertisement does not fit advertising + scan response ({0} bytes)")]
    TooLarge(usize),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Invalid Bluetooth address: {0}")]
pub struct AddressParseError(pub String);

/// Bluetooth device address type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressType {
    #[default]
    Public,
    Random,
}

impl FromStr for AddressType {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "public" => Ok(AddressType::Public),
            "random" => Ok(AddressType::Random),
            other => Err(AddressParseError(format!("unknown address type {}", other))),
        }
    }
}

/// 48-bit Bluetooth device address, most significant byte first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerAddress(pub [u8; 6]);

impl PeerAddress {
    /// Address formatted for file names (`AA_BB_CC_DD_EE_FF`)
    pub fn file_stem(&self) -> String {
        self.to_string().replace(':', "_")
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl FromStr for PeerAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split([':', '-', '_']).collect();
        if parts.len() != 6 {
            return Err(AddressParseError(s.to_string()));
        }
        let mut bytes = [0u8; 6];
        for (slot, part) in bytes.iter_mut().zip(parts) {
            if part.len() != 2 {
                return Err(AddressParseError(s.to_string()));
            }
            *slot = u8::from_str_radix(part, 16).map_err(|_| AddressParseError(s.to_string()))?;
        }
        Ok(PeerAddress(bytes))
    }
}

impl Serialize for PeerAddress {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PeerAddress {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Decoded advertisement payload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdvertisementData {
    pub flags: Option<u8>,
    pub local_name: Option<String>,
    /// Whether `local_name` is the complete (0x09) or shortened (0x08) name
    pub complete_name: bool,
    pub service_uuids: Vec<Uuid>,
    /// Whether the service lists are complete (0x03/0x07) or incomplete
    pub complete_uuids: bool,
    pub tx_power: Option<i8>,
    pub appearance: Option<u16>,
    pub service_data: BTreeMap<u16, Vec<u8>>,
    pub manufacturer_data: BTreeMap<u16, Vec<u8>>,
    /// AD structures this codec does not interpret, in original order
    pub other: Vec<(u8, Vec<u8>)>,
}

impl AdvertisementData {
    /// Minimal connectable advertisement: flags, name, service list
    pub fn synthesize(name: Option<&str>, service_uuids: &[Uuid]) -> Self {
        Self {
            flags: Some(DEFAULT_FLAGS),
            local_name: name.map(str::to_string),
            complete_name: true,
            service_uuids: service_uuids.to_vec(),
            complete_uuids: true,
            ..Default::default()
        }
    }

    /// Replace the advertised name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.local_name = Some(name.into());
        self.complete_name = true;
        self
    }

    /// Decode a raw advertising (or scan response) payload
    pub fn decode(payload: &[u8]) -> Result<Self, AdvertisingError> {
        let mut data = AdvertisementData::default();
        let mut offset = 0;

        while offset < payload.len() {
            let len = payload[offset] as usize;
            if len == 0 {
                // Zero-length structure terminates significant data
                break;
            }
            if offset + 1 + len > payload.len() {
                return Err(AdvertisingError::Truncated(offset));
            }
            let ad_type = payload[offset + 1];
            let body = &payload[offset + 2..offset + 1 + len];
            data.apply_structure(ad_type, body)?;
            offset += len + 1;
        }

        Ok(data)
    }

    fn apply_structure(&mut self, ad_type: u8, body: &[u8]) -> Result<(), AdvertisingError> {
        let malformed = |reason: &str| AdvertisingError::Malformed {
            ad_type,
            reason: reason.to_string(),
        };

        match ad_type {
            AD_FLAGS => {
                self.flags = body.first().copied();
            }
            AD_INCOMPLETE_UUID16 | AD_COMPLETE_UUID16 => {
                if body.len() % 2 != 0 {
                    return Err(malformed("odd length 16-bit UUID list"));
                }
                self.complete_uuids = ad_type == AD_COMPLETE_UUID16;
                for chunk in body.chunks_exact(2) {
                    let short = u16::from_le_bytes([chunk[0], chunk[1]]);
                    self.service_uuids.push(uuid_from_u16(short));
                }
            }
            AD_INCOMPLETE_UUID128 | AD_COMPLETE_UUID128 => {
                if body.len() % 16 != 0 {
                    return Err(malformed("128-bit UUID list not a multiple of 16"));
                }
                self.complete_uuids = ad_type == AD_COMPLETE_UUID128;
                for chunk in body.chunks_exact(16) {
                    let mut bytes = [0u8; 16];
                    bytes.copy_from_slice(chunk);
                    bytes.reverse();
                    self.service_uuids.push(Uuid::from_bytes(bytes));
                }
            }
            AD_SHORT_NAME | AD_COMPLETE_NAME => {
                self.local_name = Some(String::from_utf8_lossy(body).into_owned());
                self.complete_name = ad_type == AD_COMPLETE_NAME;
            }
            AD_TX_POWER => {
                let value = body.first().ok_or_else(|| malformed("empty TX power"))?;
                self.tx_power = Some(*value as i8);
            }
            AD_SERVICE_DATA16 => {
                if body.len() < 2 {
                    return Err(malformed("service data shorter than UUID"));
                }
                let short = u16::from_le_bytes([body[0], body[1]]);
                self.service_data.insert(short, body[2..].to_vec());
            }
            AD_APPEARANCE => {
                if body.len() != 2 {
                    return Err(malformed("appearance must be 2 bytes"));
                }
                self.appearance = Some(u16::from_le_bytes([body[0], body[1]]));
            }
            AD_MANUFACTURER => {
                if body.len() < 2 {
                    return Err(malformed("manufacturer data shorter than company id"));
                }
                let company = u16::from_le_bytes([body[0], body[1]]);
                self.manufacturer_data.insert(company, body[2..].to_vec());
            }
            other => self.other.push((other, body.to_vec())),
        }
        Ok(())
    }

    /// Individual AD structures in emission order
    fn structures(&self) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        let mut push = |ad_type: u8, body: &[u8]| {
            let mut s = Vec::with_capacity(body.len() + 2);
            s.push((body.len() + 1) as u8);
            s.push(ad_type);
            s.extend_from_slice(body);
            out.push(s);
        };

        if let Some(flags) = self.flags {
            push(AD_FLAGS, &[flags]);
        }

        let (short, long): (Vec<&Uuid>, Vec<&Uuid>) = self
            .service_uuids
            .iter()
            .partition(|u| short_uuid(u).is_some());
        if !short.is_empty() {
            let body: Vec<u8> = short
                .iter()
                .filter_map(|u| short_uuid(u))
                .flat_map(|s| s.to_le_bytes())
                .collect();
            let ty = if self.complete_uuids {
                AD_COMPLETE_UUID16
            } else {
                AD_INCOMPLETE_UUID16
            };
            push(ty, &body);
        }
        if !long.is_empty() {
            let body: Vec<u8> = long
                .iter()
                .flat_map(|u| {
                    let mut bytes = *u.as_bytes();
                    bytes.reverse();
                    bytes
                })
                .collect();
            let ty = if self.complete_uuids {
                AD_COMPLETE_UUID128
            } else {
                AD_INCOMPLETE_UUID128
            };
            push(ty, &body);
        }

        if let Some(tx) = self.tx_power {
            push(AD_TX_POWER, &[tx as u8]);
        }
        if let Some(appearance) = self.appearance {
            push(AD_APPEARANCE, &appearance.to_le_bytes());
        }
        for (uuid, value) in &self.service_data {
            let mut body = uuid.to_le_bytes().to_vec();
            body.extend_from_slice(value);
            push(AD_SERVICE_DATA16, &body);
        }
        for (company, value) in &self.manufacturer_data {
            let mut body = company.to_le_bytes().to_vec();
            body.extend_from_slice(value);
            push(AD_MANUFACTURER, &body);
        }
        for (ad_type, body) in &self.other {
            push(*ad_type, body);
        }
        // Name last: it is the first thing to move into the scan response
        if let Some(name) = &self.local_name {
            let ty = if self.complete_name {
                AD_COMPLETE_NAME
            } else {
                AD_SHORT_NAME
            };
            push(ty, name.as_bytes());
        }

        out
    }

    /// Encode every AD structure into one payload
    pub fn encode(&self) -> Vec<u8> {
        self.structures().concat()
    }

    /// Split into legacy advertising data and scan response, 31 bytes each
    pub fn split_legacy(&self) -> Result<(Vec<u8>, Vec<u8>), AdvertisingError> {
        let mut adv = Vec::new();
        let mut scan = Vec::new();

        for structure in self.structures() {
            if scan.is_empty() && adv.len() + structure.len() <= LEGACY_ADV_MAX {
                adv.extend_from_slice(&structure);
            } else if scan.len() + structure.len() <= LEGACY_ADV_MAX {
                scan.extend_from_slice(&structure);
            } else {
                return Err(AdvertisingError::TooLarge(self.encode().len()));
            }
        }

        Ok((adv, scan))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_address_parse_and_display() {
        let addr: PeerAddress = "aa:bb:cc:dd:ee:ff".parse().expect("address");
        assert_eq!(addr.to_string(), "AA:BB:CC:DD:EE:FF");
        assert_eq!(addr.file_stem(), "AA_BB_CC_DD_EE_FF");

        let underscored: PeerAddress = "AA_BB_CC_DD_EE_FF".parse().expect("address");
        assert_eq!(underscored, addr);

        assert!("AA:BB:CC".parse::<PeerAddress>().is_err());
        assert!("AA:BB:CC:DD:EE:GG".parse::<PeerAddress>().is_err());
    }

    #[test]
    fn test_decode_captured_payload() {
        // flags, complete 16-bit list (0x180A, 0xFFF0), complete name "OAT"
        let raw = hex::decode("02010605030a18f0ff04094f4154").expect("hex");
        let adv = AdvertisementData::decode(&raw).expect("decode");
        assert_eq!(adv.flags, Some(0x06));
        assert_eq!(
            adv.service_uuids,
            vec![uuid_from_u16(0x180A), uuid_from_u16(0xFFF0)]
        );
        assert_eq!(adv.local_name.as_deref(), Some("OAT"));
        assert!(adv.complete_name);
    }

    #[test]
    fn test_unknown_structures_survive_reencode() {
        let raw = vec![0x02, 0x01, 0x06, 0x03, 0x2A, 0xAB, 0xCD];
        let adv = AdvertisementData::decode(&raw).expect("decode");
        assert_eq!(adv.other, vec![(0x2A, vec![0xAB, 0xCD])]);
        assert_eq!(adv.encode(), raw);
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let raw = vec![0x05, 0x09, b'a'];
        assert_eq!(
            AdvertisementData::decode(&raw),
            Err(AdvertisingError::Truncated(0))
        );
    }

    #[test]
    fn test_manufacturer_data_little_endian_company() {
        let mut adv = AdvertisementData::default();
        adv.manufacturer_data.insert(0x004C, vec![0x02, 0x15]);
        assert_eq!(adv.encode(), vec![0x05, 0xFF, 0x4C, 0x00, 0x02, 0x15]);
    }

    #[test]
    fn test_long_name_moves_to_scan_response() {
        let vendor = Uuid::parse_str("6e400001-b5a3-f393-e0a9-e50e24dcca9e").expect("uuid");
        let adv = AdvertisementData::synthesize(Some("A-Rather-Long-Device-Name"), &[vendor]);
        let (primary, scan) = adv.split_legacy().expect("fits");
        // flags (3) + 128-bit list (18)
        assert_eq!(primary.len(), 21);
        assert_eq!(scan[1], 0x09);
        assert!(scan.len() <= LEGACY_ADV_MAX);
    }

    #[test]
    fn test_oversized_advertisement_rejected() {
        let adv = AdvertisementData {
            manufacturer_data: BTreeMap::from([(0x0001, vec![0u8; 40])]),
            ..Default::default()
        };
        assert!(matches!(
            adv.split_legacy(),
            Err(AdvertisingError::TooLarge(_))
        ));
    }
}
