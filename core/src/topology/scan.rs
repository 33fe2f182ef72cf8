//! Scan results produced by the discovery tool
//!
//! Only used to locate the target (by address or advertised name) and to
//! enrich a synthesized advertisement with what the target was seen sending.

use super::advertising::{AddressParseError, AdvertisementData, PeerAddress};
use super::uuids::parse_uuid;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Default scan results file name
pub const DEFAULT_SCAN_RESULTS: &str = "scan_results.json";

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Failed to read scan results {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Scan results parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error(transparent)]
    Address(#[from] AddressParseError),
}

/// One discovered device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRecord {
    pub name: Option<String>,
    #[serde(default)]
    pub address: String,
    pub rssi: Option<i16>,
    #[serde(default)]
    pub services: Vec<String>,
    /// Company identifier (decimal string) to hex payload
    #[serde(default)]
    pub manufacturer_data: BTreeMap<String, String>,
    pub timestamp: Option<String>,
}

impl ScanRecord {
    pub fn peer_address(&self) -> Result<PeerAddress, ScanError> {
        Ok(self.address.parse()?)
    }

    /// Merge what the scanner saw into an advertisement
    pub fn enrich(&self, adv: &mut AdvertisementData) {
        for text in &self.services {
            match parse_uuid(text) {
                Some(uuid) if !adv.service_uuids.contains(&uuid) => adv.service_uuids.push(uuid),
                Some(_) => {}
                None => warn!("Skipping unparseable scanned service UUID {:?}", text),
            }
        }

        for (company, payload) in &self.manufacturer_data {
            let company = match company.parse::<u16>() {
                Ok(id) => id,
                Err(_) => {
                    warn!("Skipping manufacturer data with company id {:?}", company);
                    continue;
                }
            };
            match hex::decode(payload) {
                Ok(bytes) => {
                    adv.manufacturer_data.insert(company, bytes);
                }
                Err(e) => warn!("Skipping manufacturer data for 0x{:04X}: {}", company, e),
            }
        }

        if adv.local_name.is_none() {
            adv.local_name = self.name.clone();
            adv.complete_name = true;
        }
    }
}

/// Devices keyed by address, in file order
#[derive(Debug, Clone, Default)]
pub struct ScanResults {
    records: Vec<ScanRecord>,
}

impl ScanResults {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ScanError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ScanError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ScanError> {
        let map: serde_json::Map<String, serde_json::Value> = serde_json::from_str(text)?;
        let mut records = Vec::with_capacity(map.len());
        for (key, value) in map {
            let mut record: ScanRecord = serde_json::from_value(value)?;
            if record.address.is_empty() {
                record.address = key;
            }
            records.push(record);
        }
        debug!("Loaded {} scan records", records.len());
        Ok(Self { records })
    }

    pub fn records(&self) -> &[ScanRecord] {
        &self.records
    }

    /// Find a device by address (case-insensitive) or exact advertised name
    pub fn locate(&self, query: &str) -> Option<&ScanRecord> {
        if let Ok(wanted) = query.parse::<PeerAddress>() {
            if let Some(record) = self
                .records
                .iter()
                .find(|r| r.peer_address().map(|a| a == wanted).unwrap_or(false))
            {
                return Some(record);
            }
        }
        self.records
            .iter()
            .find(|r| r.name.as_deref() == Some(query))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::uuids::uuid_from_u16;

    const SCAN: &str = r#"{
        "C0:11:22:33:44:55": {
            "name": "OAT1040",
            "address": "C0:11:22:33:44:55",
            "rssi": -61,
            "services": ["0000fff0-0000-1000-8000-00805f9b34fb"],
            "manufacturer_data": {"76": "0215"},
            "timestamp": "2025-12-19T10:00:00"
        },
        "11:22:33:44:55:66": {
            "name": null,
            "address": "11:22:33:44:55:66",
            "rssi": -90,
            "services": [],
            "manufacturer_data": {},
            "timestamp": "2025-12-19T10:00:01"
        }
    }"#;

    #[test]
    fn test_locate_by_address_and_name() {
        let results = ScanResults::from_json(SCAN).expect("scan results");
        assert_eq!(results.records().len(), 2);

        let by_addr = results.locate("c0:11:22:33:44:55").expect("by address");
        assert_eq!(by_addr.name.as_deref(), Some("OAT1040"));

        let by_name = results.locate("OAT1040").expect("by name");
        assert_eq!(by_name.address, "C0:11:22:33:44:55");

        assert!(results.locate("nothing-here").is_none());
    }

    #[test]
    fn test_enrich_merges_services_and_manufacturer_data() {
        let results = ScanResults::from_json(SCAN).expect("scan results");
        let record = results.locate("OAT1040").expect("record");

        let mut adv = AdvertisementData::synthesize(None, &[uuid_from_u16(0xFFF0)]);
        record.enrich(&mut adv);

        assert_eq!(adv.service_uuids, vec![uuid_from_u16(0xFFF0)]);
        assert_eq!(adv.manufacturer_data.get(&76), Some(&vec![0x02, 0x15]));
        assert_eq!(adv.local_name.as_deref(), Some("OAT1040"));
    }

    #[test]
    fn test_bad_address_surfaces_error() {
        let record = ScanRecord {
            name: None,
            address: "not-an-address".into(),
            rssi: None,
            services: vec![],
            manufacturer_data: BTreeMap::new(),
            timestamp: None,
        };
        assert!(matches!(record.peer_address(), Err(ScanError::Address(_))));
    }
}
