//! DeviceProfile: the static GATT topology the relay mirrors
//!
//! Parsed once from the enumeration tool's JSON into strongly typed
//! descriptors, validated against what the host's peripheral role can serve,
//! and assigned victim-facing handles in file order. Target-facing handles are
//! taken from the file when recorded and otherwise bound from live discovery
//! with [`DeviceProfile::bind_live`].

use super::advertising::{AddressType, AdvertisementData, PeerAddress};
use super::uuids::{parse_uuid, CCCD_UUID, GENERIC_ACCESS_UUID, GENERIC_ATTRIBUTE_UUID};
use crate::gatt::Handle;
use crate::pairing::IoCapability;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// First victim-facing handle; 0x0001..=0x000F stay free for the host's GAP/GATT services
pub const VICTIM_HANDLE_BASE: Handle = 0x0010;

/// Errors raised while loading or binding a profile
#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("Failed to read profile {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Profile parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Malformed profile: {0}")]
    Malformed(String),
    #[error("Unsupported capability: characteristic {uuid} needs {flags} from the {provider}")]
    UnsupportedCapability {
        uuid: Uuid,
        flags: String,
        provider: &'static str,
    },
    #[error("{kind} {uuid} from the profile is not present on the live device")]
    NotOnDevice { kind: &'static str, uuid: Uuid },
}

/// Characteristic property flags the relay can mirror
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct PropertyFlags {
    pub read: bool,
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
    pub indicate: bool,
}

/// Property names that exist in GATT but cannot be served by the relay
const UNMIRRORABLE_PROPERTIES: &[&str] = &[
    "broadcast",
    "authenticated-signed-writes",
    "reliable-write",
    "writable-auxiliaries",
];

impl PropertyFlags {
    pub fn all() -> Self {
        Self {
            read: true,
            write: true,
            write_without_response: true,
            notify: true,
            indicate: true,
        }
    }

    pub fn is_writable(&self) -> bool {
        self.write || self.write_without_response
    }

    pub fn is_subscribable(&self) -> bool {
        self.notify || self.indicate
    }

    /// Flags set here but absent from `other`
    pub fn missing_from(&self, other: &PropertyFlags) -> Vec<&'static str> {
        self.names()
            .into_iter()
            .filter(|name| !other.names().contains(name))
            .collect()
    }

    pub fn is_subset_of(&self, other: &PropertyFlags) -> bool {
        self.missing_from(other).is_empty()
    }

    /// Property names in the enumeration tool's vocabulary
    pub fn names(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.read {
            names.push("read");
        }
        if self.write {
            names.push("write");
        }
        if self.write_without_response {
            names.push("write-without-response");
        }
        if self.notify {
            names.push("notify");
        }
        if self.indicate {
            names.push("indicate");
        }
        names
    }

    fn parse(uuid: &Uuid, names: &[String]) -> Result<Self, ProfileError> {
        let mut flags = PropertyFlags::default();
        let mut unmirrorable = Vec::new();

        for name in names {
            match name.as_str() {
                "read" => flags.read = true,
                "write" => flags.write = true,
                "write-without-response" => flags.write_without_response = true,
                "notify" => flags.notify = true,
                "indicate" => flags.indicate = true,
                // Implied by the presence of the other flags
                "extended-properties" => {}
                known if UNMIRRORABLE_PROPERTIES.contains(&known) => unmirrorable.push(known),
                unknown => {
                    return Err(ProfileError::Malformed(format!(
                        "characteristic {} has unknown property {:?}",
                        uuid, unknown
                    )))
                }
            }
        }

        if !unmirrorable.is_empty() {
            return Err(ProfileError::UnsupportedCapability {
                uuid: *uuid,
                flags: unmirrorable.join(", "),
                provider: "relay",
            });
        }

        Ok(flags)
    }
}

/// What the host's peripheral-role GATT server can expose
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostCapabilities {
    pub supported: PropertyFlags,
}

impl Default for HostCapabilities {
    fn default() -> Self {
        Self {
            supported: PropertyFlags::all(),
        }
    }
}

/// Descriptor attached to a characteristic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorDescriptor {
    pub uuid: Uuid,
    pub victim_handle: Handle,
    pub target_handle: Option<Handle>,
    /// Added by the loader because the characteristic is subscribable
    pub synthesized: bool,
}

impl DescriptorDescriptor {
    pub fn is_cccd(&self) -> bool {
        self.uuid == CCCD_UUID
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicDescriptor {
    pub uuid: Uuid,
    pub description: Option<String>,
    pub properties: PropertyFlags,
    pub descriptors: Vec<DescriptorDescriptor>,
    /// Victim-facing characteristic declaration handle
    pub declaration_handle: Handle,
    /// Victim-facing value handle
    pub victim_handle: Handle,
    /// Target-facing value handle, once known
    pub target_handle: Option<Handle>,
    /// Value captured at enumeration time
    pub initial_value: Option<Vec<u8>>,
}

impl CharacteristicDescriptor {
    pub fn cccd(&self) -> Option<&DescriptorDescriptor> {
        self.descriptors.iter().find(|d| d.is_cccd())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub uuid: Uuid,
    pub description: Option<String>,
    /// Victim-facing service declaration handle
    pub handle: Handle,
    pub characteristics: Vec<CharacteristicDescriptor>,
}

impl ServiceDescriptor {
    /// GAP and GATT services are readable before pairing completes
    pub fn is_mandatory(&self) -> bool {
        self.uuid == GENERIC_ACCESS_UUID || self.uuid == GENERIC_ATTRIBUTE_UUID
    }
}

/// Immutable description of the device being impersonated
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceProfile {
    pub name: Option<String>,
    pub address: Option<PeerAddress>,
    pub address_type: AddressType,
    pub mtu: Option<u16>,
    pub io_capability: IoCapability,
    pub advertisement: AdvertisementData,
    /// Advertisement came from a captured payload rather than being synthesized
    pub advertisement_captured: bool,
    pub services: Vec<ServiceDescriptor>,
}

/// Services, characteristics and descriptors discovered on the real device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveService {
    pub uuid: Uuid,
    pub characteristics: Vec<LiveCharacteristic>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveCharacteristic {
    pub uuid: Uuid,
    /// Target-facing value handle
    pub handle: Handle,
    pub properties: PropertyFlags,
    pub descriptors: Vec<LiveDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveDescriptor {
    pub uuid: Uuid,
    pub handle: Handle,
}

// ============================================================================
// FILE FORMAT
// ============================================================================

#[derive(Debug, Deserialize)]
struct RawProfile {
    #[serde(default)]
    device_info: RawDeviceInfo,
    #[serde(default)]
    advertisement: Option<RawAdvertisement>,
    services: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
struct RawDeviceInfo {
    address: Option<String>,
    name: Option<String>,
    mtu: Option<u16>,
    address_type: Option<String>,
    io_capability: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawAdvertisement {
    raw: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawService {
    uuid: Option<String>,
    description: Option<String>,
    #[serde(default)]
    characteristics: Vec<RawCharacteristic>,
}

#[derive(Debug, Deserialize)]
struct RawCharacteristic {
    uuid: String,
    description: Option<String>,
    #[serde(default)]
    properties: Vec<String>,
    #[serde(default)]
    descriptors: Vec<String>,
    value: Option<String>,
    handle: Option<Handle>,
}

/// Sequential victim handle allocator
struct HandleAllocator {
    next: u32,
}

impl HandleAllocator {
    fn new() -> Self {
        Self {
            next: VICTIM_HANDLE_BASE as u32,
        }
    }

    fn take(&mut self) -> Result<Handle, ProfileError> {
        let handle = Handle::try_from(self.next)
            .map_err(|_| ProfileError::Malformed("attribute handle space exhausted".into()))?;
        self.next += 1;
        Ok(handle)
    }
}

fn uuid_field(text: &str, what: &str) -> Result<Uuid, ProfileError> {
    parse_uuid(text).ok_or_else(|| ProfileError::Malformed(format!("invalid {} UUID {:?}", what, text)))
}

impl DeviceProfile {
    /// Default profile file for a device (`AA_BB_CC_DD_EE_FF_profile.json`)
    pub fn default_path(address: &PeerAddress) -> PathBuf {
        PathBuf::from(format!("{}_profile.json", address.file_stem()))
    }

    /// Load and validate a profile file
    pub fn load(path: impl AsRef<Path>, host: &HostCapabilities) -> Result<Self, ProfileError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ProfileError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let profile = Self::from_json(&text, host)?;
        info!(
            "Loaded profile {} ({} services, {} characteristics)",
            path.display(),
            profile.services.len(),
            profile.characteristics().count()
        );
        Ok(profile)
    }

    /// Parse and validate a profile from JSON text
    pub fn from_json(text: &str, host: &HostCapabilities) -> Result<Self, ProfileError> {
        let raw: RawProfile = serde_json::from_str(text)?;

        let address = raw
            .device_info
            .address
            .as_deref()
            .map(|a| a.parse::<PeerAddress>())
            .transpose()
            .map_err(|e| ProfileError::Malformed(e.to_string()))?;
        let address_type = raw
            .device_info
            .address_type
            .as_deref()
            .map(|t| t.parse::<AddressType>())
            .transpose()
            .map_err(|e| ProfileError::Malformed(e.to_string()))?
            .unwrap_or_default();
        let io_capability = raw
            .device_info
            .io_capability
            .as_deref()
            .map(|c| c.parse::<IoCapability>())
            .transpose()
            .map_err(ProfileError::Malformed)?
            .unwrap_or_default();

        let mut allocator = HandleAllocator::new();
        let mut seen = HashSet::new();
        let mut services = Vec::with_capacity(raw.services.len());

        for (key, value) in raw.services {
            let raw_service: RawService = serde_json::from_value(value)?;
            let uuid = uuid_field(raw_service.uuid.as_deref().unwrap_or(&key), "service")?;
            if !seen.insert(uuid) {
                return Err(ProfileError::Malformed(format!("duplicate service {}", uuid)));
            }

            let handle = allocator.take()?;
            let mut characteristics = Vec::with_capacity(raw_service.characteristics.len());
            for raw_char in raw_service.characteristics {
                characteristics.push(Self::build_characteristic(raw_char, host, &mut allocator)?);
            }

            services.push(ServiceDescriptor {
                uuid,
                description: raw_service.description,
                handle,
                characteristics,
            });
        }

        let name = raw.device_info.name;
        let (advertisement, advertisement_captured) =
            match raw.advertisement.and_then(|a| a.raw) {
                Some(hex_payload) => {
                    let bytes = hex::decode(hex_payload.trim()).map_err(|e| {
                        ProfileError::Malformed(format!("advertisement payload: {}", e))
                    })?;
                    let adv = AdvertisementData::decode(&bytes)
                        .map_err(|e| ProfileError::Malformed(e.to_string()))?;
                    (adv, true)
                }
                None => {
                    let uuids: Vec<Uuid> = services
                        .iter()
                        .filter(|s| !s.is_mandatory())
                        .map(|s| s.uuid)
                        .collect();
                    (AdvertisementData::synthesize(name.as_deref(), &uuids), false)
                }
            };

        Ok(Self {
            name,
            address,
            address_type,
            mtu: raw.device_info.mtu,
            io_capability,
            advertisement,
            advertisement_captured,
            services,
        })
    }

    fn build_characteristic(
        raw: RawCharacteristic,
        host: &HostCapabilities,
        allocator: &mut HandleAllocator,
    ) -> Result<CharacteristicDescriptor, ProfileError> {
        let uuid = uuid_field(&raw.uuid, "characteristic")?;
        let properties = PropertyFlags::parse(&uuid, &raw.properties)?;

        let missing = properties.missing_from(&host.supported);
        if !missing.is_empty() {
            return Err(ProfileError::UnsupportedCapability {
                uuid,
                flags: missing.join(", "),
                provider: "host peripheral stack",
            });
        }

        let initial_value = raw
            .value
            .as_deref()
            .map(hex::decode)
            .transpose()
            .map_err(|e| ProfileError::Malformed(format!("value of {}: {}", uuid, e)))?;

        let declaration_handle = allocator.take()?;
        let victim_handle = allocator.take()?;

        let mut descriptors = Vec::with_capacity(raw.descriptors.len() + 1);
        for text in &raw.descriptors {
            descriptors.push(DescriptorDescriptor {
                uuid: uuid_field(text, "descriptor")?,
                victim_handle: allocator.take()?,
                target_handle: None,
                synthesized: false,
            });
        }
        if properties.is_subscribable() && !descriptors.iter().any(|d| d.is_cccd()) {
            descriptors.push(DescriptorDescriptor {
                uuid: CCCD_UUID,
                victim_handle: allocator.take()?,
                target_handle: None,
                synthesized: true,
            });
        }

        Ok(CharacteristicDescriptor {
            uuid,
            description: raw.description,
            properties,
            descriptors,
            declaration_handle,
            victim_handle,
            target_handle: raw.handle,
            initial_value,
        })
    }

    /// All characteristics with their owning service, in handle order
    pub fn characteristics(
        &self,
    ) -> impl Iterator<Item = (&ServiceDescriptor, &CharacteristicDescriptor)> {
        self.services
            .iter()
            .flat_map(|s| s.characteristics.iter().map(move |c| (s, c)))
    }

    /// Characteristic owning a victim-facing value handle
    pub fn characteristic_at(&self, victim_handle: Handle) -> Option<&CharacteristicDescriptor> {
        self.characteristics()
            .map(|(_, c)| c)
            .find(|c| c.victim_handle == victim_handle)
    }

    /// First characteristic with the given UUID
    pub fn find_characteristic(&self, uuid: &Uuid) -> Option<&CharacteristicDescriptor> {
        self.characteristics().map(|(_, c)| c).find(|c| &c.uuid == uuid)
    }

    /// Raw advertising bytes the downstream server mirrors
    pub fn advertisement_payload(&self) -> Vec<u8> {
        self.advertisement.encode()
    }

    /// Name to advertise under, overriding the captured one
    pub fn with_advertised_name(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.advertisement = self.advertisement.with_name(name.clone());
        self.name = Some(name);
        self
    }

    /// True once every value handle and every non-local descriptor has a target handle
    pub fn is_bound(&self) -> bool {
        self.characteristics().all(|(_, c)| {
            c.target_handle.is_some()
                && c.descriptors
                    .iter()
                    .all(|d| d.target_handle.is_some() || d.is_cccd())
        })
    }

    /// Bind target-facing handles from live discovery.
    ///
    /// The profile decides what is mirrored. Live attributes the profile does
    /// not mention are ignored; profile attributes the live device lacks, or
    /// whose flags the live device does not offer, fail the bind.
    pub fn bind_live(&self, live: &[LiveService]) -> Result<DeviceProfile, ProfileError> {
        let mut bound = self.clone();

        for service in &mut bound.services {
            let live_service = live.iter().find(|l| l.uuid == service.uuid).ok_or(
                ProfileError::NotOnDevice {
                    kind: "Service",
                    uuid: service.uuid,
                },
            )?;

            // k-th occurrence of a UUID in the profile binds to the k-th live occurrence
            let mut occurrences: HashMap<Uuid, usize> = HashMap::new();
            let mut used = HashSet::new();

            for characteristic in &mut service.characteristics {
                let index = occurrences.entry(characteristic.uuid).or_insert(0);
                let live_char = live_service
                    .characteristics
                    .iter()
                    .filter(|l| l.uuid == characteristic.uuid)
                    .nth(*index)
                    .ok_or(ProfileError::NotOnDevice {
                        kind: "Characteristic",
                        uuid: characteristic.uuid,
                    })?;
                *index += 1;
                used.insert(live_char.handle);

                let missing = characteristic.properties.missing_from(&live_char.properties);
                if !missing.is_empty() {
                    return Err(ProfileError::UnsupportedCapability {
                        uuid: characteristic.uuid,
                        flags: missing.join(", "),
                        provider: "live device",
                    });
                }

                if let Some(recorded) = characteristic.target_handle {
                    if recorded != live_char.handle {
                        warn!(
                            "Characteristic {} moved from handle 0x{:04X} to 0x{:04X}; using live handle",
                            characteristic.uuid, recorded, live_char.handle
                        );
                    }
                }
                characteristic.target_handle = Some(live_char.handle);

                let mut desc_occurrences: HashMap<Uuid, usize> = HashMap::new();
                for descriptor in &mut characteristic.descriptors {
                    let index = desc_occurrences.entry(descriptor.uuid).or_insert(0);
                    let live_desc = live_char
                        .descriptors
                        .iter()
                        .filter(|d| d.uuid == descriptor.uuid)
                        .nth(*index);
                    *index += 1;
                    match live_desc {
                        Some(live_desc) => descriptor.target_handle = Some(live_desc.handle),
                        // CCCD writes are answered locally
                        None if descriptor.is_cccd() => descriptor.target_handle = None,
                        None => {
                            return Err(ProfileError::NotOnDevice {
                                kind: "Descriptor",
                                uuid: descriptor.uuid,
                            })
                        }
                    }
                }
            }

            for extra in live_service
                .characteristics
                .iter()
                .filter(|l| !used.contains(&l.handle))
            {
                warn!(
                    "Ignoring live characteristic {} (0x{:04X}) absent from profile",
                    extra.uuid, extra.handle
                );
            }
        }

        for extra in live
            .iter()
            .filter(|l| !self.services.iter().any(|s| s.uuid == l.uuid))
        {
            warn!("Ignoring live service {} absent from profile", extra.uuid);
        }

        debug!("Bound {} characteristics to live handles", bound.characteristics().count());
        Ok(bound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::uuids::uuid_from_u16;
    use std::io::Write;

    const SAMPLE: &str = r#"{
        "device_info": {
            "address": "C0:11:22:33:44:55",
            "name": "OAT1040",
            "mtu": 247,
            "connected": true,
            "timestamp": "2025-12-19T10:00:00"
        },
        "services": {
            "0000180a-0000-1000-8000-00805f9b34fb": {
                "uuid": "0000180a-0000-1000-8000-00805f9b34fb",
                "description": "Device Information",
                "characteristics": [
                    {
                        "uuid": "00002a29-0000-1000-8000-00805f9b34fb",
                        "description": "Manufacturer Name String",
                        "properties": ["read"],
                        "descriptors": [],
                        "value": "4f4154",
                        "readable": true,
                        "writable": false,
                        "notifiable": false
                    }
                ]
            },
            "0000fff0-0000-1000-8000-00805f9b34fb": {
                "uuid": "0000fff0-0000-1000-8000-00805f9b34fb",
                "description": "Vendor specific",
                "characteristics": [
                    {
                        "uuid": "0000fff1-0000-1000-8000-00805f9b34fb",
                        "properties": ["read", "notify"],
                        "descriptors": ["00002902-0000-1000-8000-00805f9b34fb"],
                        "value": null
                    },
                    {
                        "uuid": "0000fff2-0000-1000-8000-00805f9b34fb",
                        "properties": ["write-without-response", "write"],
                        "descriptors": []
                    }
                ]
            }
        }
    }"#;

    fn sample() -> DeviceProfile {
        DeviceProfile::from_json(SAMPLE, &HostCapabilities::default()).expect("sample profile")
    }

    fn live_for(profile: &DeviceProfile) -> Vec<LiveService> {
        let mut next = 0x0100;
        profile
            .services
            .iter()
            .map(|s| LiveService {
                uuid: s.uuid,
                characteristics: s
                    .characteristics
                    .iter()
                    .map(|c| {
                        next += 2;
                        let handle = next;
                        let descriptors = c
                            .descriptors
                            .iter()
                            .map(|d| {
                                next += 1;
                                LiveDescriptor {
                                    uuid: d.uuid,
                                    handle: next,
                                }
                            })
                            .collect();
                        LiveCharacteristic {
                            uuid: c.uuid,
                            handle,
                            properties: c.properties,
                            descriptors,
                        }
                    })
                    .collect(),
            })
            .collect()
    }

    #[test]
    fn test_load_sample_profile() {
        let profile = sample();
        assert_eq!(profile.name.as_deref(), Some("OAT1040"));
        assert_eq!(profile.mtu, Some(247));
        assert_eq!(profile.address_type, AddressType::Public);
        assert_eq!(profile.io_capability, IoCapability::NoInputNoOutput);
        assert_eq!(profile.services.len(), 2);
        assert_eq!(profile.services[0].uuid, uuid_from_u16(0x180A));

        let manufacturer = &profile.services[0].characteristics[0];
        assert_eq!(manufacturer.initial_value.as_deref(), Some(&b"OAT"[..]));
        assert!(manufacturer.properties.read);
        assert!(!manufacturer.properties.is_writable());
    }

    #[test]
    fn test_victim_handles_follow_file_order() {
        let profile = sample();
        // 180A service
        assert_eq!(profile.services[0].handle, 0x0010);
        let c = &profile.services[0].characteristics[0];
        assert_eq!((c.declaration_handle, c.victim_handle), (0x0011, 0x0012));
        // FFF0 service
        assert_eq!(profile.services[1].handle, 0x0013);
        let notify = &profile.services[1].characteristics[0];
        assert_eq!((notify.declaration_handle, notify.victim_handle), (0x0014, 0x0015));
        assert_eq!(notify.descriptors[0].victim_handle, 0x0016);
        let write = &profile.services[1].characteristics[1];
        assert_eq!((write.declaration_handle, write.victim_handle), (0x0017, 0x0018));
    }

    #[test]
    fn test_reload_is_deterministic() {
        assert_eq!(sample(), sample());
    }

    #[test]
    fn test_cccd_synthesized_for_notify_without_descriptor() {
        let json = r#"{"services": {"180d": {"characteristics": [
            {"uuid": "2a37", "properties": ["notify"]}
        ]}}}"#;
        let profile =
            DeviceProfile::from_json(json, &HostCapabilities::default()).expect("profile");
        let hr = &profile.services[0].characteristics[0];
        let cccd = hr.cccd().expect("cccd");
        assert!(cccd.synthesized);
        assert_eq!(cccd.victim_handle, hr.victim_handle + 1);
    }

    #[test]
    fn test_unsupported_host_capability_rejected() {
        let host = HostCapabilities {
            supported: PropertyFlags {
                indicate: false,
                ..PropertyFlags::all()
            },
        };
        let json = r#"{"services": {"1809": {"characteristics": [
            {"uuid": "2a1c", "properties": ["indicate"]}
        ]}}}"#;
        match DeviceProfile::from_json(json, &host) {
            Err(ProfileError::UnsupportedCapability { flags, .. }) => assert_eq!(flags, "indicate"),
            other => panic!("expected UnsupportedCapability, got {:?}", other),
        }
    }

    #[test]
    fn test_unmirrorable_property_rejected() {
        let json = r#"{"services": {"fff0": {"characteristics": [
            {"uuid": "fff1", "properties": ["read", "authenticated-signed-writes"]}
        ]}}}"#;
        assert!(matches!(
            DeviceProfile::from_json(json, &HostCapabilities::default()),
            Err(ProfileError::UnsupportedCapability { .. })
        ));
    }

    #[test]
    fn test_unknown_property_is_malformed() {
        let json = r#"{"services": {"fff0": {"characteristics": [
            {"uuid": "fff1", "properties": ["teleport"]}
        ]}}}"#;
        assert!(matches!(
            DeviceProfile::from_json(json, &HostCapabilities::default()),
            Err(ProfileError::Malformed(_))
        ));
    }

    #[test]
    fn test_duplicate_service_rejected() {
        let json = r#"{"services": {
            "180a": {"characteristics": []},
            "0000180a-0000-1000-8000-00805f9b34fb": {"characteristics": []}
        }}"#;
        assert!(matches!(
            DeviceProfile::from_json(json, &HostCapabilities::default()),
            Err(ProfileError::Malformed(_))
        ));
    }

    #[test]
    fn test_missing_services_is_parse_error() {
        assert!(matches!(
            DeviceProfile::from_json("{}", &HostCapabilities::default()),
            Err(ProfileError::Parse(_))
        ));
    }

    #[test]
    fn test_synthesized_advertisement_lists_services() {
        let profile = sample();
        assert!(!profile.advertisement_captured);
        assert_eq!(profile.advertisement.local_name.as_deref(), Some("OAT1040"));
        assert_eq!(profile.advertisement.service_uuids.len(), 2);

        let renamed = profile.with_advertised_name("MITM-Proxy");
        assert_eq!(renamed.advertisement.local_name.as_deref(), Some("MITM-Proxy"));
    }

    #[test]
    fn test_captured_advertisement_is_kept() {
        let json = r#"{"advertisement": {"raw": "0201060409414243"},
                       "services": {"180a": {"characteristics": []}}}"#;
        let profile =
            DeviceProfile::from_json(json, &HostCapabilities::default()).expect("profile");
        assert!(profile.advertisement_captured);
        assert_eq!(profile.advertisement_payload(), hex::decode("0201060409414243").expect("hex"));
    }

    #[test]
    fn test_bind_live_assigns_target_handles() {
        let profile = sample();
        assert!(!profile.is_bound());
        let bound = profile.bind_live(&live_for(&profile)).expect("bind");
        assert!(bound.is_bound());
        let notify = &bound.services[1].characteristics[0];
        assert_eq!(notify.target_handle, Some(0x0104));
        assert_eq!(notify.descriptors[0].target_handle, Some(0x0105));
    }

    #[test]
    fn test_bind_live_ignores_extra_live_characteristics() {
        let profile = sample();
        let mut live = live_for(&profile);
        live[1].characteristics.push(LiveCharacteristic {
            uuid: uuid_from_u16(0xFFF9),
            handle: 0x0200,
            properties: PropertyFlags::all(),
            descriptors: vec![],
        });
        live.push(LiveService {
            uuid: uuid_from_u16(0x180F),
            characteristics: vec![],
        });
        let bound = profile.bind_live(&live).expect("bind");
        assert_eq!(bound.characteristics().count(), 3);
    }

    #[test]
    fn test_bind_live_missing_characteristic_fails() {
        let profile = sample();
        let mut live = live_for(&profile);
        live[1].characteristics.pop();
        assert!(matches!(
            profile.bind_live(&live),
            Err(ProfileError::NotOnDevice { kind: "Characteristic", .. })
        ));
    }

    #[test]
    fn test_bind_live_rejects_flags_the_device_lacks() {
        let profile = sample();
        let mut live = live_for(&profile);
        live[1].characteristics[0].properties.notify = false;
        assert!(matches!(
            profile.bind_live(&live),
            Err(ProfileError::UnsupportedCapability { provider: "live device", .. })
        ));
    }

    #[test]
    fn test_bind_live_tolerates_missing_cccd() {
        let profile = sample();
        let mut live = live_for(&profile);
        live[1].characteristics[0].descriptors.clear();
        let bound = profile.bind_live(&live).expect("bind");
        assert!(bound.is_bound());
        assert_eq!(bound.services[1].characteristics[0].descriptors[0].target_handle, None);
    }

    #[test]
    fn test_bind_live_repeated_descriptor_uuids_bind_in_order() {
        let json = r#"{"services": {"181a": {"characteristics": [
            {"uuid": "2a6e", "properties": ["read"], "descriptors": ["2904", "2904"]}
        ]}}}"#;
        let profile =
            DeviceProfile::from_json(json, &HostCapabilities::default()).expect("profile");
        let bound = profile.bind_live(&live_for(&profile)).expect("bind");

        let c = &bound.services[0].characteristics[0];
        assert_eq!(c.descriptors[0].victim_handle, 0x0013);
        assert_eq!(c.descriptors[1].victim_handle, 0x0014);
        assert_eq!(c.descriptors[0].target_handle, Some(0x0103));
        assert_eq!(c.descriptors[1].target_handle, Some(0x0104));
        assert!(crate::handles::HandleMapping::from_profile(&bound).is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        file.write_all(SAMPLE.as_bytes()).expect("write");
        let profile =
            DeviceProfile::load(file.path(), &HostCapabilities::default()).expect("load");
        assert_eq!(profile, sample());

        let missing = DeviceProfile::load("/nonexistent/profile.json", &HostCapabilities::default());
        assert!(matches!(missing, Err(ProfileError::Io { .. })));
    }

    #[test]
    fn test_default_path() {
        let addr: PeerAddress = "C0:11:22:33:44:55".parse().expect("address");
        assert_eq!(
            DeviceProfile::default_path(&addr),
            PathBuf::from("C0_11_22_33_44_55_profile.json")
        );
    }
}
