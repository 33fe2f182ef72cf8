// Topology model: what the impersonated device looks like

pub mod advertising;
pub mod profile;
pub mod scan;
pub mod uuids;

pub use advertising::{AddressParseError, AddressType, AdvertisementData, AdvertisingError, PeerAddress};
pub use profile::{
    CharacteristicDescriptor, DescriptorDescriptor, DeviceProfile, HostCapabilities,
    LiveCharacteristic, LiveDescriptor, LiveService, ProfileError, PropertyFlags,
    ServiceDescriptor, VICTIM_HANDLE_BASE,
};
pub use scan::{ScanError, ScanRecord, ScanResults};
pub use uuids::{parse_uuid, short_uuid, uuid_from_u16, CCCD_UUID};
