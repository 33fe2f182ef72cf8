//! Reference device used by tests and dry runs
//!
//! An "OAT1040"-style vendor peripheral: GAP device name, a Device Information
//! manufacturer string, and a vendor service with one notifying characteristic,
//! one writable characteristic and one command-only characteristic.

use crate::gatt::Handle;
use crate::pairing::IoCapability;
use crate::topology::{
    uuid_from_u16, AddressType, AdvertisementData, CharacteristicDescriptor,
    DescriptorDescriptor, DeviceProfile, PeerAddress, PropertyFlags, ServiceDescriptor,
    CCCD_UUID,
};
use uuid::Uuid;

pub const DEVICE_NAME: &str = "OAT1040";
pub const DEVICE_ADDRESS: PeerAddress = PeerAddress([0xC0, 0x11, 0x22, 0x33, 0x44, 0x55]);

pub const DEVICE_INFO_SERVICE: Uuid = uuid_from_u16(0x180A);
pub const VENDOR_SERVICE: Uuid = uuid_from_u16(0xFFF0);
pub const DEVICE_NAME_CHAR: Uuid = uuid_from_u16(0x2A00);
pub const MANUFACTURER_CHAR: Uuid = uuid_from_u16(0x2A29);
/// read + notify
pub const NOTIFY_CHAR: Uuid = uuid_from_u16(0xFFF1);
/// write + write-without-response
pub const WRITE_CHAR: Uuid = uuid_from_u16(0xFFF2);
/// write-without-response only
pub const COMMAND_CHAR: Uuid = uuid_from_u16(0xFFF3);

// Victim-facing handles, as the loader assigns them
pub const DEVICE_NAME_HANDLE: Handle = 0x0012;
pub const MANUFACTURER_HANDLE: Handle = 0x0015;
pub const NOTIFY_HANDLE: Handle = 0x0018;
pub const NOTIFY_CCCD_HANDLE: Handle = 0x0019;
pub const WRITE_HANDLE: Handle = 0x001B;
pub const COMMAND_HANDLE: Handle = 0x001D;

/// The same device in the enumeration tool's file format
pub const VENDOR_PROFILE_JSON: &str = r#"{
    "device_info": {
        "address": "C0:11:22:33:44:55",
        "name": "OAT1040",
        "mtu": 247,
        "connected": true
    },
    "services": {
        "00001800-0000-1000-8000-00805f9b34fb": {
            "uuid": "00001800-0000-1000-8000-00805f9b34fb",
            "description": "Generic Access",
            "characteristics": [
                { "uuid": "00002a00-0000-1000-8000-00805f9b34fb",
                  "description": "Device Name",
                  "properties": ["read"], "descriptors": [], "value": null }
            ]
        },
        "0000180a-0000-1000-8000-00805f9b34fb": {
            "uuid": "0000180a-0000-1000-8000-00805f9b34fb",
            "description": "Device Information",
            "characteristics": [
                { "uuid": "00002a29-0000-1000-8000-00805f9b34fb",
                  "description": "Manufacturer Name String",
                  "properties": ["read"], "descriptors": [], "value": "4f4154" }
            ]
        },
        "0000fff0-0000-1000-8000-00805f9b34fb": {
            "uuid": "0000fff0-0000-1000-8000-00805f9b34fb",
            "description": "Vendor specific",
            "characteristics": [
                { "uuid": "0000fff1-0000-1000-8000-00805f9b34fb",
                  "properties": ["read", "notify"],
                  "descriptors": ["00002902-0000-1000-8000-00805f9b34fb"] },
                { "uuid": "0000fff2-0000-1000-8000-00805f9b34fb",
                  "properties": ["write", "write-without-response"], "descriptors": [] },
                { "uuid": "0000fff3-0000-1000-8000-00805f9b34fb",
                  "properties": ["write-without-response"], "descriptors": [] }
            ]
        }
    }
}"#;

const READ: PropertyFlags = PropertyFlags {
    read: true,
    write: false,
    write_without_response: false,
    notify: false,
    indicate: false,
};

fn characteristic(
    uuid: Uuid,
    description: Option<&str>,
    properties: PropertyFlags,
    first_handle: Handle,
    with_cccd: bool,
    initial_value: Option<&[u8]>,
) -> CharacteristicDescriptor {
    let descriptors = if with_cccd {
        vec![DescriptorDescriptor {
            uuid: CCCD_UUID,
            victim_handle: first_handle + 2,
            target_handle: None,
            synthesized: false,
        }]
    } else {
        Vec::new()
    };
    CharacteristicDescriptor {
        uuid,
        description: description.map(str::to_string),
        properties,
        descriptors,
        declaration_handle: first_handle,
        victim_handle: first_handle + 1,
        target_handle: None,
        initial_value: initial_value.map(<[u8]>::to_vec),
    }
}

/// Unbound profile of the reference device
pub fn vendor_profile() -> DeviceProfile {
    let services = vec![
        ServiceDescriptor {
            uuid: uuid_from_u16(0x1800),
            description: Some("Generic Access".into()),
            handle: 0x0010,
            characteristics: vec![characteristic(
                DEVICE_NAME_CHAR,
                Some("Device Name"),
                READ,
                0x0011,
                false,
                None,
            )],
        },
        ServiceDescriptor {
            uuid: DEVICE_INFO_SERVICE,
            description: Some("Device Information".into()),
            handle: 0x0013,
            characteristics: vec![characteristic(
                MANUFACTURER_CHAR,
                Some("Manufacturer Name String"),
                READ,
                0x0014,
                false,
                Some(b"OAT"),
            )],
        },
        ServiceDescriptor {
            uuid: VENDOR_SERVICE,
            description: Some("Vendor specific".into()),
            handle: 0x0016,
            characteristics: vec![
                characteristic(
                    NOTIFY_CHAR,
                    None,
                    PropertyFlags {
                        notify: true,
                        ..READ
                    },
                    0x0017,
                    true,
                    None,
                ),
                characteristic(
                    WRITE_CHAR,
                    None,
                    PropertyFlags {
                        write: true,
                        write_without_response: true,
                        ..Default::default()
                    },
                    0x001A,
                    false,
                    None,
                ),
                characteristic(
                    COMMAND_CHAR,
                    None,
                    PropertyFlags {
                        write_without_response: true,
                        ..Default::default()
                    },
                    0x001C,
                    false,
                    None,
                ),
            ],
        },
    ];

    DeviceProfile {
        name: Some(DEVICE_NAME.into()),
        address: Some(DEVICE_ADDRESS),
        address_type: AddressType::Public,
        mtu: Some(247),
        io_capability: IoCapability::NoInputNoOutput,
        advertisement: AdvertisementData::synthesize(
            Some(DEVICE_NAME),
            &[DEVICE_INFO_SERVICE, VENDOR_SERVICE],
        ),
        advertisement_captured: false,
        services,
    }
}

/// Single-service profile: one notifiable characteristic under Device Information
pub fn notify_only_profile() -> DeviceProfile {
    let mut profile = vendor_profile();
    profile.services = vec![ServiceDescriptor {
        uuid: DEVICE_INFO_SERVICE,
        description: Some("Device Information".into()),
        handle: 0x0010,
        characteristics: vec![characteristic(
            NOTIFY_CHAR,
            None,
            PropertyFlags {
                notify: true,
                ..READ
            },
            0x0011,
            true,
            None,
        )],
    }];
    profile.advertisement = AdvertisementData::synthesize(Some(DEVICE_NAME), &[DEVICE_INFO_SERVICE]);
    profile
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::HostCapabilities;

    #[test]
    fn test_fixture_matches_loader_output() {
        let loaded = DeviceProfile::from_json(VENDOR_PROFILE_JSON, &HostCapabilities::default())
            .expect("fixture json");
        assert_eq!(loaded, vendor_profile());
    }

    #[test]
    fn test_handle_constants() {
        let profile = vendor_profile();
        let handle_of = |uuid: &Uuid| {
            profile
                .find_characteristic(uuid)
                .map(|c| c.victim_handle)
                .expect("characteristic")
        };
        assert_eq!(handle_of(&DEVICE_NAME_CHAR), DEVICE_NAME_HANDLE);
        assert_eq!(handle_of(&MANUFACTURER_CHAR), MANUFACTURER_HANDLE);
        assert_eq!(handle_of(&NOTIFY_CHAR), NOTIFY_HANDLE);
        assert_eq!(handle_of(&WRITE_CHAR), WRITE_HANDLE);
        assert_eq!(handle_of(&COMMAND_CHAR), COMMAND_HANDLE);
        assert_eq!(
            profile
                .find_characteristic(&NOTIFY_CHAR)
                .and_then(|c| c.cccd())
                .map(|d| d.victim_handle),
            Some(NOTIFY_CCCD_HANDLE)
        );
    }
}
