// Central-role backend on btleplug
//
// btleplug addresses attributes by UUID, not by handle. Handles are synthesized
// at discovery, walking btleplug's sets in UUID order: one per service, a
// declaration plus a value handle per characteristic, one per descriptor.
// They need not match the device's real ATT handles; recorded profile handles
// are rebound to these by UUID.

use async_trait::async_trait;
use blerelay_core::gatt::{GattError, Handle};
use blerelay_core::topology::{LiveCharacteristic, LiveDescriptor, LiveService, PeerAddress, PropertyFlags};
use blerelay_core::upstream::{CentralBridge, CentralEvent, UpstreamError};
use btleplug::api::{
    BDAddr, Central as _, CentralEvent as AdapterEvent, CharPropFlags, Characteristic, Descriptor,
    Manager as _, Peripheral as _, ScanFilter, Service, ValueNotification, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::stream::{BoxStream, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

const SCAN_POLL: Duration = Duration::from_millis(250);
const FIRST_HANDLE: Handle = 0x0001;

#[derive(Debug, Clone)]
enum Attribute {
    Value(Characteristic),
    Descriptor(Descriptor),
}

/// (service UUID, characteristic UUID) to synthesized value handle
type NotifyIndex = Arc<RwLock<HashMap<(Uuid, Uuid), Handle>>>;

struct Link {
    peripheral: Peripheral,
    attributes: HashMap<Handle, Attribute>,
    pump: JoinHandle<()>,
}

pub struct BtleplugCentral {
    adapter: Adapter,
    link: Mutex<Option<Link>>,
    notify_index: NotifyIndex,
}

impl BtleplugCentral {
    /// Open the adapter whose name starts with `name`, or the first one
    pub async fn open(name: Option<&str>) -> Result<Self, UpstreamError> {
        let manager = Manager::new().await.map_err(unavailable)?;
        let adapters = manager.adapters().await.map_err(unavailable)?;

        let mut selected = None;
        for adapter in adapters {
            let info = adapter.adapter_info().await.map_err(unavailable)?;
            debug!("Found adapter {}", info);
            match name {
                Some(wanted) if !info.starts_with(wanted) => continue,
                _ => {
                    info!("Using central adapter {}", info);
                    selected = Some(adapter);
                    break;
                }
            }
        }

        let adapter = selected.ok_or_else(|| {
            UpstreamError::AdapterUnavailable(match name {
                Some(wanted) => format!("no adapter named {}", wanted),
                None => "no Bluetooth adapter found".into(),
            })
        })?;

        Ok(Self {
            adapter,
            link: Mutex::new(None),
            notify_index: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Scan until the peripheral shows up; the caller bounds how long
    async fn find(&self, address: &PeerAddress) -> Result<Peripheral, UpstreamError> {
        let wanted = BDAddr::from(address.0);
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(unavailable)?;
        info!("Scanning for {}", address);

        loop {
            for peripheral in self.adapter.peripherals().await.map_err(platform)? {
                if peripheral.address() == wanted {
                    if let Err(e) = self.adapter.stop_scan().await {
                        debug!("Failed to stop scan: {}", e);
                    }
                    return Ok(peripheral);
                }
            }
            tokio::time::sleep(SCAN_POLL).await;
        }
    }

    fn peripheral(&self) -> Result<Peripheral, UpstreamError> {
        self.link
            .lock()
            .as_ref()
            .map(|link| link.peripheral.clone())
            .ok_or_else(|| UpstreamError::Platform("not connected".into()))
    }

    fn attribute(&self, handle: Handle) -> Result<(Peripheral, Attribute), UpstreamError> {
        let link = self.link.lock();
        let link = link
            .as_ref()
            .ok_or_else(|| UpstreamError::Platform("not connected".into()))?;
        let attribute = link.attributes.get(&handle).cloned().ok_or_else(|| {
            UpstreamError::Platform(format!("no attribute at 0x{:04X}", handle))
        })?;
        Ok((link.peripheral.clone(), attribute))
    }

    fn characteristic(&self, handle: Handle) -> Result<(Peripheral, Characteristic), UpstreamError> {
        match self.attribute(handle)? {
            (peripheral, Attribute::Value(characteristic)) => Ok((peripheral, characteristic)),
            (_, Attribute::Descriptor(_)) => Err(UpstreamError::Platform(format!(
                "0x{:04X} is a descriptor",
                handle
            ))),
        }
    }
}

#[async_trait]
impl CentralBridge for BtleplugCentral {
    async fn connect(
        &self,
        address: &PeerAddress,
    ) -> Result<mpsc::UnboundedReceiver<CentralEvent>, UpstreamError> {
        let peripheral = self.find(address).await?;
        peripheral
            .connect()
            .await
            .map_err(|e| UpstreamError::ConnectRefused {
                address: *address,
                reason: e.to_string(),
            })?;

        let notifications = peripheral.notifications().await.map_err(platform)?;
        let adapter_events = self.adapter.events().await.map_err(platform)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let pump = tokio::spawn(pump_events(
            peripheral.id(),
            notifications,
            adapter_events,
            self.notify_index.clone(),
            tx,
        ));

        let previous = self.link.lock().replace(Link {
            peripheral,
            attributes: HashMap::new(),
            pump,
        });
        if let Some(previous) = previous {
            previous.pump.abort();
        }
        info!("Connected to {}", address);
        Ok(rx)
    }

    async fn discover(&self) -> Result<Vec<LiveService>, UpstreamError> {
        let peripheral = self.peripheral()?;
        peripheral
            .discover_services()
            .await
            .map_err(|e| UpstreamError::ServiceDiscovery(e.to_string()))?;

        let Layout {
            live,
            attributes,
            notify_index,
        } = layout(peripheral.services());
        debug!("Discovered {} services, {} attributes", live.len(), attributes.len());
        *self.notify_index.write() = notify_index;
        if let Some(link) = self.link.lock().as_mut() {
            link.attributes = attributes;
        }
        Ok(live)
    }

    async fn read(&self, handle: Handle) -> Result<Vec<u8>, UpstreamError> {
        match self.attribute(handle)? {
            (peripheral, Attribute::Value(characteristic)) => {
                peripheral.read(&characteristic).await.map_err(gatt)
            }
            (peripheral, Attribute::Descriptor(descriptor)) => {
                peripheral.read_descriptor(&descriptor).await.map_err(gatt)
            }
        }
    }

    async fn write(
        &self,
        handle: Handle,
        value: &[u8],
        with_response: bool,
    ) -> Result<(), UpstreamError> {
        let kind = if with_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        match self.attribute(handle)? {
            (peripheral, Attribute::Value(characteristic)) => {
                peripheral.write(&characteristic, value, kind).await.map_err(gatt)
            }
            (peripheral, Attribute::Descriptor(descriptor)) => {
                peripheral.write_descriptor(&descriptor, value).await.map_err(gatt)
            }
        }
    }

    async fn subscribe(&self, handle: Handle) -> Result<(), UpstreamError> {
        let (peripheral, characteristic) = self.characteristic(handle)?;
        peripheral.subscribe(&characteristic).await.map_err(gatt)
    }

    async fn unsubscribe(&self, handle: Handle) -> Result<(), UpstreamError> {
        let (peripheral, characteristic) = self.characteristic(handle)?;
        peripheral.unsubscribe(&characteristic).await.map_err(gatt)
    }

    async fn disconnect(&self) -> Result<(), UpstreamError> {
        // A connect cancelled by its deadline may still be scanning
        if let Err(e) = self.adapter.stop_scan().await {
            debug!("Failed to stop scan: {}", e);
        }
        let Some(link) = self.link.lock().take() else {
            return Ok(());
        };
        link.pump.abort();
        self.notify_index.write().clear();
        link.peripheral.disconnect().await.map_err(platform)
    }
}

async fn pump_events(
    id: PeripheralId,
    mut notifications: BoxStream<'static, ValueNotification>,
    mut adapter_events: BoxStream<'static, AdapterEvent>,
    notify_index: NotifyIndex,
    tx: mpsc::UnboundedSender<CentralEvent>,
) {
    loop {
        tokio::select! {
            Some(notification) = notifications.next() => {
                let key = (notification.service_uuid, notification.uuid);
                let Some(handle) = notify_index.read().get(&key).copied() else {
                    warn!("Notification from undiscovered characteristic {}", notification.uuid);
                    continue;
                };
                let event = CentralEvent::Notification {
                    handle,
                    value: notification.value,
                };
                if tx.send(event).is_err() {
                    return;
                }
            }
            Some(event) = adapter_events.next() => {
                if matches!(&event, AdapterEvent::DeviceDisconnected(gone) if *gone == id) {
                    let _ = tx.send(CentralEvent::Disconnected);
                    return;
                }
            }
            else => {
                let _ = tx.send(CentralEvent::Disconnected);
                return;
            }
        }
    }
}

fn property_flags(flags: CharPropFlags) -> PropertyFlags {
    PropertyFlags {
        read: flags.contains(CharPropFlags::READ),
        write: flags.contains(CharPropFlags::WRITE),
        write_without_response: flags.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
        notify: flags.contains(CharPropFlags::NOTIFY),
        indicate: flags.contains(CharPropFlags::INDICATE),
    }
}

fn unavailable(e: btleplug::Error) -> UpstreamError {
    UpstreamError::AdapterUnavailable(e.to_string())
}

fn platform(e: btleplug::Error) -> UpstreamError {
    UpstreamError::Platform(e.to_string())
}

/// btleplug does not surface ATT error codes; timeouts are the one it names
fn gatt(e: btleplug::Error) -> UpstreamError {
    match e {
        btleplug::Error::TimedOut(_) => UpstreamError::Gatt(GattError::timeout()),
        other => platform(other),
    }
}

struct Layout {
    live: Vec<LiveService>,
    attributes: HashMap<Handle, Attribute>,
    notify_index: HashMap<(Uuid, Uuid), Handle>,
}

fn layout(services: BTreeSet<Service>) -> Layout {
    let mut next = FIRST_HANDLE;
    let mut attributes = HashMap::new();
    let mut notify_index = HashMap::new();
    let mut live = Vec::new();

    for service in services {
        next += 1;
        let mut characteristics = Vec::new();
        for characteristic in &service.characteristics {
            let value_handle = next + 1;
            next += 2;

            let mut descriptors = Vec::new();
            for descriptor in &characteristic.descriptors {
                descriptors.push(LiveDescriptor {
                    uuid: descriptor.uuid,
                    handle: next,
                });
                attributes.insert(next, Attribute::Descriptor(descriptor.clone()));
                next += 1;
            }

            notify_index.insert((service.uuid, characteristic.uuid), value_handle);
            attributes.insert(value_handle, Attribute::Value(characteristic.clone()));
            characteristics.push(LiveCharacteristic {
                uuid: characteristic.uuid,
                handle: value_handle,
                properties: property_flags(characteristic.properties),
                descriptors,
            });
        }
        live.push(LiveService {
            uuid: service.uuid,
            characteristics,
        });
    }

    Layout {
        live,
        attributes,
        notify_index,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blerelay_core::topology::uuid_from_u16;

    #[test]
    fn test_property_flags_mapping() {
        let flags = property_flags(CharPropFlags::READ | CharPropFlags::NOTIFY);
        assert_eq!(
            flags,
            PropertyFlags {
                read: true,
                notify: true,
                ..Default::default()
            }
        );
        assert!(property_flags(CharPropFlags::WRITE_WITHOUT_RESPONSE).is_writable());
    }

    #[test]
    fn test_timeout_maps_to_gatt_timeout() {
        let err = gatt(btleplug::Error::TimedOut(Duration::from_secs(1)));
        assert_eq!(err, UpstreamError::Gatt(GattError::timeout()));
        assert!(matches!(
            gatt(btleplug::Error::NotConnected),
            UpstreamError::Platform(_)
        ));
    }

    fn characteristic(service: Uuid, uuid: Uuid, descriptors: &[Uuid]) -> Characteristic {
        Characteristic {
            uuid,
            service_uuid: service,
            properties: CharPropFlags::READ | CharPropFlags::NOTIFY,
            descriptors: descriptors
                .iter()
                .map(|d| Descriptor {
                    uuid: *d,
                    service_uuid: service,
                    characteristic_uuid: uuid,
                })
                .collect(),
        }
    }

    #[test]
    fn test_layout_follows_uuid_order() {
        let (battery, heart_rate) = (uuid_from_u16(0x180F), uuid_from_u16(0x180D));
        let services: BTreeSet<Service> = [
            Service {
                uuid: battery,
                primary: true,
                characteristics: [characteristic(battery, uuid_from_u16(0x2A19), &[uuid_from_u16(0x2902)])]
                    .into_iter()
                    .collect(),
            },
            Service {
                uuid: heart_rate,
                primary: true,
                characteristics: [
                    characteristic(heart_rate, uuid_from_u16(0x2A38), &[]),
                    characteristic(heart_rate, uuid_from_u16(0x2A37), &[uuid_from_u16(0x2902)]),
                ]
                .into_iter()
                .collect(),
            },
        ]
        .into_iter()
        .collect();

        let layout = layout(services);
        let handles: Vec<(Uuid, Handle, Vec<Handle>)> = layout
            .live
            .iter()
            .flat_map(|s| &s.characteristics)
            .map(|c| (c.uuid, c.handle, c.descriptors.iter().map(|d| d.handle).collect()))
            .collect();

        // 0x180D sorts before 0x180F, 0x2A37 before 0x2A38
        assert_eq!(layout.live[0].uuid, heart_rate);
        assert_eq!(
            handles,
            vec![
                (uuid_from_u16(0x2A37), 0x0003, vec![0x0004]),
                (uuid_from_u16(0x2A38), 0x0006, vec![]),
                (uuid_from_u16(0x2A19), 0x0009, vec![0x000A]),
            ]
        );
        assert_eq!(layout.notify_index[&(battery, uuid_from_u16(0x2A19))], 0x0009);
        assert!(matches!(layout.attributes[&0x0004], Attribute::Descriptor(_)));
    }
}
