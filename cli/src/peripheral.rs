// Peripheral-role backend on BlueZ (bluer)
//
// Every GATT callback BlueZ makes becomes a `PeripheralEvent` and parks until
// the relay answers through `respond`. BlueZ manages CCCDs itself, so victim
// subscriptions arrive as `SubscriptionChanged` from the notify callbacks.
// Attribute handles on air are allocated by BlueZ; the handles in events are
// the profile's victim handles captured by each callback.

use async_trait::async_trait;
use blerelay_core::downstream::{DisconnectReason, DownstreamError, PeripheralBridge, PeripheralEvent};
use blerelay_core::gatt::{GattErrorCode, GattResponse, Handle, RequestId, WriteKind};
use blerelay_core::pairing::{PairingDecision, PairingMethod};
use blerelay_core::topology::{uuid_from_u16, AdvertisementData, CharacteristicDescriptor, DeviceProfile, PeerAddress};
use bluer::adv::{Advertisement, AdvertisementHandle, Type as AdvertisementType};
use bluer::agent::{
    Agent, AgentHandle, ReqError as AgentReqError, RequestAuthorization, RequestConfirmation,
    RequestPasskey, RequestPinCode,
};
use bluer::gatt::local::{
    Application, ApplicationHandle, Characteristic, CharacteristicNotifier, CharacteristicNotify,
    CharacteristicNotifyMethod, CharacteristicRead, CharacteristicReadRequest, CharacteristicWrite,
    CharacteristicWriteMethod, CharacteristicWriteRequest, Descriptor, DescriptorRead,
    DescriptorReadRequest, ReqError, Service,
};
use bluer::gatt::WriteOp;
use bluer::{Adapter, AdapterEvent, Address, DeviceEvent, DeviceProperty, Session};
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

// ============================================================================
// SHARED CALLBACK STATE
// ============================================================================

/// State reachable from BlueZ callbacks
struct Shared {
    events: mpsc::UnboundedSender<PeripheralEvent>,
    next_id: AtomicU64,
    requests: Mutex<HashMap<RequestId, oneshot::Sender<GattResponse>>>,
    pairings: Mutex<HashMap<RequestId, (PeerAddress, oneshot::Sender<PairingDecision>)>>,
    notifiers: tokio::sync::Mutex<HashMap<Handle, CharacteristicNotifier>>,
    /// Devices that are not the victim (the relay's own upstream target)
    ignored: Vec<PeerAddress>,
}

impl Shared {
    fn emit(&self, event: PeripheralEvent) {
        if self.events.send(event).is_err() {
            debug!("Peripheral event dropped; relay no longer listening");
        }
    }

    fn next_id(&self) -> RequestId {
        RequestId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Raise a request and wait for the relay's answer
    async fn request(&self, event: impl FnOnce(RequestId) -> PeripheralEvent) -> Option<GattResponse> {
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        self.requests.lock().insert(id, tx);
        self.emit(event(id));
        rx.await.ok()
    }

    async fn read(&self, handle: Handle, offset: u16) -> Result<Vec<u8>, ReqError> {
        match self
            .request(|id| PeripheralEvent::Read { id, handle, offset })
            .await
        {
            Some(GattResponse::Value(value)) => Ok(value),
            Some(GattResponse::Error(code)) => Err(req_error(code)),
            Some(GattResponse::WriteAck) => Ok(Vec::new()),
            None => Err(ReqError::Failed),
        }
    }

    async fn write(
        &self,
        handle: Handle,
        value: Vec<u8>,
        request: CharacteristicWriteRequest,
    ) -> Result<(), ReqError> {
        let kind = match request.op_type {
            WriteOp::Command => WriteKind::Command,
            WriteOp::Request | WriteOp::Reliable => WriteKind::Request,
        };
        let offset = request.offset;

        if kind == WriteKind::Command {
            // Commands are never answered
            let id = self.next_id();
            self.emit(PeripheralEvent::Write {
                id,
                handle,
                value,
                kind,
                offset,
            });
            return Ok(());
        }

        match self
            .request(|id| PeripheralEvent::Write {
                id,
                handle,
                value,
                kind,
                offset,
            })
            .await
        {
            Some(GattResponse::Error(code)) => Err(req_error(code)),
            Some(_) => Ok(()),
            None => Err(ReqError::Failed),
        }
    }

    async fn subscribed(&self, handle: Handle, notifier: CharacteristicNotifier) {
        let indicate = notifier.confirming();
        self.notifiers.lock().await.insert(handle, notifier);
        self.emit(PeripheralEvent::SubscriptionChanged {
            handle,
            enabled: true,
            indicate,
        });
    }

    /// Ask the relay how to answer a pairing attempt; true when accepted
    async fn pair(&self, device: Address, method: PairingMethod) -> bool {
        let peer = PeerAddress(device.0);
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        self.pairings.lock().insert(id, (peer, tx));
        self.emit(PeripheralEvent::PairingRequest { id, peer, method });
        matches!(rx.await, Ok(PairingDecision::Accept))
    }
}

/// BlueZ offers no ATT 0x05/0x0F reply to a callback, so the pairing gate's
/// `InsufficientAuthentication` goes out as Insufficient Authorization (0x08).
/// Victims do not start pairing on 0x08; gated characteristics therefore carry
/// BlueZ's encrypt flags and BlueZ itself refuses unencrypted access.
fn req_error(code: GattErrorCode) -> ReqError {
    match code {
        GattErrorCode::ReadNotPermitted | GattErrorCode::WriteNotPermitted => ReqError::NotPermitted,
        GattErrorCode::InvalidOffset => ReqError::InvalidOffset,
        GattErrorCode::InvalidAttributeValueLength => ReqError::InvalidValueLength,
        GattErrorCode::InsufficientAuthentication
        | GattErrorCode::InsufficientAuthorization
        | GattErrorCode::InsufficientEncryption => ReqError::NotAuthorized,
        GattErrorCode::RequestNotSupported => ReqError::NotSupported,
        _ => ReqError::Failed,
    }
}

// ============================================================================
// BLUEZ PERIPHERAL
// ============================================================================

pub struct BluezPeripheral {
    // Dropping the session unregisters the agent and application
    _session: Session,
    adapter: Adapter,
    shared: Arc<Shared>,
    events: Mutex<Option<mpsc::UnboundedReceiver<PeripheralEvent>>>,
    application: Mutex<Option<ApplicationHandle>>,
    advertisement: Mutex<Option<AdvertisementHandle>>,
    /// Non-mandatory attributes need an encrypted link
    require_encryption: bool,
    _agent: AgentHandle,
    monitor: JoinHandle<()>,
}

impl BluezPeripheral {
    /// Power the adapter, register the pairing agent and start watching devices.
    ///
    /// `ignored` lists addresses whose connections are not the victim's, such
    /// as the upstream target when both roles share one adapter.
    /// `require_encryption` mirrors the relay's pairing gate onto BlueZ.
    pub async fn open(
        adapter_name: Option<&str>,
        ignored: Vec<PeerAddress>,
        require_encryption: bool,
    ) -> Result<Self, DownstreamError> {
        let session = Session::new().await.map_err(unavailable)?;
        let adapter = match adapter_name {
            Some(name) => session.adapter(name).map_err(unavailable)?,
            None => session.default_adapter().await.map_err(unavailable)?,
        };
        adapter.set_powered(true).await.map_err(unavailable)?;
        adapter.set_pairable(true).await.map_err(unavailable)?;
        info!(
            "Using peripheral adapter {} ({})",
            adapter.name(),
            adapter.address().await.map_err(unavailable)?
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            events: tx,
            next_id: AtomicU64::new(1),
            requests: Mutex::new(HashMap::new()),
            pairings: Mutex::new(HashMap::new()),
            notifiers: tokio::sync::Mutex::new(HashMap::new()),
            ignored,
        });

        let agent = session
            .register_agent(pairing_agent(shared.clone()))
            .await
            .map_err(unavailable)?;
        let monitor = tokio::spawn(monitor_devices(adapter.clone(), shared.clone()));

        Ok(Self {
            _session: session,
            adapter,
            shared,
            events: Mutex::new(Some(rx)),
            application: Mutex::new(None),
            advertisement: Mutex::new(None),
            require_encryption,
            _agent: agent,
            monitor,
        })
    }
}

impl Drop for BluezPeripheral {
    fn drop(&mut self) {
        self.monitor.abort();
    }
}

#[async_trait]
impl PeripheralBridge for BluezPeripheral {
    async fn serve(&self, profile: &DeviceProfile) -> Result<(), DownstreamError> {
        let services = profile
            .services
            .iter()
            .map(|service| {
                let encrypt = self.require_encryption && !service.is_mandatory();
                Service {
                    uuid: service.uuid,
                    primary: true,
                    characteristics: service
                        .characteristics
                        .iter()
                        .map(|c| characteristic(&self.shared, c, encrypt))
                        .collect(),
                    ..Default::default()
                }
            })
            .collect();

        let application = Application {
            services,
            ..Default::default()
        };
        let handle = self
            .adapter
            .serve_gatt_application(application)
            .await
            .map_err(|e| DownstreamError::AdapterUnavailable(e.to_string()))?;
        *self.application.lock() = Some(handle);
        info!("GATT database registered with BlueZ");
        Ok(())
    }

    async fn start_advertising(
        &self,
        advertisement: &AdvertisementData,
    ) -> Result<(), DownstreamError> {
        let advertisement = bluez_advertisement(advertisement);
        let handle = self
            .adapter
            .advertise(advertisement)
            .await
            .map_err(|e| DownstreamError::AdapterUnavailable(e.to_string()))?;
        *self.advertisement.lock() = Some(handle);
        Ok(())
    }

    async fn stop_advertising(&self) -> Result<(), DownstreamError> {
        // Dropping the handle unregisters the advertisement
        self.advertisement.lock().take();
        Ok(())
    }

    async fn respond(&self, id: RequestId, response: GattResponse) -> Result<(), DownstreamError> {
        match self.shared.requests.lock().remove(&id) {
            Some(waiter) => {
                if waiter.send(response).is_err() {
                    debug!("BlueZ abandoned request {}", id);
                }
            }
            None => debug!("No BlueZ callback waiting for request {}", id),
        }
        Ok(())
    }

    async fn pairing_response(
        &self,
        id: RequestId,
        decision: PairingDecision,
    ) -> Result<(), DownstreamError> {
        let Some((peer, waiter)) = self.shared.pairings.lock().remove(&id) else {
            debug!("No pairing request {} pending", id);
            return Ok(());
        };
        let _ = waiter.send(decision);
        if decision != PairingDecision::Accept {
            self.shared.emit(PeripheralEvent::PairingComplete {
                peer,
                success: false,
            });
        }
        Ok(())
    }

    async fn notify(
        &self,
        handle: Handle,
        value: &[u8],
        _indicate: bool,
    ) -> Result<(), DownstreamError> {
        let mut notifiers = self.shared.notifiers.lock().await;
        let notifier = notifiers
            .get_mut(&handle)
            .ok_or(DownstreamError::NotConnected)?;
        if !notifier.is_stopped() {
            return notifier
                .notify(value.to_vec())
                .await
                .map_err(|e| DownstreamError::Platform(e.to_string()));
        }

        // The victim unsubscribed since the last notification
        notifiers.remove(&handle);
        self.shared.emit(PeripheralEvent::SubscriptionChanged {
            handle,
            enabled: false,
            indicate: false,
        });
        Ok(())
    }

    async fn disconnect(
        &self,
        peer: &PeerAddress,
        reason: DisconnectReason,
    ) -> Result<(), DownstreamError> {
        // BlueZ always reports Remote User Terminated on the air
        debug!("Disconnecting {} (wanted reason 0x{:02X})", peer, reason.hci_code());
        let device = self
            .adapter
            .device(Address::new(peer.0))
            .map_err(|e| DownstreamError::Platform(e.to_string()))?;
        device
            .disconnect()
            .await
            .map_err(|e| DownstreamError::Platform(e.to_string()))
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PeripheralEvent>> {
        self.events.lock().take()
    }
}

fn characteristic(
    shared: &Arc<Shared>,
    descriptor: &CharacteristicDescriptor,
    encrypt: bool,
) -> Characteristic {
    let handle = descriptor.victim_handle;
    let flags = descriptor.properties;

    let read = flags.read.then(|| {
        let shared = shared.clone();
        CharacteristicRead {
            read: true,
            encrypt_read: encrypt,
            fun: Box::new(move |request: CharacteristicReadRequest| {
                let shared = shared.clone();
                Box::pin(async move { shared.read(handle, request.offset).await })
            }),
            ..Default::default()
        }
    });

    let write = flags.is_writable().then(|| {
        let shared = shared.clone();
        CharacteristicWrite {
            write: flags.write,
            write_without_response: flags.write_without_response,
            encrypt_write: encrypt,
            method: CharacteristicWriteMethod::Fun(Box::new(
                move |value, request: CharacteristicWriteRequest| {
                    let shared = shared.clone();
                    Box::pin(async move { shared.write(handle, value, request).await })
                },
            )),
            ..Default::default()
        }
    });

    let notify = flags.is_subscribable().then(|| {
        let shared = shared.clone();
        CharacteristicNotify {
            notify: flags.notify,
            indicate: flags.indicate,
            method: CharacteristicNotifyMethod::Fun(Box::new(move |notifier| {
                let shared = shared.clone();
                Box::pin(async move { shared.subscribed(handle, notifier).await })
            })),
            ..Default::default()
        }
    });

    let descriptors = descriptor
        .descriptors
        .iter()
        .filter(|d| !d.is_cccd())
        .map(|d| {
            let shared = shared.clone();
            let handle = d.victim_handle;
            Descriptor {
                uuid: d.uuid,
                read: Some(DescriptorRead {
                    read: true,
                    encrypt_read: encrypt,
                    fun: Box::new(move |request: DescriptorReadRequest| {
                        let shared = shared.clone();
                        Box::pin(async move { shared.read(handle, request.offset).await })
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }
        })
        .collect();

    Characteristic {
        uuid: descriptor.uuid,
        read,
        write,
        notify,
        descriptors,
        ..Default::default()
    }
}

// ============================================================================
// PAIRING AGENT
// ============================================================================

/// Agent that lets the relay's pairing policy decide.
///
/// Just Works (authorization) and numeric comparison (confirmation) follow the
/// decision. PIN and passkey requests are always refused since the relay has
/// no input to offer.
fn pairing_agent(shared: Arc<Shared>) -> Agent {
    let authorization = shared.clone();
    let confirmation = shared.clone();
    let pin = shared.clone();
    let passkey = shared;

    Agent {
        request_default: true,
        request_authorization: Some(Box::new(move |request: RequestAuthorization| {
            let shared = authorization.clone();
            Box::pin(async move {
                if shared.pair(request.device, PairingMethod::JustWorks).await {
                    Ok(())
                } else {
                    Err(AgentReqError::Rejected)
                }
            })
        })),
        request_confirmation: Some(Box::new(move |request: RequestConfirmation| {
            let shared = confirmation.clone();
            Box::pin(async move {
                if shared
                    .pair(request.device, PairingMethod::NumericComparison)
                    .await
                {
                    Ok(())
                } else {
                    Err(AgentReqError::Rejected)
                }
            })
        })),
        request_pin_code: Some(Box::new(move |request: RequestPinCode| {
            let shared = pin.clone();
            Box::pin(async move {
                if shared.pair(request.device, PairingMethod::LegacyPin).await {
                    warn!("Pairing policy accepted a PIN request; no PIN to offer");
                }
                Err(AgentReqError::Rejected)
            })
        })),
        request_passkey: Some(Box::new(move |request: RequestPasskey| {
            let shared = passkey.clone();
            Box::pin(async move {
                if shared.pair(request.device, PairingMethod::PasskeyEntry).await {
                    warn!("Pairing policy accepted a passkey request; no passkey to offer");
                }
                Err(AgentReqError::Rejected)
            })
        })),
        ..Default::default()
    }
}

// ============================================================================
// DEVICE MONITOR
// ============================================================================

async fn monitor_devices(adapter: Adapter, shared: Arc<Shared>) {
    let events = match adapter.events().await {
        Ok(events) => events,
        Err(e) => {
            error!("Cannot watch adapter events: {}", e);
            return;
        }
    };
    let mut events = Box::pin(events);
    let mut watchers: HashMap<Address, JoinHandle<()>> = HashMap::new();

    match adapter.device_addresses().await {
        Ok(known) => {
            for address in known {
                watch(&adapter, &shared, &mut watchers, address);
            }
        }
        Err(e) => warn!("Cannot list known devices: {}", e),
    }

    while let Some(event) = events.next().await {
        match event {
            AdapterEvent::DeviceAdded(address) => watch(&adapter, &shared, &mut watchers, address),
            AdapterEvent::DeviceRemoved(address) => {
                if let Some(watcher) = watchers.remove(&address) {
                    watcher.abort();
                }
            }
            _ => {}
        }
    }
}

fn watch(
    adapter: &Adapter,
    shared: &Arc<Shared>,
    watchers: &mut HashMap<Address, JoinHandle<()>>,
    address: Address,
) {
    let peer = PeerAddress(address.0);
    if shared.ignored.contains(&peer) || watchers.contains_key(&address) {
        return;
    }
    let device = match adapter.device(address) {
        Ok(device) => device,
        Err(e) => {
            warn!("Cannot watch device {}: {}", address, e);
            return;
        }
    };
    let shared = shared.clone();
    watchers.insert(
        address,
        tokio::spawn(async move {
            let events = match device.events().await {
                Ok(events) => events,
                Err(e) => {
                    warn!("Cannot watch device {}: {}", peer, e);
                    return;
                }
            };
            let mut events = Box::pin(events);
            while let Some(event) = events.next().await {
                match event {
                    DeviceEvent::PropertyChanged(DeviceProperty::Connected(true)) => {
                        shared.emit(PeripheralEvent::Connected(peer))
                    }
                    DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) => {
                        shared.emit(PeripheralEvent::Disconnected(peer))
                    }
                    DeviceEvent::PropertyChanged(DeviceProperty::Paired(true)) => {
                        shared.emit(PeripheralEvent::PairingComplete {
                            peer,
                            success: true,
                        })
                    }
                    _ => {}
                }
            }
        }),
    );
}

fn unavailable(e: bluer::Error) -> DownstreamError {
    DownstreamError::AdapterUnavailable(e.to_string())
}

const FLAG_GENERAL_DISCOVERABLE: u8 = 0x02;

/// AD types BlueZ builds from dedicated properties and refuses as raw data
const BLUEZ_MANAGED_AD_TYPES: &[u8] = &[
    0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0D, 0x0E, 0x0F, 0x10, 0x11,
    0x14, 0x15, 0x16, 0x19, 0x1F, 0x20, 0x21, 0xFF,
];

/// Advertisement for BlueZ. Flags only reach the air through the general
/// discoverable bit; other uninterpreted structures ride as raw AD data.
fn bluez_advertisement(data: &AdvertisementData) -> Advertisement {
    let mut raw = BTreeMap::new();
    for (ad_type, body) in &data.other {
        if BLUEZ_MANAGED_AD_TYPES.contains(ad_type) {
            debug!("BlueZ will not carry AD type {:#04x}, dropped", ad_type);
            continue;
        }
        raw.entry(*ad_type).or_insert_with(|| body.clone());
    }

    Advertisement {
        advertisement_type: AdvertisementType::Peripheral,
        service_uuids: data.service_uuids.iter().copied().collect(),
        manufacturer_data: data.manufacturer_data.clone(),
        service_data: data
            .service_data
            .iter()
            .map(|(uuid, data)| (uuid_from_u16(*uuid), data.clone()))
            .collect(),
        advertisting_data: raw,
        local_name: data.local_name.clone(),
        appearance: data.appearance,
        tx_power: data.tx_power.map(i16::from),
        discoverable: Some(
            data.flags
                .map_or(true, |flags| flags & FLAG_GENERAL_DISCOVERABLE != 0),
        ),
        ..Default::default()
    }
}
