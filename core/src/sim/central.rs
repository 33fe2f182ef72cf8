// Simulated real device, driven through the CentralBridge seam

use crate::gatt::{GattError, GattErrorCode, Handle};
use crate::topology::{
    DeviceProfile, LiveCharacteristic, LiveDescriptor, LiveService, PeerAddress,
};
use crate::upstream::{CentralBridge, CentralEvent, UpstreamError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// First target-facing handle the simulated device uses
pub const SIM_TARGET_HANDLE_BASE: Handle = 0x0100;

#[derive(Debug, Clone, PartialEq, Eq)]
enum ConnectBehavior {
    Accept,
    Refuse(String),
    /// Never completes
    Hang,
}

#[derive(Debug)]
struct CentralState {
    connect: ConnectBehavior,
    events: Option<mpsc::UnboundedSender<CentralEvent>>,
    values: HashMap<Handle, Vec<u8>>,
    read_delays: HashMap<Handle, Duration>,
    read_errors: HashMap<Handle, GattErrorCode>,
    subscribe_errors: HashMap<Handle, GattErrorCode>,
    discover_error: Option<String>,
    writes: Vec<(Handle, Vec<u8>, bool)>,
    subscriptions: HashSet<Handle>,
    subscribe_calls: usize,
    unsubscribe_calls: usize,
    connect_attempts: usize,
    disconnects: usize,
}

/// In-memory peripheral exposing a profile's topology under its own handles
pub struct SimCentral {
    services: Vec<LiveService>,
    state: Mutex<CentralState>,
}

impl SimCentral {
    /// Device with the profile's services, handles allocated from 0x0100
    pub fn from_profile(profile: &DeviceProfile) -> Self {
        let mut next = SIM_TARGET_HANDLE_BASE;
        let mut values = HashMap::new();
        let mut services = Vec::with_capacity(profile.services.len());

        for service in &profile.services {
            next += 1;
            let mut characteristics = Vec::with_capacity(service.characteristics.len());
            for c in &service.characteristics {
                let handle = next + 1;
                next += 2;
                let descriptors = c
                    .descriptors
                    .iter()
                    .map(|d| {
                        let descriptor = LiveDescriptor {
                            uuid: d.uuid,
                            handle: next,
                        };
                        next += 1;
                        descriptor
                    })
                    .collect();
                if let Some(value) = &c.initial_value {
                    values.insert(handle, value.clone());
                }
                characteristics.push(LiveCharacteristic {
                    uuid: c.uuid,
                    handle,
                    properties: c.properties,
                    descriptors,
                });
            }
            services.push(LiveService {
                uuid: service.uuid,
                characteristics,
            });
        }

        Self {
            services,
            state: Mutex::new(CentralState {
                connect: ConnectBehavior::Accept,
                events: None,
                values,
                read_delays: HashMap::new(),
                read_errors: HashMap::new(),
                subscribe_errors: HashMap::new(),
                discover_error: None,
                writes: Vec::new(),
                subscriptions: HashSet::new(),
                subscribe_calls: 0,
                unsubscribe_calls: 0,
                connect_attempts: 0,
                disconnects: 0,
            }),
        }
    }

    pub fn services(&self) -> Vec<LiveService> {
        self.services.clone()
    }

    /// Target handle of the first characteristic with `uuid`
    pub fn handle_of(&self, uuid: &Uuid) -> Option<Handle> {
        self.services
            .iter()
            .flat_map(|s| s.characteristics.iter())
            .find(|c| &c.uuid == uuid)
            .map(|c| c.handle)
    }

    pub fn set_value(&self, handle: Handle, value: impl Into<Vec<u8>>) {
        self.state.lock().values.insert(handle, value.into());
    }

    pub fn set_read_delay(&self, handle: Handle, delay: Duration) {
        self.state.lock().read_delays.insert(handle, delay);
    }

    pub fn fail_reads(&self, handle: Handle, code: GattErrorCode) {
        self.state.lock().read_errors.insert(handle, code);
    }

    /// Refuse to enable notifications on `handle` until [`Self::allow_subscriptions`]
    pub fn refuse_subscriptions(&self, handle: Handle, code: GattErrorCode) {
        self.state.lock().subscribe_errors.insert(handle, code);
    }

    pub fn allow_subscriptions(&self, handle: Handle) {
        self.state.lock().subscribe_errors.remove(&handle);
    }

    pub fn fail_discovery(&self, reason: impl Into<String>) {
        self.state.lock().discover_error = Some(reason.into());
    }

    pub fn refuse_connections(&self, reason: impl Into<String>) {
        self.state.lock().connect = ConnectBehavior::Refuse(reason.into());
    }

    /// Connection attempts never complete, as with an out-of-range device
    pub fn hang_connections(&self) {
        self.state.lock().connect = ConnectBehavior::Hang;
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().events.is_some()
    }

    /// Emit a notification; returns false when nothing is connected
    pub fn notify(&self, handle: Handle, value: impl Into<Vec<u8>>) -> bool {
        let state = self.state.lock();
        match &state.events {
            Some(events) => events
                .send(CentralEvent::Notification {
                    handle,
                    value: value.into(),
                })
                .is_ok(),
            None => false,
        }
    }

    /// Simulate the device going away (power loss, out of range)
    pub fn drop_link(&self) {
        if let Some(events) = self.state.lock().events.take() {
            let _ = events.send(CentralEvent::Disconnected);
        }
    }

    pub fn writes(&self) -> Vec<(Handle, Vec<u8>, bool)> {
        self.state.lock().writes.clone()
    }

    pub fn is_subscribed(&self, handle: Handle) -> bool {
        self.state.lock().subscriptions.contains(&handle)
    }

    /// Subscribe calls that reached the device, refused ones included
    pub fn subscribe_count(&self) -> usize {
        self.state.lock().subscribe_calls
    }

    pub fn unsubscribe_count(&self) -> usize {
        self.state.lock().unsubscribe_calls
    }

    pub fn connect_attempts(&self) -> usize {
        self.state.lock().connect_attempts
    }

    pub fn disconnects(&self) -> usize {
        self.state.lock().disconnects
    }

    fn ensure_connected(&self) -> Result<(), UpstreamError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(UpstreamError::Platform("not connected".into()))
        }
    }

    fn characteristic(&self, handle: Handle) -> Result<&LiveCharacteristic, UpstreamError> {
        self.services
            .iter()
            .flat_map(|s| s.characteristics.iter())
            .find(|c| c.handle == handle)
            .ok_or(UpstreamError::Gatt(GattError::new(GattErrorCode::InvalidHandle)))
    }
}

#[async_trait]
impl CentralBridge for SimCentral {
    async fn connect(
        &self,
        address: &PeerAddress,
    ) -> Result<mpsc::UnboundedReceiver<CentralEvent>, UpstreamError> {
        let behavior = {
            let mut state = self.state.lock();
            state.connect_attempts += 1;
            state.connect.clone()
        };
        match behavior {
            ConnectBehavior::Accept => {
                let (tx, rx) = mpsc::unbounded_channel();
                self.state.lock().events = Some(tx);
                debug!("Simulated device accepted connection from relay to {}", address);
                Ok(rx)
            }
            ConnectBehavior::Refuse(reason) => Err(UpstreamError::ConnectRefused {
                address: *address,
                reason,
            }),
            ConnectBehavior::Hang => futures::future::pending().await,
        }
    }

    async fn discover(&self) -> Result<Vec<LiveService>, UpstreamError> {
        self.ensure_connected()?;
        match self.state.lock().discover_error.clone() {
            Some(reason) => Err(UpstreamError::ServiceDiscovery(reason)),
            None => Ok(self.services.clone()),
        }
    }

    async fn read(&self, handle: Handle) -> Result<Vec<u8>, UpstreamError> {
        self.ensure_connected()?;
        let characteristic = self.characteristic(handle)?;
        if !characteristic.properties.read {
            return Err(GattError::new(GattErrorCode::ReadNotPermitted).into());
        }

        let delay = self.state.lock().read_delays.get(&handle).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let state = self.state.lock();
        if let Some(code) = state.read_errors.get(&handle) {
            return Err(GattError::new(*code).into());
        }
        Ok(state.values.get(&handle).cloned().unwrap_or_default())
    }

    async fn write(
        &self,
        handle: Handle,
        value: &[u8],
        with_response: bool,
    ) -> Result<(), UpstreamError> {
        self.ensure_connected()?;
        let characteristic = self.characteristic(handle)?;
        let permitted = if with_response {
            characteristic.properties.write
        } else {
            characteristic.properties.write_without_response
        };
        if !permitted {
            return Err(GattError::new(GattErrorCode::WriteNotPermitted).into());
        }
        self.state
            .lock()
            .writes
            .push((handle, value.to_vec(), with_response));
        Ok(())
    }

    async fn subscribe(&self, handle: Handle) -> Result<(), UpstreamError> {
        self.ensure_connected()?;
        if !self.characteristic(handle)?.properties.is_subscribable() {
            return Err(GattError::new(GattErrorCode::RequestNotSupported).into());
        }
        let mut state = self.state.lock();
        state.subscribe_calls += 1;
        if let Some(code) = state.subscribe_errors.get(&handle) {
            return Err(GattError::new(*code).into());
        }
        state.subscriptions.insert(handle);
        Ok(())
    }

    async fn unsubscribe(&self, handle: Handle) -> Result<(), UpstreamError> {
        let mut state = self.state.lock();
        state.unsubscribe_calls += 1;
        state.subscriptions.remove(&handle);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), UpstreamError> {
        let mut state = self.state.lock();
        state.disconnects += 1;
        state.events = None;
        state.subscriptions.clear();
        Ok(())
    }
}
