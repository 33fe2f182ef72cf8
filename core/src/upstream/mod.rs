// Upstream Link: central-role connection to the real peripheral
//
// State machine:
//   Disconnected -> Connecting -> Connected -> ServicesResolved -> Active -> Disconnected
//
// Characteristic operations are refused until services are resolved. Every
// call into the host bridge runs under the operation deadline. Link loss is
// reported once on the event channel and never retried here.

pub mod bridge;
pub mod stream;

pub use bridge::{CentralBridge, CentralEvent};
pub use stream::NotificationStream;

use crate::gatt::{GattError, Handle};
use crate::topology::{LiveService, PeerAddress};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UpstreamError {
    #[error("Connection to {address} timed out after {timeout:?}")]
    ConnectTimeout { address: PeerAddress, timeout: Duration },
    #[error("Connection to {address} refused: {reason}")]
    ConnectRefused { address: PeerAddress, reason: String },
    #[error("Service discovery failed: {0}")]
    ServiceDiscovery(String),
    #[error(transparent)]
    Gatt(#[from] GattError),
    #[error("{op} not permitted while link is {state:?}")]
    InvalidState { state: LinkState, op: &'static str },
    #[error("Adapter unavailable: {0}")]
    AdapterUnavailable(String),
    #[error("Platform bridge error: {0}")]
    Platform(String),
}

// ============================================================================
// CONFIGURATION & STATE
// ============================================================================

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Deadline for discovery, reads, writes and subscription changes
    pub operation_timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    ServicesResolved,
    Active,
}

impl LinkState {
    /// Services resolved, characteristic operations allowed
    pub fn is_operable(&self) -> bool {
        matches!(self, LinkState::ServicesResolved | LinkState::Active)
    }
}

/// Events the link reports to its owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamEvent {
    /// Connection dropped without a local disconnect
    LinkLost,
}

type Subscribers = Arc<RwLock<HashMap<Handle, Vec<mpsc::UnboundedSender<Vec<u8>>>>>>;

// ============================================================================
// UPSTREAM LINK
// ============================================================================

pub struct UpstreamLink {
    bridge: Arc<dyn CentralBridge>,
    config: UpstreamConfig,
    state: Arc<RwLock<LinkState>>,
    address: RwLock<Option<PeerAddress>>,
    services: RwLock<Vec<LiveService>>,
    subscribers: Subscribers,
    events_tx: mpsc::UnboundedSender<UpstreamEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<UpstreamEvent>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl UpstreamLink {
    pub fn new(bridge: Arc<dyn CentralBridge>, config: UpstreamConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            bridge,
            config,
            state: Arc::new(RwLock::new(LinkState::Disconnected)),
            address: RwLock::new(None),
            services: RwLock::new(Vec::new()),
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            pump: Mutex::new(None),
        }
    }

    pub fn state(&self) -> LinkState {
        *self.state.read()
    }

    pub fn address(&self) -> Option<PeerAddress> {
        *self.address.read()
    }

    /// Services found by the last successful resolution
    pub fn services(&self) -> Vec<LiveService> {
        self.services.read().clone()
    }

    /// Link event channel; can be taken once
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<UpstreamEvent>> {
        self.events_rx.lock().take()
    }

    fn transition(
        &self,
        from: LinkState,
        to: LinkState,
        op: &'static str,
    ) -> Result<(), UpstreamError> {
        let mut state = self.state.write();
        if *state != from {
            return Err(UpstreamError::InvalidState { state: *state, op });
        }
        debug!("Upstream link {:?} -> {:?}", from, to);
        *state = to;
        Ok(())
    }

    fn set_state(&self, to: LinkState) {
        let mut state = self.state.write();
        if *state != to {
            debug!("Upstream link {:?} -> {:?}", *state, to);
            *state = to;
        }
    }

    fn ensure_operable(&self, op: &'static str) -> Result<(), UpstreamError> {
        let state = self.state();
        if state.is_operable() {
            Ok(())
        } else {
            Err(UpstreamError::InvalidState { state, op })
        }
    }

    /// Run a bridge call under the operation deadline
    async fn bounded<T>(
        &self,
        op: impl Future<Output = Result<T, UpstreamError>>,
    ) -> Result<T, UpstreamError> {
        match tokio::time::timeout(self.config.operation_timeout, op).await {
            Ok(result) => result,
            Err(_) => Err(UpstreamError::Gatt(GattError::timeout())),
        }
    }

    /// Connect to the real peripheral within `timeout`
    pub async fn connect(
        &self,
        address: &PeerAddress,
        timeout: Duration,
    ) -> Result<(), UpstreamError> {
        self.transition(LinkState::Disconnected, LinkState::Connecting, "connect")?;
        info!("Connecting to {} (timeout {:?})", address, timeout);

        let events = match tokio::time::timeout(timeout, self.bridge.connect(address)).await {
            Ok(Ok(events)) => events,
            Ok(Err(e)) => {
                self.set_state(LinkState::Disconnected);
                warn!("Connection to {} failed: {}", address, e);
                return Err(e);
            }
            Err(_) => {
                self.set_state(LinkState::Disconnected);
                warn!("Connection to {} timed out", address);
                // Abandon the pending attempt in the host stack
                if let Err(e) = self.bridge.disconnect().await {
                    debug!("Cleanup after connect timeout failed: {}", e);
                }
                return Err(UpstreamError::ConnectTimeout {
                    address: *address,
                    timeout,
                });
            }
        };

        *self.address.write() = Some(*address);
        self.set_state(LinkState::Connected);
        info!("Connected to {}", address);

        let pump = tokio::spawn(pump_events(
            events,
            self.state.clone(),
            self.subscribers.clone(),
            self.events_tx.clone(),
        ));
        if let Some(previous) = self.pump.lock().replace(pump) {
            previous.abort();
        }
        Ok(())
    }

    /// Discover the device's services; required before any characteristic operation
    pub async fn resolve_services(&self) -> Result<Vec<LiveService>, UpstreamError> {
        let state = self.state();
        if state != LinkState::Connected {
            return Err(UpstreamError::InvalidState {
                state,
                op: "resolve_services",
            });
        }

        let services = self.bounded(self.bridge.discover()).await.map_err(|e| match e {
            UpstreamError::ServiceDiscovery(_) => e,
            other => UpstreamError::ServiceDiscovery(other.to_string()),
        })?;
        if services.is_empty() {
            return Err(UpstreamError::ServiceDiscovery(
                "device exposes no services".into(),
            ));
        }

        info!(
            "Resolved {} services ({} characteristics)",
            services.len(),
            services.iter().map(|s| s.characteristics.len()).sum::<usize>()
        );
        *self.services.write() = services.clone();
        self.transition(LinkState::Connected, LinkState::ServicesResolved, "resolve_services")?;

        // Streams registered on an earlier connection resume here
        let handles: Vec<Handle> = self.subscribers.read().keys().copied().collect();
        for handle in handles {
            if let Err(e) = self.bounded(self.bridge.subscribe(handle)).await {
                warn!("Failed to restore subscription on 0x{:04X}: {}", handle, e);
            }
        }

        Ok(services)
    }

    /// Mark the link as relaying; only valid once services are resolved
    pub fn activate(&self) -> Result<(), UpstreamError> {
        self.transition(LinkState::ServicesResolved, LinkState::Active, "activate")
    }

    pub async fn read(&self, handle: Handle) -> Result<Vec<u8>, UpstreamError> {
        self.ensure_operable("read")?;
        let value = self.bounded(self.bridge.read(handle)).await?;
        trace!("Upstream read 0x{:04X}: {}", handle, hex::encode(&value));
        Ok(value)
    }

    pub async fn write(
        &self,
        handle: Handle,
        value: &[u8],
        with_response: bool,
    ) -> Result<(), UpstreamError> {
        self.ensure_operable("write")?;
        trace!(
            "Upstream write 0x{:04X} ({}): {}",
            handle,
            if with_response { "request" } else { "command" },
            hex::encode(value)
        );
        self.bounded(self.bridge.write(handle, value, with_response))
            .await
    }

    /// Stream of notifications from a target handle
    pub async fn subscribe(&self, handle: Handle) -> Result<NotificationStream, UpstreamError> {
        self.ensure_operable("subscribe")?;

        let (tx, rx) = mpsc::unbounded_channel();
        let first = {
            let mut subscribers = self.subscribers.write();
            let entry = subscribers.entry(handle).or_default();
            entry.retain(|s| !s.is_closed());
            let first = entry.is_empty();
            entry.push(tx);
            first
        };

        if first {
            if let Err(e) = self.bounded(self.bridge.subscribe(handle)).await {
                self.subscribers.write().remove(&handle);
                return Err(e);
            }
            debug!("Subscribed to 0x{:04X}", handle);
        }

        Ok(NotificationStream::new(handle, rx))
    }

    /// Drop every stream on `handle` and disable it on the device
    pub async fn unsubscribe(&self, handle: Handle) -> Result<(), UpstreamError> {
        if self.subscribers.write().remove(&handle).is_none() {
            return Ok(());
        }
        if self.state().is_operable() {
            self.bounded(self.bridge.unsubscribe(handle)).await?;
        }
        debug!("Unsubscribed from 0x{:04X}", handle);
        Ok(())
    }

    pub fn is_subscribed(&self, handle: Handle) -> bool {
        self.subscribers
            .read()
            .get(&handle)
            .map_or(false, |subs| subs.iter().any(|s| !s.is_closed()))
    }

    /// Deliberate disconnect; does not raise `LinkLost`
    pub async fn disconnect(&self) -> Result<(), UpstreamError> {
        let previous = {
            let mut state = self.state.write();
            std::mem::replace(&mut *state, LinkState::Disconnected)
        };
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        if previous == LinkState::Disconnected {
            return Ok(());
        }
        info!("Disconnecting upstream link");
        self.bounded(self.bridge.disconnect()).await
    }
}

impl Drop for UpstreamLink {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }
}

/// Fan notifications out to subscribers until the connection ends
async fn pump_events(
    mut events: mpsc::UnboundedReceiver<CentralEvent>,
    state: Arc<RwLock<LinkState>>,
    subscribers: Subscribers,
    link_events: mpsc::UnboundedSender<UpstreamEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            CentralEvent::Notification { handle, value } => {
                dispatch(&subscribers, handle, value);
            }
            CentralEvent::Disconnected => break,
        }
    }

    let previous = {
        let mut state = state.write();
        std::mem::replace(&mut *state, LinkState::Disconnected)
    };
    if previous != LinkState::Disconnected {
        warn!("Upstream link lost (was {:?})", previous);
        let _ = link_events.send(UpstreamEvent::LinkLost);
    }
}

fn dispatch(subscribers: &Subscribers, handle: Handle, value: Vec<u8>) {
    let mut stale = false;
    {
        let subs = subscribers.read();
        match subs.get(&handle) {
            Some(senders) if !senders.is_empty() => {
                for sender in senders {
                    if sender.send(value.clone()).is_err() {
                        stale = true;
                    }
                }
            }
            _ => {
                debug!("Notification on unsubscribed handle 0x{:04X}", handle);
                return;
            }
        }
    }
    if stale {
        if let Some(senders) = subscribers.write().get_mut(&handle) {
            senders.retain(|s| !s.is_closed());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gatt::GattErrorCode;
    use bridge::MockCentralBridge;
    use futures::StreamExt;

    fn address() -> PeerAddress {
        "C0:11:22:33:44:55".parse().expect("address")
    }

    fn one_service() -> Vec<LiveService> {
        vec![LiveService {
            uuid: crate::topology::uuid_from_u16(0xFFF0),
            characteristics: vec![],
        }]
    }

    /// Mock that connects and resolves; returns the sender for central events
    fn connected_mock() -> (MockCentralBridge, mpsc::UnboundedSender<CentralEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut mock = MockCentralBridge::new();
        mock.expect_connect().return_once(move |_| Ok(rx));
        mock.expect_discover().returning(|| Ok(one_service()));
        (mock, tx)
    }

    async fn resolved_link(mock: MockCentralBridge) -> UpstreamLink {
        let link = UpstreamLink::new(Arc::new(mock), UpstreamConfig::default());
        link.connect(&address(), Duration::from_secs(1))
            .await
            .expect("connect");
        link.resolve_services().await.expect("resolve");
        link
    }

    #[tokio::test]
    async fn test_operations_require_resolved_services() {
        let link = UpstreamLink::new(Arc::new(MockCentralBridge::new()), UpstreamConfig::default());
        assert!(matches!(
            link.read(0x2A).await,
            Err(UpstreamError::InvalidState {
                state: LinkState::Disconnected,
                op: "read"
            })
        ));
        assert!(matches!(
            link.subscribe(0x2A).await,
            Err(UpstreamError::InvalidState { .. })
        ));
        assert!(matches!(
            link.resolve_services().await,
            Err(UpstreamError::InvalidState { .. })
        ));
        assert!(link.activate().is_err());
    }

    #[tokio::test]
    async fn test_connected_but_unresolved_refuses_writes() {
        let (mock, _tx) = connected_mock();
        let link = UpstreamLink::new(Arc::new(mock), UpstreamConfig::default());
        link.connect(&address(), Duration::from_secs(1))
            .await
            .expect("connect");
        assert_eq!(link.state(), LinkState::Connected);
        assert!(matches!(
            link.write(0x2A, &[1], true).await,
            Err(UpstreamError::InvalidState {
                state: LinkState::Connected,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_state_progression() {
        let (mock, _tx) = connected_mock();
        let link = resolved_link(mock).await;
        assert_eq!(link.state(), LinkState::ServicesResolved);
        assert_eq!(link.address(), Some(address()));
        assert_eq!(link.services().len(), 1);
        link.activate().expect("activate");
        assert_eq!(link.state(), LinkState::Active);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let mut mock = MockCentralBridge::new();
        mock.expect_connect().returning(|addr| {
            Err(UpstreamError::ConnectRefused {
                address: *addr,
                reason: "le-connection-abort-by-local".into(),
            })
        });
        let link = UpstreamLink::new(Arc::new(mock), UpstreamConfig::default());
        let err = link
            .connect(&address(), Duration::from_secs(1))
            .await
            .expect_err("refused");
        assert!(matches!(err, UpstreamError::ConnectRefused { .. }));
        assert_eq!(link.state(), LinkState::Disconnected);
    }

    #[tokio::test]
    async fn test_discovery_failure_maps_to_service_discovery_error() {
        let (tx, rx) = mpsc::unbounded_channel::<CentralEvent>();
        let mut mock = MockCentralBridge::new();
        mock.expect_connect().return_once(move |_| Ok(rx));
        mock.expect_discover()
            .returning(|| Err(UpstreamError::Platform("dbus timeout".into())));
        let link = UpstreamLink::new(Arc::new(mock), UpstreamConfig::default());
        link.connect(&address(), Duration::from_secs(1))
            .await
            .expect("connect");

        let err = link.resolve_services().await.expect_err("discovery fails");
        assert!(matches!(err, UpstreamError::ServiceDiscovery(_)));
        assert_eq!(link.state(), LinkState::Connected);
        drop(tx);
    }

    #[tokio::test]
    async fn test_write_forwards_response_mode() {
        let (mut mock, _tx) = connected_mock();
        mock.expect_write()
            .withf(|handle, value, with_response| {
                *handle == 0x2A && value.to_vec() == vec![0xEF] && !*with_response
            })
            .times(1)
            .returning(|_, _, _| Ok(()));
        let link = resolved_link(mock).await;
        link.write(0x2A, &[0xEF], false).await.expect("write");
    }

    #[tokio::test]
    async fn test_gatt_errors_pass_through() {
        let (mut mock, _tx) = connected_mock();
        mock.expect_read()
            .returning(|_| Err(GattError::new(GattErrorCode::ReadNotPermitted).into()));
        let link = resolved_link(mock).await;
        assert_eq!(
            link.read(0x2A).await,
            Err(UpstreamError::Gatt(GattError::new(
                GattErrorCode::ReadNotPermitted
            )))
        );
    }

    #[tokio::test]
    async fn test_notifications_reach_every_subscriber() {
        let (mut mock, tx) = connected_mock();
        mock.expect_subscribe().times(1).returning(|_| Ok(()));
        let link = resolved_link(mock).await;

        let mut first = link.subscribe(0x2A).await.expect("subscribe");
        let mut second = link.subscribe(0x2A).await.expect("subscribe");
        assert_eq!(first.handle(), 0x2A);
        assert!(link.is_subscribed(0x2A));

        tx.send(CentralEvent::Notification {
            handle: 0x2A,
            value: vec![0x01, 0x02],
        })
        .expect("send");

        assert_eq!(first.next().await, Some(vec![0x01, 0x02]));
        assert_eq!(second.next().await, Some(vec![0x01, 0x02]));
    }

    #[tokio::test]
    async fn test_failed_subscribe_leaves_no_registration() {
        let (mut mock, _tx) = connected_mock();
        mock.expect_subscribe()
            .returning(|_| Err(GattError::new(GattErrorCode::WriteNotPermitted).into()));
        let link = resolved_link(mock).await;
        assert!(link.subscribe(0x2A).await.is_err());
        assert!(!link.is_subscribed(0x2A));
    }

    #[tokio::test]
    async fn test_link_loss_reported_once() {
        let (mock, tx) = connected_mock();
        let link = resolved_link(mock).await;
        let mut events = link.take_events().expect("events");
        assert!(link.take_events().is_none());

        tx.send(CentralEvent::Disconnected).expect("send");
        assert_eq!(events.recv().await, Some(UpstreamEvent::LinkLost));
        assert_eq!(link.state(), LinkState::Disconnected);
        assert!(matches!(
            link.read(0x2A).await,
            Err(UpstreamError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_local_disconnect_is_not_link_loss() {
        let (mut mock, tx) = connected_mock();
        mock.expect_disconnect().times(1).returning(|| Ok(()));
        let link = resolved_link(mock).await;
        let mut events = link.take_events().expect("events");

        link.disconnect().await.expect("disconnect");
        assert_eq!(link.state(), LinkState::Disconnected);
        drop(tx);
        tokio::task::yield_now().await;
        assert!(events.try_recv().is_err());
    }
}
