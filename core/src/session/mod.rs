//! Session Controller
//!
//! Owns both links and is the only place their events meet. Startup runs in
//! three steps that must happen in order:
//!
//! 1. [`SessionController::connect_upstream`]: connect, resolve services,
//!    bind the profile to the live handles and freeze the handle mapping.
//! 2. [`SessionController::advertise`]: activate the upstream link,
//!    auto-subscribe, publish the mirrored database and start advertising.
//! 3. [`SessionController::serve`]: relay until shutdown or upstream loss.
//!
//! Victim requests are answered strictly in the order they arrived; upstream
//! notifications bypass that queue and reach the victim as soon as they have
//! been through the pipeline.

pub mod config;
pub mod error;
pub mod handle;

pub use config::{RelayConfig, FALLBACK_ADVERTISED_NAME};
pub use error::{
    RelayError, EXIT_ADAPTER_UNAVAILABLE, EXIT_CONNECT_REFUSED, EXIT_CONNECT_TIMEOUT, EXIT_FATAL,
    EXIT_OK, EXIT_PROFILE,
};
pub use handle::{SessionHandle, SessionState};

use crate::downstream::{
    DisconnectReason, DownstreamConfig, DownstreamServer, PeripheralBridge, PeripheralEvent,
    RequestOp, ServerAction, ServerState, VictimRequest,
};
use crate::gatt::{AttOpcode, GattErrorCode, GattResponse, Handle, RequestId};
use crate::handles::HandleMapping;
use crate::inflight::{InFlightRequest, InFlightTable};
use crate::pairing::PairingPolicy;
use crate::pipeline::{Direction, Pipeline, TransformOutcome};
use crate::topology::{DeviceProfile, PeerAddress, ProfileError};
use crate::upstream::{
    CentralBridge, LinkState, NotificationStream, UpstreamConfig, UpstreamError, UpstreamEvent,
    UpstreamLink,
};
use futures::future::{self, BoxFuture};
use futures::stream::{BoxStream, FuturesOrdered, SelectAll};
use futures::{FutureExt, StreamExt};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Everything fixed once upstream services are resolved
struct Topology {
    profile: Arc<DeviceProfile>,
    mapping: Arc<HandleMapping>,
    server: Arc<DownstreamServer>,
}

/// A queued answer, popped in request order
struct Settled {
    id: Option<RequestId>,
    reply: Reply,
    stream: Option<(Handle, NotificationStream)>,
    /// Victim subscription the device refused
    refused: Option<Handle>,
}

enum Reply {
    Forwarded(VictimRequest, GattResponse),
    Local(GattResponse),
    Silent,
}

/// Why the serve loop stopped
enum Exit {
    Shutdown,
    Fatal(RelayError),
}

pub struct SessionController {
    config: RelayConfig,
    profile: Arc<DeviceProfile>,
    pipeline: Arc<Pipeline>,
    upstream: Arc<UpstreamLink>,
    peripheral: Arc<dyn PeripheralBridge>,
    topology: Option<Topology>,
    streams: Vec<(Handle, NotificationStream)>,
    inflight: Arc<InFlightTable>,
    state_tx: watch::Sender<SessionState>,
    state_rx: watch::Receiver<SessionState>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl SessionController {
    pub fn new(
        config: RelayConfig,
        profile: DeviceProfile,
        pipeline: Pipeline,
        central: Arc<dyn CentralBridge>,
        peripheral: Arc<dyn PeripheralBridge>,
    ) -> Result<Self, RelayError> {
        config.validate()?;

        let profile = if let Some(name) = &config.advertise_name {
            profile.with_advertised_name(name.clone())
        } else if profile.name.is_none() {
            profile.with_advertised_name(FALLBACK_ADVERTISED_NAME)
        } else {
            profile
        };

        let upstream = UpstreamLink::new(
            central,
            UpstreamConfig {
                operation_timeout: config.operation_timeout,
            },
        );
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            config,
            profile: Arc::new(profile),
            pipeline: Arc::new(pipeline),
            upstream: Arc::new(upstream),
            peripheral,
            topology: None,
            streams: Vec::new(),
            inflight: Arc::new(InFlightTable::new()),
            state_tx,
            state_rx,
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
        })
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle::new(self.state_rx.clone(), self.shutdown_tx.clone())
    }

    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    pub fn upstream(&self) -> &UpstreamLink {
        &self.upstream
    }

    /// The mirrored handle mapping, once upstream services are resolved
    pub fn mapping(&self) -> Option<&HandleMapping> {
        self.topology.as_ref().map(|t| t.mapping.as_ref())
    }

    /// Profile bound to the live device, once upstream services are resolved
    pub fn bound_profile(&self) -> Option<&DeviceProfile> {
        self.topology.as_ref().map(|t| t.profile.as_ref())
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            info!("Session {} -> {}", previous, state);
        }
    }

    /// Connect and resolve the real device, then freeze the topology
    pub async fn connect_upstream(&mut self, target: &PeerAddress) -> Result<(), RelayError> {
        if self.topology.is_some() {
            return Err(RelayError::StartupOrder("upstream already connected".into()));
        }

        self.set_state(SessionState::ConnectingUpstream);
        self.upstream.connect(target, self.config.connect_timeout).await?;

        self.set_state(SessionState::ResolvingServices);
        let live = self.upstream.resolve_services().await?;

        let bound = self.profile.bind_live(&live).map_err(|e| match e {
            ProfileError::NotOnDevice { .. } => RelayError::ServiceDiscovery(e.to_string()),
            other => RelayError::Profile(other),
        })?;
        let mapping = HandleMapping::from_profile(&bound)?;
        info!("Handle mapping frozen with {} entries", mapping.len());
        for (victim, target) in mapping.pairs() {
            debug!("  victim 0x{:04X} -> target 0x{:04X}", victim, target);
        }

        let profile = Arc::new(bound);
        let server = DownstreamServer::new(
            self.peripheral.clone(),
            profile.clone(),
            DownstreamConfig {
                require_pairing: self.config.require_pairing,
                pairing: PairingPolicy::new(profile.io_capability),
            },
        );
        self.topology = Some(Topology {
            profile,
            mapping: Arc::new(mapping),
            server: Arc::new(server),
        });
        Ok(())
    }

    /// Start impersonating; refuses to run before services are resolved
    pub async fn advertise(&mut self) -> Result<(), RelayError> {
        let Some(topology) = &self.topology else {
            return Err(RelayError::StartupOrder(
                "cannot advertise before upstream services are resolved".into(),
            ));
        };
        let link_state = self.upstream.state();
        if !link_state.is_operable() {
            return Err(RelayError::StartupOrder(format!(
                "cannot advertise while upstream link is {:?}",
                link_state
            )));
        }

        if link_state != LinkState::Active {
            self.upstream.activate()?;
        }

        if self.config.auto_subscribe {
            for (_, characteristic) in topology.profile.characteristics() {
                if !characteristic.properties.is_subscribable() {
                    continue;
                }
                let victim = characteristic.victim_handle;
                let target = topology.mapping.to_target(victim)?;
                match self.upstream.subscribe(target).await {
                    Ok(stream) => {
                        debug!("Auto-subscribed 0x{:04X} (target 0x{:04X})", victim, target);
                        self.streams.push((victim, stream));
                    }
                    Err(e) => warn!(
                        "Auto-subscribe to {} failed: {}",
                        characteristic.uuid, e
                    ),
                }
            }
        }

        topology.server.start_advertising().await?;
        self.set_state(SessionState::Advertising);
        Ok(())
    }

    /// Connect, advertise and relay until shutdown or upstream loss
    pub async fn run(mut self, target: &PeerAddress) -> Result<(), RelayError> {
        let started = match self.connect_upstream(target).await {
            Ok(()) => self.advertise().await,
            Err(e) => Err(e),
        };
        if let Err(e) = started {
            error!("Relay startup failed: {}", e);
            if let Err(cleanup) = self.upstream.disconnect().await {
                debug!("Upstream cleanup failed: {}", cleanup);
            }
            self.set_state(SessionState::Closed);
            return Err(e);
        }
        self.serve().await
    }

    /// Relay loop
    pub async fn serve(&mut self) -> Result<(), RelayError> {
        let Some(topology) = &self.topology else {
            return Err(RelayError::StartupOrder("serve before connect_upstream".into()));
        };
        if topology.server.state() == ServerState::Idle {
            return Err(RelayError::StartupOrder("serve before advertise".into()));
        }
        let server = topology.server.clone();
        let mapping = topology.mapping.clone();

        let mut peripheral_events = server.take_events().ok_or_else(|| {
            RelayError::StartupOrder("peripheral event channel already taken".into())
        })?;
        let mut upstream_events = self.upstream.take_events().ok_or_else(|| {
            RelayError::StartupOrder("upstream event channel already taken".into())
        })?;

        let mut notifications: SelectAll<BoxStream<'static, (Handle, Vec<u8>)>> = SelectAll::new();
        for (victim, stream) in std::mem::take(&mut self.streams) {
            notifications.push(tag_stream(victim, stream));
        }
        let mut pending: FuturesOrdered<BoxFuture<'static, Settled>> = FuturesOrdered::new();
        let mut shutdown = self.shutdown_rx.clone();
        let (deliveries, queue) = mpsc::unbounded_channel();
        let courier = tokio::spawn(deliver_notifications(server.clone(), queue));

        let exit = loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break Exit::Shutdown;
                    }
                }

                event = upstream_events.recv() => {
                    match event {
                        Some(UpstreamEvent::LinkLost) | None => {
                            error!("Upstream link lost; closing session");
                            break Exit::Fatal(RelayError::UpstreamLost);
                        }
                    }
                }

                event = peripheral_events.recv() => {
                    let Some(event) = event else {
                        break Exit::Fatal(RelayError::AdapterUnavailable(
                            "peripheral event channel closed".into(),
                        ));
                    };
                    if let Err(e) = self
                        .on_peripheral_event(&server, &mapping, event, &mut pending)
                        .await
                    {
                        break Exit::Fatal(e);
                    }
                }

                Some((handle, value)) = notifications.next(), if !notifications.is_empty() => {
                    self.forward_notification(&deliveries, handle, value);
                }

                Some(settled) = pending.next(), if !pending.is_empty() => {
                    if let Some(stream) = self.settle(&server, settled).await {
                        notifications.push(tag_stream(stream.0, stream.1));
                    }
                }
            }
        };

        // Cancels outstanding upstream operations and unconfirmed indications
        drop(pending);
        courier.abort();

        match exit {
            Exit::Shutdown => {
                info!("Shutting down relay");
                self.close(&server, DisconnectReason::RemoteUserTerminated)
                    .await;
                if let Err(e) = self.upstream.disconnect().await {
                    warn!("Upstream disconnect failed: {}", e);
                }
                self.set_state(SessionState::Closed);
                Ok(())
            }
            Exit::Fatal(e) => {
                let reason = match e {
                    RelayError::UpstreamLost => DisconnectReason::RemotePowerOff,
                    _ => DisconnectReason::RemoteUserTerminated,
                };
                self.close(&server, reason).await;
                if let Err(cleanup) = self.upstream.disconnect().await {
                    debug!("Upstream cleanup failed: {}", cleanup);
                }
                self.set_state(SessionState::Closed);
                Err(e)
            }
        }
    }

    /// Fail whatever is still in flight, drop the victim and stop advertising
    async fn close(&self, server: &DownstreamServer, reason: DisconnectReason) {
        self.set_state(SessionState::Closing);

        for request in self.inflight.cancel_all() {
            debug!(
                "Cancelling {} on 0x{:04X} after {:?}",
                request.id,
                request.handle,
                request.age()
            );
            if request.opcode == AttOpcode::WriteCommand {
                continue;
            }
            if let Err(e) = server
                .reply(request.id, GattResponse::Error(GattErrorCode::UnlikelyError))
                .await
            {
                debug!("Could not fail {}: {}", request.id, e);
            }
        }

        if let Err(e) = server.disconnect_victim(reason).await {
            warn!("Victim disconnect failed: {}", e);
        }
        if let Err(e) = server.stop_advertising().await {
            warn!("Stopping advertising failed: {}", e);
        }
    }

    async fn on_peripheral_event(
        &self,
        server: &Arc<DownstreamServer>,
        mapping: &Arc<HandleMapping>,
        event: PeripheralEvent,
        pending: &mut FuturesOrdered<BoxFuture<'static, Settled>>,
    ) -> Result<(), RelayError> {
        match server.handle_event(event).await {
            ServerAction::Respond { id, response } => {
                pending.push_back(settled(Some(id), Reply::Local(response)));
            }
            ServerAction::Forward(request) => {
                let entry = InFlightRequest::new(
                    request.id,
                    request.handle,
                    request.opcode(),
                    request.payload().to_vec(),
                );
                if let Err(e) = self.inflight.insert(entry) {
                    error!("{}; failing the duplicate", e);
                    if request.expects_response() {
                        pending.push_back(settled(
                            Some(request.id),
                            Reply::Local(GattResponse::Error(GattErrorCode::UnlikelyError)),
                        ));
                    }
                    return Ok(());
                }
                let upstream = self.upstream.clone();
                let pipeline = self.pipeline.clone();
                let mapping = mapping.clone();
                pending.push_back(
                    async move {
                        let id = request.id;
                        let response = relay(&upstream, &pipeline, &mapping, &request).await;
                        Settled {
                            id: Some(id),
                            reply: Reply::Forwarded(request, response),
                            stream: None,
                            refused: None,
                        }
                    }
                    .boxed(),
                );
            }
            ServerAction::Subscription { handle, enabled, ack } => {
                self.on_subscription(mapping, handle, enabled, ack, pending);
            }
            ServerAction::VictimConnected(peer) => {
                info!("Victim {} connected", peer);
                if let Err(e) = self.peripheral.stop_advertising().await {
                    debug!("Stopping advertising on connect failed: {}", e);
                }
                if server.state() == ServerState::Relaying {
                    self.set_state(SessionState::Relaying);
                } else {
                    self.set_state(SessionState::PairingVictim);
                }
            }
            ServerAction::VictimPaired(peer) => {
                info!("Victim {} paired", peer);
                self.set_state(SessionState::Relaying);
            }
            ServerAction::VictimDisconnected(peer) => {
                info!("Victim {} gone; advertising again", peer);
                // Nobody is left to answer
                *pending = FuturesOrdered::new();
                let dropped = self.inflight.cancel_all();
                if !dropped.is_empty() {
                    debug!("Discarded {} in-flight requests", dropped.len());
                }
                server.start_advertising().await?;
                self.set_state(SessionState::Advertising);
            }
            ServerAction::Ignore => {}
        }
        Ok(())
    }

    fn on_subscription(
        &self,
        mapping: &Arc<HandleMapping>,
        handle: Handle,
        enabled: bool,
        ack: Option<RequestId>,
        pending: &mut FuturesOrdered<BoxFuture<'static, Settled>>,
    ) {
        let ack_reply = |response: GattResponse| match ack {
            Some(_) => Reply::Local(response),
            None => Reply::Silent,
        };

        let target = match mapping.to_target(handle) {
            Ok(target) => target,
            Err(e) => {
                error!("Subscription on unmapped handle: {}", e);
                pending.push_back(settled(
                    ack,
                    ack_reply(GattResponse::Error(GattErrorCode::UnlikelyError)),
                ));
                return;
            }
        };

        // Auto-subscribed streams stay open; the CCCD only gates delivery
        let auto_subscribe = self.config.auto_subscribe;
        if auto_subscribe && (!enabled || self.upstream.is_subscribed(target)) {
            pending.push_back(settled(ack, ack_reply(GattResponse::WriteAck)));
            return;
        }

        let upstream = self.upstream.clone();
        pending.push_back(
            async move {
                let mut refused = None;
                let (response, stream) = if enabled && !upstream.is_subscribed(target) {
                    if auto_subscribe {
                        info!("Retrying upstream subscribe on 0x{:04X}", target);
                    }
                    match upstream.subscribe(target).await {
                        Ok(stream) => (GattResponse::WriteAck, Some((handle, stream))),
                        Err(e) => {
                            warn!("Upstream subscribe on 0x{:04X} failed: {}", target, e);
                            refused = Some(handle);
                            (GattResponse::Error(upstream_error_code(&e)), None)
                        }
                    }
                } else if !enabled {
                    match upstream.unsubscribe(target).await {
                        Ok(()) => (GattResponse::WriteAck, None),
                        Err(e) => (GattResponse::Error(upstream_error_code(&e)), None),
                    }
                } else {
                    (GattResponse::WriteAck, None)
                };
                Settled {
                    id: ack,
                    reply: match ack {
                        Some(_) => Reply::Local(response),
                        None => Reply::Silent,
                    },
                    stream,
                    refused,
                }
            }
            .boxed(),
        );
    }

    /// Deliver one queued answer; returns a new notification stream if one was opened
    async fn settle(
        &self,
        server: &DownstreamServer,
        settled: Settled,
    ) -> Option<(Handle, NotificationStream)> {
        let Settled {
            id,
            reply,
            stream,
            refused,
        } = settled;
        if let Some(handle) = refused {
            server.clear_subscription(handle);
        }
        let result = match (id, reply) {
            (Some(id), Reply::Forwarded(request, response)) => {
                if self.inflight.remove(id).is_none() {
                    debug!("{} was cancelled; dropping its response", id);
                    return stream;
                }
                server.complete(&request, response).await
            }
            (Some(id), Reply::Local(response)) => server.reply(id, response).await,
            _ => Ok(()),
        };
        if let Err(e) = result {
            warn!("Failed to answer victim: {}", e);
        }
        stream
    }

    fn forward_notification(
        &self,
        deliveries: &mpsc::UnboundedSender<(Handle, Vec<u8>)>,
        handle: Handle,
        value: Vec<u8>,
    ) {
        match self.pipeline.apply(Direction::Inbound, handle, value) {
            Ok(TransformOutcome::Forward(value)) => {
                if deliveries.send((handle, value)).is_err() {
                    debug!("Notification on 0x{:04X} after delivery stopped", handle);
                }
            }
            Ok(TransformOutcome::Drop(_)) => {
                debug!("Notification on 0x{:04X} dropped by pipeline", handle)
            }
            Err(e) => error!("Inbound transform failed on 0x{:04X}: {}", handle, e),
        }
    }
}

fn settled(id: Option<RequestId>, reply: Reply) -> BoxFuture<'static, Settled> {
    future::ready(Settled {
        id,
        reply,
        stream: None,
        refused: None,
    })
    .boxed()
}

/// Push notifications to the victim in arrival order.
///
/// Runs beside the relay loop so a victim that is slow to confirm an
/// indication delays only later notifications.
async fn deliver_notifications(
    server: Arc<DownstreamServer>,
    mut queue: mpsc::UnboundedReceiver<(Handle, Vec<u8>)>,
) {
    while let Some((handle, value)) = queue.recv().await {
        match server.deliver(handle, &value).await {
            Ok(true) => debug!("Notification on 0x{:04X} delivered", handle),
            Ok(false) => {}
            Err(e) => warn!("Notification delivery on 0x{:04X} failed: {}", handle, e),
        }
    }
}

fn tag_stream(victim: Handle, stream: NotificationStream) -> BoxStream<'static, (Handle, Vec<u8>)> {
    stream.map(move |value| (victim, value)).boxed()
}

/// Code the victim sees for a failed upstream operation
fn upstream_error_code(error: &UpstreamError) -> GattErrorCode {
    match error {
        UpstreamError::Gatt(e) => e.code,
        _ => GattErrorCode::UnlikelyError,
    }
}

/// Outbound pipeline, upstream operation, inbound pipeline
async fn relay(
    upstream: &UpstreamLink,
    pipeline: &Pipeline,
    mapping: &HandleMapping,
    request: &VictimRequest,
) -> GattResponse {
    let is_read = request.is_read();
    let target = match mapping.to_target(request.handle) {
        Ok(target) => target,
        Err(e) => {
            error!("{} rejected: {}", request.id, e);
            return GattResponse::Error(GattErrorCode::UnlikelyError);
        }
    };

    let payload = match pipeline.apply(Direction::Outbound, request.handle, request.payload().to_vec()) {
        Ok(TransformOutcome::Forward(payload)) => payload,
        Ok(TransformOutcome::Drop(reply)) => {
            debug!("{} answered by pipeline without contacting the device", request.id);
            return reply.to_response(is_read);
        }
        Err(e) => {
            error!("Outbound transform failed for {}: {}", request.id, e);
            return GattResponse::Error(GattErrorCode::UnlikelyError);
        }
    };

    let result = match &request.op {
        RequestOp::Read => upstream.read(target).await,
        RequestOp::Write { with_response, .. } => upstream
            .write(target, &payload, *with_response)
            .await
            .map(|()| Vec::new()),
    };
    let value = match result {
        Ok(value) => value,
        Err(e) => {
            debug!("{} failed upstream: {}", request.id, e);
            return GattResponse::Error(upstream_error_code(&e));
        }
    };

    match pipeline.apply(Direction::Inbound, request.handle, value) {
        Ok(TransformOutcome::Forward(value)) if is_read => GattResponse::Value(value),
        Ok(TransformOutcome::Forward(_)) => GattResponse::WriteAck,
        Ok(TransformOutcome::Drop(reply)) => reply.to_response(is_read),
        Err(e) => {
            error!("Inbound transform failed for {}: {}", request.id, e);
            GattResponse::Error(GattErrorCode::UnlikelyError)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{fixtures, SimCentral, SimPeripheral};
    use std::time::Duration;

    fn controller(
        config: RelayConfig,
    ) -> (SessionController, Arc<SimCentral>, Arc<SimPeripheral>) {
        let profile = fixtures::vendor_profile();
        let central = Arc::new(SimCentral::from_profile(&profile));
        let peripheral = Arc::new(SimPeripheral::new());
        let controller = SessionController::new(
            config,
            profile,
            Pipeline::identity(),
            central.clone(),
            peripheral.clone(),
        )
        .expect("controller");
        (controller, central, peripheral)
    }

    #[tokio::test]
    async fn test_advertise_before_resolve_is_startup_order_error() {
        let (mut controller, _, peripheral) = controller(RelayConfig::default());
        let err = controller.advertise().await.expect_err("must refuse");
        assert!(matches!(err, RelayError::StartupOrder(_)));
        assert_eq!(err.exit_code(), EXIT_FATAL);
        assert_eq!(peripheral.advertising_starts(), 0);
    }

    #[tokio::test]
    async fn test_startup_steps() {
        let (mut controller, central, peripheral) = controller(RelayConfig::default());
        controller
            .connect_upstream(&fixtures::DEVICE_ADDRESS)
            .await
            .expect("connect");
        assert_eq!(controller.state(), SessionState::ResolvingServices);
        let mapping = controller.mapping().expect("mapping");
        assert_eq!(
            mapping.to_target(fixtures::NOTIFY_HANDLE),
            Ok(central.handle_of(&fixtures::NOTIFY_CHAR).expect("handle"))
        );

        controller.advertise().await.expect("advertise");
        assert_eq!(controller.state(), SessionState::Advertising);
        assert!(peripheral.is_advertising());
        assert_eq!(peripheral.served_count(), 1);
        // Auto-subscribe reached the real device
        assert!(central.is_subscribed(central.handle_of(&fixtures::NOTIFY_CHAR).expect("handle")));
    }

    #[tokio::test]
    async fn test_missing_live_characteristic_is_service_discovery_error() {
        let mut live_profile = fixtures::vendor_profile();
        live_profile.services[2].characteristics.pop();
        let central = Arc::new(SimCentral::from_profile(&live_profile));
        let mut controller = SessionController::new(
            RelayConfig::default(),
            fixtures::vendor_profile(),
            Pipeline::identity(),
            central,
            Arc::new(SimPeripheral::new()),
        )
        .expect("controller");

        let err = controller
            .connect_upstream(&fixtures::DEVICE_ADDRESS)
            .await
            .expect_err("bind fails");
        assert!(matches!(err, RelayError::ServiceDiscovery(_)));
    }

    #[tokio::test]
    async fn test_fallback_advertised_name() {
        let mut profile = fixtures::vendor_profile();
        profile.name = None;
        let controller = SessionController::new(
            RelayConfig::default(),
            profile,
            Pipeline::identity(),
            Arc::new(SimCentral::from_profile(&fixtures::vendor_profile())),
            Arc::new(SimPeripheral::new()),
        )
        .expect("controller");
        assert_eq!(
            controller.profile.advertisement.local_name.as_deref(),
            Some(FALLBACK_ADVERTISED_NAME)
        );
    }

    #[tokio::test]
    async fn test_shutdown_closes_gracefully() {
        let (controller, central, peripheral) = controller(RelayConfig::default());
        let handle = controller.handle();
        let task = tokio::spawn(async move { controller.run(&fixtures::DEVICE_ADDRESS).await });

        assert!(peripheral.wait_for_advertising(1, Duration::from_secs(5)).await);
        handle.shutdown();
        let result = task.await.expect("join");
        assert!(result.is_ok());
        assert_eq!(handle.state(), SessionState::Closed);
        assert!(!peripheral.is_advertising());
        assert_eq!(central.disconnects(), 1);
    }

    #[test]
    fn test_upstream_error_codes() {
        assert_eq!(
            upstream_error_code(&UpstreamError::Gatt(crate::gatt::GattError::timeout())),
            GattErrorCode::Timeout
        );
        assert_eq!(
            upstream_error_code(&UpstreamError::Platform("dbus".into())),
            GattErrorCode::UnlikelyError
        );
    }
}
