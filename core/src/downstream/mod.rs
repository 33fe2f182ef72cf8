//! Downstream Server: the impersonated peripheral the victim talks to
//!
//! State machine:
//!   Idle -> Advertising -> VictimConnected -> Pairing -> Relaying -> Idle
//!
//! The server owns everything that can be answered without the real device:
//! the pairing gate, CCCD state, permission checks against the mirrored
//! property flags and the read cache used for read-blob continuations.
//! Everything else becomes a [`VictimRequest`] for the session to forward, and
//! comes back through [`DownstreamServer::complete`].

pub mod bridge;

pub use bridge::{DisconnectReason, PeripheralBridge, PeripheralEvent};

use crate::gatt::{AttOpcode, GattErrorCode, GattResponse, Handle, RequestId, WriteKind};
use crate::pairing::{PairingDecision, PairingPolicy};
use crate::topology::{DeviceProfile, PeerAddress, PropertyFlags};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// ATT "Client Characteristic Configuration Descriptor Improperly Configured"
const CCCD_IMPROPERLY_CONFIGURED: u8 = 0xFD;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DownstreamError {
    #[error("Adapter unavailable: {0}")]
    AdapterUnavailable(String),
    #[error("{op} not permitted while server is {state:?}")]
    InvalidState { state: ServerState, op: &'static str },
    #[error("No victim connected")]
    NotConnected,
    #[error("Platform bridge error: {0}")]
    Platform(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerState {
    Idle,
    Advertising,
    VictimConnected,
    Pairing,
    Relaying,
}

#[derive(Debug, Clone)]
pub struct DownstreamConfig {
    /// Gate non-mandatory attributes behind a completed pairing
    pub require_pairing: bool,
    pub pairing: PairingPolicy,
}

impl Default for DownstreamConfig {
    fn default() -> Self {
        Self {
            require_pairing: true,
            pairing: PairingPolicy::default(),
        }
    }
}

/// What a victim-facing handle points at
#[derive(Debug, Clone, Copy)]
enum Attribute {
    Value {
        properties: PropertyFlags,
        mandatory: bool,
    },
    Cccd {
        value_handle: Handle,
        mandatory: bool,
    },
    Descriptor {
        mandatory: bool,
    },
}

impl Attribute {
    fn is_mandatory(&self) -> bool {
        match self {
            Attribute::Value { mandatory, .. }
            | Attribute::Cccd { mandatory, .. }
            | Attribute::Descriptor { mandatory } => *mandatory,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct CccdState {
    notify: bool,
    indicate: bool,
}

impl CccdState {
    fn from_value(value: &[u8]) -> Option<Self> {
        if value.len() != 2 {
            return None;
        }
        let bits = u16::from_le_bytes([value[0], value[1]]);
        Some(Self {
            notify: bits & 0x0001 != 0,
            indicate: bits & 0x0002 != 0,
        })
    }

    fn to_value(self) -> Vec<u8> {
        let bits = (self.notify as u16) | ((self.indicate as u16) << 1);
        bits.to_le_bytes().to_vec()
    }

    fn is_enabled(&self) -> bool {
        self.notify || self.indicate
    }
}

/// Operation to perform against the real device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOp {
    Read,
    Write {
        value: Vec<u8>,
        /// How the victim issued it
        kind: WriteKind,
        /// How it goes upstream, after write-type fallback
        with_response: bool,
    },
}

/// A victim request the server could not answer locally
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VictimRequest {
    pub id: RequestId,
    /// Victim-facing handle
    pub handle: Handle,
    pub offset: u16,
    pub op: RequestOp,
}

impl VictimRequest {
    pub fn is_read(&self) -> bool {
        matches!(self.op, RequestOp::Read)
    }

    /// Whether the victim is waiting for an ATT response
    pub fn expects_response(&self) -> bool {
        !matches!(
            self.op,
            RequestOp::Write {
                kind: WriteKind::Command,
                ..
            }
        )
    }

    pub fn opcode(&self) -> AttOpcode {
        match &self.op {
            RequestOp::Read if self.offset > 0 => AttOpcode::ReadBlobRequest,
            RequestOp::Read => AttOpcode::ReadRequest,
            RequestOp::Write { kind, .. } => kind.opcode(),
        }
    }

    pub fn payload(&self) -> &[u8] {
        match &self.op {
            RequestOp::Read => &[],
            RequestOp::Write { value, .. } => value,
        }
    }
}

/// What the session should do with a peripheral event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerAction {
    /// Answer locally, in request order
    Respond { id: RequestId, response: GattResponse },
    /// Forward through the pipeline to the real device
    Forward(VictimRequest),
    /// Victim changed a CCCD; `ack` is the write to acknowledge once handled
    Subscription {
        handle: Handle,
        enabled: bool,
        ack: Option<RequestId>,
    },
    VictimConnected(PeerAddress),
    VictimPaired(PeerAddress),
    VictimDisconnected(PeerAddress),
    Ignore,
}

// ============================================================================
// DOWNSTREAM SERVER
// ============================================================================

pub struct DownstreamServer {
    bridge: Arc<dyn PeripheralBridge>,
    profile: Arc<DeviceProfile>,
    config: DownstreamConfig,
    attributes: HashMap<Handle, Attribute>,
    state: RwLock<ServerState>,
    victim: RwLock<Option<PeerAddress>>,
    served: Mutex<bool>,
    cccds: RwLock<HashMap<Handle, CccdState>>,
    read_cache: RwLock<HashMap<Handle, Vec<u8>>>,
}

impl DownstreamServer {
    pub fn new(
        bridge: Arc<dyn PeripheralBridge>,
        profile: Arc<DeviceProfile>,
        config: DownstreamConfig,
    ) -> Self {
        let mut attributes = HashMap::new();
        for (service, characteristic) in profile.characteristics() {
            let mandatory = service.is_mandatory();
            attributes.insert(
                characteristic.victim_handle,
                Attribute::Value {
                    properties: characteristic.properties,
                    mandatory,
                },
            );
            for descriptor in &characteristic.descriptors {
                let attribute = if descriptor.is_cccd() {
                    Attribute::Cccd {
                        value_handle: characteristic.victim_handle,
                        mandatory,
                    }
                } else {
                    Attribute::Descriptor { mandatory }
                };
                attributes.insert(descriptor.victim_handle, attribute);
            }
        }

        let server = Self {
            bridge,
            profile,
            config,
            attributes,
            state: RwLock::new(ServerState::Idle),
            victim: RwLock::new(None),
            served: Mutex::new(false),
            cccds: RwLock::new(HashMap::new()),
            read_cache: RwLock::new(HashMap::new()),
        };
        server.seed_cache();
        server
    }

    /// Start the read cache from the values captured at enumeration.
    ///
    /// Until the victim's first full read of a characteristic refreshes it, a
    /// blob read (offset > 0) is sliced from the captured value and may show
    /// bytes the live device no longer holds.
    fn seed_cache(&self) {
        let mut cache = self.read_cache.write();
        cache.clear();
        for (_, c) in self.profile.characteristics() {
            if let Some(value) = &c.initial_value {
                cache.insert(c.victim_handle, value.clone());
            }
        }
    }

    pub fn state(&self) -> ServerState {
        *self.state.read()
    }

    pub fn victim(&self) -> Option<PeerAddress> {
        *self.victim.read()
    }

    pub fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PeripheralEvent>> {
        self.bridge.take_events()
    }

    fn set_state(&self, to: ServerState) {
        let mut state = self.state.write();
        if *state != to {
            info!("Downstream server {:?} -> {:?}", *state, to);
            *state = to;
        }
    }

    /// Register the mirrored database (first time only) and advertise
    pub async fn start_advertising(&self) -> Result<(), DownstreamError> {
        let state = self.state();
        if state != ServerState::Idle {
            return Err(DownstreamError::InvalidState {
                state,
                op: "start_advertising",
            });
        }

        let needs_serve = !*self.served.lock();
        if needs_serve {
            self.bridge
                .serve(&self.profile)
                .await
                .map_err(adapter_unavailable)?;
            *self.served.lock() = true;
            debug!("Mirrored GATT database registered");
        }

        self.bridge
            .start_advertising(&self.profile.advertisement)
            .await
            .map_err(adapter_unavailable)?;
        info!(
            "Advertising as {:?}",
            self.profile
                .advertisement
                .local_name
                .as_deref()
                .unwrap_or("<unnamed>")
        );
        self.set_state(ServerState::Advertising);
        Ok(())
    }

    pub async fn stop_advertising(&self) -> Result<(), DownstreamError> {
        self.bridge.stop_advertising().await?;
        if self.state() == ServerState::Advertising {
            self.set_state(ServerState::Idle);
        }
        Ok(())
    }

    /// Drop the victim with a deliberate reason
    pub async fn disconnect_victim(&self, reason: DisconnectReason) -> Result<(), DownstreamError> {
        let victim = self.victim.write().take();
        let Some(peer) = victim else {
            return Ok(());
        };
        info!("Disconnecting victim {} ({:?})", peer, reason);
        self.reset_connection();
        self.set_state(ServerState::Idle);
        self.bridge.disconnect(&peer, reason).await
    }

    fn reset_connection(&self) {
        self.cccds.write().clear();
        self.seed_cache();
    }

    /// Classify a peripheral event, answering pairing requests directly
    pub async fn handle_event(&self, event: PeripheralEvent) -> ServerAction {
        match event {
            PeripheralEvent::Connected(peer) => self.on_connected(peer).await,
            PeripheralEvent::Disconnected(peer) => self.on_disconnected(peer),
            PeripheralEvent::PairingRequest { id, peer, method } => {
                let decision = self.config.pairing.evaluate(method);
                match decision {
                    PairingDecision::Accept => {
                        info!("Accepting {} pairing from {}", method, peer);
                        self.set_state(ServerState::Pairing);
                    }
                    PairingDecision::Reject(reason) => {
                        warn!(
                            "Rejecting {} pairing from {} ({:?}, IO capability {:?})",
                            method,
                            peer,
                            reason,
                            self.config.pairing.io_capability()
                        );
                    }
                }
                if let Err(e) = self.bridge.pairing_response(id, decision).await {
                    error!("Failed to answer pairing request {}: {}", id, e);
                }
                ServerAction::Ignore
            }
            PeripheralEvent::PairingComplete { peer, success } => {
                if self.victim() != Some(peer) {
                    debug!("Pairing result for unknown peer {}", peer);
                    return ServerAction::Ignore;
                }
                if success {
                    self.set_state(ServerState::Relaying);
                    ServerAction::VictimPaired(peer)
                } else {
                    warn!("Pairing with {} failed", peer);
                    self.set_state(ServerState::VictimConnected);
                    ServerAction::Ignore
                }
            }
            PeripheralEvent::Read { id, handle, offset } => self.on_read(id, handle, offset),
            PeripheralEvent::Write {
                id,
                handle,
                value,
                kind,
                offset,
            } => self.on_write(id, handle, value, kind, offset),
            PeripheralEvent::SubscriptionChanged {
                handle,
                enabled,
                indicate,
            } => {
                let cccd = CccdState {
                    notify: enabled && !indicate,
                    indicate: enabled && indicate,
                };
                self.cccds.write().insert(handle, cccd);
                debug!("Victim subscription on 0x{:04X}: {:?}", handle, cccd);
                ServerAction::Subscription {
                    handle,
                    enabled,
                    ack: None,
                }
            }
        }
    }

    async fn on_connected(&self, peer: PeerAddress) -> ServerAction {
        let current = {
            let mut victim = self.victim.write();
            let current = *victim;
            if current.is_none() {
                *victim = Some(peer);
            }
            current
        };
        match current {
            Some(current) if current == peer => return ServerAction::Ignore,
            Some(current) => {
                warn!("Refusing second victim {} while {} is connected", peer, current);
                if let Err(e) = self
                    .bridge
                    .disconnect(&peer, DisconnectReason::ConnectionLimitExceeded)
                    .await
                {
                    debug!("Failed to drop second victim: {}", e);
                }
                return ServerAction::Ignore;
            }
            None => {}
        }

        info!("Victim {} connected", peer);
        self.reset_connection();
        if self.config.require_pairing {
            self.set_state(ServerState::VictimConnected);
        } else {
            self.set_state(ServerState::Relaying);
        }
        ServerAction::VictimConnected(peer)
    }

    fn on_disconnected(&self, peer: PeerAddress) -> ServerAction {
        {
            let mut victim = self.victim.write();
            if *victim != Some(peer) {
                debug!("Disconnect from untracked peer {}", peer);
                return ServerAction::Ignore;
            }
            *victim = None;
        }
        info!("Victim {} disconnected", peer);
        self.reset_connection();
        self.set_state(ServerState::Idle);
        ServerAction::VictimDisconnected(peer)
    }

    /// Resolve a handle and apply the pairing gate
    fn admit(&self, handle: Handle, op: &'static str) -> Result<Attribute, GattErrorCode> {
        let attribute = match self.attributes.get(&handle) {
            Some(attribute) => *attribute,
            None => {
                error!("Victim {} on unknown handle 0x{:04X}", op, handle);
                return Err(GattErrorCode::InvalidHandle);
            }
        };

        match self.state() {
            ServerState::Relaying => Ok(attribute),
            ServerState::VictimConnected | ServerState::Pairing => {
                if !self.config.require_pairing || attribute.is_mandatory() {
                    Ok(attribute)
                } else {
                    debug!("Victim {} on 0x{:04X} before pairing", op, handle);
                    Err(GattErrorCode::InsufficientAuthentication)
                }
            }
            state => {
                warn!("Victim {} on 0x{:04X} while {:?}", op, handle, state);
                Err(GattErrorCode::UnlikelyError)
            }
        }
    }

    fn on_read(&self, id: RequestId, handle: Handle, offset: u16) -> ServerAction {
        let attribute = match self.admit(handle, "read") {
            Ok(attribute) => attribute,
            Err(code) => return respond(id, GattResponse::Error(code)),
        };

        let forward = ServerAction::Forward(VictimRequest {
            id,
            handle,
            offset,
            op: RequestOp::Read,
        });

        match attribute {
            Attribute::Value { properties, .. } => {
                if !properties.read {
                    return respond(id, GattResponse::Error(GattErrorCode::ReadNotPermitted));
                }
                if offset == 0 {
                    return forward;
                }
                match self.read_cache.read().get(&handle) {
                    Some(cached) => respond(id, slice_at(cached, offset)),
                    None => forward,
                }
            }
            Attribute::Cccd { value_handle, .. } => {
                let state = self
                    .cccds
                    .read()
                    .get(&value_handle)
                    .copied()
                    .unwrap_or_default();
                respond(id, slice_at(&state.to_value(), offset))
            }
            Attribute::Descriptor { .. } => forward,
        }
    }

    fn on_write(
        &self,
        id: RequestId,
        handle: Handle,
        value: Vec<u8>,
        kind: WriteKind,
        offset: u16,
    ) -> ServerAction {
        // Write Commands never get a response, whatever happens
        let reject = |code: GattErrorCode| match kind {
            WriteKind::Request => respond(id, GattResponse::Error(code)),
            WriteKind::Command => {
                debug!("Dropping write command on 0x{:04X}: {}", handle, code);
                ServerAction::Ignore
            }
        };

        let attribute = match self.admit(handle, "write") {
            Ok(attribute) => attribute,
            Err(code) => return reject(code),
        };
        if offset != 0 {
            return reject(GattErrorCode::InvalidOffset);
        }

        match attribute {
            Attribute::Value { properties, .. } => {
                let with_response = match (kind, properties.write, properties.write_without_response) {
                    (WriteKind::Request, true, _) => true,
                    (WriteKind::Request, false, true) => {
                        debug!("0x{:04X} only takes write commands; acknowledging locally", handle);
                        false
                    }
                    (WriteKind::Command, _, true) => false,
                    (WriteKind::Command, true, false) => true,
                    (_, false, false) => return reject(GattErrorCode::WriteNotPermitted),
                };
                ServerAction::Forward(VictimRequest {
                    id,
                    handle,
                    offset,
                    op: RequestOp::Write {
                        value,
                        kind,
                        with_response,
                    },
                })
            }
            Attribute::Cccd { value_handle, .. } => {
                let Some(cccd) = CccdState::from_value(&value) else {
                    return reject(GattErrorCode::InvalidAttributeValueLength);
                };
                let properties = match self.attributes.get(&value_handle) {
                    Some(Attribute::Value { properties, .. }) => *properties,
                    _ => PropertyFlags::default(),
                };
                if (cccd.notify && !properties.notify) || (cccd.indicate && !properties.indicate) {
                    return reject(GattErrorCode::Application(CCCD_IMPROPERLY_CONFIGURED));
                }

                self.cccds.write().insert(value_handle, cccd);
                debug!("Victim CCCD on 0x{:04X}: {:?}", value_handle, cccd);
                ServerAction::Subscription {
                    handle: value_handle,
                    enabled: cccd.is_enabled(),
                    ack: match kind {
                        WriteKind::Request => Some(id),
                        WriteKind::Command => None,
                    },
                }
            }
            Attribute::Descriptor { .. } => ServerAction::Forward(VictimRequest {
                id,
                handle,
                offset,
                op: RequestOp::Write {
                    value,
                    kind,
                    with_response: true,
                },
            }),
        }
    }

    /// Turn the (transformed) upstream result into the victim's answer.
    ///
    /// Full reads refresh the cache that read-blob continuations are served
    /// from; blob reads that missed the cache are sliced here.
    pub fn finish(&self, request: &VictimRequest, response: GattResponse) -> GattResponse {
        match (&request.op, response) {
            (RequestOp::Read, GattResponse::Value(value)) => {
                let sliced = slice_at(&value, request.offset);
                if matches!(self.attributes.get(&request.handle), Some(Attribute::Value { .. })) {
                    self.read_cache.write().insert(request.handle, value);
                }
                sliced
            }
            (RequestOp::Read, GattResponse::WriteAck) => GattResponse::Value(Vec::new()),
            (RequestOp::Write { .. }, GattResponse::Value(_)) => GattResponse::WriteAck,
            (_, response) => response,
        }
    }

    /// Finish a forwarded request and answer the victim if it expects an answer
    pub async fn complete(
        &self,
        request: &VictimRequest,
        response: GattResponse,
    ) -> Result<(), DownstreamError> {
        let response = self.finish(request, response);
        if !request.expects_response() {
            if let GattResponse::Error(code) = response {
                debug!(
                    "Write command {} on 0x{:04X} failed upstream: {}",
                    request.id, request.handle, code
                );
            }
            return Ok(());
        }
        self.reply(request.id, response).await
    }

    pub async fn reply(&self, id: RequestId, response: GattResponse) -> Result<(), DownstreamError> {
        debug!("Responding {} with {:?}", id, response);
        self.bridge.respond(id, response).await
    }

    /// Whether the victim has enabled notifications or indications on `handle`
    pub fn is_subscribed(&self, handle: Handle) -> bool {
        self.cccds
            .read()
            .get(&handle)
            .map_or(false, |c| c.is_enabled())
    }

    /// Forget a CCCD the real device would not back
    pub fn clear_subscription(&self, handle: Handle) {
        if self.cccds.write().remove(&handle).is_some() {
            debug!("Victim subscription on 0x{:04X} cleared", handle);
        }
    }

    /// Push a value to the victim if it is relaying and subscribed.
    ///
    /// Returns whether anything was sent.
    pub async fn deliver(&self, handle: Handle, value: &[u8]) -> Result<bool, DownstreamError> {
        if self.state() != ServerState::Relaying {
            debug!("Holding back notification on 0x{:04X}: victim not relaying", handle);
            return Ok(false);
        }
        let cccd = self.cccds.read().get(&handle).copied().unwrap_or_default();
        if !cccd.is_enabled() {
            debug!("Victim not subscribed to 0x{:04X}", handle);
            return Ok(false);
        }
        self.bridge
            .notify(handle, value, cccd.indicate && !cccd.notify)
            .await?;
        Ok(true)
    }
}

fn respond(id: RequestId, response: GattResponse) -> ServerAction {
    ServerAction::Respond { id, response }
}

fn slice_at(value: &[u8], offset: u16) -> GattResponse {
    let offset = offset as usize;
    if offset > value.len() {
        GattResponse::Error(GattErrorCode::InvalidOffset)
    } else {
        GattResponse::Value(value[offset..].to_vec())
    }
}

fn adapter_unavailable(e: DownstreamError) -> DownstreamError {
    match e {
        DownstreamError::AdapterUnavailable(_) => e,
        other => DownstreamError::AdapterUnavailable(other.to_string()),
    }
}
