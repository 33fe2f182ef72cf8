// BLE Relay Core: GATT man-in-the-middle between a victim central and a real peripheral
//
// The relay impersonates the real device toward the victim (downstream, peripheral
// role) while holding its own central-role link to the device (upstream). Every
// victim request is translated between the two handle spaces and passes through
// the interception pipeline in both directions.
//
// Host Bluetooth stacks plug in behind `CentralBridge` and `PeripheralBridge`;
// `sim` provides in-memory implementations of both.

pub mod downstream;
pub mod gatt;
pub mod handles;
pub mod inflight;
pub mod pairing;
pub mod pipeline;
pub mod session;
pub mod sim;
pub mod topology;
pub mod upstream;

pub use downstream::{
    DisconnectReason, DownstreamError, DownstreamServer, PeripheralBridge, PeripheralEvent,
    ServerState,
};
pub use gatt::{GattError, GattErrorCode, GattResponse, Handle, RequestId, WriteKind};
pub use handles::{HandleError, HandleMapping};
pub use inflight::{InFlightRequest, InFlightTable};
pub use pairing::{IoCapability, PairingDecision, PairingMethod, PairingPolicy, SmpErrorCode};
pub use pipeline::{
    Direction, DropReply, Pipeline, PipelineConfig, Transform, TransformError, TransformOutcome,
    TransformSlot, TrafficObserver,
};
pub use session::{RelayConfig, RelayError, SessionController, SessionHandle, SessionState};
pub use topology::{
    AdvertisementData, DeviceProfile, HostCapabilities, PeerAddress, ProfileError, PropertyFlags,
    ScanResults,
};
pub use upstream::{
    CentralBridge, CentralEvent, LinkState, NotificationStream, UpstreamError, UpstreamLink,
};
