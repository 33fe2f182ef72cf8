// Peripheral Bridge: the host stack's peripheral role as seen by the relay
//
// Backends (BlueZ via bluer, the in-memory simulator) implement this trait and
// surface everything the victim does as `PeripheralEvent`s on one channel.

use super::DownstreamError;
use crate::gatt::{GattResponse, Handle, RequestId, WriteKind};
use crate::pairing::{PairingDecision, PairingMethod};
use crate::topology::{AdvertisementData, DeviceProfile, PeerAddress};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// HCI disconnect reasons used when the relay drops the victim
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DisconnectReason {
    AuthenticationFailure = 0x05,
    ConnectionTimeout = 0x08,
    ConnectionLimitExceeded = 0x09,
    RemoteUserTerminated = 0x13,
    RemoteLowResources = 0x14,
    RemotePowerOff = 0x15,
    UnacceptableConnectionParameters = 0x3B,
}

impl DisconnectReason {
    pub fn hci_code(&self) -> u8 {
        *self as u8
    }
}

/// Something the victim did, as reported by the peripheral backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeripheralEvent {
    Connected(PeerAddress),
    Disconnected(PeerAddress),
    PairingRequest {
        id: RequestId,
        peer: PeerAddress,
        method: PairingMethod,
    },
    PairingComplete {
        peer: PeerAddress,
        success: bool,
    },
    Read {
        id: RequestId,
        handle: Handle,
        offset: u16,
    },
    Write {
        id: RequestId,
        handle: Handle,
        value: Vec<u8>,
        kind: WriteKind,
        offset: u16,
    },
    /// Backend-managed CCCD changed (stacks that never expose the CCCD write)
    SubscriptionChanged {
        handle: Handle,
        enabled: bool,
        indicate: bool,
    },
}

// ============================================================================
// PERIPHERAL BRIDGE TRAIT
// ============================================================================

#[async_trait]
pub trait PeripheralBridge: Send + Sync {
    /// Register the mirrored GATT database, using the profile's victim handles
    async fn serve(&self, profile: &DeviceProfile) -> Result<(), DownstreamError>;

    async fn start_advertising(
        &self,
        advertisement: &AdvertisementData,
    ) -> Result<(), DownstreamError>;

    async fn stop_advertising(&self) -> Result<(), DownstreamError>;

    /// Answer a Read or Write request
    async fn respond(&self, id: RequestId, response: GattResponse) -> Result<(), DownstreamError>;

    async fn pairing_response(
        &self,
        id: RequestId,
        decision: PairingDecision,
    ) -> Result<(), DownstreamError>;

    /// Send a notification (or indication) on a victim-facing value handle
    async fn notify(&self, handle: Handle, value: &[u8], indicate: bool)
        -> Result<(), DownstreamError>;

    async fn disconnect(
        &self,
        peer: &PeerAddress,
        reason: DisconnectReason,
    ) -> Result<(), DownstreamError>;

    /// Victim event channel; can be taken once
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PeripheralEvent>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnect_reason_codes() {
        assert_eq!(DisconnectReason::RemoteUserTerminated.hci_code(), 0x13);
        assert_eq!(DisconnectReason::RemotePowerOff.hci_code(), 0x15);
        assert_eq!(DisconnectReason::ConnectionLimitExceeded.hci_code(), 0x09);
    }
}
