// Central-role host abstraction

use super::UpstreamError;
use crate::gatt::Handle;
use crate::topology::{LiveService, PeerAddress};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Asynchronous events from the connected peripheral
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CentralEvent {
    /// Notification or indication value on a target handle
    Notification { handle: Handle, value: Vec<u8> },
    /// The peripheral dropped the connection
    Disconnected,
}

/// Central-role GATT client provided by the host Bluetooth stack.
///
/// Handles are target-facing attribute handles as reported by `discover`.
/// Implementations may queue operations internally; the link applies its own
/// deadline to every call.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CentralBridge: Send + Sync {
    /// Connect and return the event channel for this connection
    async fn connect(
        &self,
        address: &PeerAddress,
    ) -> Result<mpsc::UnboundedReceiver<CentralEvent>, UpstreamError>;

    /// Discover services, characteristics and descriptors
    async fn discover(&self) -> Result<Vec<LiveService>, UpstreamError>;

    /// Read a characteristic value or descriptor
    async fn read(&self, handle: Handle) -> Result<Vec<u8>, UpstreamError>;

    /// Write a characteristic value or descriptor
    async fn write(
        &self,
        handle: Handle,
        value: &[u8],
        with_response: bool,
    ) -> Result<(), UpstreamError>;

    /// Enable notifications or indications on a characteristic
    async fn subscribe(&self, handle: Handle) -> Result<(), UpstreamError>;

    async fn unsubscribe(&self, handle: Handle) -> Result<(), UpstreamError>;

    async fn disconnect(&self) -> Result<(), UpstreamError>;
}
