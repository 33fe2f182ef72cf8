// Notification stream handed out by UpstreamLink::subscribe

use crate::gatt::Handle;
use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// Unbounded stream of notification values from one target handle.
///
/// The registration outlives the connection: after a reconnect and service
/// resolution the link re-enables the subscription and values resume on the
/// same stream. It ends only when the link itself is dropped or the handle is
/// unsubscribed.
#[derive(Debug)]
pub struct NotificationStream {
    handle: Handle,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl NotificationStream {
    pub(crate) fn new(handle: Handle, rx: mpsc::UnboundedReceiver<Vec<u8>>) -> Self {
        Self { handle, rx }
    }

    /// Target-facing handle this stream follows
    pub fn handle(&self) -> Handle {
        self.handle
    }
}

impl Stream for NotificationStream {
    type Item = Vec<u8>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
