// Traffic observer hook: where captured traffic leaves the relay

use super::{Direction, TransformError, TransformOutcome};
use crate::gatt::Handle;
use parking_lot::Mutex;
use tracing::debug;

/// One payload's trip through the pipeline
#[derive(Debug)]
pub struct TrafficEvent<'a> {
    pub direction: Direction,
    /// Victim-facing handle
    pub handle: Handle,
    pub original: &'a [u8],
    pub outcome: &'a Result<TransformOutcome, TransformError>,
}

/// Sink for relayed traffic. Called on the relay's critical path, so
/// implementations must not block.
pub trait TrafficObserver: Send + Sync {
    fn observe(&self, event: &TrafficEvent<'_>);
}

/// Logs every payload at debug level in hex
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl TrafficObserver for TracingObserver {
    fn observe(&self, event: &TrafficEvent<'_>) {
        match event.outcome {
            Ok(TransformOutcome::Forward(out)) if out.as_slice() == event.original => debug!(
                "{} 0x{:04X}: {}",
                event.direction,
                event.handle,
                hex::encode(event.original)
            ),
            Ok(TransformOutcome::Forward(out)) => debug!(
                "{} 0x{:04X}: {} -> {}",
                event.direction,
                event.handle,
                hex::encode(event.original),
                hex::encode(out)
            ),
            Ok(TransformOutcome::Drop(reply)) => debug!(
                "{} 0x{:04X}: {} dropped ({:?})",
                event.direction,
                event.handle,
                hex::encode(event.original),
                reply
            ),
            Err(e) => debug!(
                "{} 0x{:04X}: {} failed: {}",
                event.direction,
                event.handle,
                hex::encode(event.original),
                e
            ),
        }
    }
}

/// Owned copy of a [`TrafficEvent`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedTraffic {
    pub direction: Direction,
    pub handle: Handle,
    pub original: Vec<u8>,
    /// Forwarded bytes, `None` when dropped or failed
    pub forwarded: Option<Vec<u8>>,
}

/// Keeps every event in memory
#[derive(Debug, Default)]
pub struct CaptureObserver {
    events: Mutex<Vec<CapturedTraffic>>,
}

impl CaptureObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<CapturedTraffic> {
        self.events.lock().clone()
    }
}

impl TrafficObserver for CaptureObserver {
    fn observe(&self, event: &TrafficEvent<'_>) {
        let forwarded = match event.outcome {
            Ok(TransformOutcome::Forward(out)) => Some(out.clone()),
            _ => None,
        };
        self.events.lock().push(CapturedTraffic {
            direction: event.direction,
            handle: event.handle,
            original: event.original.to_vec(),
            forwarded,
        });
    }
}
