/// Interception Pipeline
///
/// Ordered transform chain applied to every payload crossing the relay.
/// Outbound (victim -> target) traffic runs the slots in registration order;
/// inbound (target -> victim) traffic runs them in reverse, so a slot that
/// edits a request sits symmetrically to one that adjusts its response.
/// The first slot that drops a payload ends the chain.

pub mod config;
pub mod observer;
pub mod transform;

pub use config::{DropReplySpec, PipelineConfig, PipelineConfigError, TransformKind, TransformSpec};
pub use observer::{CaptureObserver, CapturedTraffic, TracingObserver, TrafficEvent, TrafficObserver};
pub use transform::{DropReply, Transform, TransformSlot};

use crate::gatt::Handle;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Which way traffic is flowing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Victim to target: reads and writes
    Outbound,
    /// Target to victim: read values, write results, notifications
    Inbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Outbound => f.write_str("victim->target"),
            Direction::Inbound => f.write_str("target->victim"),
        }
    }
}

/// Result of running a payload through a transform or the whole chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransformOutcome {
    Forward(Vec<u8>),
    Drop(DropReply),
}

/// A transform failed; reported locally, never sent over the link
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Transform {name} failed: {reason}")]
pub struct TransformError {
    pub name: String,
    pub reason: String,
}

impl TransformError {
    pub fn new(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

pub struct Pipeline {
    slots: Vec<TransformSlot>,
    observer: Arc<dyn TrafficObserver>,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline").field("slots", &self.slots).finish()
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::identity()
    }
}

impl Pipeline {
    /// Pass-through pipeline with the tracing observer
    pub fn identity() -> Self {
        Self {
            slots: Vec::new(),
            observer: Arc::new(TracingObserver),
        }
    }

    pub fn new(slots: Vec<TransformSlot>) -> Self {
        Self {
            slots,
            ..Self::identity()
        }
    }

    pub fn with_slot(mut self, slot: TransformSlot) -> Self {
        self.slots.push(slot);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn TrafficObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn slots(&self) -> &[TransformSlot] {
        &self.slots
    }

    pub fn is_identity(&self) -> bool {
        self.slots
            .iter()
            .all(|s| matches!(s.transform, Transform::PassThrough))
    }

    /// Run `payload` through every matching slot for `direction`
    pub fn apply(
        &self,
        direction: Direction,
        handle: Handle,
        payload: Vec<u8>,
    ) -> Result<TransformOutcome, TransformError> {
        let original = payload.clone();
        let outcome = self.run(direction, handle, payload);
        self.observer.observe(&TrafficEvent {
            direction,
            handle,
            original: &original,
            outcome: &outcome,
        });
        outcome
    }

    fn run(
        &self,
        direction: Direction,
        handle: Handle,
        payload: Vec<u8>,
    ) -> Result<TransformOutcome, TransformError> {
        let ordered: Box<dyn Iterator<Item = &TransformSlot>> = match direction {
            Direction::Outbound => Box::new(self.slots.iter()),
            Direction::Inbound => Box::new(self.slots.iter().rev()),
        };

        let mut current = payload;
        for slot in ordered.filter(|s| s.matches(direction, handle)) {
            match slot.transform.apply(direction, handle, current)? {
                TransformOutcome::Forward(next) => current = next,
                dropped @ TransformOutcome::Drop(_) => return Ok(dropped),
            }
        }
        Ok(TransformOutcome::Forward(current))
    }
}
