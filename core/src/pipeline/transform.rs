//! Transform variants
//!
//! A closed set of byte transforms. Each one is a pure function of
//! (direction, victim handle, payload) and runs in bounded time; the only
//! open-ended variant is [`Transform::Custom`], which callers supply in code.

use super::{Direction, TransformError, TransformOutcome};
use crate::gatt::{GattErrorCode, GattResponse, Handle};
use std::fmt;
use std::sync::Arc;

/// What the victim receives when a transform drops an operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReply {
    /// Empty read value, or a Write Response
    Ack,
    /// Fixed read value; writes are acknowledged
    Value(Vec<u8>),
    /// Error Response with the given code
    Error(GattErrorCode),
}

impl DropReply {
    /// Response for a dropped read (`is_read`) or write
    pub fn to_response(&self, is_read: bool) -> GattResponse {
        match (self, is_read) {
            (DropReply::Error(code), _) => GattResponse::Error(*code),
            (DropReply::Value(value), true) => GattResponse::Value(value.clone()),
            (DropReply::Ack, true) => GattResponse::Value(Vec::new()),
            (_, false) => GattResponse::WriteAck,
        }
    }
}

type CustomFn =
    dyn Fn(Direction, Handle, &[u8]) -> Result<TransformOutcome, TransformError> + Send + Sync;

/// Caller-supplied transform
#[derive(Clone)]
pub struct CustomTransform(Arc<CustomFn>);

impl fmt::Debug for CustomTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CustomTransform(..)")
    }
}

#[derive(Debug, Clone)]
pub enum Transform {
    PassThrough,
    /// Replace the payload with fixed bytes
    Replace(Vec<u8>),
    /// XOR the payload with a repeating key
    Xor(Vec<u8>),
    /// Do not forward; answer with the given reply
    Drop(DropReply),
    Custom(CustomTransform),
}

impl Transform {
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(Direction, Handle, &[u8]) -> Result<TransformOutcome, TransformError>
            + Send
            + Sync
            + 'static,
    {
        Transform::Custom(CustomTransform(Arc::new(f)))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Transform::PassThrough => "pass_through",
            Transform::Replace(_) => "replace",
            Transform::Xor(_) => "xor",
            Transform::Drop(_) => "drop",
            Transform::Custom(_) => "custom",
        }
    }

    pub(crate) fn apply(
        &self,
        direction: Direction,
        handle: Handle,
        payload: Vec<u8>,
    ) -> Result<TransformOutcome, TransformError> {
        match self {
            Transform::PassThrough => Ok(TransformOutcome::Forward(payload)),
            Transform::Replace(value) => Ok(TransformOutcome::Forward(value.clone())),
            Transform::Xor(key) => {
                if key.is_empty() {
                    return Ok(TransformOutcome::Forward(payload));
                }
                let out = payload
                    .iter()
                    .zip(key.iter().cycle())
                    .map(|(b, k)| b ^ k)
                    .collect();
                Ok(TransformOutcome::Forward(out))
            }
            Transform::Drop(reply) => Ok(TransformOutcome::Drop(reply.clone())),
            Transform::Custom(custom) => (custom.0)(direction, handle, &payload),
        }
    }
}

/// A transform plus the traffic it applies to
#[derive(Debug, Clone)]
pub struct TransformSlot {
    pub name: String,
    pub transform: Transform,
    /// Only this direction, or both when `None`
    pub direction: Option<Direction>,
    /// Only this victim handle, or all when `None`
    pub handle: Option<Handle>,
}

impl TransformSlot {
    pub fn new(name: impl Into<String>, transform: Transform) -> Self {
        Self {
            name: name.into(),
            transform,
            direction: None,
            handle: None,
        }
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = Some(direction);
        self
    }

    pub fn with_handle(mut self, handle: Handle) -> Self {
        self.handle = Some(handle);
        self
    }

    pub fn matches(&self, direction: Direction, handle: Handle) -> bool {
        self.direction.map_or(true, |d| d == direction) && self.handle.map_or(true, |h| h == handle)
    }
}
