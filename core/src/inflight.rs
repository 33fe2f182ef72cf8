//! In-flight request table
//!
//! Correlates each victim request with the upstream operation serving it. The
//! session inserts an entry when a request enters the pipeline and removes it
//! when the response goes back to the victim; teardown drains whatever is
//! left so nothing leaks past the session.

use crate::gatt::{AttOpcode, Handle, RequestId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InFlightError {
    #[error("Protocol error: {0} already in flight")]
    Duplicate(RequestId),
}

/// A victim request awaiting its upstream result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlightRequest {
    pub id: RequestId,
    /// Victim-facing handle
    pub handle: Handle,
    pub opcode: AttOpcode,
    pub payload: Vec<u8>,
    pub started_at: Instant,
}

impl InFlightRequest {
    pub fn new(id: RequestId, handle: Handle, opcode: AttOpcode, payload: Vec<u8>) -> Self {
        Self {
            id,
            handle,
            opcode,
            payload,
            started_at: Instant::now(),
        }
    }

    pub fn age(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// Request id keyed table; the only mutable state shared by both directions
#[derive(Debug, Default)]
pub struct InFlightTable {
    entries: Mutex<HashMap<RequestId, InFlightRequest>>,
}

impl InFlightTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, request: InFlightRequest) -> Result<(), InFlightError> {
        let mut entries = self.entries.lock();
        if entries.contains_key(&request.id) {
            return Err(InFlightError::Duplicate(request.id));
        }
        entries.insert(request.id, request);
        Ok(())
    }

    pub fn remove(&self, id: RequestId) -> Option<InFlightRequest> {
        self.entries.lock().remove(&id)
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.entries.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Drain every entry, oldest first
    pub fn cancel_all(&self) -> Vec<InFlightRequest> {
        let mut drained: Vec<_> = self.entries.lock().drain().map(|(_, r)| r).collect();
        drained.sort_by_key(|r| r.started_at);
        drained
    }
}
