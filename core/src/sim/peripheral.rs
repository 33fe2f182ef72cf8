// Simulated peripheral stack plus the victim that talks to it
//
// Tests inject victim behaviour (connect, pair, read, write) and observe what
// the relay sends back. Every recorded change wakes waiters.

use crate::downstream::{DisconnectReason, DownstreamError, PeripheralBridge, PeripheralEvent};
use crate::gatt::{GattResponse, Handle, RequestId, WriteKind};
use crate::pairing::{PairingDecision, PairingMethod};
use crate::topology::{AdvertisementData, DeviceProfile, PeerAddress};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};

/// Everything the relay did toward the victim
#[derive(Debug, Clone, Default)]
pub struct PeripheralRecord {
    pub served: usize,
    pub advertising: bool,
    pub advertising_starts: usize,
    pub advertisements: Vec<AdvertisementData>,
    pub responses: Vec<(RequestId, GattResponse)>,
    pub notifications: Vec<(Handle, Vec<u8>, bool)>,
    pub disconnects: Vec<(PeerAddress, DisconnectReason)>,
    pub pairing_decisions: Vec<(RequestId, PairingDecision)>,
}

pub struct SimPeripheral {
    events_tx: mpsc::UnboundedSender<PeripheralEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<PeripheralEvent>>>,
    record: Mutex<PeripheralRecord>,
    pending_pairings: Mutex<HashMap<RequestId, PeerAddress>>,
    advertising_error: Mutex<Option<String>>,
    /// True while the victim withholds indication confirmations
    confirmations_held: watch::Sender<bool>,
    next_id: AtomicU64,
    changed: Notify,
}

impl Default for SimPeripheral {
    fn default() -> Self {
        Self::new()
    }
}

impl SimPeripheral {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (confirmations_held, _) = watch::channel(false);
        Self {
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            record: Mutex::new(PeripheralRecord::default()),
            pending_pairings: Mutex::new(HashMap::new()),
            advertising_error: Mutex::new(None),
            confirmations_held,
            next_id: AtomicU64::new(1),
            changed: Notify::new(),
        }
    }

    /// Make every advertising attempt fail
    pub fn fail_advertising(&self, reason: impl Into<String>) {
        *self.advertising_error.lock() = Some(reason.into());
    }

    /// Leave indications unconfirmed until [`Self::confirm_indications`]
    pub fn hold_confirmations(&self) {
        self.confirmations_held.send_replace(true);
    }

    pub fn confirm_indications(&self) {
        self.confirmations_held.send_replace(false);
    }

    fn next_id(&self) -> RequestId {
        RequestId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn inject(&self, event: PeripheralEvent) {
        // The receiver only goes away with the session
        let _ = self.events_tx.send(event);
    }

    fn update(&self, f: impl FnOnce(&mut PeripheralRecord)) {
        f(&mut self.record.lock());
        self.changed.notify_waiters();
    }

    // ------------------------------------------------------------------
    // Victim actions
    // ------------------------------------------------------------------

    pub fn connect_victim(&self, peer: PeerAddress) {
        self.inject(PeripheralEvent::Connected(peer));
    }

    pub fn disconnect_victim(&self, peer: PeerAddress) {
        self.inject(PeripheralEvent::Disconnected(peer));
    }

    pub fn pair(&self, peer: PeerAddress, method: PairingMethod) -> RequestId {
        let id = self.next_id();
        self.pending_pairings.lock().insert(id, peer);
        self.inject(PeripheralEvent::PairingRequest { id, peer, method });
        id
    }

    pub fn read(&self, handle: Handle, offset: u16) -> RequestId {
        let id = self.next_id();
        self.inject(PeripheralEvent::Read { id, handle, offset });
        id
    }

    /// Read under an id the victim already used, as a misbehaving stack would
    pub fn read_as(&self, id: RequestId, handle: Handle, offset: u16) {
        self.inject(PeripheralEvent::Read { id, handle, offset });
    }

    pub fn write(&self, handle: Handle, value: impl Into<Vec<u8>>, kind: WriteKind) -> RequestId {
        let id = self.next_id();
        self.inject(PeripheralEvent::Write {
            id,
            handle,
            value: value.into(),
            kind,
            offset: 0,
        });
        id
    }

    /// Write 0x0001 to a CCCD
    pub fn enable_notifications(&self, cccd_handle: Handle) -> RequestId {
        self.write(cccd_handle, vec![0x01, 0x00], WriteKind::Request)
    }

    /// Write 0x0002 to a CCCD
    pub fn enable_indications(&self, cccd_handle: Handle) -> RequestId {
        self.write(cccd_handle, vec![0x02, 0x00], WriteKind::Request)
    }

    pub fn disable_notifications(&self, cccd_handle: Handle) -> RequestId {
        self.write(cccd_handle, vec![0x00, 0x00], WriteKind::Request)
    }

    // ------------------------------------------------------------------
    // Observations
    // ------------------------------------------------------------------

    pub fn record(&self) -> PeripheralRecord {
        self.record.lock().clone()
    }

    pub fn served_count(&self) -> usize {
        self.record.lock().served
    }

    pub fn is_advertising(&self) -> bool {
        self.record.lock().advertising
    }

    pub fn advertising_starts(&self) -> usize {
        self.record.lock().advertising_starts
    }

    pub fn responses(&self) -> Vec<(RequestId, GattResponse)> {
        self.record.lock().responses.clone()
    }

    pub fn response_to(&self, id: RequestId) -> Option<GattResponse> {
        self.record
            .lock()
            .responses
            .iter()
            .find(|(r, _)| *r == id)
            .map(|(_, response)| response.clone())
    }

    pub fn notifications(&self) -> Vec<(Handle, Vec<u8>, bool)> {
        self.record.lock().notifications.clone()
    }

    pub fn disconnects(&self) -> Vec<(PeerAddress, DisconnectReason)> {
        self.record.lock().disconnects.clone()
    }

    pub fn pairing_decisions(&self) -> Vec<(RequestId, PairingDecision)> {
        self.record.lock().pairing_decisions.clone()
    }

    /// Wait until `predicate` holds for the record, or `timeout` passes
    pub async fn wait_until<F>(&self, timeout: Duration, mut predicate: F) -> bool
    where
        F: FnMut(&PeripheralRecord) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if predicate(&self.record.lock()) {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return false;
            }
        }
    }

    pub async fn wait_for_response(&self, id: RequestId, timeout: Duration) -> Option<GattResponse> {
        let answered = self
            .wait_until(timeout, |r| r.responses.iter().any(|(rid, _)| *rid == id))
            .await;
        if answered {
            self.response_to(id)
        } else {
            None
        }
    }

    pub async fn wait_for_responses(&self, count: usize, timeout: Duration) -> bool {
        self.wait_until(timeout, |r| r.responses.len() >= count).await
    }

    pub async fn wait_for_notifications(&self, count: usize, timeout: Duration) -> bool {
        self.wait_until(timeout, |r| r.notifications.len() >= count)
            .await
    }

    pub async fn wait_for_advertising(&self, starts: usize, timeout: Duration) -> bool {
        self.wait_until(timeout, |r| r.advertising && r.advertising_starts >= starts)
            .await
    }

    pub async fn wait_for_disconnect(&self, timeout: Duration) -> Option<(PeerAddress, DisconnectReason)> {
        if self.wait_until(timeout, |r| !r.disconnects.is_empty()).await {
            self.record.lock().disconnects.first().copied()
        } else {
            None
        }
    }

    pub async fn wait_for_pairing_decision(
        &self,
        id: RequestId,
        timeout: Duration,
    ) -> Option<PairingDecision> {
        let decided = self
            .wait_until(timeout, |r| r.pairing_decisions.iter().any(|(rid, _)| *rid == id))
            .await;
        if !decided {
            return None;
        }
        self.record
            .lock()
            .pairing_decisions
            .iter()
            .find(|(rid, _)| *rid == id)
            .map(|(_, decision)| *decision)
    }
}

#[async_trait]
impl PeripheralBridge for SimPeripheral {
    async fn serve(&self, _profile: &DeviceProfile) -> Result<(), DownstreamError> {
        self.update(|r| r.served += 1);
        Ok(())
    }

    async fn start_advertising(
        &self,
        advertisement: &AdvertisementData,
    ) -> Result<(), DownstreamError> {
        if let Some(reason) = self.advertising_error.lock().clone() {
            return Err(DownstreamError::AdapterUnavailable(reason));
        }
        self.update(|r| {
            r.advertising = true;
            r.advertising_starts += 1;
            r.advertisements.push(advertisement.clone());
        });
        Ok(())
    }

    async fn stop_advertising(&self) -> Result<(), DownstreamError> {
        self.update(|r| r.advertising = false);
        Ok(())
    }

    async fn respond(&self, id: RequestId, response: GattResponse) -> Result<(), DownstreamError> {
        self.update(|r| r.responses.push((id, response)));
        Ok(())
    }

    async fn pairing_response(
        &self,
        id: RequestId,
        decision: PairingDecision,
    ) -> Result<(), DownstreamError> {
        self.update(|r| r.pairing_decisions.push((id, decision)));
        // The host stack reports the outcome once SMP finishes
        if let Some(peer) = self.pending_pairings.lock().remove(&id) {
            self.inject(PeripheralEvent::PairingComplete {
                peer,
                success: decision == PairingDecision::Accept,
            });
        }
        Ok(())
    }

    async fn notify(&self, handle: Handle, value: &[u8], indicate: bool) -> Result<(), DownstreamError> {
        self.update(|r| r.notifications.push((handle, value.to_vec(), indicate)));
        if indicate {
            let mut held = self.confirmations_held.subscribe();
            while *held.borrow_and_update() {
                if held.changed().await.is_err() {
                    break;
                }
            }
        }
        Ok(())
    }

    async fn disconnect(
        &self,
        peer: &PeerAddress,
        reason: DisconnectReason,
    ) -> Result<(), DownstreamError> {
        self.update(|r| r.disconnects.push((*peer, reason)));
        self.inject(PeripheralEvent::Disconnected(*peer));
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PeripheralEvent>> {
        self.events_rx.lock().take()
    }
}
