// Cloneable handle for observing and stopping a running session

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Idle,
    ConnectingUpstream,
    ResolvingServices,
    Advertising,
    PairingVictim,
    Relaying,
    Closing,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Clone)]
pub struct SessionHandle {
    state: watch::Receiver<SessionState>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl SessionHandle {
    pub(crate) fn new(
        state: watch::Receiver<SessionState>,
        shutdown: Arc<watch::Sender<bool>>,
    ) -> Self {
        Self { state, shutdown }
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Wait until the session reaches `target`; false on timeout or once closed
    pub async fn wait_for(&self, target: SessionState, timeout: Duration) -> bool {
        let mut state = self.state.clone();
        let reached = tokio::time::timeout(
            timeout,
            state.wait_for(|s| *s == target || *s == SessionState::Closed),
        )
        .await;
        matches!(reached, Ok(Ok(s)) if *s == target)
    }

    /// Ask the session to close gracefully
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}
