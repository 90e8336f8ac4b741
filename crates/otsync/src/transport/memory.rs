use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{ConnectionState, Transport, TransportEvent};

/// In-process transport driven by the caller.
///
/// Frames passed to [`Transport::send`] come out of [`MemoryTransport::take_outbound`];
/// frames passed to [`MemoryTransport::deliver`] arrive as
/// [`TransportEvent::Message`]. Connection drops are simulated with
/// [`MemoryTransport::drop_connection`], after which the transport stays down
/// until [`MemoryTransport::reconnect`] or `connect` is called.
pub struct MemoryTransport {
    state: Mutex<ConnectionState>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    outbound_tx: mpsc::UnboundedSender<Vec<u8>>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        Self {
            state: Mutex::new(ConnectionState::Disconnected),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
        }
    }

    /// Take the stream of frames the client sent while connected
    pub fn take_outbound(&self) -> Option<mpsc::UnboundedReceiver<Vec<u8>>> {
        self.outbound_rx.lock().ok()?.take()
    }

    /// Hand a frame to the client as if the server had sent it
    pub fn deliver(&self, frame: Vec<u8>) {
        self.emit(TransportEvent::Message(frame));
    }

    /// Report a transport-level error without changing state
    pub fn fail(&self, message: impl Into<String>) {
        self.emit(TransportEvent::Error(message.into()));
    }

    /// Simulate the socket closing underneath the client
    pub fn drop_connection(&self) {
        if self.set_state(ConnectionState::Disconnected) != ConnectionState::Disconnected {
            self.emit(TransportEvent::Disconnected);
        }
    }

    /// Simulate a successful reconnect
    pub fn reconnect(&self) {
        if self.set_state(ConnectionState::Connected) != ConnectionState::Connected {
            self.emit(TransportEvent::Connected);
        }
    }

    fn set_state(&self, next: ConnectionState) -> ConnectionState {
        match self.state.lock() {
            Ok(mut state) => std::mem::replace(&mut *state, next),
            Err(poisoned) => std::mem::replace(&mut *poisoned.into_inner(), next),
        }
    }

    fn emit(&self, event: TransportEvent) {
        if self.events_tx.send(event).is_err() {
            debug!("Memory transport has no event reader");
        }
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MemoryTransport {
    fn connect(&self, url: &str) {
        debug!("Memory transport connecting to {}", url);
        self.reconnect();
    }

    fn send(&self, frame: Vec<u8>) {
        if self.state() != ConnectionState::Connected {
            warn!("Dropping {} byte frame: transport not connected", frame.len());
            return;
        }
        if self.outbound_tx.send(frame).is_err() {
            debug!("Memory transport outbound reader dropped");
        }
    }

    fn disconnect(&self) {
        self.drop_connection();
    }

    fn state(&self) -> ConnectionState {
        match self.state.lock() {
            Ok(state) => *state,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.events_rx.lock().ok()?.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_state_transitions_emit_once() {
        let transport = MemoryTransport::new();
        let mut events = transport.take_events().unwrap();
        assert!(transport.take_events().is_none());

        transport.connect("memory://test");
        transport.connect("memory://test");
        transport.drop_connection();
        transport.drop_connection();

        assert_eq!(events.recv().await, Some(TransportEvent::Connected));
        assert_eq!(events.recv().await, Some(TransportEvent::Disconnected));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_while_disconnected_is_dropped() {
        let transport = MemoryTransport::new();
        let mut outbound = transport.take_outbound().unwrap();

        transport.send(b"lost".to_vec());
        transport.connect("memory://test");
        transport.send(b"kept".to_vec());

        assert_eq!(outbound.recv().await, Some(b"kept".to_vec()));
        assert!(outbound.try_recv().is_err());
    }
}
