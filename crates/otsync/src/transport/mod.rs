//! Socket ownership: one connection, raw frames in and out, and
//! connection-state events for the protocol client.

use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::ReconnectPolicy;

pub mod memory;
pub mod ws;

pub use memory::MemoryTransport;
pub use ws::WsTransport;

/// Connection state of a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by a transport, in the order they happened
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected,
    Disconnected,
    Error(String),
    Message(Vec<u8>),
}

/// A reconnecting, frame-oriented connection.
///
/// `send` never fails: frames sent while not connected are dropped with a
/// warning, and the caller is expected to check [`Transport::state`] or buffer
/// at a higher layer.
pub trait Transport: Send + Sync {
    /// Start connecting to `url`. Reconnects until [`Transport::disconnect`].
    fn connect(&self, url: &str);

    /// Queue one frame for the socket
    fn send(&self, frame: Vec<u8>);

    /// Close the socket and stop reconnecting
    fn disconnect(&self);

    fn state(&self) -> ConnectionState;

    /// Take the event stream. There is exactly one reader; later calls get `None`.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>>;
}

/// Exponential reconnect delays derived from a [`ReconnectPolicy`]
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Delay before the next attempt, or `None` once the retry cap is hit
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max) = self.policy.max_retries {
            if self.attempt >= max {
                return None;
            }
        }

        let delay = self.delay_for(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        Some(delay)
    }

    /// Start over after a successful connection
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let initial = self.policy.initial_delay_ms as f64;
        let max = self.policy.max_delay_ms as f64;
        let exponent = attempt.min(64) as i32;
        let millis = (initial * self.policy.factor.powi(exponent)).min(max);
        Duration::from_millis(millis as u64)
    }
}
