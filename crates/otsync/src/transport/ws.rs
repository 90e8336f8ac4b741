use futures_util::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex, RwLock};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use super::{Backoff, ConnectionState, Transport, TransportEvent};
use crate::config::{ReconnectPolicy, WireFormat};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket transport with automatic reconnection.
///
/// After [`Transport::connect`] a background task keeps one socket open,
/// reconnecting with exponential backoff whenever it closes or errors, until
/// [`Transport::disconnect`] is called.
pub struct WsTransport {
    inner: Arc<Inner>,
}

struct Inner {
    policy: ReconnectPolicy,
    binary_frames: bool,
    state: RwLock<ConnectionState>,
    outgoing: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    loop_handle: Mutex<Option<LoopHandle>>,
}

/// One connection loop, started by a call to `connect`
struct LoopHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl WsTransport {
    /// Create a transport. Frames are sent as binary when the wire format is lib0.
    pub fn new(policy: ReconnectPolicy, wire_format: WireFormat) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Self {
            inner: Arc::new(Inner {
                policy,
                binary_frames: wire_format == WireFormat::Lib0,
                state: RwLock::new(ConnectionState::Disconnected),
                outgoing: Mutex::new(None),
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
                loop_handle: Mutex::new(None),
            }),
        }
    }
}

impl Transport for WsTransport {
    fn connect(&self, url: &str) {
        let Ok(mut loop_handle) = self.inner.loop_handle.lock() else {
            error!("Transport loop lock poisoned");
            return;
        };

        // The old loop closes its socket and reports Disconnected before the
        // new one starts.
        let previous = loop_handle.take().map(|previous| {
            if !previous.task.is_finished() {
                debug!("Restarting connection loop for {}", url);
            }
            previous.shutdown.send_replace(true);
            previous.task
        });

        let (shutdown, shutdown_rx) = watch::channel(false);
        let inner = self.inner.clone();
        let url = url.to_string();
        let task = tokio::spawn(async move {
            if let Some(previous) = previous {
                if let Err(e) = previous.await {
                    warn!("Previous connection loop failed: {}", e);
                }
            }
            inner.run(url, shutdown_rx).await
        });
        *loop_handle = Some(LoopHandle { shutdown, task });
    }

    fn send(&self, frame: Vec<u8>) {
        let sent = self
            .inner
            .outgoing
            .lock()
            .ok()
            .and_then(|outgoing| outgoing.as_ref().map(|tx| tx.send(frame).is_ok()))
            .unwrap_or(false);

        if !sent {
            warn!("Dropping outbound frame: socket not connected");
        }
    }

    fn disconnect(&self) {
        info!("Disconnect requested");
        self.inner.stop();
    }

    fn state(&self) -> ConnectionState {
        self.inner
            .state
            .read()
            .map(|state| *state)
            .unwrap_or(ConnectionState::Disconnected)
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.inner.events_rx.lock().ok()?.take()
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.inner.stop();
    }
}

impl Inner {
    fn stop(&self) {
        if let Ok(loop_handle) = self.loop_handle.lock() {
            if let Some(current) = loop_handle.as_ref() {
                current.shutdown.send_replace(true);
            }
        }
    }

    async fn run(self: Arc<Self>, url: String, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = Backoff::new(self.policy.clone());

        loop {
            if *shutdown.borrow() {
                break;
            }

            self.set_state(ConnectionState::Connecting);
            info!("Connecting to {}", url);

            let attempt = tokio::select! {
                result = tokio_tungstenite::connect_async(url.as_str()) => result,
                _ = shutdown.changed() => break,
            };

            match attempt {
                Ok((socket, _)) => {
                    backoff.reset();
                    self.run_session(socket, &mut shutdown).await;
                }
                Err(e) => {
                    warn!("Failed to connect to {}: {}", url, e);
                    self.set_state(ConnectionState::Disconnected);
                    self.emit(TransportEvent::Error(e.to_string()));
                }
            }

            if *shutdown.borrow() {
                break;
            }

            let Some(delay) = backoff.next_delay() else {
                error!("Giving up on {} after {} attempts", url, backoff.attempt());
                break;
            };
            debug!("Reconnecting to {} in {:?}", url, delay);

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }

        self.set_state(ConnectionState::Disconnected);
        info!("Connection loop for {} stopped", url);
    }

    async fn run_session(&self, socket: Socket, shutdown: &mut watch::Receiver<bool>) {
        let (mut sink, mut source) = socket.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        self.set_outgoing(Some(out_tx));
        self.set_state(ConnectionState::Connected);
        self.emit(TransportEvent::Connected);
        info!("Socket connected");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        if let Err(e) = sink.send(Message::Close(None)).await {
                            debug!("Close frame not sent: {}", e);
                        }
                        break;
                    }
                }
                Some(frame) = out_rx.recv() => {
                    if let Err(e) = sink.send(self.to_message(frame)).await {
                        warn!("Failed to write to socket: {}", e);
                        self.emit(TransportEvent::Error(e.to_string()));
                        break;
                    }
                }
                incoming = source.next() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        self.emit(TransportEvent::Message(text.as_bytes().to_vec()));
                    }
                    Some(Ok(Message::Binary(data))) => {
                        self.emit(TransportEvent::Message(data.to_vec()));
                    }
                    Some(Ok(Message::Close(frame))) => {
                        info!("Server closed socket: {:?}", frame);
                        break;
                    }
                    Some(Ok(_)) => {
                        // tungstenite answers pings itself
                    }
                    Some(Err(e)) => {
                        warn!("Socket error: {}", e);
                        self.emit(TransportEvent::Error(e.to_string()));
                        break;
                    }
                    None => break,
                },
            }
        }

        self.set_outgoing(None);
        self.set_state(ConnectionState::Disconnected);
        self.emit(TransportEvent::Disconnected);
        info!("Socket disconnected");
    }

    fn to_message(&self, frame: Vec<u8>) -> Message {
        if self.binary_frames {
            return Message::Binary(frame.into());
        }
        match String::from_utf8(frame) {
            Ok(text) => Message::Text(text.into()),
            Err(e) => Message::Binary(e.into_bytes().into()),
        }
    }

    fn set_state(&self, next: ConnectionState) {
        if let Ok(mut state) = self.state.write() {
            *state = next;
        }
    }

    fn set_outgoing(&self, tx: Option<mpsc::UnboundedSender<Vec<u8>>>) {
        if let Ok(mut outgoing) = self.outgoing.lock() {
            *outgoing = tx;
        }
    }

    fn emit(&self, event: TransportEvent) {
        if self.events_tx.send(event).is_err() {
            debug!("Transport event dropped: no reader");
        }
    }
}
