//! Client-side signalling transport
//!
//! Maintains one WebSocket connection to the relay, re-establishing it with
//! bounded exponential backoff when it drops. Inbound frames are parsed into
//! [`SignalMessage`] values and fanned out to subscribers as a live feed; a
//! subscriber that attaches late misses prior traffic.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use super::types::SignalMessage;

/// Outbound side of the signalling transport.
///
/// Kept as a trait so the negotiation session can be tested against a
/// recording sink instead of a live connection.
pub trait SignalSink: Send + Sync {
    /// Best-effort, non-blocking send. Silently drops the message when no
    /// connection is currently established.
    fn send(&self, msg: &SignalMessage);
}

/// Reconnect policy for [`SignalChannel`].
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Consecutive failed attempts before the channel gives up.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: 10,
        }
    }
}

/// Duplex message channel between this client and the relay.
#[derive(Clone)]
pub struct SignalChannel {
    shared: Arc<Shared>,
}

struct Shared {
    url: String,
    reconnect: ReconnectConfig,
    /// Writer outbox of the currently established connection, if any.
    writer: RwLock<Option<mpsc::Sender<Message>>>,
    events: broadcast::Sender<SignalMessage>,
    running: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl SignalChannel {
    pub fn new(url: impl Into<String>, reconnect: ReconnectConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        let (events, _) = broadcast::channel(64);
        Self {
            shared: Arc::new(Shared {
                url: url.into(),
                reconnect,
                writer: RwLock::new(None),
                events,
                running: AtomicBool::new(false),
                shutdown,
            }),
        }
    }

    /// Establish the connection. Idempotent: calling this while the
    /// connection task is already running is a no-op.
    pub fn connect(&self) {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            debug!("signal channel already connected");
            return;
        }
        let shared = self.shared.clone();
        tokio::spawn(run_connection(shared));
    }

    /// Subscribe to the live feed of inbound signalling messages.
    pub fn subscribe(&self) -> broadcast::Receiver<SignalMessage> {
        self.shared.events.subscribe()
    }

    /// Whether a connection is currently established.
    pub fn is_connected(&self) -> bool {
        self.shared
            .writer
            .read()
            .map(|w| w.is_some())
            .unwrap_or(false)
    }

    /// Stop the connection task and close the connection.
    pub fn shutdown(&self) {
        let _ = self.shared.shutdown.send(true);
    }
}

impl SignalSink for SignalChannel {
    fn send(&self, msg: &SignalMessage) {
        let text = match serde_json::to_string(msg) {
            Ok(text) => text,
            Err(e) => {
                warn!("failed to serialize {} message: {}", msg.kind(), e);
                return;
            }
        };
        let guard = match self.shared.writer.read() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        match guard.as_ref() {
            Some(tx) => {
                if let Err(e) = tx.try_send(Message::Text(text)) {
                    warn!("dropping {} message: {}", msg.kind(), e);
                }
            }
            None => debug!("not connected, dropping {} message", msg.kind()),
        }
    }
}

/// Connection task: connect, pump, reconnect with capped backoff.
async fn run_connection(shared: Arc<Shared>) {
    let mut shutdown_rx = shared.shutdown.subscribe();
    let mut attempts = 0u32;
    let mut delay = shared.reconnect.initial_delay;

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        match connect_async(shared.url.as_str()).await {
            Ok((stream, _)) => {
                info!("connected to relay {}", shared.url);
                attempts = 0;
                delay = shared.reconnect.initial_delay;
                pump(&shared, stream, &mut shutdown_rx).await;
                clear_writer(&shared);
                if *shutdown_rx.borrow() {
                    break;
                }
                warn!("relay connection lost, reconnecting");
            }
            Err(e) => {
                warn!("failed to connect to relay {}: {}", shared.url, e);
            }
        }

        attempts += 1;
        if attempts >= shared.reconnect.max_attempts {
            error!(
                "giving up on relay {} after {} attempts",
                shared.url, attempts
            );
            break;
        }

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown_rx.changed() => {}
        }
        delay = (delay * 2).min(shared.reconnect.max_delay);
    }

    clear_writer(&shared);
    shared.running.store(false, Ordering::SeqCst);
}

/// Drive one established connection until it closes or shutdown is signalled.
async fn pump(
    shared: &Arc<Shared>,
    stream: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    let (mut write, mut read) = stream.split();
    let (tx, mut rx) = mpsc::channel::<Message>(64);
    if let Ok(mut guard) = shared.writer.write() {
        *guard = Some(tx);
    }

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    let _ = write.send(Message::Close(None)).await;
                    return;
                }
            }
            Some(msg) = rx.recv() => {
                if let Err(e) = write.send(msg).await {
                    warn!("relay send failed: {}", e);
                    return;
                }
            }
            frame = read.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<SignalMessage>(&text) {
                            Ok(msg) => {
                                debug!("received {} message", msg.kind());
                                let _ = shared.events.send(msg);
                            }
                            Err(e) => warn!("discarding malformed signal: {}", e),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("relay socket error: {}", e);
                        return;
                    }
                }
            }
        }
    }
}

fn clear_writer(shared: &Arc<Shared>) {
    if let Ok(mut guard) = shared.writer.write() {
        guard.take();
    }
}
