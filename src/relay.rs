//! Signalling relay: a transparent WebSocket broadcast bus
//!
//! Every frame received from one connection is forwarded unmodified to all
//! other open connections. The relay never inspects payloads and never
//! associates a connection with an identity or a session; routing
//! correctness is entirely the negotiation layer's concern.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::any,
    Router,
};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::config::RelayConfig;

type ConnId = u64;

struct HubState {
    /// Open connections, keyed by an opaque per-process id. A client that
    /// reconnects gets a brand-new entry; nothing persists across sessions.
    conns: RwLock<HashMap<ConnId, mpsc::Sender<Message>>>,
    next_id: AtomicU64,
    max_frame_bytes: usize,
    send_queue: usize,
}

/// The relay hub, bound to a listening address.
pub struct RelayHub {
    listener: TcpListener,
    state: Arc<HubState>,
}

impl RelayHub {
    /// Bind the listening endpoint. A bind failure is fatal to the caller.
    pub async fn bind(config: &RelayConfig) -> Result<Self> {
        let listener = TcpListener::bind(&config.bind_address)
            .await
            .with_context(|| format!("failed to bind relay on {}", config.bind_address))?;
        Ok(Self {
            listener,
            state: Arc::new(HubState {
                conns: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                max_frame_bytes: config.max_frame_bytes,
                send_queue: config.send_queue,
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("relay listener has no local address")
    }

    /// Serve connections until the process exits.
    pub async fn serve(self) -> Result<()> {
        let app = Router::new()
            .route("/", any(ws_handler))
            .with_state(self.state);
        axum::serve(self.listener, app)
            .await
            .context("relay server terminated")
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<HubState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<HubState>) {
    let id = state.next_id.fetch_add(1, Ordering::Relaxed);
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(state.send_queue);

    let open = {
        let mut conns = state.conns.write().await;
        conns.insert(id, tx);
        conns.len()
    };
    info!("client {} connected ({} open)", id, open);

    // Forward queued broadcasts to this client.
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(msg).await.is_err() {
                break;
            }
        }
    });

    while let Some(result) = receiver.next().await {
        match result {
            Ok(Message::Text(text)) => {
                if text.len() > state.max_frame_bytes {
                    warn!(
                        "client {} frame of {} bytes exceeds limit, dropping",
                        id,
                        text.len()
                    );
                    continue;
                }
                broadcast(&state, id, Message::Text(text)).await;
            }
            Ok(Message::Binary(data)) => {
                if data.len() > state.max_frame_bytes {
                    warn!(
                        "client {} frame of {} bytes exceeds limit, dropping",
                        id,
                        data.len()
                    );
                    continue;
                }
                broadcast(&state, id, Message::Binary(data)).await;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("client {} socket error: {}", id, e);
                break;
            }
        }
    }

    remove(&state, id).await;
    send_task.abort();
    let open = state.conns.read().await.len();
    info!("client {} disconnected ({} open)", id, open);
}

/// Deliver a frame to every open connection except the sender.
///
/// The open set is snapshotted under the read lock, then delivery happens
/// without it, so connections added or removed mid-broadcast are not
/// observed as partial or duplicate sends. Delivery failures to one
/// recipient never affect the others or the sender.
async fn broadcast(state: &Arc<HubState>, from: ConnId, msg: Message) {
    let targets: Vec<(ConnId, mpsc::Sender<Message>)> = {
        let conns = state.conns.read().await;
        conns
            .iter()
            .filter(|(id, _)| **id != from)
            .map(|(id, tx)| (*id, tx.clone()))
            .collect()
    };

    for (id, tx) in targets {
        match tx.try_send(msg.clone()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("client {} send queue full, disconnecting", id);
                remove(state, id).await;
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                remove(state, id).await;
            }
        }
    }
}

/// Idempotent removal from the open set.
async fn remove(state: &Arc<HubState>, id: ConnId) {
    if state.conns.write().await.remove(&id).is_some() {
        debug!("client {} removed from open set", id);
    }
}
