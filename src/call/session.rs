//! Call negotiation state machine
//!
//! One session per process drives a peer-connection capability from idle to
//! media flowing and back, reacting to local commands, signalling messages
//! from the relay, and capability callbacks. Every trigger funnels through
//! a single dispatch loop, so no two transitions ever run concurrently.

use std::collections::VecDeque;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use super::media::{MediaConstraints, MediaError, MediaSource, MediaStream, MediaTrack, VideoSink};
use super::peer::{LinkState, PeerConnectionApi, PeerError, PeerEvent, PeerFactory};
use crate::signal::{SignalMessage, SignalSink};

/// Negotiation phase of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    /// Offer sent, waiting for the remote answer.
    AwaitingAnswer,
    /// Answering an incoming offer.
    Negotiating,
    InCall,
    /// Teardown in progress; always exits to Idle.
    Closing,
}

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallState::Idle => write!(f, "idle"),
            CallState::AwaitingAnswer => write!(f, "awaiting-answer"),
            CallState::Negotiating => write!(f, "negotiating"),
            CallState::InCall => write!(f, "in-call"),
            CallState::Closing => write!(f, "closing"),
        }
    }
}

/// Local actions on the session.
#[derive(Debug, Clone, Copy)]
pub enum SessionCommand {
    Call,
    HangUp,
    StartLocalVideo,
    Shutdown,
}

/// User-visible notifications. Exactly one is emitted per surfaced failure;
/// a permission denial emits none.
#[derive(Debug, Clone)]
pub enum SessionNotice {
    CallFailed(String),
}

/// Everything the dispatch loop reacts to.
enum SessionEvent {
    Command(SessionCommand),
    /// Capability callback, stamped with the generation of the peer that
    /// produced it so events from a torn-down peer are discarded.
    Peer { gen: u64, event: PeerEvent },
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub constraints: MediaConstraints,
    /// Remote candidates buffered while the remote description is pending.
    pub candidate_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            constraints: MediaConstraints::default(),
            candidate_buffer: 64,
        }
    }
}

/// Control handle held by the embedding layer (CLI, UI, tests).
pub struct SessionHandle {
    commands: mpsc::Sender<SessionEvent>,
    pub state: watch::Receiver<CallState>,
    pub notices: mpsc::Receiver<SessionNotice>,
}

impl SessionHandle {
    pub async fn call(&self) {
        let _ = self
            .commands
            .send(SessionEvent::Command(SessionCommand::Call))
            .await;
    }

    pub async fn hang_up(&self) {
        let _ = self
            .commands
            .send(SessionEvent::Command(SessionCommand::HangUp))
            .await;
    }

    pub async fn start_local_video(&self) {
        let _ = self
            .commands
            .send(SessionEvent::Command(SessionCommand::StartLocalVideo))
            .await;
    }

    pub async fn shutdown(&self) {
        let _ = self
            .commands
            .send(SessionEvent::Command(SessionCommand::Shutdown))
            .await;
    }
}

/// Per-process negotiation session.
pub struct CallSession {
    config: SessionConfig,
    sink: Arc<dyn SignalSink>,
    factory: Arc<dyn PeerFactory>,
    media: Arc<dyn MediaSource>,
    local_sink: Arc<dyn VideoSink>,
    remote_sink: Arc<dyn VideoSink>,

    state: CallState,
    state_tx: watch::Sender<CallState>,
    notices_tx: mpsc::Sender<SessionNotice>,
    events_tx: mpsc::Sender<SessionEvent>,
    events_rx: Option<mpsc::Receiver<SessionEvent>>,
    signals: Option<broadcast::Receiver<SignalMessage>>,

    peer: Option<Arc<dyn PeerConnectionApi>>,
    peer_gen: u64,
    stream: Option<MediaStream>,
    remote_description_set: bool,
    pending_candidates: VecDeque<Value>,
    local_video_active: bool,
}

impl CallSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        signals: broadcast::Receiver<SignalMessage>,
        sink: Arc<dyn SignalSink>,
        factory: Arc<dyn PeerFactory>,
        media: Arc<dyn MediaSource>,
        local_sink: Arc<dyn VideoSink>,
        remote_sink: Arc<dyn VideoSink>,
        config: SessionConfig,
    ) -> (Self, SessionHandle) {
        let (state_tx, state_rx) = watch::channel(CallState::Idle);
        let (notices_tx, notices_rx) = mpsc::channel(16);
        let (events_tx, events_rx) = mpsc::channel(64);

        let session = Self {
            config,
            sink,
            factory,
            media,
            local_sink,
            remote_sink,
            state: CallState::Idle,
            state_tx,
            notices_tx,
            events_tx: events_tx.clone(),
            events_rx: Some(events_rx),
            signals: Some(signals),
            peer: None,
            peer_gen: 0,
            stream: None,
            remote_description_set: false,
            pending_candidates: VecDeque::new(),
            local_video_active: false,
        };

        let handle = SessionHandle {
            commands: events_tx,
            state: state_rx,
            notices: notices_rx,
        };

        (session, handle)
    }

    /// Dispatch loop. Runs until shutdown or until both feeds close.
    pub async fn run(mut self) {
        let mut events = match self.events_rx.take() {
            Some(rx) => rx,
            None => return,
        };
        let mut signals = match self.signals.take() {
            Some(rx) => rx,
            None => return,
        };

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(SessionEvent::Command(SessionCommand::Shutdown)) | None => {
                        self.teardown().await;
                        break;
                    }
                    Some(SessionEvent::Command(cmd)) => self.handle_command(cmd).await,
                    Some(SessionEvent::Peer { gen, event }) => {
                        self.handle_peer_event(gen, event).await
                    }
                },
                signal = signals.recv() => match signal {
                    Ok(msg) => self.handle_signal(msg).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("signal feed lagged, {} messages dropped", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        self.teardown().await;
                        break;
                    }
                },
            }
        }
    }

    async fn handle_command(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::Call => {
                if self.state != CallState::Idle {
                    warn!("call requested while {}", self.state);
                    return;
                }
                match self.place_call().await {
                    Ok(()) => self.set_state(CallState::AwaitingAnswer),
                    Err(e) => self.fail(e).await,
                }
            }
            SessionCommand::HangUp => {
                if self.state == CallState::Idle {
                    debug!("hang up while idle, nothing to do");
                    return;
                }
                self.sink.send(&SignalMessage::hangup());
                self.teardown().await;
            }
            SessionCommand::StartLocalVideo => {
                if self.state != CallState::Idle {
                    warn!("start local video requested while {}", self.state);
                    return;
                }
                if let Err(e) = self.start_local_video().await {
                    self.fail(e).await;
                }
            }
            SessionCommand::Shutdown => {}
        }
    }

    async fn handle_signal(&mut self, msg: SignalMessage) {
        match msg {
            SignalMessage::Offer(desc) => {
                if self.state != CallState::Idle {
                    // Renegotiation is unsupported; tolerating the message
                    // must not corrupt the current call.
                    warn!("ignoring offer while {}", self.state);
                    return;
                }
                info!("handling incoming offer");
                self.set_state(CallState::Negotiating);
                match self.accept_offer(desc).await {
                    Ok(()) => self.set_state(CallState::InCall),
                    Err(e) => self.fail(e).await,
                }
            }
            SignalMessage::Answer(desc) => {
                if self.state != CallState::AwaitingAnswer {
                    warn!("ignoring answer while {}", self.state);
                    return;
                }
                info!("handling incoming answer");
                match self.apply_remote_description(desc).await {
                    Ok(()) => self.set_state(CallState::InCall),
                    Err(e) => self.fail(e).await,
                }
            }
            SignalMessage::IceCandidate(candidate) => {
                self.handle_remote_candidate(candidate).await;
            }
            SignalMessage::Hangup => {
                if self.state == CallState::Idle {
                    debug!("remote hangup while idle, ignoring");
                    return;
                }
                info!("remote party hung up");
                self.teardown().await;
            }
        }
    }

    async fn handle_peer_event(&mut self, gen: u64, event: PeerEvent) {
        if gen != self.peer_gen || self.peer.is_none() {
            debug!("discarding event from torn-down peer");
            return;
        }
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                // Sent as discovered, even before the description exchange
                // completes; the remote side buffers as needed.
                self.sink.send(&SignalMessage::ice_candidate(candidate));
            }
            PeerEvent::LinkState(state) => match state {
                LinkState::Failed | LinkState::Disconnected | LinkState::Closed => {
                    if self.state != CallState::Idle {
                        warn!("peer link {}, tearing down", state);
                        self.teardown().await;
                    }
                }
                other => debug!("peer link {}", other),
            },
            PeerEvent::SignalingClosed => {
                if self.state != CallState::Idle {
                    warn!("capability signalling closed, tearing down");
                    self.teardown().await;
                }
            }
            PeerEvent::RemoteTrack { id, kind } => {
                info!("received remote {} track {}", kind, id);
                let stream = MediaStream::new(vec![MediaTrack::remote(id, kind)]);
                self.remote_sink.attach(&stream);
            }
        }
    }

    /// Caller path: capability, media, offer, local description, send.
    async fn place_call(&mut self) -> Result<(), SessionError> {
        self.ensure_peer().await?;
        self.ensure_media().await?;
        self.attach_local_tracks().await?;
        let peer = self.peer()?;
        let offer = peer.create_offer().await?;
        peer.set_local_description(offer.clone()).await?;
        self.sink.send(&SignalMessage::offer(offer));
        info!("sent offer");
        Ok(())
    }

    /// Answerer path, one suspension-point chain: capability, media, remote
    /// description, preview, tracks, answer, local description, send. Any
    /// failing step routes to the classified failure handler.
    async fn accept_offer(&mut self, desc: Value) -> Result<(), SessionError> {
        self.ensure_peer().await?;
        self.ensure_media().await?;
        self.apply_remote_description(desc).await?;
        if let Some(stream) = &self.stream {
            self.local_sink.attach(stream);
            self.local_video_active = true;
        }
        self.attach_local_tracks().await?;
        let peer = self.peer()?;
        let answer = peer.create_answer().await?;
        peer.set_local_description(answer.clone()).await?;
        self.sink.send(&SignalMessage::answer(answer));
        info!("sent answer");
        Ok(())
    }

    async fn apply_remote_description(&mut self, desc: Value) -> Result<(), SessionError> {
        let peer = self.peer()?;
        peer.set_remote_description(desc).await?;
        self.remote_description_set = true;
        self.flush_pending_candidates().await;
        Ok(())
    }

    async fn handle_remote_candidate(&mut self, candidate: Value) {
        if !self.remote_description_set || self.peer.is_none() {
            // Candidate raced ahead of the offer/answer exchange.
            if self.pending_candidates.len() >= self.config.candidate_buffer {
                self.pending_candidates.pop_front();
            }
            self.pending_candidates.push_back(candidate);
            debug!(
                "buffered early candidate ({} pending)",
                self.pending_candidates.len()
            );
            return;
        }
        if let Some(peer) = self.peer.clone() {
            // Late or duplicate candidates are expected traffic.
            if let Err(e) = peer.add_ice_candidate(candidate).await {
                debug!("failed to add remote candidate: {}", e);
            }
        }
    }

    async fn flush_pending_candidates(&mut self) {
        if self.pending_candidates.is_empty() {
            return;
        }
        let peer = match self.peer.clone() {
            Some(peer) => peer,
            None => return,
        };
        let pending: Vec<Value> = self.pending_candidates.drain(..).collect();
        debug!("applying {} buffered candidates", pending.len());
        for candidate in pending {
            if let Err(e) = peer.add_ice_candidate(candidate).await {
                debug!("failed to add buffered candidate: {}", e);
            }
        }
    }

    async fn ensure_peer(&mut self) -> Result<(), SessionError> {
        if self.peer.is_some() {
            return Ok(());
        }
        self.peer_gen += 1;
        let gen = self.peer_gen;
        let (tx, mut rx) = mpsc::channel(64);
        let peer = self.factory.create(tx).await?;

        // Stamp capability callbacks with the peer generation before they
        // enter the dispatch loop.
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if events_tx
                    .send(SessionEvent::Peer { gen, event })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        self.peer = Some(peer);
        self.remote_description_set = false;
        Ok(())
    }

    async fn ensure_media(&mut self) -> Result<(), SessionError> {
        if self.stream.is_some() {
            return Ok(());
        }
        let stream = self.media.acquire(&self.config.constraints).await?;
        info!("acquired local media ({} tracks)", stream.tracks().len());
        self.stream = Some(stream);
        Ok(())
    }

    async fn attach_local_tracks(&mut self) -> Result<(), SessionError> {
        let peer = self.peer()?;
        if let Some(stream) = &self.stream {
            for track in stream.tracks() {
                peer.add_track(track).await?;
            }
        }
        Ok(())
    }

    async fn start_local_video(&mut self) -> Result<(), SessionError> {
        if self.local_video_active {
            debug!("local preview already active");
            return Ok(());
        }
        self.ensure_media().await?;
        if let Some(stream) = &self.stream {
            stream.set_enabled(true);
            self.local_sink.attach(stream);
        }
        self.local_video_active = true;
        info!("local preview active");
        Ok(())
    }

    fn peer(&self) -> Result<Arc<dyn PeerConnectionApi>, SessionError> {
        self.peer
            .clone()
            .ok_or(SessionError::Peer(PeerError::Closed))
    }

    /// Classified failure handling: a missing device is surfaced once, a
    /// permission denial is the user cancelling, everything else is
    /// surfaced with its message. All paths end in teardown.
    async fn fail(&mut self, err: SessionError) {
        match &err {
            SessionError::Media(MediaError::NotFound) => {
                warn!("{}", err);
                let _ = self
                    .notices_tx
                    .try_send(SessionNotice::CallFailed(err.to_string()));
            }
            SessionError::Media(MediaError::PermissionDenied) => {
                info!("device access denied, treating as cancelled call");
            }
            other => {
                warn!("negotiation failed: {}", other);
                let _ = self
                    .notices_tx
                    .try_send(SessionNotice::CallFailed(other.to_string()));
            }
        }
        self.teardown().await;
    }

    /// Deterministic return to Idle: stop transceivers, close and drop the
    /// capability, release the media stream, detach sinks.
    async fn teardown(&mut self) {
        if self.state == CallState::Idle && self.peer.is_none() && self.stream.is_none() {
            return;
        }
        self.set_state(CallState::Closing);

        if let Some(peer) = self.peer.take() {
            if let Err(e) = peer.stop_transceivers().await {
                debug!("failed to stop transceivers: {}", e);
            }
            if let Err(e) = peer.close().await {
                debug!("failed to close peer connection: {}", e);
            }
        }

        if let Some(stream) = self.stream.take() {
            stream.set_enabled(false);
        }
        self.local_sink.detach();
        self.remote_sink.detach();
        self.remote_description_set = false;
        self.pending_candidates.clear();
        self.local_video_active = false;

        self.set_state(CallState::Idle);
        info!("call closed");
    }

    fn set_state(&mut self, state: CallState) {
        if self.state != state {
            debug!("session state {} -> {}", self.state, state);
        }
        self.state = state;
        let _ = self.state_tx.send(state);
    }
}

/// Failure of a negotiation step, classified for the handler in
/// [`CallSession::fail`].
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error(transparent)]
    Peer(#[from] PeerError),
}
