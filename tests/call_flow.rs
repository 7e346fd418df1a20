//! Negotiation state machine tests with mock capability and media seams,
//! plus a full handshake over a live relay.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{sleep, timeout};

use huddle::call::{
    CallSession, CallState, LinkState, MediaConstraints, MediaError, MediaSource, MediaStream,
    MediaTrack, PeerConnectionApi, PeerError, PeerEvent, PeerFactory, SessionConfig,
    SessionHandle, SessionNotice, TrackKind, VideoSink,
};
use huddle::config::RelayConfig;
use huddle::relay::RelayHub;
use huddle::signal::{ReconnectConfig, SignalChannel, SignalMessage, SignalSink};

// ---------------------------------------------------------------- mocks

#[derive(Default)]
struct MockPeer {
    ops: Mutex<Vec<String>>,
    remote_descriptions: Mutex<Vec<Value>>,
    tracks: AtomicUsize,
    transceivers_stopped: AtomicBool,
    closed: AtomicBool,
}

impl MockPeer {
    fn op_index(&self, op: &str) -> Option<usize> {
        self.ops.lock().unwrap().iter().position(|o| o == op)
    }

    fn remote_description_count(&self) -> usize {
        self.remote_descriptions.lock().unwrap().len()
    }
}

#[async_trait]
impl PeerConnectionApi for MockPeer {
    async fn create_offer(&self) -> Result<Value, PeerError> {
        self.ops.lock().unwrap().push("create_offer".into());
        Ok(json!({"type": "offer", "sdp": "mock offer sdp"}))
    }

    async fn create_answer(&self) -> Result<Value, PeerError> {
        self.ops.lock().unwrap().push("create_answer".into());
        Ok(json!({"type": "answer", "sdp": "mock answer sdp"}))
    }

    async fn set_local_description(&self, _desc: Value) -> Result<(), PeerError> {
        self.ops.lock().unwrap().push("set_local_description".into());
        Ok(())
    }

    async fn set_remote_description(&self, desc: Value) -> Result<(), PeerError> {
        self.ops
            .lock()
            .unwrap()
            .push("set_remote_description".into());
        self.remote_descriptions.lock().unwrap().push(desc);
        Ok(())
    }

    async fn add_ice_candidate(&self, _candidate: Value) -> Result<(), PeerError> {
        self.ops.lock().unwrap().push("add_ice_candidate".into());
        Ok(())
    }

    async fn add_track(&self, _track: &MediaTrack) -> Result<(), PeerError> {
        self.tracks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_transceivers(&self) -> Result<(), PeerError> {
        self.transceivers_stopped.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct MockPeerFactory {
    peers: Mutex<Vec<Arc<MockPeer>>>,
    events: Mutex<Vec<mpsc::Sender<PeerEvent>>>,
}

impl MockPeerFactory {
    fn latest_peer(&self) -> Arc<MockPeer> {
        self.peers.lock().unwrap().last().cloned().expect("no peer created")
    }

    fn latest_events(&self) -> mpsc::Sender<PeerEvent> {
        self.events.lock().unwrap().last().cloned().expect("no peer created")
    }

    fn created(&self) -> usize {
        self.peers.lock().unwrap().len()
    }
}

#[async_trait]
impl PeerFactory for MockPeerFactory {
    async fn create(
        &self,
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnectionApi>, PeerError> {
        let peer = Arc::new(MockPeer::default());
        self.peers.lock().unwrap().push(peer.clone());
        self.events.lock().unwrap().push(events);
        Ok(peer)
    }
}

#[derive(Clone, Copy)]
enum MediaMode {
    Working,
    NotFound,
    PermissionDenied,
}

struct MockMedia {
    mode: MediaMode,
    acquires: AtomicUsize,
}

impl MockMedia {
    fn new(mode: MediaMode) -> Self {
        Self {
            mode,
            acquires: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl MediaSource for MockMedia {
    async fn acquire(&self, _constraints: &MediaConstraints) -> Result<MediaStream, MediaError> {
        self.acquires.fetch_add(1, Ordering::SeqCst);
        match self.mode {
            MediaMode::Working => Ok(MediaStream::new(vec![
                MediaTrack::new("audio0", TrackKind::Audio, None),
                MediaTrack::new("video0", TrackKind::Video, None),
            ])),
            MediaMode::NotFound => Err(MediaError::NotFound),
            MediaMode::PermissionDenied => Err(MediaError::PermissionDenied),
        }
    }
}

#[derive(Default)]
struct RecordingSink {
    attaches: AtomicUsize,
    detaches: AtomicUsize,
}

impl VideoSink for RecordingSink {
    fn attach(&self, _stream: &MediaStream) {
        self.attaches.fetch_add(1, Ordering::SeqCst);
    }

    fn detach(&self) {
        self.detaches.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct CaptureSink(Mutex<Vec<SignalMessage>>);

impl CaptureSink {
    fn kinds(&self) -> Vec<&'static str> {
        self.0.lock().unwrap().iter().map(|m| m.kind()).collect()
    }
}

impl SignalSink for CaptureSink {
    fn send(&self, msg: &SignalMessage) {
        self.0.lock().unwrap().push(msg.clone());
    }
}

// -------------------------------------------------------------- harness

struct Harness {
    signals: broadcast::Sender<SignalMessage>,
    outbound: Arc<CaptureSink>,
    factory: Arc<MockPeerFactory>,
    media: Arc<MockMedia>,
    local_sink: Arc<RecordingSink>,
    handle: SessionHandle,
}

fn spawn_session(media: MediaMode) -> Harness {
    let (signals, signals_rx) = broadcast::channel(32);
    let outbound = Arc::new(CaptureSink::default());
    let factory = Arc::new(MockPeerFactory::default());
    let media = Arc::new(MockMedia::new(media));
    let local_sink = Arc::new(RecordingSink::default());
    let remote_sink = Arc::new(RecordingSink::default());

    let (session, handle) = CallSession::new(
        signals_rx,
        outbound.clone(),
        factory.clone(),
        media.clone(),
        local_sink.clone(),
        remote_sink,
        SessionConfig::default(),
    );
    tokio::spawn(session.run());

    Harness {
        signals,
        outbound,
        factory,
        media,
        local_sink,
        handle,
    }
}

async fn wait_for_state(rx: &mut watch::Receiver<CallState>, want: CallState) {
    timeout(Duration::from_secs(5), async {
        loop {
            if *rx.borrow_and_update() == want {
                return;
            }
            rx.changed().await.expect("session ended");
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {want:?}"));
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !check() {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition never became true");
}

fn offer() -> SignalMessage {
    SignalMessage::offer(json!({"type": "offer", "sdp": "remote offer sdp"}))
}

fn answer() -> SignalMessage {
    SignalMessage::answer(json!({"type": "answer", "sdp": "remote answer sdp"}))
}

fn candidate() -> SignalMessage {
    SignalMessage::ice_candidate(json!({
        "candidate": "candidate:1 1 UDP 1 10.0.0.1 1000 typ host",
        "sdpMid": "0",
        "sdpMLineIndex": 0
    }))
}

// ---------------------------------------------------------------- tests

#[tokio::test]
async fn call_sends_offer_and_awaits_answer() {
    let mut h = spawn_session(MediaMode::Working);

    h.handle.call().await;
    wait_for_state(&mut h.handle.state, CallState::AwaitingAnswer).await;

    assert_eq!(h.outbound.kinds(), vec!["offer"]);
    let peer = h.factory.latest_peer();
    assert_eq!(peer.tracks.load(Ordering::SeqCst), 2);
    assert!(peer.op_index("set_local_description").is_some());
}

#[tokio::test]
async fn answer_completes_the_handshake() {
    let mut h = spawn_session(MediaMode::Working);

    h.handle.call().await;
    wait_for_state(&mut h.handle.state, CallState::AwaitingAnswer).await;

    h.signals.send(answer()).unwrap();
    wait_for_state(&mut h.handle.state, CallState::InCall).await;

    assert_eq!(h.factory.latest_peer().remote_description_count(), 1);
}

#[tokio::test]
async fn incoming_offer_is_answered() {
    let mut h = spawn_session(MediaMode::Working);

    h.signals.send(offer()).unwrap();
    wait_for_state(&mut h.handle.state, CallState::InCall).await;

    assert_eq!(h.outbound.kinds(), vec!["answer"]);
    let peer = h.factory.latest_peer();
    assert_eq!(peer.remote_description_count(), 1);
    assert_eq!(peer.tracks.load(Ordering::SeqCst), 2);
    // Local preview attaches while answering.
    assert!(h.local_sink.attaches.load(Ordering::SeqCst) >= 1);
}

#[tokio::test]
async fn early_candidate_is_buffered_until_description_arrives() {
    let mut h = spawn_session(MediaMode::Working);

    // Candidate races ahead of the offer.
    h.signals.send(candidate()).unwrap();
    sleep(Duration::from_millis(50)).await;
    h.signals.send(offer()).unwrap();
    wait_for_state(&mut h.handle.state, CallState::InCall).await;

    let peer = h.factory.latest_peer();
    let set_remote = peer.op_index("set_remote_description").expect("no remote description");
    let added = peer.op_index("add_ice_candidate").expect("candidate never applied");
    assert!(set_remote < added, "candidate applied before remote description");
}

#[tokio::test]
async fn late_candidates_are_applied_directly() {
    let mut h = spawn_session(MediaMode::Working);

    h.handle.call().await;
    wait_for_state(&mut h.handle.state, CallState::AwaitingAnswer).await;
    h.signals.send(answer()).unwrap();
    wait_for_state(&mut h.handle.state, CallState::InCall).await;

    h.signals.send(candidate()).unwrap();
    let peer = h.factory.latest_peer();
    wait_until(|| peer.op_index("add_ice_candidate").is_some()).await;
}

#[tokio::test]
async fn local_candidates_are_signalled_immediately() {
    let mut h = spawn_session(MediaMode::Working);

    h.handle.call().await;
    wait_for_state(&mut h.handle.state, CallState::AwaitingAnswer).await;

    // Trickle before any answer arrived.
    h.factory
        .latest_events()
        .send(PeerEvent::LocalCandidate(json!({"candidate": "c"})))
        .await
        .unwrap();

    let outbound = h.outbound.clone();
    wait_until(move || outbound.kinds().contains(&"ice-candidate")).await;
}

#[tokio::test]
async fn remote_hangup_returns_to_idle_and_releases_resources() {
    let mut h = spawn_session(MediaMode::Working);

    h.signals.send(offer()).unwrap();
    wait_for_state(&mut h.handle.state, CallState::InCall).await;

    h.signals.send(SignalMessage::hangup()).unwrap();
    wait_for_state(&mut h.handle.state, CallState::Idle).await;

    let peer = h.factory.latest_peer();
    assert!(peer.transceivers_stopped.load(Ordering::SeqCst));
    assert!(peer.closed.load(Ordering::SeqCst));
    assert!(h.local_sink.detaches.load(Ordering::SeqCst) >= 1);
}

#[tokio::test]
async fn local_hangup_notifies_remote_and_returns_to_idle() {
    let mut h = spawn_session(MediaMode::Working);

    h.handle.call().await;
    wait_for_state(&mut h.handle.state, CallState::AwaitingAnswer).await;

    h.handle.hang_up().await;
    wait_for_state(&mut h.handle.state, CallState::Idle).await;

    assert!(h.outbound.kinds().contains(&"hangup"));
    assert!(h.factory.latest_peer().closed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn link_failure_tears_down_the_call() {
    let mut h = spawn_session(MediaMode::Working);

    h.signals.send(offer()).unwrap();
    wait_for_state(&mut h.handle.state, CallState::InCall).await;

    h.factory
        .latest_events()
        .send(PeerEvent::LinkState(LinkState::Failed))
        .await
        .unwrap();
    wait_for_state(&mut h.handle.state, CallState::Idle).await;

    assert!(h.factory.latest_peer().closed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn offer_while_in_call_is_ignored() {
    let mut h = spawn_session(MediaMode::Working);

    h.signals.send(offer()).unwrap();
    wait_for_state(&mut h.handle.state, CallState::InCall).await;
    let answers_before = h.outbound.kinds().len();

    h.signals.send(offer()).unwrap();
    sleep(Duration::from_millis(200)).await;

    assert_eq!(*h.handle.state.borrow(), CallState::InCall);
    assert_eq!(h.factory.latest_peer().remote_description_count(), 1);
    assert_eq!(h.outbound.kinds().len(), answers_before);
    assert_eq!(h.factory.created(), 1);
}

#[tokio::test]
async fn permission_denied_is_silent() {
    let mut h = spawn_session(MediaMode::PermissionDenied);

    h.handle.call().await;

    let factory = h.factory.clone();
    wait_until(move || {
        factory.created() == 1 && factory.latest_peer().closed.load(Ordering::SeqCst)
    })
    .await;

    assert_eq!(*h.handle.state.borrow(), CallState::Idle);
    assert!(h.handle.notices.try_recv().is_err(), "no notice expected");
    assert!(h.outbound.kinds().is_empty(), "no offer should have left");
}

#[tokio::test]
async fn missing_device_surfaces_exactly_one_notice() {
    let mut h = spawn_session(MediaMode::NotFound);

    h.handle.call().await;

    let notice = timeout(Duration::from_secs(5), h.handle.notices.recv())
        .await
        .expect("no notice surfaced")
        .expect("notice channel closed");
    let SessionNotice::CallFailed(reason) = notice;
    assert!(reason.contains("no camera or microphone"));

    assert!(h.handle.notices.try_recv().is_err(), "expected a single notice");
    wait_for_state(&mut h.handle.state, CallState::Idle).await;
}

#[tokio::test]
async fn local_preview_stays_idle_and_reuses_the_stream() {
    let mut h = spawn_session(MediaMode::Working);

    h.handle.start_local_video().await;
    let local = h.local_sink.clone();
    wait_until(move || local.attaches.load(Ordering::SeqCst) == 1).await;

    assert_eq!(*h.handle.state.borrow(), CallState::Idle);
    assert_eq!(h.media.acquires.load(Ordering::SeqCst), 1);
    assert_eq!(h.factory.created(), 0, "preview must not create a peer");

    // Requesting the preview again is a no-op.
    h.handle.start_local_video().await;
    sleep(Duration::from_millis(100)).await;
    assert_eq!(h.local_sink.attaches.load(Ordering::SeqCst), 1);
    assert_eq!(h.media.acquires.load(Ordering::SeqCst), 1);

    // A subsequent call reuses the already-acquired stream.
    h.handle.call().await;
    wait_for_state(&mut h.handle.state, CallState::AwaitingAnswer).await;
    assert_eq!(h.media.acquires.load(Ordering::SeqCst), 1);
    assert_eq!(h.factory.latest_peer().tracks.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn hangup_while_idle_is_a_noop() {
    let h = spawn_session(MediaMode::Working);

    h.signals.send(SignalMessage::hangup()).unwrap();
    h.handle.hang_up().await;
    sleep(Duration::from_millis(100)).await;

    assert_eq!(*h.handle.state.borrow(), CallState::Idle);
    assert_eq!(h.factory.created(), 0);
}

// ------------------------------------------------- end-to-end handshake

async fn spawn_relay_session(
    addr: std::net::SocketAddr,
) -> (SignalChannel, Arc<MockPeerFactory>, SessionHandle) {
    let channel = SignalChannel::new(format!("ws://{addr}/"), ReconnectConfig::default());
    let factory = Arc::new(MockPeerFactory::default());

    let (session, handle) = CallSession::new(
        channel.subscribe(),
        Arc::new(channel.clone()),
        factory.clone(),
        Arc::new(MockMedia::new(MediaMode::Working)),
        Arc::new(RecordingSink::default()),
        Arc::new(RecordingSink::default()),
        SessionConfig::default(),
    );
    tokio::spawn(session.run());

    channel.connect();
    let probe = channel.clone();
    timeout(Duration::from_secs(5), async move {
        while !probe.is_connected() {
            sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("channel never connected");

    (channel, factory, handle)
}

#[tokio::test]
async fn full_handshake_over_live_relay() {
    let mut config = RelayConfig::default();
    config.bind_address = "127.0.0.1:0".to_string();
    let hub = RelayHub::bind(&config).await.unwrap();
    let addr = hub.local_addr().unwrap();
    tokio::spawn(hub.serve());

    let (_chan_a, factory_a, mut handle_a) = spawn_relay_session(addr).await;
    let (_chan_b, factory_b, mut handle_b) = spawn_relay_session(addr).await;

    handle_a.call().await;

    wait_for_state(&mut handle_a.state, CallState::InCall).await;
    wait_for_state(&mut handle_b.state, CallState::InCall).await;

    // B answered exactly once; A applied exactly that answer.
    assert_eq!(factory_b.latest_peer().remote_description_count(), 1);
    assert_eq!(factory_a.latest_peer().remote_description_count(), 1);

    // Hang up from A; both sides return to idle.
    handle_a.hang_up().await;
    wait_for_state(&mut handle_a.state, CallState::Idle).await;
    wait_for_state(&mut handle_b.state, CallState::Idle).await;

    assert!(factory_a.latest_peer().closed.load(Ordering::SeqCst));
    assert!(factory_b.latest_peer().closed.load(Ordering::SeqCst));
}
