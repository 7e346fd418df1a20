//! Peer-connection capability
//!
//! The negotiation session drives the underlying transport through
//! [`PeerConnectionApi`]; callbacks come back as [`PeerEvent`] values on a
//! channel, so the session stays testable without a live transport.
//! [`RtcPeer`] is the production implementation over the `webrtc` crate.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

use super::media::{MediaTrack, TrackKind};

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("no active peer connection")]
    Closed,
    #[error("malformed session description: {0}")]
    Description(String),
    #[error(transparent)]
    Capability(#[from] webrtc::Error),
}

/// Health of the negotiated direct peer link, independent of signalling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkState::New => write!(f, "new"),
            LinkState::Connecting => write!(f, "connecting"),
            LinkState::Connected => write!(f, "connected"),
            LinkState::Disconnected => write!(f, "disconnected"),
            LinkState::Failed => write!(f, "failed"),
            LinkState::Closed => write!(f, "closed"),
        }
    }
}

/// Asynchronous callbacks from the capability, delivered as events.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A local ICE candidate was discovered and should be signalled to the
    /// remote party immediately, whatever the negotiation phase.
    LocalCandidate(Value),
    LinkState(LinkState),
    /// The capability's signalling state reached closed.
    SignalingClosed,
    RemoteTrack { id: String, kind: TrackKind },
}

/// Command interface of the peer-connection capability.
///
/// Descriptions and candidates are opaque JSON blobs in the shape the wire
/// envelope carries (`{"type","sdp"}` and candidate-init objects).
#[async_trait]
pub trait PeerConnectionApi: Send + Sync {
    async fn create_offer(&self) -> Result<Value, PeerError>;
    async fn create_answer(&self) -> Result<Value, PeerError>;
    async fn set_local_description(&self, desc: Value) -> Result<(), PeerError>;
    async fn set_remote_description(&self, desc: Value) -> Result<(), PeerError>;
    async fn add_ice_candidate(&self, candidate: Value) -> Result<(), PeerError>;
    async fn add_track(&self, track: &MediaTrack) -> Result<(), PeerError>;
    async fn stop_transceivers(&self) -> Result<(), PeerError>;
    async fn close(&self) -> Result<(), PeerError>;
}

/// Creates capability instances wired to an event channel.
#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create(
        &self,
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnectionApi>, PeerError>;
}

/// Production factory backed by the `webrtc` crate.
pub struct RtcPeerFactory {
    stun_servers: Vec<String>,
}

impl RtcPeerFactory {
    pub fn new(stun_servers: Vec<String>) -> Self {
        Self { stun_servers }
    }
}

#[async_trait]
impl PeerFactory for RtcPeerFactory {
    async fn create(
        &self,
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnectionApi>, PeerError> {
        let peer = RtcPeer::new(&self.stun_servers, events).await?;
        Ok(Arc::new(peer))
    }
}

/// Peer connection over the `webrtc` crate.
pub struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
}

impl RtcPeer {
    pub async fn new(
        stun_servers: &[String],
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<Self, PeerError> {
        let mut media = MediaEngine::default();
        media.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media)?;

        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers: Vec<RTCIceServer> = stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect();

        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(config).await?);
        install_handlers(&pc, events);
        Ok(Self { pc })
    }
}

fn install_handlers(pc: &Arc<RTCPeerConnection>, events: mpsc::Sender<PeerEvent>) {
    let tx = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let tx = tx.clone();
        Box::pin(async move {
            if let Some(c) = candidate {
                if let Ok(init) = c.to_json() {
                    if let Ok(value) = serde_json::to_value(&init) {
                        let _ = tx.send(PeerEvent::LocalCandidate(value)).await;
                    }
                }
            }
        })
    }));

    let tx = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let tx = tx.clone();
        info!("peer connection state: {}", state);
        Box::pin(async move {
            let mapped = match state {
                RTCPeerConnectionState::New => LinkState::New,
                RTCPeerConnectionState::Connecting => LinkState::Connecting,
                RTCPeerConnectionState::Connected => LinkState::Connected,
                RTCPeerConnectionState::Disconnected => LinkState::Disconnected,
                RTCPeerConnectionState::Failed => LinkState::Failed,
                RTCPeerConnectionState::Closed => LinkState::Closed,
                RTCPeerConnectionState::Unspecified => return,
            };
            let _ = tx.send(PeerEvent::LinkState(mapped)).await;
        })
    }));

    let tx = events.clone();
    pc.on_signaling_state_change(Box::new(move |state: RTCSignalingState| {
        let tx = tx.clone();
        debug!("signaling state: {}", state);
        Box::pin(async move {
            if state == RTCSignalingState::Closed {
                let _ = tx.send(PeerEvent::SignalingClosed).await;
            }
        })
    }));

    let tx = events;
    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        let tx = tx.clone();
        Box::pin(async move {
            let kind = match track.kind() {
                RTPCodecType::Audio => TrackKind::Audio,
                _ => TrackKind::Video,
            };
            let _ = tx
                .send(PeerEvent::RemoteTrack {
                    id: track.id(),
                    kind,
                })
                .await;
        })
    }));
}

fn description_from_value(desc: &Value) -> Result<RTCSessionDescription, PeerError> {
    let sdp = desc
        .get("sdp")
        .and_then(|s| s.as_str())
        .ok_or_else(|| PeerError::Description("missing sdp".to_string()))?;
    match desc.get("type").and_then(|t| t.as_str()) {
        Some("offer") => Ok(RTCSessionDescription::offer(sdp.to_string())?),
        Some("answer") => Ok(RTCSessionDescription::answer(sdp.to_string())?),
        other => Err(PeerError::Description(format!(
            "unsupported description type: {other:?}"
        ))),
    }
}

fn description_to_value(desc: &RTCSessionDescription) -> Value {
    serde_json::json!({
        "type": desc.sdp_type.to_string().to_lowercase(),
        "sdp": desc.sdp,
    })
}

#[async_trait]
impl PeerConnectionApi for RtcPeer {
    async fn create_offer(&self) -> Result<Value, PeerError> {
        let offer = self.pc.create_offer(None).await?;
        Ok(description_to_value(&offer))
    }

    async fn create_answer(&self) -> Result<Value, PeerError> {
        let answer = self.pc.create_answer(None).await?;
        Ok(description_to_value(&answer))
    }

    async fn set_local_description(&self, desc: Value) -> Result<(), PeerError> {
        let desc = description_from_value(&desc)?;
        self.pc.set_local_description(desc).await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: Value) -> Result<(), PeerError> {
        let desc = description_from_value(&desc)?;
        self.pc.set_remote_description(desc).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: Value) -> Result<(), PeerError> {
        let candidate_str = candidate
            .get("candidate")
            .and_then(|c| c.as_str())
            .unwrap_or("");
        // An empty candidate marks end-of-candidates.
        if candidate_str.is_empty() {
            return Ok(());
        }

        let init = RTCIceCandidateInit {
            candidate: candidate_str.to_string(),
            sdp_mid: candidate
                .get("sdpMid")
                .and_then(|m| m.as_str())
                .map(|s| s.to_string()),
            sdp_mline_index: candidate
                .get("sdpMLineIndex")
                .and_then(|i| i.as_u64())
                .map(|i| i as u16),
            username_fragment: candidate
                .get("usernameFragment")
                .and_then(|u| u.as_str())
                .map(|s| s.to_string()),
        };
        self.pc.add_ice_candidate(init).await?;
        Ok(())
    }

    async fn add_track(&self, track: &MediaTrack) -> Result<(), PeerError> {
        if let Some(rtc) = track.rtc_track() {
            self.pc.add_track(rtc).await?;
        }
        Ok(())
    }

    async fn stop_transceivers(&self) -> Result<(), PeerError> {
        for transceiver in self.pc.get_transceivers().await {
            transceiver.stop().await?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.pc.close().await?;
        Ok(())
    }
}
