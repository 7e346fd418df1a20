//! Client-side call negotiation
//!
//! The session state machine, the peer-connection capability seam, and the
//! media acquisition/display seams it drives.

mod media;
mod peer;
mod session;

pub use media::{
    LogSink, MediaConstraints, MediaError, MediaSource, MediaStream, MediaTrack, SyntheticSource,
    TrackKind, VideoSink, VideoSize,
};
pub use peer::{
    LinkState, PeerConnectionApi, PeerError, PeerEvent, PeerFactory, RtcPeer, RtcPeerFactory,
};
pub use session::{
    CallSession, CallState, SessionCommand, SessionConfig, SessionError, SessionHandle,
    SessionNotice,
};
