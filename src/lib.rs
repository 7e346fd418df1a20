pub mod call;
pub mod config;
pub mod relay;
pub mod signal;

pub use call::{
    CallSession, CallState, MediaConstraints, MediaError, MediaSource, MediaStream, MediaTrack,
    PeerConnectionApi, PeerError, PeerEvent, PeerFactory, SessionConfig, SessionHandle,
    SessionNotice, VideoSink,
};
pub use config::Config;
pub use relay::RelayHub;
pub use signal::{SignalChannel, SignalMessage, SignalSink};
