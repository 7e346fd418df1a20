//! Signalling layer: the wire envelope and the client-side relay transport.

mod channel;
mod types;


pub use channel::{ReconnectConfig, SignalChannel, SignalSink};
pub use types::SignalMessage;
