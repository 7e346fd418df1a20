//! Signalling wire format shared by the relay clients
//!
//! One JSON envelope per WebSocket text frame:
//! `{ "type": "offer" | "answer" | "ice-candidate" | "hangup", "data": ... }`
//!
//! The relay never parses this envelope; only the negotiation layer does.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A signalling message exchanged between the two call parties.
///
/// Session-description and candidate payloads are carried as opaque JSON
/// blobs; their internals belong to the peer-connection capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "Envelope", into = "Envelope")]
pub enum SignalMessage {
    Offer(Value),
    Answer(Value),
    IceCandidate(Value),
    Hangup,
}

impl SignalMessage {
    pub fn offer(description: Value) -> Self {
        SignalMessage::Offer(description)
    }

    pub fn answer(description: Value) -> Self {
        SignalMessage::Answer(description)
    }

    pub fn ice_candidate(candidate: Value) -> Self {
        SignalMessage::IceCandidate(candidate)
    }

    pub fn hangup() -> Self {
        SignalMessage::Hangup
    }

    /// Wire tag of the message, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            SignalMessage::Offer(_) => "offer",
            SignalMessage::Answer(_) => "answer",
            SignalMessage::IceCandidate(_) => "ice-candidate",
            SignalMessage::Hangup => "hangup",
        }
    }
}

/// Raw wire envelope. Kept separate from [`SignalMessage`] so a hangup
/// tolerates both an absent and an empty `data` field; browser clients
/// send `{"type":"hangup","data":""}`.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

impl From<SignalMessage> for Envelope {
    fn from(msg: SignalMessage) -> Self {
        let (kind, data) = match msg {
            SignalMessage::Offer(data) => ("offer", data),
            SignalMessage::Answer(data) => ("answer", data),
            SignalMessage::IceCandidate(data) => ("ice-candidate", data),
            SignalMessage::Hangup => ("hangup", Value::String(String::new())),
        };
        Envelope {
            kind: kind.to_string(),
            data,
        }
    }
}

impl TryFrom<Envelope> for SignalMessage {
    type Error = String;

    fn try_from(envelope: Envelope) -> Result<Self, Self::Error> {
        match envelope.kind.as_str() {
            "offer" => Ok(SignalMessage::Offer(envelope.data)),
            "answer" => Ok(SignalMessage::Answer(envelope.data)),
            "ice-candidate" => Ok(SignalMessage::IceCandidate(envelope.data)),
            "hangup" => Ok(SignalMessage::Hangup),
            other => Err(format!("unknown signal type: {other}")),
        }
    }
}
