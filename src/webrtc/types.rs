//! Signaling message types and identifiers

use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use super::error::{Error, Result};

/// Generate a random identifier for a signaling socket
pub fn generate_uuid() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..20)
        .map(|_| char::from_digit(rng.gen_range(0..36), 36).unwrap_or('0'))
        .collect()
}

/// Identifier of one endpoint within an orchestrator, assigned in creation order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointId(pub u32);

impl std::fmt::Display for EndpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which side of the negotiation an endpoint plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Creates the data channel and the offer
    Local,
    /// Answers an offer relayed from another client
    Remote,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Local => write!(f, "local"),
            Role::Remote => write!(f, "remote"),
        }
    }
}

/// Negotiation state of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Created,
    Negotiating,
    Connected,
    Closed,
}

impl std::fmt::Display for EndpointState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndpointState::Created => write!(f, "created"),
            EndpointState::Negotiating => write!(f, "negotiating"),
            EndpointState::Connected => write!(f, "connected"),
            EndpointState::Closed => write!(f, "closed"),
        }
    }
}

/// Names of the events carried by the signaling relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    Init,
    NewPeer,
    SdpOffer,
    SdpAnswer,
    IceCandidate,
}

impl SignalKind {
    pub const ALL: [SignalKind; 5] = [
        SignalKind::Init,
        SignalKind::NewPeer,
        SignalKind::SdpOffer,
        SignalKind::SdpAnswer,
        SignalKind::IceCandidate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Init => "init",
            SignalKind::NewPeer => "new-peer",
            SignalKind::SdpOffer => "sdp-offer",
            SignalKind::SdpAnswer => "sdp-answer",
            SignalKind::IceCandidate => "ice-candidate",
        }
    }
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// All signaling messages, as framed on the wire:
/// `{"event": "sdp-offer", "data": "<serialized description>"}`
///
/// Payloads stay serialized until they reach an endpoint, so a malformed
/// description fails that endpoint's negotiation instead of the relay link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum SignalMessage {
    Init,
    NewPeer,
    SdpOffer(String),
    SdpAnswer(String),
    IceCandidate(String),
}

impl SignalMessage {
    pub fn kind(&self) -> SignalKind {
        match self {
            SignalMessage::Init => SignalKind::Init,
            SignalMessage::NewPeer => SignalKind::NewPeer,
            SignalMessage::SdpOffer(_) => SignalKind::SdpOffer,
            SignalMessage::SdpAnswer(_) => SignalKind::SdpAnswer,
            SignalMessage::IceCandidate(_) => SignalKind::IceCandidate,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::Malformed(e.to_string()))
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::Malformed(e.to_string()))
    }
}

/// Serialize a session description the way browsers do (`{"type","sdp"}`)
pub fn encode_description(desc: &RTCSessionDescription) -> Result<String> {
    serde_json::to_string(desc).map_err(|e| Error::Malformed(e.to_string()))
}

pub fn decode_description(payload: &str) -> Result<RTCSessionDescription> {
    serde_json::from_str(payload)
        .map_err(|e| Error::Malformed(format!("session description: {}", e)))
}

/// Serialize an ICE candidate as `{"candidate","sdpMid","sdpMLineIndex",...}`
pub fn encode_candidate(candidate: &RTCIceCandidateInit) -> Result<String> {
    serde_json::to_string(candidate).map_err(|e| Error::Malformed(e.to_string()))
}

/// Decode a relayed candidate. Browsers mark the end of gathering with
/// either `null` or an empty candidate line; both decode to `None`.
pub fn decode_candidate(payload: &str) -> Result<Option<RTCIceCandidateInit>> {
    let init: Option<RTCIceCandidateInit> = serde_json::from_str(payload)
        .map_err(|e| Error::Malformed(format!("ice candidate: {}", e)))?;
    Ok(init.filter(|c| !c.candidate.is_empty()))
}

/// Chat text received on one endpoint's data channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub from: EndpointId,
    pub role: Role,
    pub text: String,
}
