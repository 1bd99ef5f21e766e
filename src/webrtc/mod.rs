//! WebRTC data channels brokered by a signaling relay
//!
//! Signaling protocol (JSON text frames, `{"event", "data"}`):
//! - `init`: this client should create its local endpoint and offer
//! - `new-peer`: another client joined; prepare a remote endpoint
//! - `sdp-offer`, `sdp-answer`, `ice-candidate`: serialized descriptions
//!   and candidates, relayed verbatim

mod endpoint;
mod error;
mod orchestrator;
mod session;
mod signaling;
mod transport;
mod types;

#[cfg(test)]
mod mock;

pub use endpoint::{EndpointOutput, NegotiationEndpoint};
pub use error::{Error, Result};
pub use orchestrator::{Command, SessionOrchestrator};
pub use session::Session;
pub use signaling::{ChannelEvent, ChannelState, LoopbackRelay, SignalingChannel};
pub use transport::{
    DataChannel, EventSender, EventSink, PeerTransport, RtcTransport, RtcTransportFactory,
    TransportEvent, TransportFactory,
};
pub use types::{
    decode_candidate, decode_description, encode_candidate, encode_description, generate_uuid,
    EndpointId, EndpointState, ReceivedMessage, Role, SignalKind, SignalMessage,
};
