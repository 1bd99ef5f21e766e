//! Negotiation endpoint: one peer connection plus its data channel

use std::sync::Arc;
use tracing::{debug, info, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;

use super::error::{Error, Result};
use super::transport::{DataChannel, EventSink, PeerTransport, TransportEvent};
use super::types::{
    decode_candidate, decode_description, encode_candidate, encode_description, EndpointId,
    EndpointState, Role, SignalMessage,
};

/// What the orchestrator should do after a transport notification
#[derive(Debug, PartialEq, Eq)]
pub enum EndpointOutput {
    /// Relay this message through the signaling channel
    Relay(SignalMessage),
    /// Deliver chat text to the consumer
    Received(String),
}

/// Drives one transport through offer/answer negotiation.
///
/// All methods run on the session loop. Transport operations suspend, and
/// every resumption re-checks that the endpoint was not closed meanwhile.
pub struct NegotiationEndpoint {
    id: EndpointId,
    role: Role,
    state: EndpointState,
    ice_state: RTCPeerConnectionState,
    transport: Option<Box<dyn PeerTransport>>,
    data_channel: Option<Arc<dyn DataChannel>>,
    sink: EventSink,
    channel_label: String,
    remote_description_set: bool,
    answered: bool,
    pending_candidates: Vec<RTCIceCandidateInit>,
}

impl NegotiationEndpoint {
    pub fn new(
        role: Role,
        transport: Box<dyn PeerTransport>,
        sink: EventSink,
        channel_label: impl Into<String>,
    ) -> Self {
        let ice_state = transport.connection_state();
        Self {
            id: sink.endpoint(),
            role,
            state: EndpointState::Created,
            ice_state,
            transport: Some(transport),
            data_channel: None,
            sink,
            channel_label: channel_label.into(),
            remote_description_set: false,
            answered: false,
            pending_candidates: Vec::new(),
        }
    }

    pub fn id(&self) -> EndpointId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> EndpointState {
        self.state
    }

    /// Last connection state reported by the transport
    pub fn ice_state(&self) -> RTCPeerConnectionState {
        self.ice_state
    }

    pub fn has_data_channel(&self) -> bool {
        self.data_channel.is_some()
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state == EndpointState::Closed || self.sink.is_detached()
    }

    fn transport(&self) -> Result<&dyn PeerTransport> {
        match self.transport {
            Some(ref t) if !self.is_closed() => Ok(t.as_ref()),
            _ => Err(Error::Closed),
        }
    }

    /// Bail out if the endpoint was closed while a transport call was pending
    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            debug!("Endpoint {} closed during negotiation", self.id);
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// Create the data channel and an offer; returns the serialized offer to relay
    pub async fn initiate_as_local(&mut self) -> Result<String> {
        if self.role != Role::Local {
            return Err(Error::WrongRole { expected: Role::Local });
        }
        if self.state != EndpointState::Created {
            return Err(Error::InvalidState(self.state));
        }
        self.state = EndpointState::Negotiating;

        match self.negotiate_offer().await {
            Ok(offer) => {
                info!("Endpoint {} created offer", self.id);
                Ok(offer)
            }
            Err(e) => Err(self.fail(e).await),
        }
    }

    async fn negotiate_offer(&mut self) -> Result<String> {
        let dc = self
            .transport()?
            .create_data_channel(&self.channel_label)
            .await
            .map_err(negotiation)?;
        self.ensure_open()?;
        self.data_channel = Some(dc);

        let offer = self.transport()?.create_offer().await.map_err(negotiation)?;
        self.ensure_open()?;
        let payload = encode_description(&offer)?;

        self.transport()?
            .set_local_description(offer)
            .await
            .map_err(negotiation)?;
        self.ensure_open()?;

        Ok(payload)
    }

    /// Apply a relayed offer and produce the serialized answer to relay
    pub async fn initiate_as_remote(&mut self, offer: &str) -> Result<String> {
        if self.role != Role::Remote {
            return Err(Error::WrongRole { expected: Role::Remote });
        }
        if self.state != EndpointState::Created {
            debug!("Endpoint {} ignoring offer in state {}", self.id, self.state);
            return Err(Error::InvalidState(self.state));
        }
        self.state = EndpointState::Negotiating;

        match self.negotiate_answer(offer).await {
            Ok(answer) => {
                info!("Endpoint {} created answer", self.id);
                Ok(answer)
            }
            Err(e) => Err(self.fail(e).await),
        }
    }

    async fn negotiate_answer(&mut self, offer: &str) -> Result<String> {
        let desc = decode_description(offer)?;
        if desc.sdp_type != RTCSdpType::Offer {
            return Err(Error::Malformed(format!("expected offer, got {}", desc.sdp_type)));
        }

        self.transport()?
            .set_remote_description(desc)
            .await
            .map_err(negotiation)?;
        self.ensure_open()?;
        self.remote_description_set = true;
        self.flush_candidates().await?;

        let answer = self.transport()?.create_answer().await.map_err(negotiation)?;
        self.ensure_open()?;
        let payload = encode_description(&answer)?;

        self.transport()?
            .set_local_description(answer)
            .await
            .map_err(negotiation)?;
        self.ensure_open()?;

        Ok(payload)
    }

    /// Apply the answer to our offer. Stray or duplicated answers are ignored.
    pub async fn apply_answer(&mut self, answer: &str) -> Result<()> {
        if self.role != Role::Local {
            return Err(Error::WrongRole { expected: Role::Local });
        }
        if self.state != EndpointState::Negotiating || self.answered {
            warn!(
                "Endpoint {} ignoring answer in state {} (answered: {})",
                self.id, self.state, self.answered
            );
            return Ok(());
        }
        self.answered = true;

        match self.accept_answer(answer).await {
            Ok(()) => {
                info!("Endpoint {} applied answer, ice state {}", self.id, self.ice_state);
                Ok(())
            }
            Err(e) => Err(self.fail(e).await),
        }
    }

    async fn accept_answer(&mut self, answer: &str) -> Result<()> {
        let desc = decode_description(answer)?;
        if desc.sdp_type != RTCSdpType::Answer {
            return Err(Error::Malformed(format!("expected answer, got {}", desc.sdp_type)));
        }

        self.transport()?
            .set_remote_description(desc)
            .await
            .map_err(negotiation)?;
        self.ensure_open()?;
        self.remote_description_set = true;
        self.flush_candidates().await
    }

    /// Apply a relayed candidate, buffering it until a remote description is set
    pub async fn apply_ice_candidate(&mut self, candidate: &str) -> Result<()> {
        if !matches!(
            self.state,
            EndpointState::Negotiating | EndpointState::Connected
        ) {
            warn!("Endpoint {} ignoring candidate in state {}", self.id, self.state);
            return Ok(());
        }

        let init = match decode_candidate(candidate) {
            Ok(Some(init)) => init,
            Ok(None) => {
                debug!("Endpoint {} received end of candidates", self.id);
                return Ok(());
            }
            Err(e) => return Err(self.fail(e).await),
        };

        if !self.remote_description_set {
            self.pending_candidates.push(init);
            debug!(
                "Endpoint {} buffered candidate ({} pending)",
                self.id,
                self.pending_candidates.len()
            );
            return Ok(());
        }

        self.add_candidate(init).await
    }

    async fn add_candidate(&self, init: RTCIceCandidateInit) -> Result<()> {
        // A well-formed candidate the transport rejects is not fatal
        if let Err(e) = self.transport()?.add_ice_candidate(init).await {
            warn!("Endpoint {} rejected candidate: {:#}", self.id, e);
        } else {
            debug!("Endpoint {} added ice candidate", self.id);
        }
        Ok(())
    }

    async fn flush_candidates(&mut self) -> Result<()> {
        let pending = std::mem::take(&mut self.pending_candidates);
        if !pending.is_empty() {
            debug!("Endpoint {} applying {} buffered candidates", self.id, pending.len());
        }
        for init in pending {
            self.ensure_open()?;
            self.add_candidate(init).await?;
        }
        Ok(())
    }

    /// Send text over the data channel. Nothing is queued if it is not open.
    pub async fn send(&self, payload: &str) -> Result<()> {
        let dc = match self.data_channel {
            Some(ref dc) if !self.is_closed() && dc.is_open() => dc,
            _ => return Err(Error::ChannelNotReady),
        };
        dc.send_text(payload)
            .await
            .map_err(|e| Error::Negotiation(format!("{:#}", e)))?;
        debug!("Endpoint {} sent {} bytes", self.id, payload.len());
        Ok(())
    }

    /// Handle a notification posted by this endpoint's transport
    pub fn handle_transport_event(&mut self, event: TransportEvent) -> Option<EndpointOutput> {
        if self.is_closed() {
            debug!("Endpoint {} closed, ignoring {:?}", self.id, event);
            return None;
        }

        match event {
            TransportEvent::IceCandidate(init) => match encode_candidate(&init) {
                Ok(payload) => Some(EndpointOutput::Relay(SignalMessage::IceCandidate(payload))),
                Err(e) => {
                    warn!("Endpoint {} could not encode candidate: {}", self.id, e);
                    None
                }
            },
            TransportEvent::StateChanged(state) => {
                self.ice_state = state;
                match state {
                    RTCPeerConnectionState::Connected => {
                        if self.state == EndpointState::Negotiating {
                            self.state = EndpointState::Connected;
                        }
                        info!("Endpoint {} connected", self.id);
                    }
                    RTCPeerConnectionState::Failed | RTCPeerConnectionState::Disconnected => {
                        warn!("Endpoint {} transport {}", self.id, state);
                    }
                    _ => debug!("Endpoint {} transport state {}", self.id, state),
                }
                None
            }
            TransportEvent::DataChannel(dc) => {
                info!("Endpoint {} adopted data channel '{}'", self.id, dc.label());
                self.data_channel = Some(dc);
                None
            }
            TransportEvent::ChannelOpen => {
                info!("Endpoint {} data channel open", self.id);
                None
            }
            TransportEvent::ChannelClosed => {
                info!("Endpoint {} data channel closed", self.id);
                None
            }
            TransportEvent::Message(text) => Some(EndpointOutput::Received(text)),
        }
    }

    /// Close after a negotiation error, returning the error for the caller
    async fn fail(&mut self, error: Error) -> Error {
        if !matches!(error, Error::Closed) {
            warn!("Endpoint {} negotiation failed: {}", self.id, error);
        }
        self.close().await;
        error
    }

    /// Release the data channel and transport. Safe to call repeatedly.
    pub async fn close(&mut self) {
        if self.state == EndpointState::Closed {
            return;
        }
        self.state = EndpointState::Closed;
        self.sink.detach();
        self.pending_candidates.clear();

        if let Some(dc) = self.data_channel.take() {
            if let Err(e) = dc.close().await {
                debug!("Endpoint {} data channel close: {:#}", self.id, e);
            }
        }
        if let Some(transport) = self.transport.take() {
            if let Err(e) = transport.close().await {
                debug!("Endpoint {} transport close: {:#}", self.id, e);
            }
        }
        info!("Endpoint {} ({}) closed", self.id, self.role);
    }
}

fn negotiation(e: anyhow::Error) -> Error {
    Error::Negotiation(format!("{:#}", e))
}
