//! Peer-connection transport seam and its `webrtc` crate implementation
//!
//! Endpoints drive a [`PeerTransport`] through its suspend-style setup calls.
//! Notifications coming back from the transport (discovered candidates,
//! connection state, data channel traffic) never touch endpoint state
//! directly: they are posted through an [`EventSink`] into the session loop.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use super::types::EndpointId;

/// Notification raised by a transport on behalf of one endpoint
pub enum TransportEvent {
    /// A local candidate was discovered and should be relayed
    IceCandidate(RTCIceCandidateInit),
    StateChanged(RTCPeerConnectionState),
    /// The remote side opened a data channel towards us
    DataChannel(Arc<dyn DataChannel>),
    ChannelOpen,
    ChannelClosed,
    Message(String),
}

impl std::fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportEvent::IceCandidate(c) => f.debug_tuple("IceCandidate").field(c).finish(),
            TransportEvent::StateChanged(s) => f.debug_tuple("StateChanged").field(s).finish(),
            TransportEvent::DataChannel(dc) => {
                f.debug_tuple("DataChannel").field(&dc.label()).finish()
            }
            TransportEvent::ChannelOpen => f.write_str("ChannelOpen"),
            TransportEvent::ChannelClosed => f.write_str("ChannelClosed"),
            TransportEvent::Message(m) => f.debug_tuple("Message").field(m).finish(),
        }
    }
}

pub type EventSender = mpsc::UnboundedSender<(EndpointId, TransportEvent)>;

/// Per-endpoint handle used by transport callbacks to reach the session loop.
///
/// Once detached (the endpoint was closed) every `emit` is dropped.
#[derive(Clone)]
pub struct EventSink {
    endpoint: EndpointId,
    detached: Arc<AtomicBool>,
    tx: EventSender,
}

impl EventSink {
    pub fn new(endpoint: EndpointId, tx: EventSender) -> Self {
        Self {
            endpoint,
            detached: Arc::new(AtomicBool::new(false)),
            tx,
        }
    }

    pub fn endpoint(&self) -> EndpointId {
        self.endpoint
    }

    /// Post an event; returns false if it was dropped
    pub fn emit(&self, event: TransportEvent) -> bool {
        if self.is_detached() {
            trace!("Endpoint {} detached, dropping {:?}", self.endpoint, event);
            return false;
        }
        self.tx.send((self.endpoint, event)).is_ok()
    }

    pub fn detach(&self) {
        self.detached.store(true, Ordering::SeqCst);
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }
}

/// Bidirectional application-data channel
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;
    fn is_open(&self) -> bool;
    async fn send_text(&self, text: &str) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

/// One peer connection, as seen by a negotiation endpoint
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>>;
    async fn create_offer(&self) -> Result<RTCSessionDescription>;
    async fn create_answer(&self) -> Result<RTCSessionDescription>;
    async fn set_local_description(&self, desc: RTCSessionDescription) -> Result<()>;
    async fn set_remote_description(&self, desc: RTCSessionDescription) -> Result<()>;
    async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<()>;
    fn connection_state(&self) -> RTCPeerConnectionState;
    async fn close(&self) -> Result<()>;
}

/// Creates transports whose notifications flow into the given sink
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(&self, sink: EventSink) -> Result<Box<dyn PeerTransport>>;
}

#[async_trait]
impl DataChannel for RTCDataChannel {
    fn label(&self) -> &str {
        RTCDataChannel::label(self)
    }

    fn is_open(&self) -> bool {
        self.ready_state() == RTCDataChannelState::Open
    }

    async fn send_text(&self, text: &str) -> Result<()> {
        RTCDataChannel::send_text(self, text.to_string()).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        RTCDataChannel::close(self).await?;
        Ok(())
    }
}

/// Builds `RTCPeerConnection`s configured with the given STUN servers
pub struct RtcTransportFactory {
    stun_servers: Vec<String>,
}

impl RtcTransportFactory {
    pub fn new(stun_servers: Vec<String>) -> Self {
        Self { stun_servers }
    }
}

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    async fn create(&self, sink: EventSink) -> Result<Box<dyn PeerTransport>> {
        let mut m = MediaEngine::default();
        m.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut m)?;

        let api = APIBuilder::new()
            .with_media_engine(m)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers: Vec<RTCIceServer> = self
            .stun_servers
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
        RtcTransport::install_handlers(&pc, &sink);

        Ok(Box::new(RtcTransport { pc, sink }))
    }
}

/// `webrtc` crate peer connection
pub struct RtcTransport {
    pc: Arc<RTCPeerConnection>,
    sink: EventSink,
}

impl RtcTransport {
    fn install_handlers(pc: &RTCPeerConnection, sink: &EventSink) {
        let candidate_sink = sink.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let sink = candidate_sink.clone();
            Box::pin(async move {
                // None marks the end of gathering
                if let Some(c) = candidate {
                    match c.to_json() {
                        Ok(init) => {
                            sink.emit(TransportEvent::IceCandidate(init));
                        }
                        Err(e) => debug!("Endpoint {} candidate not serializable: {}", sink.endpoint(), e),
                    }
                }
            })
        }));

        let state_sink = sink.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let sink = state_sink.clone();
            Box::pin(async move {
                sink.emit(TransportEvent::StateChanged(state));
            })
        }));

        let dc_sink = sink.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let sink = dc_sink.clone();
            Box::pin(async move {
                info!("Endpoint {} received data channel: {}", sink.endpoint(), dc.label());
                wire_data_channel(&dc, &sink);
                sink.emit(TransportEvent::DataChannel(dc));
            })
        }));
    }
}

/// Forward open/close/message notifications of a data channel into the sink
fn wire_data_channel(dc: &RTCDataChannel, sink: &EventSink) {
    let open_sink = sink.clone();
    dc.on_open(Box::new(move || {
        let sink = open_sink.clone();
        Box::pin(async move {
            sink.emit(TransportEvent::ChannelOpen);
        })
    }));

    let close_sink = sink.clone();
    dc.on_close(Box::new(move || {
        let sink = close_sink.clone();
        Box::pin(async move {
            sink.emit(TransportEvent::ChannelClosed);
        })
    }));

    let msg_sink = sink.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let sink = msg_sink.clone();
        Box::pin(async move {
            if !msg.is_string {
                trace!("Endpoint {} ignoring {} binary bytes", sink.endpoint(), msg.data.len());
                return;
            }
            match String::from_utf8(msg.data.to_vec()) {
                Ok(text) => {
                    sink.emit(TransportEvent::Message(text));
                }
                Err(e) => debug!("Endpoint {} sent invalid UTF-8: {}", sink.endpoint(), e),
            }
        })
    }));
}

#[async_trait]
impl PeerTransport for RtcTransport {
    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>> {
        let dc = self.pc.create_data_channel(label, None).await?;
        wire_data_channel(&dc, &self.sink);
        Ok(dc)
    }

    async fn create_offer(&self) -> Result<RTCSessionDescription> {
        Ok(self.pc.create_offer(None).await?)
    }

    async fn create_answer(&self) -> Result<RTCSessionDescription> {
        Ok(self.pc.create_answer(None).await?)
    }

    async fn set_local_description(&self, desc: RTCSessionDescription) -> Result<()> {
        self.pc.set_local_description(desc).await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: RTCSessionDescription) -> Result<()> {
        self.pc.set_remote_description(desc).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<()> {
        self.pc.add_ice_candidate(candidate).await?;
        Ok(())
    }

    fn connection_state(&self) -> RTCPeerConnectionState {
        self.pc.connection_state()
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await?;
        Ok(())
    }
}
