//! Session orchestration: routes signaling events onto endpoints
//!
//! Routing table:
//! - `init`: create the local endpoint, negotiate, relay its offer
//! - `new-peer`: append a remote endpoint
//! - `sdp-offer`: every remote endpoint answers it (the relay carries no
//!   peer id, so offers cannot be addressed)
//! - `sdp-answer`, `ice-candidate`: applied to the local endpoint

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::endpoint::{EndpointOutput, NegotiationEndpoint};
use super::error::{Error, Result};
use super::signaling::{ChannelEvent, SignalingChannel};
use super::transport::{EventSender, EventSink, TransportEvent, TransportFactory};
use super::types::{EndpointId, ReceivedMessage, Role, SignalKind, SignalMessage};

/// Requests from the consumer to the session loop
#[derive(Debug)]
pub enum Command {
    SendMessage {
        text: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Teardown,
}

/// Owns the signaling channel, the local endpoint and all remote endpoints
pub struct SessionOrchestrator {
    channel: SignalingChannel,
    factory: Arc<dyn TransportFactory>,
    channel_label: String,
    local: Option<NegotiationEndpoint>,
    remotes: Vec<NegotiationEndpoint>,
    next_id: u32,
    events_tx: EventSender,
    events_rx: mpsc::UnboundedReceiver<(EndpointId, TransportEvent)>,
    inbox: mpsc::UnboundedSender<ReceivedMessage>,
    torn_down: bool,
}

impl SessionOrchestrator {
    /// Take ownership of `channel` and subscribe to every signaling event
    pub fn new(
        mut channel: SignalingChannel,
        factory: Arc<dyn TransportFactory>,
        channel_label: impl Into<String>,
        inbox: mpsc::UnboundedSender<ReceivedMessage>,
    ) -> Result<Self> {
        for kind in SignalKind::ALL {
            channel.on(kind)?;
        }
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Ok(Self {
            channel,
            factory,
            channel_label: channel_label.into(),
            local: None,
            remotes: Vec::new(),
            next_id: 0,
            events_tx,
            events_rx,
            inbox,
            torn_down: false,
        })
    }

    pub fn channel(&self) -> &SignalingChannel {
        &self.channel
    }

    pub fn local(&self) -> Option<&NegotiationEndpoint> {
        self.local.as_ref()
    }

    pub fn remotes(&self) -> &[NegotiationEndpoint] {
        &self.remotes
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    async fn create_endpoint(&mut self, role: Role) -> Result<NegotiationEndpoint> {
        let id = EndpointId(self.next_id);
        self.next_id += 1;

        let sink = EventSink::new(id, self.events_tx.clone());
        let transport = self
            .factory
            .create(sink.clone())
            .await
            .map_err(|e| Error::Negotiation(format!("{:#}", e)))?;

        debug!("Created {} endpoint {}", role, id);
        Ok(NegotiationEndpoint::new(
            role,
            transport,
            sink,
            self.channel_label.clone(),
        ))
    }

    /// Dispatch one signaling message to the endpoint(s) it concerns
    pub async fn handle_signal(&mut self, message: SignalMessage) {
        if self.torn_down {
            debug!("Session torn down, ignoring {}", message.kind());
            return;
        }

        match message {
            SignalMessage::Init => self.handle_init().await,
            SignalMessage::NewPeer => self.handle_new_peer().await,
            SignalMessage::SdpOffer(offer) => self.handle_offer(&offer).await,
            SignalMessage::SdpAnswer(answer) => self.handle_answer(&answer).await,
            SignalMessage::IceCandidate(candidate) => self.handle_candidate(&candidate).await,
        }
    }

    async fn handle_init(&mut self) {
        if self.local.is_some() {
            warn!("Ignoring init: local endpoint already exists");
            return;
        }

        let endpoint = match self.create_endpoint(Role::Local).await {
            Ok(endpoint) => endpoint,
            Err(e) => {
                error!("Failed to create local endpoint: {}", e);
                return;
            }
        };

        let local = self.local.insert(endpoint);
        match local.initiate_as_local().await {
            Ok(offer) => {
                self.channel.send(SignalMessage::SdpOffer(offer));
                info!("Sent offer from local endpoint {}", local.id());
            }
            Err(e) => warn!("Local endpoint {} failed to start: {}", local.id(), e),
        }
    }

    async fn handle_new_peer(&mut self) {
        match self.create_endpoint(Role::Remote).await {
            Ok(endpoint) => {
                info!("New peer: remote endpoint {}", endpoint.id());
                self.remotes.push(endpoint);
            }
            Err(e) => error!("Failed to create remote endpoint: {}", e),
        }
    }

    async fn handle_offer(&mut self, offer: &str) {
        if self.remotes.is_empty() {
            warn!("Routing error: sdp-offer with no remote endpoint");
            return;
        }

        for remote in self.remotes.iter_mut() {
            match remote.initiate_as_remote(offer).await {
                Ok(answer) => {
                    self.channel.send(SignalMessage::SdpAnswer(answer));
                    info!("Sent answer from remote endpoint {}", remote.id());
                }
                Err(Error::InvalidState(_)) => {}
                Err(e) => debug!("Remote endpoint {} rejected offer: {}", remote.id(), e),
            }
        }
    }

    async fn handle_answer(&mut self, answer: &str) {
        match self.local.as_mut() {
            Some(local) => {
                if let Err(e) = local.apply_answer(answer).await {
                    warn!("Local endpoint {} rejected answer: {}", local.id(), e);
                }
            }
            None => warn!("Routing error: sdp-answer with no local endpoint"),
        }
    }

    async fn handle_candidate(&mut self, candidate: &str) {
        match self.local.as_mut() {
            Some(local) => {
                if let Err(e) = local.apply_ice_candidate(candidate).await {
                    warn!("Local endpoint {} rejected candidate: {}", local.id(), e);
                }
            }
            None => warn!("Routing error: ice-candidate with no local endpoint"),
        }
    }

    /// Route a transport notification back to the endpoint that raised it
    pub fn handle_transport_event(&mut self, id: EndpointId, event: TransportEvent) {
        let endpoint = if self.local.as_ref().map(|l| l.id()) == Some(id) {
            self.local.as_mut()
        } else {
            self.remotes.iter_mut().find(|r| r.id() == id)
        };
        let Some(endpoint) = endpoint else {
            debug!("No endpoint {} for {:?}", id, event);
            return;
        };

        match endpoint.handle_transport_event(event) {
            Some(EndpointOutput::Relay(message)) => self.channel.send(message),
            Some(EndpointOutput::Received(text)) => {
                let received = ReceivedMessage {
                    from: id,
                    role: endpoint.role(),
                    text,
                };
                if self.inbox.send(received).is_err() {
                    debug!("Inbox closed, dropping message from {}", id);
                }
            }
            None => {}
        }
    }

    /// Handle every transport notification already queued; returns how many
    pub fn process_pending_transport_events(&mut self) -> usize {
        let mut handled = 0;
        while let Ok((id, event)) = self.events_rx.try_recv() {
            self.handle_transport_event(id, event);
            handled += 1;
        }
        handled
    }

    /// Send chat text over the local endpoint's data channel.
    ///
    /// Messages sent before the channel opens are dropped, not queued.
    pub async fn send_message(&self, text: &str) -> Result<()> {
        let result = match self.local {
            Some(ref local) => local.send(text).await,
            None => Err(Error::ChannelNotReady),
        };
        match result {
            Ok(()) => info!("Sending message ({} bytes)", text.len()),
            Err(ref e) => error!("Message not sent: {}", e),
        }
        result
    }

    /// Close every endpoint, then disconnect the channel. Runs once.
    pub async fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        if let Some(local) = self.local.as_mut() {
            local.close().await;
        }
        for remote in self.remotes.iter_mut() {
            remote.close().await;
        }
        self.channel.disconnect();

        info!(
            "Session torn down ({} local, {} remote endpoints closed)",
            usize::from(self.local.is_some()),
            self.remotes.len()
        );
    }

    /// Serve signaling events, transport events and consumer commands one at
    /// a time until teardown is requested or the command sender is dropped.
    pub async fn run(&mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        info!("Session running on signaling channel {}", self.channel.id());
        let mut channel_live = true;

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::SendMessage { text, reply }) => {
                        let _ = reply.send(self.send_message(&text).await);
                    }
                    Some(Command::Teardown) | None => break,
                },
                event = self.channel.next_event(), if channel_live => match event {
                    Some(ChannelEvent::Message(message)) => self.handle_signal(message).await,
                    Some(ChannelEvent::Connected) => info!("Signaling channel open"),
                    Some(ChannelEvent::ConnectError(reason)) => {
                        error!("Signaling relay unreachable: {}", reason);
                        channel_live = false;
                    }
                    Some(ChannelEvent::Disconnected) | None => {
                        warn!("Signaling channel lost; open endpoints stay up until teardown");
                        channel_live = false;
                    }
                },
                Some((id, event)) = self.events_rx.recv() => {
                    self.handle_transport_event(id, event);
                }
            }
        }

        self.teardown().await;
    }
}
