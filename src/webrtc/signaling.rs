//! Signaling channel to the relay server
//!
//! Messages are JSON text frames over a WebSocket:
//! `{"event": "<name>", "data": <payload>}`. Frames are decoded into
//! [`SignalMessage`] at this boundary; anything that fails to decode is
//! logged and dropped.

use futures::{SinkExt, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use super::error::{Error, Result};
use super::types::{generate_uuid, SignalKind, SignalMessage};

/// Connection state of a signaling channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closed,
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelState::Connecting => write!(f, "connecting"),
            ChannelState::Open => write!(f, "open"),
            ChannelState::Closed => write!(f, "closed"),
        }
    }
}

/// Everything the channel reports, in arrival order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Connected,
    Message(SignalMessage),
    /// The relay could not be reached; the channel is closed
    ConnectError(String),
    /// The relay dropped an open connection
    Disconnected,
}

/// Background half of a channel: whatever moves frames to and from the relay
struct Link {
    state: Arc<watch::Sender<ChannelState>>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    outbound: mpsc::UnboundedReceiver<SignalMessage>,
    shutdown: watch::Receiver<bool>,
}

/// Persistent connection to a signaling relay
pub struct SignalingChannel {
    id: String,
    state: Arc<watch::Sender<ChannelState>>,
    outbound: mpsc::UnboundedSender<SignalMessage>,
    inbound: mpsc::UnboundedReceiver<ChannelEvent>,
    subscriptions: HashSet<SignalKind>,
    shutdown: watch::Sender<bool>,
    disconnected: bool,
}

impl SignalingChannel {
    fn with_link(initial: ChannelState) -> (Self, Link) {
        let state = Arc::new(watch::Sender::new(initial));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);

        let channel = Self {
            id: generate_uuid(),
            state: state.clone(),
            outbound: outbound_tx,
            inbound: events_rx,
            subscriptions: HashSet::new(),
            shutdown,
            disconnected: false,
        };
        let link = Link {
            state,
            events: events_tx,
            outbound: outbound_rx,
            shutdown: shutdown_rx,
        };
        (channel, link)
    }

    /// Open a WebSocket connection to the relay.
    ///
    /// Returns immediately in the `Connecting` state. A relay that cannot be
    /// reached is reported as [`ChannelEvent::ConnectError`], never as an error
    /// here. Must be called within a tokio runtime.
    pub fn connect(url: &str) -> Self {
        let (channel, link) = Self::with_link(ChannelState::Connecting);
        info!("Signaling channel {} connecting to {}", channel.id, url);
        tokio::spawn(websocket_task(url.to_string(), link));
        channel
    }

    /// An already-open channel wired to an in-process relay
    pub fn loopback() -> (Self, LoopbackRelay) {
        let (channel, link) = Self::with_link(ChannelState::Open);
        let _ = link.events.send(ChannelEvent::Connected);
        let relay = LoopbackRelay {
            state: link.state,
            events: link.events,
            outbound: link.outbound,
        };
        (channel, relay)
    }

    /// Opaque identifier of the underlying socket
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    /// Register the single subscriber for an event kind.
    ///
    /// Messages of kinds nobody subscribed to are dropped by `next_event`.
    pub fn on(&mut self, kind: SignalKind) -> Result<()> {
        if !self.subscriptions.insert(kind) {
            return Err(Error::AlreadySubscribed(kind));
        }
        debug!("Signaling channel {} subscribed to {}", self.id, kind);
        Ok(())
    }

    /// Fire-and-forget send. Queued while connecting, dropped once closed.
    pub fn send(&self, message: SignalMessage) {
        if self.state() == ChannelState::Closed {
            debug!("Signaling channel {} closed, dropping {}", self.id, message.kind());
            return;
        }
        debug!("Signaling channel {} sending {}", self.id, message.kind());
        if self.outbound.send(message).is_err() {
            debug!("Signaling channel {} link gone", self.id);
        }
    }

    /// Wait for the next event. Returns `None` after `disconnect` or once the
    /// link is gone.
    pub async fn next_event(&mut self) -> Option<ChannelEvent> {
        loop {
            if self.disconnected {
                return None;
            }
            let event = self.inbound.recv().await?;
            if let Some(event) = self.admit(event) {
                return Some(event);
            }
        }
    }

    /// Non-blocking variant of [`next_event`](Self::next_event)
    pub fn try_next_event(&mut self) -> Option<ChannelEvent> {
        loop {
            if self.disconnected {
                return None;
            }
            let event = self.inbound.try_recv().ok()?;
            if let Some(event) = self.admit(event) {
                return Some(event);
            }
        }
    }

    fn admit(&self, event: ChannelEvent) -> Option<ChannelEvent> {
        if let ChannelEvent::Message(ref msg) = event {
            if !self.subscriptions.contains(&msg.kind()) {
                debug!("Signaling channel {} has no subscriber for {}", self.id, msg.kind());
                return None;
            }
        }
        Some(event)
    }

    /// Close the channel. Calling it again is a no-op.
    pub fn disconnect(&mut self) {
        if self.disconnected {
            return;
        }
        self.disconnected = true;
        self.state.send_replace(ChannelState::Closed);
        self.shutdown.send_replace(true);
        info!("Signaling channel {} disconnected", self.id);
    }
}

/// Drive a WebSocket connection until it drops or the channel shuts down
async fn websocket_task(url: String, mut link: Link) {
    let ws_stream = tokio::select! {
        result = connect_async(url.as_str()) => match result {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                warn!("Failed to reach signaling relay {}: {}", url, e);
                link.state.send_replace(ChannelState::Closed);
                let _ = link.events.send(ChannelEvent::ConnectError(e.to_string()));
                return;
            }
        },
        _ = link.shutdown.changed() => return,
    };

    let opened = link.state.send_if_modified(|state| {
        if *state == ChannelState::Connecting {
            *state = ChannelState::Open;
            true
        } else {
            false
        }
    });
    if !opened {
        return;
    }
    info!("Connected to signaling relay {}", url);
    let _ = link.events.send(ChannelEvent::Connected);

    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            _ = link.shutdown.changed() => break,
            Some(message) = link.outbound.recv() => {
                let json = match message.to_json() {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("Failed to encode {}: {}", message.kind(), e);
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(json.into())).await {
                    error!("Failed to send to {}: {}", url, e);
                    break;
                }
            }
            frame = read.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => match SignalMessage::from_json(&text) {
                        Ok(message) => {
                            debug!("Received {} from {}", message.kind(), url);
                            let _ = link.events.send(ChannelEvent::Message(message));
                        }
                        Err(e) => warn!("Ignoring frame from {}: {}", url, e),
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        warn!("Signaling relay closed: {}", url);
                        break;
                    }
                    Some(Err(e)) => {
                        error!("WebSocket error from {}: {}", url, e);
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    let _ = write.close().await;
    if link.state.send_replace(ChannelState::Closed) != ChannelState::Closed {
        let _ = link.events.send(ChannelEvent::Disconnected);
    }
}

/// Relay end of a loopback channel
pub struct LoopbackRelay {
    state: Arc<watch::Sender<ChannelState>>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    outbound: mpsc::UnboundedReceiver<SignalMessage>,
}

impl LoopbackRelay {
    /// Deliver a message from the relay to the client
    pub fn push(&self, message: SignalMessage) {
        let _ = self.events.send(ChannelEvent::Message(message));
    }

    /// Simulate an unreachable relay
    pub fn fail(&self, reason: &str) {
        self.state.send_replace(ChannelState::Closed);
        let _ = self.events.send(ChannelEvent::ConnectError(reason.to_string()));
    }

    /// Simulate the relay dropping the connection
    pub fn drop_connection(&self) {
        if self.state.send_replace(ChannelState::Closed) != ChannelState::Closed {
            let _ = self.events.send(ChannelEvent::Disconnected);
        }
    }

    /// Messages the client has sent so far (drained)
    pub fn sent(&mut self) -> Vec<SignalMessage> {
        let mut sent = Vec::new();
        while let Ok(message) = self.outbound.try_recv() {
            sent.push(message);
        }
        sent
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }
}
