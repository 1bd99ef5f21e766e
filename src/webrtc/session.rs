//! Binds an orchestrator to its consumer's lifetime
//!
//! `mount` sets the session up exactly once; `unmount` (or dropping the
//! [`Session`]) tears it down exactly once.

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use super::error::{Error, Result};
use super::orchestrator::{Command, SessionOrchestrator};
use super::signaling::SignalingChannel;
use super::transport::{RtcTransportFactory, TransportFactory};
use super::types::ReceivedMessage;
use crate::config::Config;

/// A mounted chat session running on its own task
pub struct Session {
    commands: mpsc::UnboundedSender<Command>,
    task: Option<JoinHandle<()>>,
    messages: Option<mpsc::UnboundedReceiver<ReceivedMessage>>,
}

impl Session {
    /// Connect to the configured relay and start the session loop
    pub fn mount(config: &Config) -> Result<Self> {
        let channel = SignalingChannel::connect(&config.signaling.url);
        let factory = Arc::new(RtcTransportFactory::new(config.webrtc.stun_servers.clone()));
        Self::mount_with(channel, factory, &config.webrtc.channel_label)
    }

    /// Start the session loop over an existing channel and transport factory
    pub fn mount_with(
        channel: SignalingChannel,
        factory: Arc<dyn TransportFactory>,
        channel_label: &str,
    ) -> Result<Self> {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let mut orchestrator = SessionOrchestrator::new(channel, factory, channel_label, inbox_tx)?;

        let (commands, commands_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            orchestrator.run(commands_rx).await;
        });

        Ok(Self {
            commands,
            task: Some(task),
            messages: Some(inbox_rx),
        })
    }

    pub fn is_mounted(&self) -> bool {
        self.task.is_some()
    }

    /// Messages received from peers. Can be taken once.
    pub fn messages(&mut self) -> Option<mpsc::UnboundedReceiver<ReceivedMessage>> {
        self.messages.take()
    }

    /// Send chat text; fails with `ChannelNotReady` if the data channel is not open
    pub async fn send_message(&self, text: &str) -> Result<()> {
        let (reply, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::SendMessage {
                text: text.to_string(),
                reply,
            })
            .map_err(|_| Error::SessionEnded)?;
        reply_rx.await.map_err(|_| Error::SessionEnded)?
    }

    /// Tear the session down and wait until every endpoint is closed
    pub async fn unmount(mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        let _ = self.commands.send(Command::Teardown);
        if let Err(e) = task.await {
            error!("Session task failed: {}", e);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.task.take().is_some() {
            debug!("Session dropped while mounted, requesting teardown");
            let _ = self.commands.send(Command::Teardown);
        }
    }
}
