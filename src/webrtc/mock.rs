//! Scripted in-memory transport for orchestrator tests

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use super::transport::{DataChannel, EventSink, PeerTransport, TransportFactory};

pub fn description(sdp_type: &str, sdp: &str) -> RTCSessionDescription {
    serde_json::from_value(serde_json::json!({ "type": sdp_type, "sdp": sdp }))
        .expect("valid description json")
}

/// How a mock transport should misbehave
#[derive(Clone, Default)]
pub struct Script {
    pub reject_remote_description: bool,
    pub fail_create_offer: bool,
}

#[derive(Default)]
pub struct MockDataChannel {
    label: String,
    open: AtomicBool,
    closed: AtomicBool,
    sent: Mutex<Vec<String>>,
}

impl MockDataChannel {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            ..Default::default()
        }
    }

    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataChannel for MockDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.is_closed()
    }

    async fn send_text(&self, text: &str) -> Result<()> {
        self.sent.lock().unwrap().push(text.to_string());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// What a mock transport has been asked to do
#[derive(Default)]
pub struct Record {
    pub calls: Vec<String>,
    pub close_count: u32,
}

/// Test-side view of one created transport
#[derive(Clone)]
pub struct MockHandle {
    pub record: Arc<Mutex<Record>>,
    pub sink: EventSink,
    pub channel: Arc<Mutex<Option<Arc<MockDataChannel>>>>,
}

impl MockHandle {
    pub fn calls(&self) -> Vec<String> {
        self.record.lock().unwrap().calls.clone()
    }

    pub fn close_count(&self) -> u32 {
        self.record.lock().unwrap().close_count
    }

    pub fn data_channel(&self) -> Option<Arc<MockDataChannel>> {
        self.channel.lock().unwrap().clone()
    }
}

struct MockTransport {
    handle: MockHandle,
    script: Script,
}

impl MockTransport {
    fn record(&self, call: impl Into<String>) {
        self.handle.record.lock().unwrap().calls.push(call.into());
    }
}

#[async_trait]
impl PeerTransport for MockTransport {
    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>> {
        self.record(format!("create_data_channel:{}", label));
        let dc = Arc::new(MockDataChannel::new(label));
        *self.handle.channel.lock().unwrap() = Some(dc.clone());
        Ok(dc)
    }

    async fn create_offer(&self) -> Result<RTCSessionDescription> {
        self.record("create_offer");
        if self.script.fail_create_offer {
            return Err(anyhow!("offer creation failed"));
        }
        Ok(description("offer", "v=0\r\nmock-offer\r\n"))
    }

    async fn create_answer(&self) -> Result<RTCSessionDescription> {
        self.record("create_answer");
        Ok(description("answer", "v=0\r\nmock-answer\r\n"))
    }

    async fn set_local_description(&self, desc: RTCSessionDescription) -> Result<()> {
        self.record(format!("set_local:{}", desc.sdp_type));
        Ok(())
    }

    async fn set_remote_description(&self, desc: RTCSessionDescription) -> Result<()> {
        self.record(format!("set_remote:{}", desc.sdp_type));
        if self.script.reject_remote_description {
            return Err(anyhow!("no matching session"));
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<()> {
        self.record(format!("add_candidate:{}", candidate.candidate));
        Ok(())
    }

    fn connection_state(&self) -> RTCPeerConnectionState {
        RTCPeerConnectionState::New
    }

    async fn close(&self) -> Result<()> {
        self.handle.record.lock().unwrap().close_count += 1;
        Ok(())
    }
}

/// Hands out mock transports, applying queued scripts in creation order
#[derive(Default)]
pub struct MockFactory {
    scripts: Mutex<VecDeque<Script>>,
    created: Mutex<Vec<MockHandle>>,
}

impl MockFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Script for the next transport created (default behavior otherwise)
    pub fn push_script(&self, script: Script) {
        self.scripts.lock().unwrap().push_back(script);
    }

    pub fn handles(&self) -> Vec<MockHandle> {
        self.created.lock().unwrap().clone()
    }

    pub fn handle(&self, index: usize) -> MockHandle {
        self.created.lock().unwrap()[index].clone()
    }
}

#[async_trait]
impl TransportFactory for MockFactory {
    async fn create(&self, sink: EventSink) -> Result<Box<dyn PeerTransport>> {
        let script = self.scripts.lock().unwrap().pop_front().unwrap_or_default();
        let handle = MockHandle {
            record: Arc::new(Mutex::new(Record::default())),
            sink,
            channel: Arc::new(Mutex::new(None)),
        };
        self.created.lock().unwrap().push(handle.clone());
        Ok(Box::new(MockTransport { handle, script }))
    }
}
