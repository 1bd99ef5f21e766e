pub mod config;
pub mod webrtc;

pub use config::Config;
pub use self::webrtc::{Session, SessionOrchestrator, SignalMessage, SignalingChannel};
