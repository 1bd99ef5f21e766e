//! Error types for signaling and negotiation

use thiserror::Error;

use super::types::{EndpointState, Role, SignalKind};

#[derive(Error, Debug)]
pub enum Error {
    #[error("Data channel is not open")]
    ChannelNotReady,

    #[error("Operation requires a {expected} endpoint")]
    WrongRole { expected: Role },

    #[error("Invalid endpoint state: {0}")]
    InvalidState(EndpointState),

    #[error("Malformed payload: {0}")]
    Malformed(String),

    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("Endpoint closed")]
    Closed,

    #[error("Already subscribed to {0}")]
    AlreadySubscribed(SignalKind),

    #[error("Session ended")]
    SessionEnded,
}

pub type Result<T> = std::result::Result<T, Error>;
